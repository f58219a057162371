//! HTTP client abstraction.
//!
//! The transfer layer talks to the network only through [`HttpClient`]. The
//! default implementation is [`UreqClient`]; tests use [`MockHttpClient`] or
//! route requests to an in-process server through [`LoopbackClient`].

use crate::cancel::{CancelToken, CancelledRead};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Cursor, Read};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::Duration;

/// How often a caller waiting on a transfer worker checks its cancel token.
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// Body chunks buffered between a transfer worker and its reader.
const BODY_QUEUE_DEPTH: usize = 4;

const BODY_CHUNK_SIZE: usize = 16 * 1024;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET.
    Get,
    /// PUT.
    Put,
    /// POST.
    Post,
    /// DELETE.
    Delete,
}

impl Method {
    /// Method name on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Incoming response with a streaming body.
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Body stream.
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    /// Creates a response with an in-memory body.
    pub fn from_bytes(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body: Box::new(Cursor::new(body)),
        }
    }

    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Blocking HTTP client.
///
/// Implementations must return non-2xx responses as `Ok`; only failures to
/// exchange a request at all are errors.
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response head with a streaming body.
    fn execute(&self, request: HttpRequest) -> io::Result<HttpResponse>;

    /// Sends a request that gives up once `token` is cancelled.
    ///
    /// Clients that can block on the network must return, and make later
    /// body reads return, within a short poll interval of the cancellation
    /// even while the socket is stalled. The default suits in-memory clients.
    fn execute_cancellable(
        &self,
        request: HttpRequest,
        _token: &CancelToken,
    ) -> io::Result<HttpResponse> {
        self.execute(request)
    }
}

/// [`HttpClient`] backed by `ureq`.
pub struct UreqClient {
    agent: ureq::Agent,
}

impl UreqClient {
    /// Creates a client with a global per-request timeout.
    pub fn new(timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self { agent }
    }
}

impl fmt::Debug for UreqClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UreqClient").finish_non_exhaustive()
    }
}

fn to_io(err: ureq::Error) -> io::Error {
    match err {
        ureq::Error::Io(io) => io,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

impl UreqClient {
    fn send(
        agent: &ureq::Agent,
        request: HttpRequest,
    ) -> io::Result<(u16, Vec<(String, String)>, impl Read + Send + 'static)> {
        let mut builder = ureq::http::Request::builder()
            .method(request.method.as_str())
            .uri(request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let outgoing = builder
            .body(request.body.unwrap_or_default())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        let response = agent.run(outgoing).map_err(to_io)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Ok((status, headers, response.into_body().into_reader()))
    }
}

impl HttpClient for UreqClient {
    fn execute(&self, request: HttpRequest) -> io::Result<HttpResponse> {
        let (status, headers, body) = Self::send(&self.agent, request)?;
        Ok(HttpResponse {
            status,
            headers,
            body: Box::new(body),
        })
    }

    /// Runs the exchange on a worker thread.
    ///
    /// The caller only waits on channels, so a cancel is noticed within
    /// `CANCEL_POLL` even while the socket is stalled. The worker exits
    /// once its blocked read returns and finds the reader gone.
    fn execute_cancellable(
        &self,
        request: HttpRequest,
        token: &CancelToken,
    ) -> io::Result<HttpResponse> {
        token_check(token)?;
        let (head_tx, head_rx) = mpsc::sync_channel(1);
        let (body_tx, body_rx) = mpsc::sync_channel(BODY_QUEUE_DEPTH);
        let agent = self.agent.clone();
        thread::Builder::new()
            .name("http-transfer".to_string())
            .spawn(move || match Self::send(&agent, request) {
                Ok((status, headers, body)) => {
                    if head_tx.send(Ok((status, headers))).is_ok() {
                        pump_body(body, &body_tx);
                    }
                }
                Err(err) => {
                    let _ = head_tx.send(Err(err));
                }
            })?;

        let (status, headers) = recv_cancellable(&head_rx, token)??;
        Ok(HttpResponse {
            status,
            headers,
            body: Box::new(ChannelBody::new(body_rx, token.clone())),
        })
    }
}

enum BodyChunk {
    Data(Vec<u8>),
    End,
    Failed(io::Error),
}

fn token_check(token: &CancelToken) -> io::Result<()> {
    if token.is_cancelled() {
        return Err(io::Error::new(io::ErrorKind::Other, CancelledRead));
    }
    Ok(())
}

/// Waits for a message from a transfer worker, checking `token` in between.
fn recv_cancellable<T>(rx: &Receiver<T>, token: &CancelToken) -> io::Result<T> {
    loop {
        token_check(token)?;
        match rx.recv_timeout(CANCEL_POLL) {
            Ok(value) => return Ok(value),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "transfer worker exited",
                ))
            }
        }
    }
}

fn pump_body<R: Read>(mut body: R, tx: &SyncSender<BodyChunk>) {
    let mut buf = vec![0u8; BODY_CHUNK_SIZE];
    loop {
        let chunk = match body.read(&mut buf) {
            Ok(0) => BodyChunk::End,
            Ok(n) => BodyChunk::Data(buf[..n].to_vec()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => BodyChunk::Failed(err),
        };
        let last = !matches!(chunk, BodyChunk::Data(_));
        if tx.send(chunk).is_err() || last {
            return;
        }
    }
}

/// Response body fed by a transfer worker.
struct ChannelBody {
    rx: Receiver<BodyChunk>,
    token: CancelToken,
    chunk: Vec<u8>,
    pos: usize,
    done: bool,
}

impl ChannelBody {
    fn new(rx: Receiver<BodyChunk>, token: CancelToken) -> Self {
        Self {
            rx,
            token,
            chunk: Vec::new(),
            pos: 0,
            done: false,
        }
    }
}

impl Read for ChannelBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.chunk.len() {
            if self.done {
                return Ok(0);
            }
            match recv_cancellable(&self.rx, &self.token)? {
                BodyChunk::Data(data) => {
                    self.chunk = data;
                    self.pos = 0;
                }
                BodyChunk::End => self.done = true,
                BodyChunk::Failed(err) => {
                    self.done = true;
                    return Err(err);
                }
            }
        }
        let n = (self.chunk.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Scripted response for [`MockHttpClient`].
#[derive(Debug, Clone)]
pub struct MockResponse {
    /// Status code.
    pub status: u16,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Body.
    pub body: Vec<u8>,
}

impl MockResponse {
    /// A response with a body and no headers.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A mock client for testing.
///
/// Responses are returned in the order they were queued; every request is
/// recorded for later inspection.
#[derive(Debug, Default)]
pub struct MockHttpClient {
    responses: Mutex<VecDeque<io::Result<MockResponse>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttpClient {
    /// Creates a mock with nothing queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response.
    pub fn push_response(&self, response: MockResponse) {
        self.responses.lock().push_back(Ok(response));
    }

    /// Queues a transport failure.
    pub fn push_error(&self, kind: io::ErrorKind, message: &str) {
        self.responses
            .lock()
            .push_back(Err(io::Error::new(kind, message.to_string())));
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl HttpClient for MockHttpClient {
    fn execute(&self, request: HttpRequest) -> io::Result<HttpResponse> {
        self.requests.lock().push(request);
        match self.responses.lock().pop_front() {
            Some(Ok(response)) => Ok(HttpResponse::from_bytes(
                response.status,
                response.headers,
                response.body,
            )),
            Some(Err(err)) => Err(err),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no mock response queued",
            )),
        }
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles one request addressed by path and query.
    fn handle(
        &self,
        method: &str,
        path_and_query: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> (u16, Vec<(String, String)>, Vec<u8>);
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// The wrapped server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    fn execute(&self, request: HttpRequest) -> io::Result<HttpResponse> {
        let url = url::Url::parse(&request.url)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let path_and_query = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        let body = request.body.unwrap_or_default();
        let (status, headers, body) = self.server.handle(
            request.method.as_str(),
            &path_and_query,
            &request.headers,
            &body,
        );
        Ok(HttpResponse::from_bytes(status, headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoServer;

    impl LoopbackServer for EchoServer {
        fn handle(
            &self,
            method: &str,
            path_and_query: &str,
            _headers: &[(String, String)],
            body: &[u8],
        ) -> (u16, Vec<(String, String)>, Vec<u8>) {
            let mut reply = format!("{} {} ", method, path_and_query).into_bytes();
            reply.extend_from_slice(body);
            (200, vec![("X-Echo".into(), "1".into())], reply)
        }
    }

    #[test]
    fn loopback_strips_origin() {
        let client = LoopbackClient::new(EchoServer);
        let mut response = client
            .execute(HttpRequest {
                method: Method::Put,
                url: "https://api.example.org/api/0.6/changeset/5/close".into(),
                headers: Vec::new(),
                body: Some(b"\r\n".to_vec()),
            })
            .unwrap();
        assert_eq!(response.header("x-echo"), Some("1"));
        let mut text = String::new();
        response.body.read_to_string(&mut text).unwrap();
        assert_eq!(text, "PUT /api/0.6/changeset/5/close \r\n");
    }

    #[test]
    fn mock_replays_in_order() {
        let mock = MockHttpClient::new();
        mock.push_response(MockResponse::new(200, "first"));
        mock.push_error(io::ErrorKind::TimedOut, "slow");

        let request = HttpRequest {
            method: Method::Get,
            url: "https://api.example.org/api/capabilities".into(),
            headers: Vec::new(),
            body: None,
        };
        assert_eq!(mock.execute(request.clone()).unwrap().status, 200);
        assert_eq!(
            mock.execute(request.clone()).unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );
        assert!(mock.execute(request).is_err());
        assert_eq!(mock.request_count(), 3);
    }

    #[test]
    fn channel_body_stops_on_cancel_while_stalled() {
        let (tx, rx) = mpsc::sync_channel(BODY_QUEUE_DEPTH);
        let token = CancelToken::new();
        let mut body = ChannelBody::new(rx, token.clone());
        tx.send(BodyChunk::Data(b"<osm".to_vec())).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(body.read(&mut buf).unwrap(), 4);

        let canceller = {
            let token = token.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                token.cancel();
            })
        };
        let started = std::time::Instant::now();
        let err = body.read(&mut buf).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(crate::cancel::map_io_error(err, &CancelToken::new()).is_cancelled());
        canceller.join().unwrap();
        drop(tx);
    }

    #[test]
    fn channel_body_reports_end_and_failures() {
        let (tx, rx) = mpsc::sync_channel(BODY_QUEUE_DEPTH);
        tx.send(BodyChunk::Data(b"ab".to_vec())).unwrap();
        tx.send(BodyChunk::End).unwrap();
        let mut text = String::new();
        ChannelBody::new(rx, CancelToken::new())
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "ab");

        let (tx, rx) = mpsc::sync_channel(BODY_QUEUE_DEPTH);
        tx.send(BodyChunk::Failed(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset",
        )))
        .unwrap();
        let mut buf = [0u8; 4];
        let err = ChannelBody::new(rx, CancelToken::new())
            .read(&mut buf)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
