//! Transport connection to the API server.
//!
//! Every request goes through [`OsmConnection::execute`], which consults the
//! offline gate, attaches authentication, tracks the request for cancellation
//! and turns non-2xx responses into typed failures.

use crate::auth::{self, AuthMethod, CredentialsProvider};
use crate::cancel::{map_io_error, CancelToken, CancellableRead};
use crate::classify::classify;
use crate::error::{ChangesetClosedSource, TransferError, TransferResult};
use crate::http::{HttpClient, HttpRequest, Method};
use crate::network_log::NetworkErrorLog;
use crate::offline::OfflineGate;
use osmsync_protocol::{ProtocolError, GENERATOR, PROTOCOL_VERSION};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

const ACCEPT: &str = "application/xml, */*;q=0.8";
const CONTENT_TYPE_XML: &str = "text/xml";
const CONTENT_TYPE_FORM: &str = "application/x-www-form-urlencoded";

/// One API call, relative to the server URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    body: Option<Vec<u8>>,
    content_type: &'static str,
    authenticated: bool,
    versioned: bool,
    source: ChangesetClosedSource,
}

impl ApiRequest {
    fn new(method: Method, path: impl Into<String>, body: Option<Vec<u8>>) -> Self {
        Self {
            method,
            path: path.into(),
            body,
            content_type: CONTENT_TYPE_XML,
            authenticated: false,
            versioned: true,
            source: ChangesetClosedSource::Unspecified,
        }
    }

    /// GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path, None)
    }

    /// PUT request.
    pub fn put(path: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new(Method::Put, path, Some(body.into()))
    }

    /// POST request.
    pub fn post(path: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new(Method::Post, path, Some(body.into()))
    }

    /// DELETE request.
    pub fn delete(path: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new(Method::Delete, path, Some(body.into()))
    }

    /// Attaches credentials.
    pub fn authenticated(mut self) -> Self {
        self.authenticated = true;
        self
    }

    /// Sends the body form-encoded instead of as XML.
    pub fn form_encoded(mut self) -> Self {
        self.content_type = CONTENT_TYPE_FORM;
        self
    }

    /// Addresses the path relative to the server URL, without the version segment.
    pub fn unversioned(mut self) -> Self {
        self.versioned = false;
        self
    }

    /// Tags a changeset-closed conflict with the operation that caused it.
    pub fn conflict_source(mut self, source: ChangesetClosedSource) -> Self {
        self.source = source;
        self
    }

    /// Method.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Path relative to the base URL.
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Successful response with a cancellable body.
pub struct ApiResponse {
    status: u16,
    headers: Vec<(String, String)>,
    url: String,
    body: CancellableRead<Box<dyn Read + Send>>,
    cancel: CancelToken,
}

impl ApiResponse {
    /// Status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Request URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Streaming body. Reads fail once the connection is cancelled.
    pub fn into_reader(self) -> impl Read + Send {
        self.body
    }

    /// Reads the whole body as text.
    pub fn text(mut self) -> TransferResult<String> {
        let mut bytes = Vec::new();
        self.body
            .read_to_end(&mut bytes)
            .map_err(|e| map_io_error(e, &self.cancel))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl std::fmt::Debug for ApiResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiResponse")
            .field("status", &self.status)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// Connection to one API server.
pub struct OsmConnection {
    server_url: String,
    api_base: String,
    host: String,
    auth_method: AuthMethod,
    client: Arc<dyn HttpClient>,
    gate: Arc<OfflineGate>,
    credentials: Arc<dyn CredentialsProvider>,
    errors: Arc<NetworkErrorLog>,
    cancel: CancelToken,
    grace: Duration,
}

impl OsmConnection {
    /// Creates a connection.
    ///
    /// `server_url` is the API URL without the protocol version segment.
    pub fn new(
        server_url: &str,
        auth_method: AuthMethod,
        client: Arc<dyn HttpClient>,
        gate: Arc<OfflineGate>,
        credentials: Arc<dyn CredentialsProvider>,
        errors: Arc<NetworkErrorLog>,
    ) -> TransferResult<Self> {
        let server_url = server_url.trim_end_matches('/').to_string();
        let parsed = Url::parse(&server_url).map_err(|e| {
            TransferError::Config(format!("invalid server url '{}': {}", server_url, e))
        })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| TransferError::Config(format!("server url '{}' has no host", server_url)))?
            .to_string();
        let api_base = format!("{}/{}/", server_url, PROTOCOL_VERSION);
        Ok(Self {
            server_url,
            api_base,
            host,
            auth_method,
            client,
            gate,
            credentials,
            errors,
            cancel: CancelToken::new(),
            grace: Duration::from_millis(100),
        })
    }

    /// Sets how long [`cancel`](Self::cancel) waits for an in-flight request.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Server URL without the version segment.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Base URL of versioned calls, ending in `/`.
    pub fn api_base_url(&self) -> &str {
        &self.api_base
    }

    /// Server host, used to key credentials.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Authentication scheme.
    pub fn auth_method(&self) -> AuthMethod {
        self.auth_method
    }

    /// Token observed by this connection.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Shared error log.
    pub fn network_errors(&self) -> &NetworkErrorLog {
        &self.errors
    }

    /// Absolute URL for a request.
    pub fn url_for(&self, request: &ApiRequest) -> String {
        let path = request.path.trim_start_matches('/');
        if request.versioned {
            format!("{}{}", self.api_base, path)
        } else {
            format!("{}/{}", self.server_url, path)
        }
    }

    /// Cancels the current transfer and every later one until
    /// [`reset_cancel`](Self::reset_cancel).
    ///
    /// Waits at most the grace period for an in-flight request to unwind and
    /// returns true if it did.
    pub fn cancel(&self) -> bool {
        info!(host = %self.host, "cancelling transfer");
        self.cancel.cancel();
        let idle = self.cancel.wait_idle(self.grace);
        if !idle {
            warn!(in_flight = self.cancel.in_flight(), "request still in flight after grace period");
        }
        idle
    }

    /// Makes the connection usable again after a cancel.
    pub fn reset_cancel(&self) {
        self.cancel.reset();
    }

    /// Fails with [`TransferError::Cancelled`] once cancelled.
    pub fn check_cancelled(&self) -> TransferResult<()> {
        self.cancel.check()
    }

    /// Converts a codec failure that happened while reading a response.
    pub fn protocol_error(&self, err: ProtocolError) -> TransferError {
        match err {
            ProtocolError::Io(io) => map_io_error(io, &self.cancel),
            _ if self.cancel.is_cancelled() => TransferError::Cancelled,
            other => other.into(),
        }
    }

    /// Sends a request.
    ///
    /// Returns the response of a 2xx status; every other status becomes a
    /// typed failure.
    pub fn execute(&self, request: ApiRequest) -> TransferResult<ApiResponse> {
        self.cancel.check()?;
        let url = self.url_for(&request);
        self.gate.ensure_url_online(&url)?;

        let mut headers = vec![
            ("User-Agent".to_string(), GENERATOR.to_string()),
            ("Accept".to_string(), ACCEPT.to_string()),
        ];
        if request.body.is_some() {
            headers.push(("Content-Type".to_string(), request.content_type.to_string()));
        }
        if request.authenticated {
            let value = auth::authorization_header(
                self.auth_method,
                self.credentials.as_ref(),
                &self.host,
                request.method.as_str(),
                &url,
            )?;
            headers.push(("Authorization".to_string(), value));
        }

        debug!(method = %request.method, url = %url, "sending request");
        let guard = self.cancel.begin_request();
        let outgoing = HttpRequest {
            method: request.method,
            url: url.clone(),
            headers,
            body: request.body,
        };
        let response = match self.client.execute_cancellable(outgoing, &self.cancel) {
            Ok(response) => response,
            Err(err) => {
                let err = map_io_error(err, &self.cancel);
                if !err.is_cancelled() {
                    self.errors.record(&url, err.to_string());
                }
                return Err(err);
            }
        };
        self.cancel.check()?;

        let status = response.status;
        debug!(status, url = %url, "response received");
        let mut body = CancellableRead::new(response.body, self.cancel.clone(), guard);
        if (200..300).contains(&status) {
            return Ok(ApiResponse {
                status,
                headers: response.headers,
                url,
                body,
                cancel: self.cancel.clone(),
            });
        }

        let mut raw = Vec::new();
        body.read_to_end(&mut raw)
            .map_err(|e| map_io_error(e, &self.cancel))?;
        let text = String::from_utf8_lossy(&raw);
        let text = text.trim();
        let header = response
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Error"))
            .map(|(_, v)| v.trim().to_string());
        match &header {
            Some(header) => error!(status, url = %url, error = %header, "api request failed"),
            None if !text.is_empty() => error!(status, url = %url, body = %text, "api request failed"),
            None => error!(status, url = %url, "api request failed"),
        }
        if status == 401 || status == 403 {
            warn!(host = %self.host, "purging cached credentials");
            self.credentials.purge(&self.host);
        }

        let failure = match classify(
            status,
            header.as_deref(),
            Some(text),
            &url,
            request.source,
        ) {
            Err(err) => err,
            Ok(()) => TransferError::Api {
                status,
                header: header.clone(),
                body: Some(text.to_string()),
                url: url.clone(),
            },
        };
        self.errors.record(&url, failure.to_string());
        Err(failure)
    }
}

impl std::fmt::Debug for OsmConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsmConnection")
            .field("api_base", &self.api_base)
            .field("auth_method", &self.auth_method)
            .finish_non_exhaustive()
    }
}
