//! Cancelling transfers blocked on a real socket.

use osmsync_protocol::Bounds;
use osmsync_transfer::{MemoryCredentials, TransferConfig, TransferError, TransferSession};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const PARTIAL_MAP: &str = "HTTP/1.1 200 OK\r\n\
    Content-Type: text/xml\r\n\
    Content-Length: 100000\r\n\
    \r\n\
    <osm version=\"0.6\"><node id=\"1\" lat=\"1.0\" lon=\"2.0\" version=\"1\"/>";

/// Accepts one connection, reads the request head, writes `reply` and then
/// holds the socket open without sending anything else until stopped.
struct StallingServer {
    port: u16,
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl StallingServer {
    fn start(reply: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (stop, stopped) = mpsc::channel();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request_head(&mut stream);
            stream.write_all(reply.as_bytes()).unwrap();
            stream.flush().unwrap();
            let _ = stopped.recv_timeout(Duration::from_secs(10));
        });
        Self { port, stop, handle }
    }

    fn session(&self) -> Arc<TransferSession> {
        let config = TransferConfig::new(format!("http://127.0.0.1:{}/api", self.port))
            .with_timeout(Duration::from_secs(30))
            .with_cancel_grace(Duration::from_secs(1));
        Arc::new(TransferSession::with_ureq(config, Arc::new(MemoryCredentials::new())).unwrap())
    }

    fn shutdown(self) {
        let _ = self.stop.send(());
        self.handle.join().unwrap();
    }
}

fn read_request_head(stream: &mut TcpStream) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(0) | Err(_) => return,
            Ok(_) => head.push(byte[0]),
        }
    }
}

fn spawn_map_read(
    session: &Arc<TransferSession>,
    first_record: mpsc::Sender<()>,
) -> JoinHandle<Result<usize, TransferError>> {
    let session = Arc::clone(session);
    thread::spawn(move || {
        session
            .api()
            .read_map(&Bounds::new(0.0, 0.0, 3.0, 3.0), |_record| {
                let _ = first_record.send(());
                Ok(())
            })
    })
}

fn join_within(
    reader: JoinHandle<Result<usize, TransferError>>,
    limit: Duration,
) -> Result<usize, TransferError> {
    let deadline = Instant::now() + limit;
    while !reader.is_finished() {
        assert!(Instant::now() < deadline, "read did not return after cancel");
        thread::sleep(Duration::from_millis(10));
    }
    reader.join().unwrap()
}

#[test]
fn cancel_interrupts_a_stalled_body() {
    let server = StallingServer::start(PARTIAL_MAP);
    let session = server.session();
    let (first_record, record_seen) = mpsc::channel();
    let reader = spawn_map_read(&session, first_record);

    // Headers and the start of the body are already on the wire.
    let _ = record_seen.recv_timeout(Duration::from_secs(2));
    thread::sleep(Duration::from_millis(200));
    assert!(!reader.is_finished());

    let cancelled_at = Instant::now();
    assert!(session.cancel());
    let result = join_within(reader, Duration::from_secs(2));
    assert!(matches!(result, Err(TransferError::Cancelled)), "{:?}", result);
    assert!(cancelled_at.elapsed() < Duration::from_secs(2));

    server.shutdown();
}

#[test]
fn cancel_interrupts_a_request_waiting_for_headers() {
    let server = StallingServer::start("");
    let session = server.session();
    let (first_record, _record_seen) = mpsc::channel();
    let reader = spawn_map_read(&session, first_record);

    thread::sleep(Duration::from_millis(300));
    assert!(!reader.is_finished());

    assert!(session.cancel());
    let result = join_within(reader, Duration::from_secs(2));
    assert!(matches!(result, Err(TransferError::Cancelled)), "{:?}", result);

    session.connection().reset_cancel();
    assert!(session.connection().check_cancelled().is_ok());

    server.shutdown();
}
