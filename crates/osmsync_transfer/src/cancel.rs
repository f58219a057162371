//! Cooperative cancellation of transfers.
//!
//! A [`CancelToken`] is checked before dispatch, between chunk writes and on
//! every read of a response body. Cancelling waits a bounded grace period for
//! the in-flight request to observe the flag; it never blocks longer.

use crate::error::{TransferError, TransferResult};
use parking_lot::{Condvar, Mutex};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    in_flight: Mutex<usize>,
    idle: Condvar,
}

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    /// Creates an unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag. Callable from any thread.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Clears the flag so the token can guard a new transfer.
    pub fn reset(&self) {
        self.state.cancelled.store(false, Ordering::SeqCst);
    }

    /// Fails with [`TransferError::Cancelled`] if the flag is set.
    pub fn check(&self) -> TransferResult<()> {
        if self.is_cancelled() {
            Err(TransferError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Number of requests currently in flight.
    pub fn in_flight(&self) -> usize {
        *self.state.in_flight.lock()
    }

    /// Waits until no request is in flight or `grace` elapsed.
    ///
    /// Returns true if the transfer went idle in time.
    pub fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        let mut in_flight = self.state.in_flight.lock();
        while *in_flight > 0 {
            if self.state.idle.wait_until(&mut in_flight, deadline).timed_out() {
                return *in_flight == 0;
            }
        }
        true
    }

    pub(crate) fn begin_request(&self) -> InFlightGuard {
        *self.state.in_flight.lock() += 1;
        InFlightGuard {
            state: Arc::clone(&self.state),
        }
    }
}

/// Marks one request as in flight until dropped.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    state: Arc<CancelState>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.state.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.state.idle.notify_all();
        }
    }
}

/// Marker carried by the I/O error a cancelled read returns.
#[derive(Debug)]
pub(crate) struct CancelledRead;

impl std::fmt::Display for CancelledRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("transfer cancelled")
    }
}

impl std::error::Error for CancelledRead {}

/// Response body that stops reading once its token is cancelled.
pub struct CancellableRead<R> {
    inner: R,
    token: CancelToken,
    _guard: InFlightGuard,
}

impl<R: Read> CancellableRead<R> {
    pub(crate) fn new(inner: R, token: CancelToken, guard: InFlightGuard) -> Self {
        Self {
            inner,
            token,
            _guard: guard,
        }
    }
}

impl<R: Read> Read for CancellableRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, CancelledRead));
        }
        match self.inner.read(buf) {
            Err(_) if self.token.is_cancelled() => {
                Err(io::Error::new(io::ErrorKind::Other, CancelledRead))
            }
            other => other,
        }
    }
}

/// Maps an I/O error, reporting cancellation instead of the raw cause.
pub(crate) fn map_io_error(err: io::Error, token: &CancelToken) -> TransferError {
    let is_cancel_marker = err
        .get_ref()
        .map(|inner| inner.is::<CancelledRead>())
        .unwrap_or(false);
    if is_cancel_marker || token.is_cancelled() {
        TransferError::Cancelled
    } else {
        TransferError::transport(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn check_and_reset() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(matches!(token.check(), Err(TransferError::Cancelled)));
        token.reset();
        assert!(token.check().is_ok());
    }

    #[test]
    fn wait_idle_is_bounded() {
        let token = CancelToken::new();
        let guard = token.begin_request();
        let started = Instant::now();
        assert!(!token.wait_idle(Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(guard);
        assert!(token.wait_idle(Duration::from_millis(50)));
    }

    #[test]
    fn wait_idle_returns_when_request_finishes() {
        let token = CancelToken::new();
        let guard = token.begin_request();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(guard);
        });
        assert!(token.wait_idle(Duration::from_secs(5)));
        handle.join().unwrap();
        assert_eq!(token.in_flight(), 0);
    }

    #[test]
    fn cancelled_read_maps_to_cancelled() {
        let token = CancelToken::new();
        let mut body = CancellableRead::new(&b"abcdef"[..], token.clone(), token.begin_request());
        let mut buf = [0u8; 3];
        assert_eq!(body.read(&mut buf).unwrap(), 3);

        token.cancel();
        let err = body.read(&mut buf).unwrap_err();
        assert!(map_io_error(err, &CancelToken::new()).is_cancelled());
    }
}
