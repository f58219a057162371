//! Progress reporting for long transfers.

use crate::cancel::CancelToken;

/// Receives progress of long transfers.
///
/// All methods have no-op defaults.
pub trait ProgressSink: Send + Sync {
    /// A transfer of `total` units started.
    fn begin(&self, _total: usize) {}

    /// `done` of `total` units are finished.
    fn chunk_done(&self, _done: usize, _total: usize) {}

    /// Free-form status message.
    fn message(&self, _message: &str) {}

    /// Lets the sink request cancellation between chunks.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {}

impl ProgressSink for CancelToken {
    fn is_cancelled(&self) -> bool {
        CancelToken::is_cancelled(self)
    }
}
