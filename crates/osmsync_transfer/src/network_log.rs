//! Diagnostic log of the last network error per URL.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Last error recorded for a URL.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkErrorEntry {
    /// Error description.
    pub message: String,
    /// Time the error was recorded.
    pub at: DateTime<Utc>,
}

/// URL to last-error map. Kept in memory only.
#[derive(Debug, Default)]
pub struct NetworkErrorLog {
    entries: Mutex<BTreeMap<String, NetworkErrorEntry>>,
}

impl NetworkErrorLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an error, replacing any earlier one for the same URL.
    pub fn record(&self, url: &str, message: impl Into<String>) {
        self.entries.lock().insert(
            url.to_string(),
            NetworkErrorEntry {
                message: message.into(),
                at: Utc::now(),
            },
        );
    }

    /// Last error for a URL.
    pub fn get(&self, url: &str) -> Option<NetworkErrorEntry> {
        self.entries.lock().get(url).cloned()
    }

    /// Snapshot of all entries, ordered by URL.
    pub fn entries(&self) -> Vec<(String, NetworkErrorEntry)> {
        self.entries
            .lock()
            .iter()
            .map(|(url, entry)| (url.clone(), entry.clone()))
            .collect()
    }

    /// Number of URLs with a recorded error.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Forgets every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
