//! Changeset metadata and lifecycle.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::collections::BTreeMap;

/// Server-side transactional grouping of edits.
///
/// An id of 0 means the changeset was not yet created on the server. Once
/// closed, a changeset is never reopened; use [`Changeset::successor`] to
/// continue with the same tags.
#[derive(Debug, Clone, PartialEq)]
pub struct Changeset {
    id: u64,
    created_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    open: bool,
    changes_count: u64,
    tags: BTreeMap<String, String>,
}

impl Default for Changeset {
    fn default() -> Self {
        Self::new()
    }
}

impl Changeset {
    /// Creates a local changeset not yet known to the server.
    pub fn new() -> Self {
        Self {
            id: 0,
            created_at: None,
            closed_at: None,
            open: false,
            changes_count: 0,
            tags: BTreeMap::new(),
        }
    }

    /// Adds a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Builds a changeset from server-reported state.
    ///
    /// A closing timestamp always forces the closed state.
    pub fn from_server(
        id: u64,
        created_at: Option<DateTime<Utc>>,
        closed_at: Option<DateTime<Utc>>,
        open: bool,
        changes_count: u64,
        tags: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id,
            created_at,
            closed_at,
            open: open && closed_at.is_none(),
            changes_count,
            tags,
        }
    }

    /// Server id, 0 if not yet created.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns true if the changeset has no server id yet.
    pub fn is_new(&self) -> bool {
        self.id == 0
    }

    /// Returns true while the changeset accepts uploads.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Closing timestamp.
    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    /// Number of edits applied so far.
    pub fn changes_count(&self) -> u64 {
        self.changes_count
    }

    /// Tags.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Replaces the tags.
    pub fn set_tags(&mut self, tags: BTreeMap<String, String>) {
        self.tags = tags;
    }

    /// Records the id assigned by the server and marks the changeset open.
    pub fn assign_id(&mut self, id: u64, at: DateTime<Utc>) -> ProtocolResult<()> {
        if !self.is_new() {
            return Err(ProtocolError::illegal_state(format!(
                "changeset already has id {}",
                self.id
            )));
        }
        if id == 0 {
            return Err(ProtocolError::illegal_state("server assigned changeset id 0"));
        }
        self.id = id;
        self.created_at = Some(at);
        self.open = true;
        Ok(())
    }

    /// Marks the changeset closed.
    pub fn mark_closed(&mut self, at: Option<DateTime<Utc>>) {
        self.open = false;
        if at.is_some() {
            self.closed_at = at;
        }
    }

    /// Adds `count` to the number of applied edits.
    pub fn record_upload(&mut self, count: u64) {
        self.changes_count = self.changes_count.saturating_add(count);
    }

    /// A fresh local changeset carrying the same tags.
    pub fn successor(&self) -> Self {
        Self {
            tags: self.tags.clone(),
            ..Self::new()
        }
    }

    /// Returns true if the changeset is open and was created at least `min_age` before `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, min_age: Duration) -> bool {
        match self.created_at {
            Some(created) if self.open => now - created > min_age,
            _ => false,
        }
    }
}

/// Parses a server timestamp.
///
/// Accepts RFC 3339 and the `2010-09-07 14:39:41 UTC` form used in error headers.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S UTC")
        .ok()
        .map(|naive| naive.and_utc())
}
