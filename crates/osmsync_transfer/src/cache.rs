//! Changeset lifecycle tracker.
//!
//! A keyed cache of changesets plus an index of the open ones. The cache
//! never talks to the network; reconciliation and uploads feed it.

use osmsync_protocol::Changeset;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<u64, Changeset>,
    open: BTreeSet<u64>,
}

impl CacheState {
    fn put(&mut self, changeset: Changeset) {
        let id = changeset.id();
        if changeset.is_open() {
            self.open.insert(id);
        } else {
            self.open.remove(&id);
        }
        self.entries.insert(id, changeset);
    }
}

/// Thread-safe changeset cache.
#[derive(Debug, Default)]
pub struct ChangesetCache {
    state: RwLock<CacheState>,
}

impl ChangesetCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached changeset by id.
    pub fn get(&self, id: u64) -> Option<Changeset> {
        self.state.read().entries.get(&id).cloned()
    }

    /// Inserts or replaces a changeset. Local changesets (id 0) are ignored.
    ///
    /// An open record never reopens a closed entry: its other fields are
    /// taken but the entry stays closed with its closing time.
    pub fn upsert(&self, mut changeset: Changeset) {
        if changeset.is_new() {
            return;
        }
        let mut state = self.state.write();
        if let Some(existing) = state.entries.get(&changeset.id()) {
            if !existing.is_open() && changeset.is_open() {
                debug!(changeset_id = changeset.id(), "keeping cached changeset closed");
                changeset.mark_closed(existing.closed_at());
            }
        }
        state.put(changeset);
    }

    /// Snapshot of the open changesets, ordered by id.
    pub fn list_open(&self) -> Vec<Changeset> {
        let state = self.state.read();
        state
            .open
            .iter()
            .filter_map(|id| state.entries.get(id).cloned())
            .collect()
    }

    /// Merges server records into the cache.
    ///
    /// A closed entry is never replaced by an open record. Between two
    /// closed records, the one with the later closing time wins. Returns the
    /// number of entries that changed.
    pub fn update(&self, from_server: Vec<Changeset>) -> usize {
        let mut state = self.state.write();
        let mut changed = 0;
        for incoming in from_server {
            if incoming.is_new() {
                continue;
            }
            let replace = match state.entries.get(&incoming.id()) {
                None => true,
                Some(existing) if existing == &incoming => false,
                Some(existing) if !existing.is_open() && incoming.is_open() => {
                    debug!(changeset_id = incoming.id(), "ignoring reopened changeset");
                    false
                }
                Some(existing) if !existing.is_open() => {
                    match (existing.closed_at(), incoming.closed_at()) {
                        (Some(old), Some(new)) => new >= old,
                        (Some(_), None) => false,
                        (None, _) => true,
                    }
                }
                Some(_) => true,
            };
            if replace {
                state.put(incoming);
                changed += 1;
            }
        }
        changed
    }

    /// Marks a cached changeset closed. Returns false if it is not cached.
    pub fn mark_closed(&self, id: u64, at: Option<chrono::DateTime<chrono::Utc>>) -> bool {
        let mut state = self.state.write();
        let Some(changeset) = state.entries.get_mut(&id) else {
            return false;
        };
        changeset.mark_closed(at);
        state.open.remove(&id);
        true
    }

    /// Removes a changeset.
    pub fn remove(&self, id: u64) -> Option<Changeset> {
        let mut state = self.state.write();
        state.open.remove(&id);
        state.entries.remove(&id)
    }

    /// Number of cached changesets.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.entries.clear();
        state.open.clear();
    }
}
