//! Reconcile command implementation.
//!
//! Changesets left open by `upload --keep-open` are tracked in a JSON state
//! file. Reconciling queries the server for them and drops the ones that
//! were closed in the meantime.

use super::CommandResult;
use chrono::SecondsFormat;
use osmsync_protocol::{parse_timestamp, Changeset};
use osmsync_transfer::{TickOutcome, TransferSession};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Changesets known to be open.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StateFile {
    /// Tracked changesets, by id.
    pub changesets: Vec<TrackedChangeset>,
}

/// One tracked changeset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedChangeset {
    /// Changeset id.
    pub id: u64,
    /// Creation time as RFC 3339.
    pub created_at: Option<String>,
    /// Number of edits uploaded so far.
    pub changes_count: u64,
    /// Changeset tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl StateFile {
    /// Starts tracking an open changeset, replacing an older entry.
    pub fn track(&mut self, changeset: &Changeset) {
        self.changesets.retain(|c| c.id != changeset.id());
        self.changesets.push(TrackedChangeset {
            id: changeset.id(),
            created_at: changeset
                .created_at()
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            changes_count: changeset.changes_count(),
            tags: changeset.tags().clone(),
        });
    }

    /// Tracked changesets as open changesets.
    pub fn to_changesets(&self) -> Vec<Changeset> {
        self.changesets
            .iter()
            .map(|c| {
                Changeset::from_server(
                    c.id,
                    c.created_at.as_deref().and_then(parse_timestamp),
                    None,
                    true,
                    c.changes_count,
                    c.tags.clone(),
                )
            })
            .collect()
    }
}

/// Loads the state file. A missing file is an empty state.
pub fn load_state(path: &Path) -> CommandResult<StateFile> {
    if !path.exists() {
        return Ok(StateFile::default());
    }
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

/// Writes the state file.
pub fn save_state(path: &Path, state: &StateFile) -> CommandResult<()> {
    let data = serde_json::to_string_pretty(state)?;
    std::fs::write(path, data)?;
    Ok(())
}

/// Result of one reconciliation.
#[derive(Debug, Default, Serialize)]
pub struct ReconcileSummary {
    /// Changesets queried.
    pub queried: usize,
    /// Changesets found closed.
    pub closed: Vec<u64>,
    /// Changesets still open.
    pub open: Vec<u64>,
}

/// Reconciles the tracked changesets once and rewrites the state file.
pub fn reconcile(session: &TransferSession, state_path: &Path) -> CommandResult<ReconcileSummary> {
    let state = load_state(state_path)?;
    let cache = session.cache();
    for changeset in state.to_changesets() {
        cache.upsert(changeset);
    }

    let queried = match session.reconcile_now()? {
        TickOutcome::Reconciled { queried, .. } => queried,
        TickOutcome::Skipped => 0,
    };

    let mut summary = ReconcileSummary {
        queried,
        ..ReconcileSummary::default()
    };
    let mut remaining = StateFile::default();
    for tracked in &state.changesets {
        match cache.get(tracked.id) {
            Some(changeset) if changeset.is_open() => {
                summary.open.push(tracked.id);
                remaining.track(&changeset);
            }
            _ => summary.closed.push(tracked.id),
        }
    }
    debug!(closed = summary.closed.len(), open = summary.open.len(), "state reconciled");
    save_state(state_path, &remaining)?;
    Ok(summary)
}

/// Runs the reconcile command.
pub fn run(session: &TransferSession, state_path: &Path, format: &str) -> CommandResult<()> {
    let summary = reconcile(session, state_path)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        _ => {
            println!("Queried {} changeset(s)", summary.queried);
            for id in &summary.closed {
                println!("  closed: {}", id);
            }
            for id in &summary.open {
                println!("  open:   {}", id);
            }
        }
    }
    Ok(())
}
