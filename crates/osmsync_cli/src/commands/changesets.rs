//! Changesets command implementation.

use super::CommandResult;
use chrono::SecondsFormat;
use osmsync_protocol::Changeset;
use osmsync_transfer::TransferSession;
use serde::Serialize;
use std::collections::BTreeMap;

/// One changeset as printed.
#[derive(Debug, Serialize)]
pub struct ChangesetRow {
    /// Changeset id.
    pub id: u64,
    /// Whether the changeset is open.
    pub open: bool,
    /// Creation time.
    pub created_at: Option<String>,
    /// Closing time.
    pub closed_at: Option<String>,
    /// Number of edits.
    pub changes_count: u64,
    /// Changeset tags.
    pub tags: BTreeMap<String, String>,
}

impl From<&Changeset> for ChangesetRow {
    fn from(changeset: &Changeset) -> Self {
        Self {
            id: changeset.id(),
            open: changeset.is_open(),
            created_at: changeset
                .created_at()
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            closed_at: changeset
                .closed_at()
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            changes_count: changeset.changes_count(),
            tags: changeset.tags().clone(),
        }
    }
}

/// Queries changesets by id. Unknown ids are left out.
pub fn fetch(session: &TransferSession, ids: &[u64]) -> CommandResult<Vec<ChangesetRow>> {
    let changesets = session.api().query_changesets(ids)?;
    Ok(changesets.iter().map(ChangesetRow::from).collect())
}

/// Runs the changesets command.
pub fn run(session: &TransferSession, ids: &[u64], format: &str) -> CommandResult<()> {
    let rows = fetch(session, ids)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
        _ => {
            if rows.is_empty() {
                println!("No changesets found");
            }
            for row in &rows {
                let state = if row.open { "open" } else { "closed" };
                println!("{:>10}  {:<6}  {:>6} changes", row.id, state, row.changes_count);
                if let Some(comment) = row.tags.get("comment") {
                    println!("            {}", comment);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing;

    #[test]
    fn lists_known_changesets() {
        let (server, session) = testing::session();
        let mut tags = BTreeMap::new();
        tags.insert("comment".to_string(), "fix names".to_string());
        let open = server.store().create_changeset(tags, osmsync_server::ANONYMOUS);
        let closed = server
            .store()
            .create_changeset(BTreeMap::new(), osmsync_server::ANONYMOUS);
        server.store().expire_changeset(closed);

        let rows = fetch(&session, &[open, closed, 404]).unwrap();
        assert_eq!(rows.len(), 2);
        let first = rows.iter().find(|r| r.id == open).unwrap();
        assert!(first.open);
        assert_eq!(first.tags["comment"], "fix names");
        let second = rows.iter().find(|r| r.id == closed).unwrap();
        assert!(!second.open);
        assert!(second.closed_at.is_some());
    }
}
