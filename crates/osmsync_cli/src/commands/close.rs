//! Close command implementation.

use super::CommandResult;
use osmsync_transfer::TransferSession;

/// Runs the close command.
pub fn run(session: &TransferSession, id: u64) -> CommandResult<()> {
    let changeset = session.close_changeset(id)?;
    match changeset.closed_at() {
        Some(at) => println!("✓ Closed changeset {} at {}", id, at.to_rfc3339()),
        None => println!("✓ Closed changeset {}", id),
    }
    Ok(())
}
