//! Upload command implementation.

use super::reconcile::{load_state, save_state};
use super::CommandResult;
use osmsync_protocol::{Changeset, Edit, OsmReader, OsmRecord};
use osmsync_transfer::{
    parse_strategy, FailedChunkPolicy, MaxChangesetSizeExceededPolicy, ProgressSink,
    TransferSession, UploadFailure, UploadReport, UploadStrategySpec,
};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::info;

/// Upload settings overriding the session configuration.
#[derive(Debug, Default, Clone)]
pub struct UploadOptions {
    /// Strategy name (`individualobjects`, `chunked`, `singlerequest`).
    pub strategy: Option<String>,
    /// Chunk size for the chunked strategy.
    pub chunk_size: Option<usize>,
    /// Reaction to a full changeset.
    pub policy: Option<MaxChangesetSizeExceededPolicy>,
    /// Skip the chunk rejected by a full changeset instead of retrying it.
    pub skip_failed_chunk: bool,
    /// Leave the last changeset open.
    pub keep_open: bool,
    /// Tags of a new changeset.
    pub tags: Vec<(String, String)>,
    /// Existing open changeset to upload into.
    pub changeset: Option<u64>,
    /// State file tracking changesets left open.
    pub state: Option<PathBuf>,
}

impl UploadOptions {
    /// Applies the options to a base specification.
    pub fn spec(&self, base: UploadStrategySpec) -> CommandResult<UploadStrategySpec> {
        let mut spec = base;
        if let Some(name) = &self.strategy {
            spec.strategy = parse_strategy(name, self.chunk_size)?;
        }
        if let Some(policy) = self.policy {
            spec.policy = policy;
        }
        if self.skip_failed_chunk {
            spec.failed_chunk_policy = FailedChunkPolicy::Skip;
        }
        if self.keep_open {
            spec.close_changeset_after_upload = false;
        }
        Ok(spec)
    }
}

/// Reads the edits of an `<osmChange>` file, in document order.
pub fn read_edits(path: &Path) -> CommandResult<Vec<Edit>> {
    let file = File::open(path).map_err(|e| format!("cannot open {:?}: {}", path, e))?;
    let mut edits = Vec::new();
    for record in OsmReader::new(BufReader::new(file)) {
        if let OsmRecord::Primitive { action, primitive } = record? {
            let action = action.ok_or_else(|| {
                format!("{} carries no action", primitive.primitive_id())
            })?;
            edits.push(Edit::new(action, primitive));
        }
    }
    Ok(edits)
}

/// Logs chunk progress.
struct LogProgress;

impl ProgressSink for LogProgress {
    fn begin(&self, total: usize) {
        info!(total, "uploading");
    }

    fn chunk_done(&self, done: usize, total: usize) {
        info!(done, total, "chunk uploaded");
    }
}

/// Uploads the edits of `path`.
pub fn upload(
    session: &TransferSession,
    path: &Path,
    options: &UploadOptions,
) -> CommandResult<Result<UploadReport, UploadFailure>> {
    let edits = read_edits(path)?;
    if edits.is_empty() {
        return Err(format!("no edits in {:?}", path).into());
    }
    let spec = options.spec(session.config().upload)?;
    let changeset = match options.changeset {
        Some(id) => session.api().get_changeset(id)?,
        None => options
            .tags
            .iter()
            .fold(Changeset::new(), |c, (k, v)| c.with_tag(k, v)),
    };

    let outcome = session.upload_with(spec, changeset, edits, &LogProgress);
    if let Some(state_path) = &options.state {
        let changesets = match &outcome {
            Ok(report) => &report.changesets,
            Err(failure) => &failure.changesets,
        };
        let mut state = load_state(state_path)?;
        for changeset in changesets.iter().filter(|c| c.is_open()) {
            state.track(changeset);
        }
        save_state(state_path, &state)?;
    }
    Ok(outcome)
}

/// Runs the upload command.
pub fn run(session: &TransferSession, path: &Path, options: &UploadOptions) -> CommandResult<()> {
    match upload(session, path, options)? {
        Ok(report) => {
            for changeset in &report.changesets {
                let state = if changeset.is_open() { "open" } else { "closed" };
                println!("Changeset {} ({})", changeset.id(), state);
            }
            println!("✓ Uploaded {} edit(s) in {} request(s)", report.committed_count(), report.requests);
            if !report.already_deleted.is_empty() {
                println!("  {} deletion(s) were already applied", report.already_deleted.len());
            }
            if !report.skipped.is_empty() {
                println!("  Skipped: {:?}", report.skipped);
            }
            if report.stopped_on_full {
                println!(
                    "⚠ Changeset full, {} edit(s) not uploaded",
                    report.pending.len()
                );
            }
            if let Some(err) = &report.close_error {
                println!("⚠ Failed to close changeset: {}", err);
            }
            Ok(())
        }
        Err(failure) => {
            println!("⚠ Upload failed: {}", failure.error);
            println!("  Committed: {}", failure.committed_count());
            println!("  Pending:   {}", failure.pending.len());
            if let Some(in_doubt) = &failure.in_doubt {
                println!("  In doubt:  {:?}", in_doubt);
            }
            Err(failure.into())
        }
    }
}
