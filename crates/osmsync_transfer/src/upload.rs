//! Uploading an edit set into one or more changesets.
//!
//! Chunks are sent strictly in plan order. Ids assigned by the server for
//! earlier chunks are written into later ones before they are sent.

use crate::api::OsmApi;
use crate::cache::ChangesetCache;
use crate::error::{PrimitiveGone, TransferError, TransferResult};
use crate::progress::{NullProgress, ProgressSink};
use crate::strategy::{
    FailedChunkPolicy, MaxChangesetSizeExceededPolicy, UploadStrategy, UploadStrategySpec,
};
use osmsync_protocol::{ChangeAction, Changeset, DiffResultEntry, Edit, PrimitiveId};
use std::collections::HashMap;
use std::ops::Range;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Outcome of an upload that did not fail.
#[derive(Debug)]
pub struct UploadReport {
    /// Changesets used, in order, in their final local state.
    pub changesets: Vec<Changeset>,
    /// Server outcome of every committed edit.
    pub committed: Vec<DiffResultEntry>,
    /// Edits not uploaded because the changeset filled up.
    pub pending: Vec<Edit>,
    /// Edits dropped after their chunk hit a full changeset.
    pub skipped: Vec<PrimitiveId>,
    /// Deletions the server reported as already applied.
    pub already_deleted: Vec<PrimitiveId>,
    /// Number of upload requests sent.
    pub requests: usize,
    /// True if the upload stopped because the changeset was full.
    pub stopped_on_full: bool,
    /// Failure to close the last changeset, if closing was requested.
    pub close_error: Option<TransferError>,
}

impl UploadReport {
    /// Number of definitely committed edits.
    pub fn committed_count(&self) -> usize {
        self.committed.len()
    }

    /// Returns true if every edit was applied or found already deleted.
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty() && self.skipped.is_empty()
    }

    /// Changeset the last chunk went into.
    pub fn last_changeset(&self) -> Option<&Changeset> {
        self.changesets.last()
    }
}

/// An upload that failed part way.
#[derive(Debug, Error)]
#[error("upload failed after {} committed edits: {error}", .committed.len())]
pub struct UploadFailure {
    /// Cause.
    #[source]
    pub error: TransferError,
    /// Server outcome of every edit committed before the failure.
    pub committed: Vec<DiffResultEntry>,
    /// Edits not known to be applied, the in-doubt chunk included.
    pub pending: Vec<Edit>,
    /// Ids of the chunk that may or may not have reached the server.
    pub in_doubt: Option<Vec<PrimitiveId>>,
    /// Changesets used, in order.
    pub changesets: Vec<Changeset>,
}

impl UploadFailure {
    /// Number of definitely committed edits.
    pub fn committed_count(&self) -> usize {
        self.committed.len()
    }
}

/// Mutable state of one upload.
struct UploadRun {
    changeset: Changeset,
    edits: Vec<Edit>,
    next: usize,
    assigned: HashMap<PrimitiveId, i64>,
    versions: HashMap<PrimitiveId, u32>,
    committed: Vec<DiffResultEntry>,
    skipped: Vec<PrimitiveId>,
    already_deleted: Vec<PrimitiveId>,
    previous: Vec<Changeset>,
    requests: usize,
}

impl UploadRun {
    fn new(changeset: Changeset, edits: Vec<Edit>) -> Self {
        Self {
            changeset,
            edits,
            next: 0,
            assigned: HashMap::new(),
            versions: HashMap::new(),
            committed: Vec::new(),
            skipped: Vec::new(),
            already_deleted: Vec::new(),
            previous: Vec::new(),
            requests: 0,
        }
    }

    /// Copy of an edit with every id the server already assigned filled in.
    fn prepare(&self, edit: &Edit) -> Edit {
        let mut edit = edit.clone();
        if edit.action != ChangeAction::Create {
            if let Some(new_id) = self.assigned.get(&edit.primitive_id()) {
                edit.primitive.id = *new_id;
            }
        }
        if let Some(version) = self.versions.get(&edit.primitive_id()) {
            edit.primitive.version = *version;
        }
        edit.primitive.remap_references(&self.assigned);
        edit
    }

    fn commit(&mut self, end: usize, entries: Vec<DiffResultEntry>) {
        for entry in &entries {
            let Some(new_id) = entry.new_id else {
                continue;
            };
            if entry.old_id.is_new() {
                self.assigned.insert(entry.old_id, new_id);
            }
            if let Some(version) = entry.new_version {
                self.versions
                    .insert(PrimitiveId::new(entry.old_id.kind, new_id), version);
            }
        }
        let applied = (end - self.next) as u64;
        self.changeset.record_upload(applied);
        self.committed.extend(entries);
        self.next = end;
    }

    /// Index of the deletion a gone conflict refers to.
    fn gone_deletion(&self, gone: &PrimitiveGone, mut range: Range<usize>) -> Option<usize> {
        let kind = gone.primitive_type?;
        if !gone.is_known_primitive() {
            return None;
        }
        let target = PrimitiveId::new(kind, gone.id);
        range.find(|&index| {
            let edit = &self.edits[index];
            edit.action == ChangeAction::Delete && self.prepare(edit).primitive_id() == target
        })
    }

    fn changesets(previous: Vec<Changeset>, current: Changeset) -> Vec<Changeset> {
        let mut changesets = previous;
        changesets.push(current);
        changesets
    }

    fn fail(
        mut self,
        error: TransferError,
        from: usize,
        in_doubt: Option<Vec<PrimitiveId>>,
    ) -> UploadFailure {
        let pending = self.edits.split_off(from.min(self.edits.len()));
        UploadFailure {
            error,
            committed: self.committed,
            pending,
            in_doubt,
            changesets: Self::changesets(self.previous, self.changeset),
        }
    }

    fn finish(mut self, stopped_on_full: bool, close_error: Option<TransferError>) -> UploadReport {
        let pending = self.edits.split_off(self.next.min(self.edits.len()));
        UploadReport {
            changesets: Self::changesets(self.previous, self.changeset),
            committed: self.committed,
            pending,
            skipped: self.skipped,
            already_deleted: self.already_deleted,
            requests: self.requests,
            stopped_on_full,
            close_error,
        }
    }
}

/// Uploads edit sets according to an upload strategy specification.
pub struct UploadTask<'a> {
    api: &'a OsmApi,
    spec: UploadStrategySpec,
    cache: Option<&'a ChangesetCache>,
    progress: &'a dyn ProgressSink,
}

impl<'a> UploadTask<'a> {
    /// Creates a task.
    pub fn new(api: &'a OsmApi, spec: UploadStrategySpec) -> Self {
        Self {
            api,
            spec,
            cache: None,
            progress: &NullProgress,
        }
    }

    /// Records every changeset touched in a cache.
    pub fn with_cache(mut self, cache: &'a ChangesetCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Reports progress to a sink.
    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    /// Uploads `edits` into `changeset`, opening it first if it is new.
    ///
    /// Edits are sent in the given order.
    pub fn upload(
        &self,
        changeset: Changeset,
        edits: Vec<Edit>,
    ) -> Result<UploadReport, UploadFailure> {
        let mut run = UploadRun::new(changeset, edits);
        if run.changeset.is_new() {
            if let Err(err) = self.open(&mut run.changeset) {
                return Err(run.fail(err, 0, None));
            }
        } else if !run.changeset.is_open() {
            let err = TransferError::InvalidChangeset(format!(
                "changeset {} is closed",
                run.changeset.id()
            ));
            return Err(run.fail(err, 0, None));
        }

        let advertised = self.capability_chunk_size();
        self.progress.begin(run.edits.len());
        info!(
            changeset_id = run.changeset.id(),
            edits = run.edits.len(),
            strategy = %self.spec.strategy,
            requests = self.spec.request_count_for(run.edits.len() as i64),
            "starting upload"
        );

        // Set while the current changeset was opened for a retried chunk and has
        // not accepted anything yet.
        let mut fresh = false;
        let mut stopped_on_full = false;
        'plan: loop {
            let mut plan = self
                .spec
                .strategy
                .plan(run.next, run.edits.len(), advertised);
            while let Some(range) = plan.next() {
                if let Err(err) = self.check_cancelled() {
                    let from = run.next;
                    return Err(run.fail(err, from, None));
                }
                let chunk: Vec<Edit> = run.edits[range.clone()]
                    .iter()
                    .map(|edit| run.prepare(edit))
                    .collect();
                run.requests += 1;
                debug!(
                    changeset_id = run.changeset.id(),
                    start = range.start,
                    end = range.end,
                    "sending chunk"
                );

                match self.send(&run.changeset, &chunk) {
                    Ok(entries) => {
                        run.commit(range.end, entries);
                        fresh = false;
                        self.remember(&run.changeset);
                        self.progress.chunk_done(run.next, run.edits.len());
                    }
                    Err(TransferError::PrimitiveGone(gone)) => {
                        let Some(index) = run.gone_deletion(&gone, range.clone()) else {
                            return Err(run.fail(TransferError::PrimitiveGone(gone), range.start, None));
                        };
                        let edit = run.edits.remove(index);
                        warn!(primitive = %edit.primitive_id(), "already deleted on server, skipping");
                        run.already_deleted.push(edit.primitive_id());
                        plan.halt();
                        continue 'plan;
                    }
                    Err(TransferError::ChangesetClosed(closed)) => {
                        plan.halt();
                        run.changeset.mark_closed(closed.closed_on);
                        self.remember(&run.changeset);
                        warn!(
                            changeset_id = run.changeset.id(),
                            policy = self.spec.policy.name(),
                            committed = run.committed.len(),
                            "changeset closed during upload"
                        );
                        match self.spec.policy {
                            MaxChangesetSizeExceededPolicy::Abort => {
                                let err = TransferError::ChangesetClosed(closed);
                                return Err(run.fail(err, range.start, None));
                            }
                            MaxChangesetSizeExceededPolicy::FillOneChangesetAndReturnToUploadDialog => {
                                stopped_on_full = true;
                                break 'plan;
                            }
                            MaxChangesetSizeExceededPolicy::AutomaticallyOpenNewChangesets => {
                                if fresh {
                                    let err = TransferError::ChangesetClosed(closed);
                                    return Err(run.fail(err, range.start, None));
                                }
                                let mut successor = run.changeset.successor();
                                if let Err(err) = self.open(&mut successor) {
                                    return Err(run.fail(err, range.start, None));
                                }
                                let closed_changeset = std::mem::replace(&mut run.changeset, successor);
                                run.previous.push(closed_changeset);
                                fresh = true;
                                if self.spec.failed_chunk_policy == FailedChunkPolicy::Skip {
                                    warn!(edits = chunk.len(), "skipping chunk rejected by full changeset");
                                    run.skipped.extend(run.edits[range.clone()].iter().map(Edit::primitive_id));
                                    run.next = range.end;
                                    fresh = false;
                                }
                                continue 'plan;
                            }
                        }
                    }
                    Err(err) => {
                        let in_doubt = matches!(
                            err,
                            TransferError::Cancelled | TransferError::Transport { .. }
                        )
                        .then(|| chunk.iter().map(Edit::primitive_id).collect());
                        return Err(run.fail(err, range.start, in_doubt));
                    }
                }
            }
            break;
        }

        let close_error = if self.spec.close_changeset_after_upload && run.changeset.is_open() {
            match self.api.close_changeset(&mut run.changeset) {
                Ok(()) => None,
                Err(err) => {
                    warn!(changeset_id = run.changeset.id(), error = %err, "failed to close changeset");
                    Some(err)
                }
            }
        } else {
            None
        };
        self.remember(&run.changeset);
        info!(
            committed = run.committed.len(),
            requests = run.requests,
            stopped_on_full,
            "upload finished"
        );
        Ok(run.finish(stopped_on_full, close_error))
    }

    fn open(&self, changeset: &mut Changeset) -> TransferResult<()> {
        self.api.open_changeset(changeset)?;
        self.remember(changeset);
        Ok(())
    }

    fn remember(&self, changeset: &Changeset) {
        if let Some(cache) = self.cache {
            cache.upsert(changeset.clone());
        }
    }

    fn check_cancelled(&self) -> TransferResult<()> {
        self.api.connection().check_cancelled()?;
        if self.progress.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    fn capability_chunk_size(&self) -> Option<usize> {
        if self.spec.strategy != (UploadStrategy::Chunked { chunk_size: None }) {
            return None;
        }
        if let Some(size) = self.api.max_changeset_size() {
            return Some(size);
        }
        match self.api.initialize() {
            Ok(capabilities) => capabilities.max_changeset_size(),
            Err(err) => {
                warn!(error = %err, "cannot read chunk size from capabilities, uploading in one request");
                None
            }
        }
    }

    fn send(&self, changeset: &Changeset, chunk: &[Edit]) -> TransferResult<Vec<DiffResultEntry>> {
        match self.spec.strategy {
            UploadStrategy::IndividualObjects => chunk
                .iter()
                .map(|edit| self.send_one(changeset, edit))
                .collect(),
            UploadStrategy::Chunked { .. } | UploadStrategy::SingleRequest => {
                Ok(self.api.upload_diff(changeset, chunk)?.entries().to_vec())
            }
        }
    }

    fn send_one(&self, changeset: &Changeset, edit: &Edit) -> TransferResult<DiffResultEntry> {
        let old_id = edit.primitive_id();
        let primitive = &edit.primitive;
        let (new_id, new_version) = match edit.action {
            ChangeAction::Create => (Some(self.api.create_primitive(primitive, changeset)?), Some(1)),
            ChangeAction::Modify => (
                Some(primitive.id),
                Some(self.api.modify_primitive(primitive, changeset)?),
            ),
            ChangeAction::Delete => {
                self.api.delete_primitive(primitive, changeset)?;
                (None, None)
            }
        };
        Ok(DiffResultEntry {
            old_id,
            new_id,
            new_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthMethod, Credentials, MemoryCredentials};
    use crate::connection::OsmConnection;
    use crate::http::{MockHttpClient, MockResponse};
    use crate::network_log::NetworkErrorLog;
    use crate::offline::OfflineGate;
    use crate::cancel::CancelToken;
    use osmsync_protocol::Primitive;
    use std::io;
    use std::sync::Arc;

    const CLOSED: &str = "The changeset 10 was closed at 2024-03-01T10:00:00Z";

    fn api() -> (Arc<MockHttpClient>, OsmApi) {
        let mock = Arc::new(MockHttpClient::new());
        let connection = OsmConnection::new(
            "https://api.example.org/api",
            AuthMethod::Basic,
            mock.clone(),
            Arc::new(OfflineGate::new()),
            Arc::new(
                MemoryCredentials::new()
                    .with_credentials("api.example.org", Credentials::new("u", "p")),
            ),
            Arc::new(NetworkErrorLog::new()),
        )
        .unwrap();
        (mock, OsmApi::new(Arc::new(connection)))
    }

    fn diff(entries: &[(&str, i64, i64, u32)]) -> MockResponse {
        let mut body = String::from("<diffResult version=\"0.6\">");
        for (kind, old, new, version) in entries {
            body.push_str(&format!(
                "<{} old_id=\"{}\" new_id=\"{}\" new_version=\"{}\"/>",
                kind, old, new, version
            ));
        }
        body.push_str("</diffResult>");
        MockResponse::new(200, body)
    }

    fn edits() -> Vec<Edit> {
        vec![
            Edit::create(Primitive::node(-1, 1.0, 1.0)),
            Edit::create(Primitive::node(-2, 2.0, 2.0)),
            Edit::create(Primitive::way(-3, vec![-1, -2])),
        ]
    }

    fn body(mock: &MockHttpClient, index: usize) -> String {
        String::from_utf8(mock.requests()[index].body.clone().unwrap_or_default()).unwrap()
    }

    #[test]
    fn single_request_upload() {
        let (mock, api) = api();
        mock.push_response(MockResponse::new(200, "10"));
        mock.push_response(diff(&[("node", -1, 100, 1), ("node", -2, 101, 1), ("way", -3, 200, 1)]));
        mock.push_response(MockResponse::new(200, ""));

        let cache = ChangesetCache::new();
        let report = UploadTask::new(&api, UploadStrategySpec::default())
            .with_cache(&cache)
            .upload(Changeset::new(), edits())
            .unwrap();
        assert_eq!(report.committed_count(), 3);
        assert_eq!(report.requests, 1);
        assert!(report.is_complete());
        assert!(report.close_error.is_none());
        let changeset = report.last_changeset().unwrap();
        assert_eq!(changeset.id(), 10);
        assert!(!changeset.is_open());
        assert_eq!(changeset.changes_count(), 3);
        assert!(!cache.get(10).unwrap().is_open());
        assert!(mock.requests()[2].url.ends_with("changeset/10/close"));
    }

    #[test]
    fn later_chunks_use_assigned_ids() {
        let (mock, api) = api();
        mock.push_response(MockResponse::new(200, "10"));
        mock.push_response(diff(&[("node", -1, 100, 1), ("node", -2, 101, 1)]));
        mock.push_response(diff(&[("way", -3, 200, 1)]));

        let spec = UploadStrategySpec::new(UploadStrategy::chunked(2)).with_close_changeset(false);
        let report = UploadTask::new(&api, spec)
            .upload(Changeset::new(), edits())
            .unwrap();
        assert_eq!(report.requests, 2);
        assert!(report.last_changeset().unwrap().is_open());

        let second = body(&mock, 2);
        assert!(second.contains("<nd ref=\"100\"/>"));
        assert!(second.contains("<nd ref=\"101\"/>"));
        assert!(second.contains("id=\"-3\""));
    }

    #[test]
    fn unspecified_chunk_size_comes_from_capabilities() {
        let (mock, api) = api();
        mock.push_response(MockResponse::new(200, "10"));
        mock.push_response(MockResponse::new(
            200,
            r#"<osm version="0.6"><api><version minimum="0.6" maximum="0.6"/><changesets maximum_elements="2"/></api></osm>"#,
        ));
        mock.push_response(diff(&[("node", -1, 100, 1), ("node", -2, 101, 1)]));
        mock.push_response(diff(&[("way", -3, 200, 1)]));

        let spec = UploadStrategySpec::new(UploadStrategy::Chunked { chunk_size: None })
            .with_close_changeset(false);
        let report = UploadTask::new(&api, spec)
            .upload(Changeset::new(), edits())
            .unwrap();
        assert_eq!(report.requests, 2);
        assert_eq!(report.committed_count(), 3);
    }

    #[test]
    fn abort_reports_committed_and_pending() {
        let (mock, api) = api();
        mock.push_response(MockResponse::new(200, "10"));
        mock.push_response(diff(&[("node", -1, 100, 1), ("node", -2, 101, 1)]));
        mock.push_response(MockResponse::new(409, "").with_header("Error", CLOSED));

        let spec = UploadStrategySpec::new(UploadStrategy::chunked(2));
        let failure = UploadTask::new(&api, spec)
            .upload(Changeset::new(), edits())
            .unwrap_err();
        assert!(matches!(failure.error, TransferError::ChangesetClosed(_)));
        assert_eq!(failure.committed_count(), 2);
        assert_eq!(failure.pending.len(), 1);
        assert!(failure.in_doubt.is_none());
        assert!(!failure.changesets[0].is_open());
        assert_eq!(mock.request_count(), 3);
    }

    #[test]
    fn fill_returns_remaining_edits() {
        let (mock, api) = api();
        mock.push_response(MockResponse::new(200, "10"));
        mock.push_response(diff(&[("node", -1, 100, 1), ("node", -2, 101, 1)]));
        mock.push_response(MockResponse::new(409, "").with_header("Error", CLOSED));

        let spec = UploadStrategySpec::new(UploadStrategy::chunked(2))
            .with_policy(MaxChangesetSizeExceededPolicy::FillOneChangesetAndReturnToUploadDialog);
        let report = UploadTask::new(&api, spec)
            .upload(Changeset::new(), edits())
            .unwrap();
        assert!(report.stopped_on_full);
        assert_eq!(report.committed_count(), 2);
        assert_eq!(report.pending.len(), 1);
        assert!(!report.is_complete());
        assert_eq!(mock.request_count(), 3);
    }

    #[test]
    fn auto_open_retries_chunk_in_new_changeset() {
        let (mock, api) = api();
        mock.push_response(MockResponse::new(200, "10"));
        mock.push_response(diff(&[("node", -1, 100, 1), ("node", -2, 101, 1)]));
        mock.push_response(MockResponse::new(409, "").with_header("Error", CLOSED));
        mock.push_response(MockResponse::new(200, "11"));
        mock.push_response(diff(&[("way", -3, 200, 1)]));
        mock.push_response(MockResponse::new(200, ""));

        let spec = UploadStrategySpec::new(UploadStrategy::chunked(2))
            .with_policy(MaxChangesetSizeExceededPolicy::AutomaticallyOpenNewChangesets);
        let report = UploadTask::new(&api, spec)
            .upload(Changeset::new().with_tag("comment", "benches"), edits())
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.committed_count(), 3);
        let ids: Vec<u64> = report.changesets.iter().map(Changeset::id).collect();
        assert_eq!(ids, vec![10, 11]);
        assert_eq!(
            report.changesets[1].tags().get("comment").map(String::as_str),
            Some("benches")
        );
        assert!(body(&mock, 4).contains("changeset=\"11\""));
        assert!(body(&mock, 4).contains("<nd ref=\"100\"/>"));
    }

    #[test]
    fn auto_open_can_skip_failed_chunk() {
        let (mock, api) = api();
        mock.push_response(MockResponse::new(200, "10"));
        mock.push_response(MockResponse::new(409, "").with_header("Error", CLOSED));
        mock.push_response(MockResponse::new(200, "11"));
        mock.push_response(diff(&[("way", -3, 200, 1)]));

        let spec = UploadStrategySpec::new(UploadStrategy::chunked(2))
            .with_policy(MaxChangesetSizeExceededPolicy::AutomaticallyOpenNewChangesets)
            .with_failed_chunk_policy(FailedChunkPolicy::Skip)
            .with_close_changeset(false);
        let report = UploadTask::new(&api, spec)
            .upload(Changeset::new(), edits())
            .unwrap();
        assert_eq!(report.skipped, vec![PrimitiveId::node(-1), PrimitiveId::node(-2)]);
        assert_eq!(report.committed_count(), 1);
        assert!(!report.is_complete());
    }

    #[test]
    fn auto_open_gives_up_when_new_changeset_is_full_at_once() {
        let (mock, api) = api();
        mock.push_response(MockResponse::new(200, "10"));
        mock.push_response(MockResponse::new(409, "").with_header("Error", CLOSED));
        mock.push_response(MockResponse::new(200, "11"));
        mock.push_response(
            MockResponse::new(409, "")
                .with_header("Error", "The changeset 11 was closed at 2024-03-01T10:00:01Z"),
        );

        let spec = UploadStrategySpec::new(UploadStrategy::SingleRequest)
            .with_policy(MaxChangesetSizeExceededPolicy::AutomaticallyOpenNewChangesets);
        let failure = UploadTask::new(&api, spec)
            .upload(Changeset::new(), edits())
            .unwrap_err();
        assert!(matches!(failure.error, TransferError::ChangesetClosed(_)));
        assert_eq!(failure.changesets.len(), 2);
        assert_eq!(failure.pending.len(), 3);
    }

    #[test]
    fn already_deleted_primitives_are_skipped() {
        let (mock, api) = api();
        mock.push_response(MockResponse::new(200, "10"));
        mock.push_response(
            MockResponse::new(410, "")
                .with_header("Error", "The node with the id 7 has already been deleted"),
        );
        mock.push_response(MockResponse::new(
            200,
            r#"<diffResult version="0.6"><node old_id="8"/></diffResult>"#,
        ));

        let edits = vec![
            Edit::delete(Primitive::node(7, 0.0, 0.0).with_version(1)),
            Edit::delete(Primitive::node(8, 0.0, 0.0).with_version(2)),
        ];
        let spec = UploadStrategySpec::default().with_close_changeset(false);
        let report = UploadTask::new(&api, spec)
            .upload(Changeset::new(), edits)
            .unwrap();
        assert_eq!(report.already_deleted, vec![PrimitiveId::node(7)]);
        assert_eq!(report.committed_count(), 1);
        assert!(report.committed[0].is_deleted());
        assert!(!body(&mock, 2).contains("id=\"7\""));
    }

    #[test]
    fn unknown_gone_fails() {
        let (mock, api) = api();
        mock.push_response(MockResponse::new(200, "10"));
        mock.push_response(
            MockResponse::new(410, "")
                .with_header("Error", "The node with the id 9 has already been deleted"),
        );
        let edits = vec![Edit::modify(Primitive::node(9, 0.0, 0.0).with_version(1))];
        let failure = UploadTask::new(&api, UploadStrategySpec::default())
            .upload(Changeset::new(), edits)
            .unwrap_err();
        assert!(matches!(failure.error, TransferError::PrimitiveGone(_)));
        assert_eq!(failure.pending.len(), 1);
    }

    #[test]
    fn individual_objects_use_single_calls() {
        let (mock, api) = api();
        mock.push_response(MockResponse::new(200, "10"));
        mock.push_response(MockResponse::new(200, "100"));
        mock.push_response(MockResponse::new(200, "4"));
        mock.push_response(MockResponse::new(200, "2"));

        let edits = vec![
            Edit::create(Primitive::node(-1, 1.0, 1.0)),
            Edit::modify(Primitive::way(5, vec![-1, 6]).with_version(3)),
            Edit::delete(Primitive::node(6, 0.0, 0.0).with_version(1)),
        ];
        let spec = UploadStrategySpec::new(UploadStrategy::IndividualObjects)
            .with_close_changeset(false);
        let report = UploadTask::new(&api, spec)
            .upload(Changeset::new(), edits)
            .unwrap();
        assert_eq!(report.requests, 3);
        assert_eq!(report.committed[0].new_id, Some(100));
        assert_eq!(report.committed[1].new_version, Some(4));
        assert!(report.committed[2].is_deleted());

        assert!(mock.requests()[1].url.ends_with("node/create"));
        assert!(body(&mock, 2).contains("<nd ref=\"100\"/>"));
        assert!(mock.requests()[3].url.ends_with("node/6"));
    }

    #[test]
    fn cancellation_between_chunks() {
        struct CancelAfterFirst(CancelToken);

        impl ProgressSink for CancelAfterFirst {
            fn chunk_done(&self, _done: usize, _total: usize) {
                self.0.cancel();
            }

            fn is_cancelled(&self) -> bool {
                self.0.is_cancelled()
            }
        }

        let (mock, api) = api();
        mock.push_response(MockResponse::new(200, "10"));
        mock.push_response(diff(&[("node", -1, 100, 1)]));

        let sink = CancelAfterFirst(CancelToken::new());
        let spec = UploadStrategySpec::new(UploadStrategy::chunked(1));
        let failure = UploadTask::new(&api, spec)
            .with_progress(&sink)
            .upload(Changeset::new(), edits())
            .unwrap_err();
        assert!(failure.error.is_cancelled());
        assert_eq!(failure.committed_count(), 1);
        assert_eq!(failure.pending.len(), 2);
        assert!(failure.in_doubt.is_none());
        assert_eq!(mock.request_count(), 2);
    }

    #[test]
    fn transport_failure_leaves_chunk_in_doubt() {
        let (mock, api) = api();
        mock.push_response(MockResponse::new(200, "10"));
        mock.push_error(io::ErrorKind::TimedOut, "read timed out");

        let failure = UploadTask::new(&api, UploadStrategySpec::default())
            .upload(Changeset::new(), edits())
            .unwrap_err();
        assert!(matches!(failure.error, TransferError::Transport { .. }));
        assert_eq!(failure.in_doubt.as_ref().map(Vec::len), Some(3));
        assert_eq!(failure.pending.len(), 3);
    }

    #[test]
    fn closed_changeset_is_rejected() {
        let (mock, api) = api();
        let mut changeset = Changeset::new();
        changeset.assign_id(4, chrono::Utc::now()).unwrap();
        changeset.mark_closed(None);
        let failure = UploadTask::new(&api, UploadStrategySpec::default())
            .upload(changeset, edits())
            .unwrap_err();
        assert!(matches!(failure.error, TransferError::InvalidChangeset(_)));
        assert_eq!(mock.request_count(), 0);
    }
}
