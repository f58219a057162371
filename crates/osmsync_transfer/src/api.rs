//! Typed calls against the versioned API.

use crate::connection::{ApiRequest, OsmConnection};
use crate::error::{ChangesetClosedSource, TransferError, TransferResult};
use crate::reconcile::ChangesetFetcher;
use chrono::Utc;
use osmsync_protocol::{
    changeset_document, primitive_document, Bounds, Capabilities, Changeset, DiffResult, Edit,
    OsmChangeWriter, OsmReader, OsmRecord, Primitive, PrimitiveType, PROTOCOL_VERSION,
};
use parking_lot::RwLock;
use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum number of ids per multi-fetch request.
pub const MAX_IDS_PER_REQUEST: usize = 170;

/// API client bound to one connection.
pub struct OsmApi {
    connection: Arc<OsmConnection>,
    capabilities: RwLock<Option<Capabilities>>,
}

impl OsmApi {
    /// Creates a client.
    pub fn new(connection: Arc<OsmConnection>) -> Self {
        Self {
            connection,
            capabilities: RwLock::new(None),
        }
    }

    /// Underlying connection.
    pub fn connection(&self) -> &OsmConnection {
        &self.connection
    }

    /// Fetches and caches the server capabilities.
    ///
    /// Fails unless the server supports protocol version 0.6. Later calls
    /// return the cached document.
    pub fn initialize(&self) -> TransferResult<Capabilities> {
        if let Some(capabilities) = self.capabilities.read().clone() {
            return Ok(capabilities);
        }
        let response = self
            .connection
            .execute(ApiRequest::get("capabilities").unversioned())?;
        let capabilities = Capabilities::parse(response.into_reader())
            .map_err(|e| self.connection.protocol_error(e))?;
        if !capabilities.supports_version(PROTOCOL_VERSION) {
            return Err(TransferError::Config(format!(
                "server supports protocol versions {} to {}, not {}",
                capabilities.get("version", "minimum").unwrap_or("?"),
                capabilities.get("version", "maximum").unwrap_or("?"),
                PROTOCOL_VERSION
            )));
        }
        info!(
            server = %self.connection.server_url(),
            max_changeset_size = ?capabilities.max_changeset_size(),
            "api initialized"
        );
        *self.capabilities.write() = Some(capabilities.clone());
        Ok(capabilities)
    }

    /// Cached capabilities, if initialized.
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.capabilities.read().clone()
    }

    /// Largest changeset the server accepts, if known.
    pub fn max_changeset_size(&self) -> Option<usize> {
        self.capabilities
            .read()
            .as_ref()
            .and_then(Capabilities::max_changeset_size)
    }

    /// Creates `changeset` on the server and records the assigned id.
    pub fn open_changeset(&self, changeset: &mut Changeset) -> TransferResult<u64> {
        if !changeset.is_new() {
            return Err(TransferError::InvalidChangeset(format!(
                "changeset {} is already open",
                changeset.id()
            )));
        }
        let body = changeset_document(changeset)?;
        let text = self
            .connection
            .execute(ApiRequest::put("changeset/create", body).authenticated())?
            .text()?;
        let id: u64 = parse_reply(&text, "changeset id")?;
        changeset.assign_id(id, Utc::now())?;
        info!(changeset_id = id, "opened changeset");
        Ok(id)
    }

    /// Replaces the tags of an open changeset on the server.
    pub fn update_changeset(&self, changeset: &mut Changeset) -> TransferResult<()> {
        let id = require_id(changeset)?;
        let body = changeset_document(changeset)?;
        let request = ApiRequest::put(format!("changeset/{}", id), body)
            .authenticated()
            .conflict_source(ChangesetClosedSource::UpdateChangeset);
        let response = match self.connection.execute(request) {
            Ok(response) => response,
            Err(TransferError::ChangesetClosed(closed)) => {
                changeset.mark_closed(closed.closed_on);
                return Err(TransferError::ChangesetClosed(closed));
            }
            Err(err) => return Err(err),
        };
        if let Some(updated) = self.read_changesets(response.into_reader())?.into_iter().next() {
            if updated.id() == id {
                changeset.set_tags(updated.tags().clone());
            }
        }
        debug!(changeset_id = id, "updated changeset");
        Ok(())
    }

    /// Closes a changeset.
    ///
    /// The changeset is marked closed locally whether or not the call
    /// succeeds.
    pub fn close_changeset(&self, changeset: &mut Changeset) -> TransferResult<()> {
        let id = require_id(changeset)?;
        let request = ApiRequest::put(format!("changeset/{}/close", id), "\r\n")
            .authenticated()
            .conflict_source(ChangesetClosedSource::CloseChangeset);
        let result = self.connection.execute(request).and_then(|r| r.text());
        match &result {
            Err(TransferError::ChangesetClosed(closed)) => changeset.mark_closed(closed.closed_on),
            _ => changeset.mark_closed(Some(Utc::now())),
        }
        result?;
        info!(changeset_id = id, "closed changeset");
        Ok(())
    }

    /// Fetches one changeset.
    pub fn get_changeset(&self, id: u64) -> TransferResult<Changeset> {
        let response = self
            .connection
            .execute(ApiRequest::get(format!("changeset/{}", id)))?;
        self.read_changesets(response.into_reader())?
            .into_iter()
            .find(|c| c.id() == id)
            .ok_or_else(|| {
                TransferError::MalformedResponse(format!("response carries no changeset {}", id))
            })
    }

    /// Fetches several changesets in one request.
    pub fn query_changesets(&self, ids: &[u64]) -> TransferResult<Vec<Changeset>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let path = format!("changesets?changesets={}", join_ids(ids));
        let response = self.connection.execute(ApiRequest::get(path))?;
        self.read_changesets(response.into_reader())
    }

    /// Uploads edits as one change document.
    pub fn upload_diff(&self, changeset: &Changeset, edits: &[Edit]) -> TransferResult<DiffResult> {
        let id = require_open(changeset)?;
        let mut writer = OsmChangeWriter::new(Vec::new());
        writer.start(id)?;
        writer.append_all(edits)?;
        writer.finish()?;
        let body = writer.into_inner();

        debug!(changeset_id = id, edits = edits.len(), "uploading diff");
        let response = self.connection.execute(
            ApiRequest::post(format!("changeset/{}/upload", id), body)
                .authenticated()
                .conflict_source(ChangesetClosedSource::UploadData),
        )?;
        DiffResult::parse(response.into_reader()).map_err(|e| self.connection.protocol_error(e))
    }

    /// Creates one primitive and returns its server id.
    pub fn create_primitive(&self, primitive: &Primitive, changeset: &Changeset) -> TransferResult<i64> {
        let changeset_id = require_open(changeset)?;
        let body = primitive_document(&Edit::create(primitive.clone()), changeset_id)?;
        let text = self
            .connection
            .execute(
                ApiRequest::put(format!("{}/create", primitive.kind().api_name()), body)
                    .authenticated()
                    .conflict_source(ChangesetClosedSource::UploadData),
            )?
            .text()?;
        parse_reply(&text, "primitive id")
    }

    /// Modifies one primitive and returns its new version.
    pub fn modify_primitive(&self, primitive: &Primitive, changeset: &Changeset) -> TransferResult<u32> {
        let changeset_id = require_open(changeset)?;
        let body = primitive_document(&Edit::modify(primitive.clone()), changeset_id)?;
        let text = self
            .connection
            .execute(
                ApiRequest::put(primitive_path(primitive), body)
                    .authenticated()
                    .conflict_source(ChangesetClosedSource::UploadData),
            )?
            .text()?;
        parse_reply(&text, "version")
    }

    /// Deletes one primitive and returns its new version.
    pub fn delete_primitive(&self, primitive: &Primitive, changeset: &Changeset) -> TransferResult<u32> {
        let changeset_id = require_open(changeset)?;
        let body = primitive_document(&Edit::delete(primitive.clone()), changeset_id)?;
        let text = self
            .connection
            .execute(
                ApiRequest::delete(primitive_path(primitive), body)
                    .authenticated()
                    .conflict_source(ChangesetClosedSource::UploadData),
            )?
            .text()?;
        parse_reply(&text, "version")
    }

    /// Streams the records inside a bounding box to `sink`.
    ///
    /// Returns the number of records delivered.
    pub fn read_map<F>(&self, bounds: &Bounds, sink: F) -> TransferResult<usize>
    where
        F: FnMut(OsmRecord) -> TransferResult<()>,
    {
        let response = self
            .connection
            .execute(ApiRequest::get(format!("map?bbox={}", bounds.to_bbox_param())))?;
        self.stream_records(response.into_reader(), sink)
    }

    /// Fetches primitives of one kind by id, in batches.
    ///
    /// Returns the number of records delivered.
    pub fn fetch_primitives<F>(&self, kind: PrimitiveType, ids: &[i64], mut sink: F) -> TransferResult<usize>
    where
        F: FnMut(OsmRecord) -> TransferResult<()>,
    {
        let plural = kind.plural_name();
        let mut delivered = 0;
        for batch in ids.chunks(MAX_IDS_PER_REQUEST) {
            self.connection.check_cancelled()?;
            let path = format!("{}?{}={}", plural, plural, join_ids(batch));
            let response = self.connection.execute(ApiRequest::get(path))?;
            delivered += self.stream_records(response.into_reader(), &mut sink)?;
        }
        Ok(delivered)
    }

    fn stream_records<R, F>(&self, body: R, mut sink: F) -> TransferResult<usize>
    where
        R: Read,
        F: FnMut(OsmRecord) -> TransferResult<()>,
    {
        let mut reader = OsmReader::new(body);
        let mut delivered = 0;
        while let Some(record) = reader
            .next_record()
            .map_err(|e| self.connection.protocol_error(e))?
        {
            sink(record)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    fn read_changesets<R: Read>(&self, body: R) -> TransferResult<Vec<Changeset>> {
        let mut changesets = Vec::new();
        self.stream_records(body, |record| {
            if let OsmRecord::Changeset(changeset) = record {
                changesets.push(changeset);
            }
            Ok(())
        })?;
        Ok(changesets)
    }
}

impl ChangesetFetcher for OsmApi {
    fn fetch_changesets(&self, ids: &[u64]) -> TransferResult<Vec<Changeset>> {
        self.query_changesets(ids)
    }
}

impl std::fmt::Debug for OsmApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsmApi")
            .field("connection", &self.connection)
            .field("initialized", &self.capabilities.read().is_some())
            .finish()
    }
}

fn require_id(changeset: &Changeset) -> TransferResult<u64> {
    if changeset.is_new() {
        return Err(TransferError::InvalidChangeset(
            "changeset has no server id".to_string(),
        ));
    }
    Ok(changeset.id())
}

fn require_open(changeset: &Changeset) -> TransferResult<u64> {
    let id = require_id(changeset)?;
    if !changeset.is_open() {
        warn!(changeset_id = id, "refusing to use closed changeset");
        return Err(TransferError::InvalidChangeset(format!(
            "changeset {} is closed",
            id
        )));
    }
    Ok(id)
}

fn primitive_path(primitive: &Primitive) -> String {
    format!("{}/{}", primitive.kind().api_name(), primitive.id)
}

fn join_ids<T: ToString>(ids: &[T]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_reply<T: FromStr>(text: &str, what: &str) -> TransferResult<T> {
    text.trim().parse().map_err(|_| {
        TransferError::MalformedResponse(format!("expected {} in reply, got '{}'", what, text.trim()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthMethod, Credentials, MemoryCredentials};
    use crate::http::{MockHttpClient, MockResponse};
    use crate::network_log::NetworkErrorLog;
    use crate::offline::OfflineGate;
    use osmsync_protocol::{ChangeAction, PrimitiveId};

    const CAPABILITIES: &str = r#"<osm version="0.6"><api>
        <version minimum="0.6" maximum="0.6"/>
        <changesets maximum_elements="50"/>
    </api></osm>"#;

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

    fn open_changeset(id: u64) -> Changeset {
        let mut changeset = Changeset::new();
        changeset.assign_id(id, Utc::now()).unwrap();
        changeset
    }

    #[test]
    fn initialize_caches_capabilities() {
        let (mock, api) = api();
        mock.push_response(MockResponse::new(200, CAPABILITIES));
        let capabilities = api.initialize().unwrap();
        assert_eq!(capabilities.max_changeset_size(), Some(50));
        assert_eq!(api.max_changeset_size(), Some(50));
        api.initialize().unwrap();
        assert_eq!(mock.request_count(), 1);
        assert_eq!(mock.requests()[0].url, "https://api.example.org/api/capabilities");
    }

    #[test]
    fn initialize_rejects_other_versions() {
        let (mock, api) = api();
        mock.push_response(MockResponse::new(
            200,
            r#"<osm><api><version minimum="0.5" maximum="0.5"/></api></osm>"#,
        ));
        assert!(matches!(api.initialize(), Err(TransferError::Config(_))));
        assert!(api.capabilities().is_none());
    }

    #[test]
    fn open_changeset_assigns_id() {
        let (mock, api) = api();
        mock.push_response(MockResponse::new(200, "4711\n"));
        let mut changeset = Changeset::new().with_tag("comment", "benches");
        assert_eq!(api.open_changeset(&mut changeset).unwrap(), 4711);
        assert!(changeset.is_open());
        assert!(changeset.created_at().is_some());

        let request = &mock.requests()[0];
        assert_eq!(request.url, "https://api.example.org/api/0.6/changeset/create");
        let body = String::from_utf8(request.body.clone().unwrap()).unwrap();
        assert!(body.contains("comment"));

        assert!(matches!(
            api.open_changeset(&mut changeset),
            Err(TransferError::InvalidChangeset(_))
        ));
    }

    #[test]
    fn open_changeset_rejects_garbage_reply() {
        let (mock, api) = api();
        mock.push_response(MockResponse::new(200, "<html>"));
        let mut changeset = Changeset::new();
        assert!(matches!(
            api.open_changeset(&mut changeset),
            Err(TransferError::MalformedResponse(_))
        ));
        assert!(changeset.is_new());
    }

    #[test]
    fn update_requires_id_and_tags_conflicts() {
        let (mock, api) = api();
        assert!(matches!(
            api.update_changeset(&mut Changeset::new()),
            Err(TransferError::InvalidChangeset(_))
        ));
        assert_eq!(mock.request_count(), 0);

        mock.push_response(
            MockResponse::new(409, "")
                .with_header("Error", "The changeset 8 was closed at 2024-01-01T00:00:00Z"),
        );
        let mut changeset = open_changeset(8);
        match api.update_changeset(&mut changeset) {
            Err(TransferError::ChangesetClosed(closed)) => {
                assert_eq!(closed.source, ChangesetClosedSource::UpdateChangeset);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(!changeset.is_open());
        assert!(changeset.closed_at().is_some());
    }

    #[test]
    fn close_marks_closed_even_on_failure() {
        let (mock, api) = api();
        mock.push_response(MockResponse::new(500, "boom"));
        let mut changeset = open_changeset(9);
        assert_eq!(api.close_changeset(&mut changeset).unwrap_err().status(), Some(500));
        assert!(!changeset.is_open());

        let request = &mock.requests()[0];
        assert_eq!(request.url, "https://api.example.org/api/0.6/changeset/9/close");
        assert_eq!(request.body.as_deref(), Some(&b"\r\n"[..]));
    }

    #[test]
    fn query_changesets_batches_ids() {
        let (mock, api) = api();
        assert!(api.query_changesets(&[]).unwrap().is_empty());
        mock.push_response(MockResponse::new(
            200,
            r#"<osm version="0.6">
                <changeset id="1" created_at="2024-01-01T00:00:00Z" open="true" changes_count="0"/>
                <changeset id="2" created_at="2024-01-01T00:00:00Z" closed_at="2024-01-01T01:00:00Z" open="false" changes_count="4"/>
            </osm>"#,
        ));
        let changesets = api.query_changesets(&[1, 2]).unwrap();
        assert_eq!(changesets.len(), 2);
        assert!(changesets[0].is_open());
        assert!(!changesets[1].is_open());
        assert!(mock.requests()[0].url.ends_with("changesets?changesets=1,2"));
    }

    #[test]
    fn upload_diff_posts_change_document() {
        let (mock, api) = api();
        mock.push_response(MockResponse::new(
            200,
            r#"<diffResult version="0.6"><node old_id="-1" new_id="100" new_version="1"/></diffResult>"#,
        ));
        let changeset = open_changeset(5);
        let edits = vec![Edit::create(Primitive::node(-1, 1.0, 2.0))];
        let diff = api.upload_diff(&changeset, &edits).unwrap();
        assert_eq!(diff.id_mapping().get(&PrimitiveId::node(-1)), Some(&100));

        let request = &mock.requests()[0];
        assert!(request.url.ends_with("changeset/5/upload"));
        let body = String::from_utf8(request.body.clone().unwrap()).unwrap();
        assert!(body.contains("<osmChange"));
        assert!(body.contains("changeset=\"5\""));
    }

    #[test]
    fn upload_into_closed_changeset_is_refused() {
        let (mock, api) = api();
        let mut changeset = open_changeset(5);
        changeset.mark_closed(None);
        let edits = vec![Edit::new(ChangeAction::Delete, Primitive::node(3, 0.0, 0.0))];
        assert!(matches!(
            api.upload_diff(&changeset, &edits),
            Err(TransferError::InvalidChangeset(_))
        ));
        assert_eq!(mock.request_count(), 0);
    }

    #[test]
    fn individual_operations_parse_replies() {
        let (mock, api) = api();
        let changeset = open_changeset(5);
        mock.push_response(MockResponse::new(200, "321"));
        mock.push_response(MockResponse::new(200, "4"));
        mock.push_response(MockResponse::new(200, "5"));
        mock.push_response(MockResponse::new(200, "not a version"));

        let node = Primitive::node(-2, 1.0, 1.0);
        assert_eq!(api.create_primitive(&node, &changeset).unwrap(), 321);
        let way = Primitive::way(12, vec![1, 2]).with_version(3);
        assert_eq!(api.modify_primitive(&way, &changeset).unwrap(), 4);
        assert_eq!(api.delete_primitive(&way, &changeset).unwrap(), 5);
        assert!(matches!(
            api.delete_primitive(&way, &changeset),
            Err(TransferError::MalformedResponse(_))
        ));

        let requests = mock.requests();
        assert!(requests[0].url.ends_with("node/create"));
        assert!(requests[1].url.ends_with("way/12"));
        assert_eq!(requests[2].method, crate::http::Method::Delete);
    }

    #[test]
    fn fetch_primitives_splits_batches() {
        let (mock, api) = api();
        let ids: Vec<i64> = (1..=200).collect();
        mock.push_response(MockResponse::new(
            200,
            r#"<osm version="0.6"><node id="1" version="1" lat="0" lon="0"/></osm>"#,
        ));
        mock.push_response(MockResponse::new(
            200,
            r#"<osm version="0.6"><node id="200" version="1" lat="0" lon="0"/></osm>"#,
        ));
        let mut seen = Vec::new();
        let delivered = api
            .fetch_primitives(PrimitiveType::Node, &ids, |record| {
                if let OsmRecord::Primitive { primitive, .. } = record {
                    seen.push(primitive.id);
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(seen, vec![1, 200]);

        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].url.contains("nodes?nodes=1,2,"));
        assert!(requests[1].url.ends_with("nodes?nodes=171,172,173,174,175,176,177,178,179,180,181,182,183,184,185,186,187,188,189,190,191,192,193,194,195,196,197,198,199,200"));
    }

    #[test]
    fn read_map_streams_records() {
        let (mock, api) = api();
        mock.push_response(MockResponse::new(
            200,
            r#"<osm version="0.6">
                <bounds minlat="0" minlon="0" maxlat="1" maxlon="1"/>
                <node id="1" version="2" lat="0.5" lon="0.5"/>
                <way id="2" version="1"><nd ref="1"/></way>
            </osm>"#,
        ));
        let mut records = Vec::new();
        let count = api
            .read_map(&Bounds::new(0.0, 0.0, 1.0, 1.0), |record| {
                records.push(record);
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 3);
        assert!(matches!(records[0], OsmRecord::Bounds(_)));
        assert!(mock.requests()[0].url.ends_with("map?bbox=0,0,1,1"));
    }
}
