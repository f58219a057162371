//! Request routing and endpoint handlers.

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::store::OsmStore;
use osmsync_protocol::{
    Bounds, Capabilities, Changeset, Edit, OsmDocumentWriter, OsmReader, OsmRecord, Primitive,
    PrimitiveId, PrimitiveType, ProtocolResult, PROTOCOL_VERSION,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Shared state of all handlers.
#[derive(Debug)]
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Primitive and changeset store.
    pub store: Arc<OsmStore>,
    auth: Authenticator,
    origin: String,
    prefix: String,
}

impl HandlerContext {
    /// Creates a context.
    ///
    /// An unparseable public URL is treated as `http://localhost` with no path prefix.
    pub fn new(config: ServerConfig, store: Arc<OsmStore>) -> Self {
        let (origin, prefix) = match Url::parse(&config.public_url) {
            Ok(url) => (
                url.origin().ascii_serialization(),
                url.path().trim_end_matches('/').to_string(),
            ),
            Err(err) => {
                warn!(url = %config.public_url, error = %err, "invalid public url");
                ("http://localhost".to_string(), String::new())
            }
        };
        let auth = Authenticator::new(&config);
        Self {
            config,
            store,
            auth,
            origin,
            prefix,
        }
    }
}

/// A parsed request.
#[derive(Debug)]
pub struct Request<'a> {
    method: &'a str,
    path_and_query: &'a str,
    segments: Vec<String>,
    query: HashMap<String, String>,
    headers: &'a [(String, String)],
    body: &'a [u8],
}

impl<'a> Request<'a> {
    /// Parses a request relative to the server's path prefix.
    pub fn new(
        method: &'a str,
        path_and_query: &'a str,
        headers: &'a [(String, String)],
        body: &'a [u8],
        prefix: &str,
    ) -> Self {
        let (path, query) = path_and_query
            .split_once('?')
            .unwrap_or((path_and_query, ""));
        let path = path.strip_prefix(prefix).unwrap_or(path);
        let segments = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let query = query
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (decode(key), decode(value))
            })
            .collect();
        Self {
            method,
            path_and_query,
            segments,
            query,
            headers,
            body,
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn query(&self, key: &str) -> ServerResult<&str> {
        self.query
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ServerError::BadRequest(format!("missing query parameter '{}'", key)))
    }
}

fn decode(value: &str) -> String {
    urlencoding::decode(value)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

/// A response ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
}

impl Response {
    fn xml(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type".into(), "text/xml; charset=utf-8".into())],
            body,
        }
    }

    fn text(body: impl ToString) -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type".into(), "text/plain; charset=utf-8".into())],
            body: body.to_string().into_bytes(),
        }
    }

    fn from_error(err: &ServerError) -> Self {
        let message = err.error_header();
        Self {
            status: err.status(),
            headers: vec![
                ("Error".into(), message.clone()),
                ("Content-Type".into(), "text/plain; charset=utf-8".into()),
            ],
            body: message.into_bytes(),
        }
    }
}

/// Routes requests to endpoint handlers.
#[derive(Debug)]
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles one request. Errors become responses carrying an `Error` header.
    pub fn handle(
        &self,
        method: &str,
        path_and_query: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Response {
        let request = Request::new(method, path_and_query, headers, body, &self.context.prefix);
        match self.route(&request) {
            Ok(response) => {
                debug!(method, path = path_and_query, status = response.status, "request handled");
                response
            }
            Err(err) => {
                if err.is_server_error() {
                    warn!(method, path = path_and_query, error = %err, "request failed");
                } else {
                    debug!(method, path = path_and_query, status = err.status(), error = %err, "request rejected");
                }
                Response::from_error(&err)
            }
        }
    }

    fn route(&self, request: &Request<'_>) -> ServerResult<Response> {
        let segments: Vec<&str> = request.segments.iter().map(String::as_str).collect();
        let rest = match segments.as_slice() {
            ["capabilities"] | [PROTOCOL_VERSION, "capabilities"] => {
                return match request.method {
                    "GET" => Ok(self.capabilities()),
                    other => Err(ServerError::MethodNotAllowed(other.to_string())),
                };
            }
            [PROTOCOL_VERSION, rest @ ..] => rest,
            _ => return Err(not_found(request)),
        };

        match (request.method, rest) {
            ("PUT", ["changeset", "create"]) => self.create_changeset(request),
            ("GET", ["changeset", id]) => self.get_changeset(parse_id(id)?),
            ("PUT", ["changeset", id]) => self.update_changeset(request, parse_id(id)?),
            ("PUT", ["changeset", id, "close"]) => self.close_changeset(request, parse_id(id)?),
            ("POST", ["changeset", id, "upload"]) => self.upload(request, parse_id(id)?),
            ("GET", ["changesets"]) => self.query_changesets(request),
            ("GET", ["map"]) => self.map(request),
            ("GET", [plural]) => match kind_from_plural(plural) {
                Some(kind) => self.fetch(request, kind),
                None => Err(not_found(request)),
            },
            ("PUT", [kind, "create"]) => self.create_primitive(request, parse_kind(kind)?),
            ("GET", [kind, id]) => self.get_primitive(parse_kind(kind)?, parse_id(id)?),
            ("PUT", [kind, id]) => self.modify_primitive(request, parse_kind(kind)?, parse_id(id)?),
            ("DELETE", [kind, id]) => {
                self.delete_primitive(request, parse_kind(kind)?, parse_id(id)?)
            }
            (_, ["changeset", ..]) | (_, [_, _]) => {
                Err(ServerError::MethodNotAllowed(request.method.to_string()))
            }
            _ => Err(not_found(request)),
        }
    }

    fn user(&self, request: &Request<'_>) -> ServerResult<String> {
        let url = format!("{}{}", self.context.origin, request.path_and_query);
        self.context
            .auth
            .authenticate(request.method, &url, request.header("Authorization"))
    }

    fn capabilities(&self) -> Response {
        let config = &self.context.config;
        let capabilities = Capabilities::new()
            .with("version", "minimum", PROTOCOL_VERSION)
            .with("version", "maximum", PROTOCOL_VERSION)
            .with("area", "maximum", "0.25")
            .with(
                "changesets",
                "maximum_elements",
                self.context.store.max_changeset_elements().to_string(),
            )
            .with("waynodes", "maximum", config.max_way_nodes.to_string())
            .with("timeout", "seconds", config.timeout.as_secs().to_string());
        Response::xml(capabilities.to_xml().into_bytes())
    }

    fn create_changeset(&self, request: &Request<'_>) -> ServerResult<Response> {
        let user = self.user(request)?;
        let tags = changeset_tags(request.body)?;
        let id = self.context.store.create_changeset(tags, &user);
        Ok(Response::text(id))
    }

    fn get_changeset(&self, id: u64) -> ServerResult<Response> {
        let changeset = self.context.store.changeset(id)?;
        changesets_document(std::slice::from_ref(&changeset))
    }

    fn update_changeset(&self, request: &Request<'_>, id: u64) -> ServerResult<Response> {
        let user = self.user(request)?;
        let tags = changeset_tags(request.body)?;
        let changeset = self.context.store.update_changeset(id, tags, &user)?;
        changesets_document(std::slice::from_ref(&changeset))
    }

    fn close_changeset(&self, request: &Request<'_>, id: u64) -> ServerResult<Response> {
        let user = self.user(request)?;
        self.context.store.close_changeset(id, &user)?;
        Ok(Response::text(""))
    }

    fn upload(&self, request: &Request<'_>, changeset_id: u64) -> ServerResult<Response> {
        let user = self.user(request)?;
        let mut edits = Vec::new();
        for record in OsmReader::new(request.body) {
            if let OsmRecord::Primitive { action, primitive } = record? {
                let action = action.ok_or_else(|| {
                    ServerError::BadRequest(format!(
                        "{} outside of a create, modify or delete group",
                        primitive.primitive_id()
                    ))
                })?;
                check_changeset(&primitive, changeset_id)?;
                edits.push(Edit::new(action, primitive));
            }
        }
        let result = self.context.store.apply(changeset_id, &edits, &user)?;
        let mut out = Vec::new();
        result.write(&mut out)?;
        Ok(Response::xml(out))
    }

    fn query_changesets(&self, request: &Request<'_>) -> ServerResult<Response> {
        let ids = parse_ids::<u64>(request.query("changesets")?)?;
        changesets_document(&self.context.store.changesets(&ids))
    }

    fn map(&self, request: &Request<'_>) -> ServerResult<Response> {
        let raw = request.query("bbox")?;
        let bounds = Bounds::from_bbox_param(raw)
            .ok_or_else(|| ServerError::BadRequest(format!("invalid bbox '{}'", raw)))?;
        let primitives = self.context.store.map(&bounds);
        primitives_document(Some(&bounds), &primitives)
    }

    fn fetch(&self, request: &Request<'_>, kind: PrimitiveType) -> ServerResult<Response> {
        let ids = parse_ids::<i64>(request.query(kind.plural_name())?)?;
        let primitives = self.context.store.fetch(kind, &ids)?;
        primitives_document(None, &primitives)
    }

    fn get_primitive(&self, kind: PrimitiveType, id: i64) -> ServerResult<Response> {
        let primitive = self
            .context
            .store
            .primitive(PrimitiveId::new(kind, id))
            .ok_or_else(|| ServerError::NotFound(format!("{} {} not found", kind, id)))?;
        if !primitive.visible {
            return Err(ServerError::Gone { kind, id });
        }
        primitives_document(None, std::slice::from_ref(&primitive))
    }

    fn create_primitive(&self, request: &Request<'_>, kind: PrimitiveType) -> ServerResult<Response> {
        let user = self.user(request)?;
        let primitive = single_primitive(request.body, kind, None)?;
        let changeset_id = primitive.changeset_id;
        let result = self
            .context
            .store
            .apply(changeset_id, &[Edit::create(primitive)], &user)?;
        let new_id = result
            .entries()
            .first()
            .and_then(|e| e.new_id)
            .ok_or_else(|| ServerError::Internal("create produced no id".into()))?;
        Ok(Response::text(new_id))
    }

    fn modify_primitive(
        &self,
        request: &Request<'_>,
        kind: PrimitiveType,
        id: i64,
    ) -> ServerResult<Response> {
        let user = self.user(request)?;
        let primitive = single_primitive(request.body, kind, Some(id))?;
        let changeset_id = primitive.changeset_id;
        let result = self
            .context
            .store
            .apply(changeset_id, &[Edit::modify(primitive)], &user)?;
        let version = result
            .entries()
            .first()
            .and_then(|e| e.new_version)
            .ok_or_else(|| ServerError::Internal("modify produced no version".into()))?;
        Ok(Response::text(version))
    }

    fn delete_primitive(
        &self,
        request: &Request<'_>,
        kind: PrimitiveType,
        id: i64,
    ) -> ServerResult<Response> {
        let user = self.user(request)?;
        let primitive = single_primitive(request.body, kind, Some(id))?;
        let changeset_id = primitive.changeset_id;
        self.context
            .store
            .apply(changeset_id, &[Edit::delete(primitive)], &user)?;
        let version = self
            .context
            .store
            .primitive(PrimitiveId::new(kind, id))
            .map(|p| p.version)
            .ok_or_else(|| ServerError::Internal("deleted primitive vanished".into()))?;
        Ok(Response::text(version))
    }
}

fn not_found(request: &Request<'_>) -> ServerError {
    ServerError::NotFound(format!("no route for {} {}", request.method, request.path_and_query))
}

fn parse_id<T: std::str::FromStr>(raw: &str) -> ServerResult<T> {
    raw.parse()
        .map_err(|_| ServerError::BadRequest(format!("invalid id '{}'", raw)))
}

fn parse_ids<T: std::str::FromStr>(raw: &str) -> ServerResult<Vec<T>> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| parse_id(s.trim()))
        .collect()
}

fn parse_kind(raw: &str) -> ServerResult<PrimitiveType> {
    PrimitiveType::from_api_name(raw)
        .ok_or_else(|| ServerError::NotFound(format!("unknown element type '{}'", raw)))
}

fn kind_from_plural(raw: &str) -> Option<PrimitiveType> {
    PrimitiveType::ALL
        .into_iter()
        .find(|kind| kind.plural_name() == raw)
}

fn check_changeset(primitive: &Primitive, changeset_id: u64) -> ServerResult<()> {
    if primitive.changeset_id != changeset_id {
        return Err(ServerError::Conflict(format!(
            "Changeset mismatch: Provided {} but only {} is allowed",
            primitive.changeset_id, changeset_id
        )));
    }
    Ok(())
}

fn changeset_tags(body: &[u8]) -> ServerResult<BTreeMap<String, String>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(BTreeMap::new());
    }
    for record in OsmReader::new(body) {
        if let OsmRecord::Changeset(changeset) = record? {
            return Ok(changeset.tags().clone());
        }
    }
    Err(ServerError::BadRequest("no changeset in document".into()))
}

fn single_primitive(body: &[u8], kind: PrimitiveType, id: Option<i64>) -> ServerResult<Primitive> {
    for record in OsmReader::new(body) {
        if let OsmRecord::Primitive { primitive, .. } = record? {
            if primitive.kind() != kind {
                return Err(ServerError::BadRequest(format!(
                    "expected a {}, found a {}",
                    kind,
                    primitive.kind()
                )));
            }
            if let Some(id) = id.filter(|id| *id != primitive.id) {
                return Err(ServerError::BadRequest(format!(
                    "id {} in the document does not match {} in the url",
                    primitive.id, id
                )));
            }
            return Ok(primitive);
        }
    }
    Err(ServerError::BadRequest(format!("no {} in document", kind)))
}

fn changesets_document(changesets: &[Changeset]) -> ServerResult<Response> {
    let body = render(|writer| {
        for changeset in changesets {
            writer.changeset(changeset)?;
        }
        Ok(())
    })?;
    Ok(Response::xml(body))
}

fn primitives_document(bounds: Option<&Bounds>, primitives: &[Primitive]) -> ServerResult<Response> {
    let body = render(|writer| {
        if let Some(bounds) = bounds {
            writer.bounds(bounds)?;
        }
        for primitive in primitives {
            writer.primitive(primitive)?;
        }
        Ok(())
    })?;
    Ok(Response::xml(body))
}

fn render<F>(fill: F) -> ServerResult<Vec<u8>>
where
    F: FnOnce(&mut OsmDocumentWriter<Vec<u8>>) -> ProtocolResult<()>,
{
    let mut writer = OsmDocumentWriter::new(Vec::new())?;
    fill(&mut writer)?;
    Ok(writer.finish()?)
}
