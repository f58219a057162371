//! In-memory API server.

use crate::config::ServerConfig;
use crate::handler::{HandlerContext, RequestHandler};
use crate::store::OsmStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The reference API server.
///
/// The server owns no sockets. Callers hand it requests as method, path,
/// headers and body, and forward the returned status, headers and body.
///
/// # Example
///
/// ```
/// use osmsync_server::{OsmServer, ServerConfig};
///
/// let server = OsmServer::new(ServerConfig::default());
/// let (status, _headers, body) = server.handle("GET", "/api/capabilities", &[], &[]);
/// assert_eq!(status, 200);
/// assert!(String::from_utf8_lossy(&body).contains("<api>"));
/// ```
pub struct OsmServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
    requests: AtomicUsize,
}

impl OsmServer {
    /// Creates a server with an empty store.
    pub fn new(config: ServerConfig) -> Self {
        let store = Arc::new(OsmStore::new(config.max_changeset_elements));
        Self::with_store(config, store)
    }

    /// Creates a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<OsmStore>) -> Self {
        let context = Arc::new(HandlerContext::new(config, store));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self {
            handler,
            context,
            requests: AtomicUsize::new(0),
        }
    }

    /// Handles one request and returns status, headers and body.
    pub fn handle(
        &self,
        method: &str,
        path_and_query: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> (u16, Vec<(String, String)>, Vec<u8>) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let response = self.handler.handle(method, path_and_query, headers, body);
        (response.status, response.headers, response.body)
    }

    /// Returns the backing store.
    pub fn store(&self) -> &Arc<OsmStore> {
        &self.context.store
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// Returns the number of requests handled so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for OsmServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsmServer")
            .field("public_url", &self.context.config.public_url)
            .field("requests", &self.request_count())
            .finish_non_exhaustive()
    }
}
