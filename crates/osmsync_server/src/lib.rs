//! # osmsync server
//!
//! In-memory reference server for the versioned-data API spoken by
//! `osmsync_transfer`.
//!
//! This crate provides:
//! - Capabilities, changeset, diff upload, single-object and read endpoints
//! - A primitive store with versions, visibility and atomic diff application
//! - Changesets that close when they reach their element limit
//! - Basic and signed-token authentication of write requests
//! - The conflict headers clients parse (`The changeset N was closed at ...`,
//!   `The node with the id N has already been deleted`)
//!
//! # Usage
//!
//! The server is transport-agnostic. Tests plug it behind a loopback HTTP
//! client; an embedding HTTP listener forwards requests to
//! [`OsmServer::handle`].
//!
//! ```rust
//! use osmsync_server::{OsmServer, ServerConfig};
//!
//! let server = OsmServer::new(ServerConfig::new("http://osm.test/api").with_user("alice", "pw"));
//! let (status, _, _) = server.handle("PUT", "/api/0.6/changeset/create", &[], b"");
//! assert_eq!(status, 401);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod server;
mod store;

pub use auth::{Authenticator, ANONYMOUS};
pub use config::{OAuthGrant, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, Request, RequestHandler, Response};
pub use server::OsmServer;
pub use store::OsmStore;
