//! # osmsync transfer
//!
//! Client side of the osmsync transfer layer.
//!
//! This crate provides:
//! - An authenticated, cancellable connection with offline gating
//! - Typed API calls (capabilities, changesets, uploads, downloads)
//! - Error classification of non-success responses
//! - Upload strategies, chunk planning and full-changeset policies
//! - A changeset cache with periodic background reconciliation
//! - HTTP client abstraction with ureq, mock and loopback clients
//!
//! ## Upload model
//!
//! Edits are sent in order, one chunk at a time, into an open changeset.
//! Ids the server assigns to new primitives are substituted into every
//! later chunk. When the server closes a full changeset, the configured
//! policy decides whether the upload aborts, stops, or continues in a new
//! changeset.
//!
//! ## Key invariants
//!
//! - Every request passes the offline gate first
//! - Foreground calls and reconciliation use separate connections; cancelling
//!   one leaves the other running
//! - A closed changeset never becomes open again in the cache

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod api;
mod auth;
mod cache;
mod cancel;
mod classify;
pub mod config;
mod connection;
mod error;
mod http;
mod network_log;
mod offline;
mod progress;
mod reconcile;
mod session;
mod strategy;
mod upload;

pub use api::{OsmApi, MAX_IDS_PER_REQUEST};
pub use auth::{AuthMethod, Credentials, CredentialsProvider, MemoryCredentials, OAuthToken};
pub use cache::ChangesetCache;
pub use cancel::{CancelToken, CancellableRead};
pub use classify::classify;
pub use config::{MemoryPreferences, PreferenceStore, ReconciliationConfig, TransferConfig};
pub use connection::{ApiRequest, ApiResponse, OsmConnection};
pub use error::{
    ChangesetClosed, ChangesetClosedSource, PrimitiveGone, TransferError, TransferResult,
};
pub use http::{
    HttpClient, HttpRequest, HttpResponse, LoopbackClient, LoopbackServer, Method, MockHttpClient,
    MockResponse, UreqClient,
};
pub use network_log::{NetworkErrorEntry, NetworkErrorLog};
pub use offline::{OfflineGate, OnlineResource};
pub use progress::{NullProgress, ProgressSink};
pub use reconcile::{ChangesetFetcher, ReconciliationTask, TickOutcome};
pub use session::TransferSession;
pub use strategy::{
    parse_strategy, ChunkPlan, FailedChunkPolicy, MaxChangesetSizeExceededPolicy, UploadStrategy,
    UploadStrategySpec,
};
pub use upload::{UploadFailure, UploadReport, UploadTask};
