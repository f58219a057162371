//! Error types for the reference server.

use chrono::{DateTime, SecondsFormat, Utc};
use osmsync_protocol::{PrimitiveId, PrimitiveType, ProtocolError};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors a request can end in. Each maps to one HTTP status.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed request.
    #[error("{0}")]
    BadRequest(String),

    /// Missing or invalid credentials.
    #[error("{0}")]
    Unauthorized(String),

    /// Unknown resource.
    #[error("{0}")]
    NotFound(String),

    /// Route exists but not for this method.
    #[error("method {0} not allowed")]
    MethodNotAllowed(String),

    /// The changeset is closed.
    #[error("The changeset {id} was closed at {}", .closed_at.to_rfc3339_opts(SecondsFormat::Secs, true))]
    ChangesetClosed {
        /// Changeset id.
        id: u64,
        /// Closing time.
        closed_at: DateTime<Utc>,
    },

    /// The client edited a stale version.
    #[error("Version mismatch: Provided {provided}, server had: {current} of {primitive}")]
    VersionMismatch {
        /// Edited primitive.
        primitive: PrimitiveId,
        /// Version sent by the client.
        provided: u32,
        /// Version on the server.
        current: u32,
    },

    /// Any other conflict.
    #[error("{0}")]
    Conflict(String),

    /// The primitive was deleted before.
    #[error("The {kind} with the id {id} has already been deleted")]
    Gone {
        /// Kind of the primitive.
        kind: PrimitiveType,
        /// Id of the primitive.
        id: i64,
    },

    /// A precondition on referenced primitives failed.
    #[error("{0}")]
    PreconditionFailed(String),

    /// Unreadable document.
    #[error("malformed document: {0}")]
    Protocol(#[from] ProtocolError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// HTTP status for this error.
    pub fn status(&self) -> u16 {
        match self {
            ServerError::BadRequest(_) | ServerError::Protocol(_) => 400,
            ServerError::Unauthorized(_) => 401,
            ServerError::NotFound(_) => 404,
            ServerError::MethodNotAllowed(_) => 405,
            ServerError::ChangesetClosed { .. }
            | ServerError::VersionMismatch { .. }
            | ServerError::Conflict(_) => 409,
            ServerError::Gone { .. } => 410,
            ServerError::PreconditionFailed(_) => 412,
            ServerError::Internal(_) => 500,
        }
    }

    /// Value of the `Error` response header.
    pub fn error_header(&self) -> String {
        self.to_string()
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status() >= 500
    }
}
