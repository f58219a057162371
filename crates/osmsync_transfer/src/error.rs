//! Error types for the transfer layer.

use crate::offline::OnlineResource;
use chrono::{DateTime, Utc};
use osmsync_protocol::{parse_timestamp, PrimitiveType, ProtocolError};
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::warn;

/// Result type for transfer operations.
pub type TransferResult<T> = Result<T, TransferError>;

static CHANGESET_CLOSED: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^The changeset (\d+) was closed at (.*)$").expect("valid regex")
});

static PRIMITIVE_GONE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^The (\S+) with the id (\d+) has already been deleted$")
        .expect("valid regex")
});

/// Operation during which a changeset turned out to be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangesetClosedSource {
    /// Updating changeset tags.
    UpdateChangeset,
    /// Uploading edits into the changeset.
    UploadData,
    /// Closing the changeset.
    CloseChangeset,
    /// Not known.
    Unspecified,
}

/// A changeset the server reports as closed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesetClosed {
    /// Changeset id, 0 if the header could not be parsed.
    pub changeset_id: u64,
    /// Closing time, if the header carried a parseable one.
    pub closed_on: Option<DateTime<Utc>>,
    /// Operation that hit the closed changeset.
    pub source: ChangesetClosedSource,
    /// Raw error header.
    pub header: Option<String>,
}

impl ChangesetClosed {
    /// Returns true if the header follows the changeset-closed grammar.
    pub fn matches(header: &str) -> bool {
        CHANGESET_CLOSED.is_match(header)
    }

    /// Parses an error header.
    ///
    /// A header that does not follow the grammar yields changeset id 0 and no
    /// closing time.
    pub fn from_header(header: Option<&str>, source: ChangesetClosedSource) -> Self {
        let mut closed = Self {
            changeset_id: 0,
            closed_on: None,
            source,
            header: header.map(str::to_string),
        };
        let Some(captures) = header.and_then(|h| CHANGESET_CLOSED.captures(h)) else {
            warn!(header = ?header, "unexpected format of changeset-closed header");
            return closed;
        };
        closed.changeset_id = captures[1].parse().unwrap_or(0);
        closed.closed_on = parse_timestamp(&captures[2]);
        if closed.closed_on.is_none() {
            warn!(value = &captures[2], "failed to parse changeset closing date");
        }
        closed
    }
}

impl fmt::Display for ChangesetClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.changeset_id == 0 {
            f.write_str("changeset was closed")?;
        } else {
            write!(f, "changeset {} was closed", self.changeset_id)?;
        }
        if let Some(closed_on) = self.closed_on {
            write!(f, " at {}", closed_on.to_rfc3339())?;
        }
        Ok(())
    }
}

/// A primitive the server reports as already deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimitiveGone {
    /// Kind of the primitive, if the header named one.
    pub primitive_type: Option<PrimitiveType>,
    /// Id of the primitive, 0 if unknown.
    pub id: i64,
    /// Raw error header.
    pub header: Option<String>,
    /// Raw response body.
    pub body: Option<String>,
}

impl PrimitiveGone {
    /// Returns true if the header follows the already-deleted grammar.
    pub fn matches(header: &str) -> bool {
        PRIMITIVE_GONE.is_match(header)
    }

    /// Parses an error header.
    pub fn from_header(header: Option<&str>, body: Option<&str>) -> Self {
        let mut gone = Self {
            primitive_type: None,
            id: 0,
            header: header.map(str::to_string),
            body: body.map(str::to_string),
        };
        if let Some(captures) = header.and_then(|h| PRIMITIVE_GONE.captures(h)) {
            gone.primitive_type = PrimitiveType::from_api_name(&captures[1]);
            gone.id = captures[2].parse().unwrap_or(0);
        }
        gone
    }

    /// Returns true if the deleted primitive could be identified.
    pub fn is_known_primitive(&self) -> bool {
        self.primitive_type.is_some() && self.id > 0
    }
}

impl fmt::Display for PrimitiveGone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.primitive_type {
            Some(kind) if self.id > 0 => write!(f, "{} {} has already been deleted", kind, self.id),
            _ => f.write_str("primitive has already been deleted"),
        }
    }
}

/// Errors raised by the transfer layer.
#[derive(Error, Debug)]
pub enum TransferError {
    /// The transfer was cancelled.
    #[error("transfer cancelled")]
    Cancelled,

    /// The target resource is administratively offline.
    #[error("{resource} is offline")]
    Offline {
        /// Offline resource.
        resource: OnlineResource,
    },

    /// No credentials are available for an authenticated request.
    #[error("no credentials available for {host}")]
    MissingCredentials {
        /// Host the request was for.
        host: String,
    },

    /// The authorization header could not be produced.
    #[error("failed to sign request: {0}")]
    AuthSigningFailed(String),

    /// The server answered with a non-success status.
    #[error("api error {status} for {url}: {}", header.as_deref().unwrap_or("no error header"))]
    Api {
        /// HTTP status code.
        status: u16,
        /// Value of the `Error` response header.
        header: Option<String>,
        /// Response body.
        body: Option<String>,
        /// Request URL.
        url: String,
    },

    /// Conflict: the changeset is closed.
    #[error("conflict: {0}")]
    ChangesetClosed(ChangesetClosed),

    /// Conflict: the primitive is already deleted.
    #[error("conflict: {0}")]
    PrimitiveGone(PrimitiveGone),

    /// The response could not be interpreted.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// A reader or writer was driven out of order.
    #[error("illegal protocol state: {0}")]
    IllegalProtocolState(String),

    /// Network or stream failure.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Underlying I/O error.
        #[source]
        source: Option<std::io::Error>,
    },

    /// The changeset cannot be used for the requested operation.
    #[error("invalid changeset: {0}")]
    InvalidChangeset(String),

    /// Configuration value is unusable.
    #[error("configuration error: {0}")]
    Config(String),
}

impl TransferError {
    /// Wraps an I/O error.
    pub fn transport(err: std::io::Error) -> Self {
        Self::Transport {
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// HTTP status associated with the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransferError::Api { status, .. } => Some(*status),
            TransferError::ChangesetClosed(_) => Some(409),
            TransferError::PrimitiveGone(_) => Some(410),
            _ => None,
        }
    }

    /// Returns true for the conflict subtypes.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            TransferError::ChangesetClosed(_) | TransferError::PrimitiveGone(_)
        )
    }

    /// Returns true if the transfer was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

impl From<ProtocolError> for TransferError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::IllegalState(message) => TransferError::IllegalProtocolState(message),
            ProtocolError::Io(io) => TransferError::transport(io),
            ProtocolError::Signing(message) => TransferError::AuthSigningFailed(message),
            other => TransferError::MalformedResponse(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changeset_closed_header() {
        let closed = ChangesetClosed::from_header(
            Some("The changeset 42 was closed at 2020-01-01T00:00:00Z"),
            ChangesetClosedSource::UploadData,
        );
        assert_eq!(closed.changeset_id, 42);
        assert!(closed.closed_on.is_some());
        assert_eq!(closed.source, ChangesetClosedSource::UploadData);

        let legacy = ChangesetClosed::from_header(
            Some("The changeset 7 was closed at 2010-09-07 14:39:41 UTC"),
            ChangesetClosedSource::Unspecified,
        );
        assert_eq!(legacy.changeset_id, 7);
        assert!(legacy.closed_on.is_some());
    }

    #[test]
    fn changeset_closed_degrades() {
        let closed = ChangesetClosed::from_header(
            Some("Changeset 42 is closed"),
            ChangesetClosedSource::Unspecified,
        );
        assert_eq!(closed.changeset_id, 0);
        assert!(closed.closed_on.is_none());

        let bad_date = ChangesetClosed::from_header(
            Some("The changeset 9 was closed at sometime"),
            ChangesetClosedSource::Unspecified,
        );
        assert_eq!(bad_date.changeset_id, 9);
        assert!(bad_date.closed_on.is_none());

        let none = ChangesetClosed::from_header(None, ChangesetClosedSource::Unspecified);
        assert_eq!(none.changeset_id, 0);
    }

    #[test]
    fn grammar_requires_full_match() {
        assert!(!ChangesetClosed::matches(
            "Note: The changeset 1 was closed at 2020-01-01T00:00:00Z"
        ));
        assert!(!PrimitiveGone::matches(
            "The node with the id 7 has already been deleted, sorry"
        ));
    }

    #[test]
    fn primitive_gone_header() {
        let gone =
            PrimitiveGone::from_header(Some("The node with the id 7 has already been deleted"), None);
        assert_eq!(gone.primitive_type, Some(PrimitiveType::Node));
        assert_eq!(gone.id, 7);
        assert!(gone.is_known_primitive());

        let unknown = PrimitiveGone::from_header(None, Some("gone"));
        assert!(!unknown.is_known_primitive());
    }

    #[test]
    fn protocol_error_conversion() {
        let err: TransferError = ProtocolError::illegal_state("append before start").into();
        assert!(matches!(err, TransferError::IllegalProtocolState(_)));

        let err: TransferError = ProtocolError::malformed("eof").into();
        assert!(matches!(err, TransferError::MalformedResponse(_)));
    }

    #[test]
    fn error_display() {
        let err = TransferError::Offline {
            resource: OnlineResource::OsmApi,
        };
        assert_eq!(err.to_string(), "osm_api is offline");
        assert_eq!(TransferError::Cancelled.to_string(), "transfer cancelled");
        assert!(!TransferError::Cancelled.is_conflict());
    }
}
