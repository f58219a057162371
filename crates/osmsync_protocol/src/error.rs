//! Error types for the wire protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while reading or writing protocol documents.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The XML tokenizer rejected the input.
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// An attribute could not be tokenized.
    #[error("xml attribute error: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),

    /// Underlying stream failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The document structure does not follow the protocol.
    #[error("malformed document: {0}")]
    MalformedDocument(String),

    /// A required attribute is absent.
    #[error("missing required attribute '{attribute}' on <{element}>")]
    MissingAttribute {
        /// Element name.
        element: String,
        /// Attribute name.
        attribute: String,
    },

    /// An attribute value could not be interpreted.
    #[error("invalid value '{value}' for attribute '{attribute}' on <{element}>")]
    InvalidAttribute {
        /// Element name.
        element: String,
        /// Attribute name.
        attribute: String,
        /// Raw attribute value.
        value: String,
    },

    /// The document declares a protocol version other than 0.6.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// A reader or writer was driven out of order.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Request signing failed.
    #[error("signing failed: {0}")]
    Signing(String),
}

impl ProtocolError {
    /// Creates a malformed-document error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedDocument(message.into())
    }

    /// Creates an illegal-state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    pub(crate) fn missing(element: &str, attribute: &str) -> Self {
        Self::MissingAttribute {
            element: element.to_string(),
            attribute: attribute.to_string(),
        }
    }

    pub(crate) fn invalid(element: &str, attribute: &str, value: &str) -> Self {
        Self::InvalidAttribute {
            element: element.to_string(),
            attribute: attribute.to_string(),
            value: value.to_string(),
        }
    }

    /// Returns true if this error signals misuse of a reader or writer.
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, ProtocolError::IllegalState(_))
    }
}
