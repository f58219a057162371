//! # osmsync protocol
//!
//! Wire-format types and streaming XML codecs for the osmsync transfer layer.
//!
//! This crate provides:
//! - `Primitive`, `PrimitiveId` and `Edit` records (identity and version only)
//! - `Changeset` metadata with its open/closed lifecycle
//! - A pull-style streaming reader for `<osm>` and `<osmChange>` documents
//! - Change and bulk document writers
//! - `<diffResult>` and capabilities parsing
//! - The signed-token authorization header scheme
//!
//! This is a pure protocol crate with no network I/O. Readers and writers
//! operate on any `std::io::Read` / `std::io::Write`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod capabilities;
mod changeset;
mod diff;
mod error;
mod primitive;
mod reader;
mod sanitize;
pub mod signing;
mod writer;

pub use capabilities::Capabilities;
pub use changeset::{parse_timestamp, Changeset};
pub use diff::{DiffResult, DiffResultEntry};
pub use error::{ProtocolError, ProtocolResult};
pub use primitive::{
    Bounds, ChangeAction, Edit, LatLon, Member, Primitive, PrimitiveData, PrimitiveId,
    PrimitiveType,
};
pub use reader::{DocumentKind, OsmReader, OsmRecord};
pub use sanitize::InvalidXmlCharFilter;
pub use writer::{changeset_document, primitive_document, OsmChangeWriter, OsmDocumentWriter};

/// The only protocol version this crate reads and writes.
pub const PROTOCOL_VERSION: &str = "0.6";

/// Generator attribute written into every document.
pub const GENERATOR: &str = concat!("osmsync/", env!("CARGO_PKG_VERSION"));
