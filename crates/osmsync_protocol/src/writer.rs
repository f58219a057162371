//! Change and bulk document writers.

use crate::changeset::Changeset;
use crate::error::{ProtocolError, ProtocolResult};
use crate::primitive::{Bounds, ChangeAction, Edit, Primitive, PrimitiveData};
use crate::{GENERATOR, PROTOCOL_VERSION};
use chrono::SecondsFormat;
use std::borrow::Cow;
use std::io::Write;

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

fn escape(value: &str) -> Cow<'_, str> {
    let escaped = quick_xml::escape::escape(value);
    if escaped.contains(['\n', '\r', '\t']) {
        Cow::Owned(
            escaped
                .replace('\n', "&#xA;")
                .replace('\r', "&#xD;")
                .replace('\t', "&#x9;"),
        )
    } else {
        escaped
    }
}

/// Where a primitive element is written.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    /// Inside a `<create>`/`<modify>`/`<delete>` group.
    Change(ChangeAction),
    /// Inside an `<osm>` bulk document.
    Bulk,
}

fn write_tags<W: Write>(
    out: &mut W,
    tags: &std::collections::BTreeMap<String, String>,
    indent: &str,
) -> ProtocolResult<()> {
    for (key, value) in tags {
        writeln!(out, "{}<tag k=\"{}\" v=\"{}\"/>", indent, escape(key), escape(value))?;
    }
    Ok(())
}

fn write_primitive<W: Write>(
    out: &mut W,
    primitive: &Primitive,
    changeset_id: Option<u64>,
    flavor: Flavor,
    indent: &str,
) -> ProtocolResult<()> {
    let kind = primitive.kind().api_name();
    write!(out, "{}<{} id=\"{}\"", indent, kind, primitive.id)?;
    if !primitive.is_new() {
        write!(out, " version=\"{}\"", primitive.version)?;
    }
    match changeset_id {
        Some(id) => write!(out, " changeset=\"{}\"", id)?,
        None if primitive.changeset_id != 0 => {
            write!(out, " changeset=\"{}\"", primitive.changeset_id)?
        }
        None => {}
    }
    if flavor == Flavor::Bulk {
        if !primitive.visible {
            write!(out, " visible=\"false\"")?;
        }
        if let Some(timestamp) = &primitive.timestamp {
            write!(out, " timestamp=\"{}\"", escape(timestamp))?;
        }
        if let Some(user) = &primitive.user {
            write!(out, " user=\"{}\"", escape(user))?;
        }
    }
    if let PrimitiveData::Node(Some(coord)) = &primitive.data {
        write!(out, " lat=\"{}\" lon=\"{}\"", coord.lat, coord.lon)?;
    }

    let has_body = match &primitive.data {
        PrimitiveData::Node(_) => !primitive.tags.is_empty(),
        PrimitiveData::Way(nodes) => !nodes.is_empty() || !primitive.tags.is_empty(),
        PrimitiveData::Relation(members) => !members.is_empty() || !primitive.tags.is_empty(),
    };
    if flavor == Flavor::Change(ChangeAction::Delete) || !has_body {
        writeln!(out, "/>")?;
        return Ok(());
    }
    writeln!(out, ">")?;

    let inner = format!("{}  ", indent);
    match &primitive.data {
        PrimitiveData::Node(_) => {}
        PrimitiveData::Way(nodes) => {
            for node in nodes {
                writeln!(out, "{}<nd ref=\"{}\"/>", inner, node)?;
            }
        }
        PrimitiveData::Relation(members) => {
            for member in members {
                writeln!(
                    out,
                    "{}<member type=\"{}\" ref=\"{}\" role=\"{}\"/>",
                    inner,
                    member.kind.api_name(),
                    member.ref_id,
                    escape(&member.role)
                )?;
            }
        }
    }
    write_tags(out, &primitive.tags, &inner)?;
    writeln!(out, "{}</{}>", indent, kind)?;
    Ok(())
}

fn write_changeset<W: Write>(out: &mut W, changeset: &Changeset, indent: &str) -> ProtocolResult<()> {
    write!(out, "{}<changeset", indent)?;
    if !changeset.is_new() {
        write!(out, " id=\"{}\"", changeset.id())?;
    }
    if let Some(created) = changeset.created_at() {
        write!(
            out,
            " created_at=\"{}\"",
            created.to_rfc3339_opts(SecondsFormat::Secs, true)
        )?;
    }
    if let Some(closed) = changeset.closed_at() {
        write!(
            out,
            " closed_at=\"{}\"",
            closed.to_rfc3339_opts(SecondsFormat::Secs, true)
        )?;
    }
    if !changeset.is_new() {
        write!(
            out,
            " open=\"{}\" changes_count=\"{}\"",
            changeset.is_open(),
            changeset.changes_count()
        )?;
    }
    if changeset.tags().is_empty() {
        writeln!(out, "/>")?;
        return Ok(());
    }
    writeln!(out, ">")?;
    write_tags(out, changeset.tags(), &format!("{}  ", indent))?;
    writeln!(out, "{}</changeset>", indent)?;
    Ok(())
}

/// Renders the `<osm><changeset>` document sent when creating or updating a changeset.
pub fn changeset_document(changeset: &Changeset) -> ProtocolResult<String> {
    let mut out = Vec::new();
    out.extend_from_slice(XML_DECLARATION.as_bytes());
    writeln!(
        out,
        "<osm version=\"{}\" generator=\"{}\">",
        PROTOCOL_VERSION, GENERATOR
    )?;
    let mut tags_only = Changeset::new();
    tags_only.set_tags(changeset.tags().clone());
    write_changeset(&mut out, &tags_only, "  ")?;
    writeln!(out, "</osm>")?;
    String::from_utf8(out).map_err(|e| ProtocolError::malformed(e.to_string()))
}

/// Renders the `<osm>` document carrying one edit for the single-object calls.
///
/// Deletes are written without a body.
pub fn primitive_document(edit: &Edit, changeset_id: u64) -> ProtocolResult<String> {
    let mut out = Vec::new();
    out.extend_from_slice(XML_DECLARATION.as_bytes());
    writeln!(
        out,
        "<osm version=\"{}\" generator=\"{}\">",
        PROTOCOL_VERSION, GENERATOR
    )?;
    write_primitive(
        &mut out,
        &edit.primitive,
        Some(changeset_id),
        Flavor::Change(edit.action),
        "  ",
    )?;
    writeln!(out, "</osm>")?;
    String::from_utf8(out).map_err(|e| ProtocolError::malformed(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Idle,
    Started { group: Option<ChangeAction> },
    Finished,
}

/// Streaming `<osmChange>` writer.
///
/// Adjacent edits of the same kind share one group element; edits are never
/// reordered. `start`, `append` and `finish` must be called in that order.
/// A finished writer may be started again to emit another document into the
/// same sink.
pub struct OsmChangeWriter<W: Write> {
    out: W,
    state: WriterState,
    changeset_id: u64,
}

impl<W: Write> OsmChangeWriter<W> {
    /// Creates an idle writer.
    pub fn new(out: W) -> Self {
        Self {
            out,
            state: WriterState::Idle,
            changeset_id: 0,
        }
    }

    /// Opens the document; every appended primitive is bound to `changeset_id`.
    pub fn start(&mut self, changeset_id: u64) -> ProtocolResult<()> {
        if let WriterState::Started { .. } = self.state {
            return Err(ProtocolError::illegal_state("document already started"));
        }
        self.out.write_all(XML_DECLARATION.as_bytes())?;
        writeln!(
            self.out,
            "<osmChange version=\"{}\" generator=\"{}\">",
            PROTOCOL_VERSION, GENERATOR
        )?;
        self.changeset_id = changeset_id;
        self.state = WriterState::Started { group: None };
        Ok(())
    }

    /// Appends one edit.
    pub fn append(&mut self, edit: &Edit) -> ProtocolResult<()> {
        let current = match self.state {
            WriterState::Started { group } => group,
            WriterState::Idle => return Err(ProtocolError::illegal_state("append before start")),
            WriterState::Finished => {
                return Err(ProtocolError::illegal_state("append after finish"))
            }
        };
        if current != Some(edit.action) {
            if let Some(open) = current {
                writeln!(self.out, "  </{}>", open.tag_name())?;
            }
            writeln!(self.out, "  <{}>", edit.action.tag_name())?;
            self.state = WriterState::Started {
                group: Some(edit.action),
            };
        }
        write_primitive(
            &mut self.out,
            &edit.primitive,
            Some(self.changeset_id),
            Flavor::Change(edit.action),
            "    ",
        )
    }

    /// Appends every edit of a slice.
    pub fn append_all<'a>(&mut self, edits: impl IntoIterator<Item = &'a Edit>) -> ProtocolResult<()> {
        for edit in edits {
            self.append(edit)?;
        }
        Ok(())
    }

    /// Closes the document and flushes the sink.
    pub fn finish(&mut self) -> ProtocolResult<()> {
        let group = match self.state {
            WriterState::Started { group } => group,
            WriterState::Idle => return Err(ProtocolError::illegal_state("finish before start")),
            WriterState::Finished => {
                return Err(ProtocolError::illegal_state("document already finished"))
            }
        };
        if let Some(open) = group {
            writeln!(self.out, "  </{}>", open.tag_name())?;
        }
        writeln!(self.out, "</osmChange>")?;
        self.out.flush()?;
        self.state = WriterState::Finished;
        Ok(())
    }

    /// Returns the sink.
    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Streaming `<osm>` bulk document writer.
pub struct OsmDocumentWriter<W: Write> {
    out: W,
}

impl<W: Write> OsmDocumentWriter<W> {
    /// Writes the document header.
    pub fn new(mut out: W) -> ProtocolResult<Self> {
        out.write_all(XML_DECLARATION.as_bytes())?;
        writeln!(
            out,
            "<osm version=\"{}\" generator=\"{}\">",
            PROTOCOL_VERSION, GENERATOR
        )?;
        Ok(Self { out })
    }

    /// Writes a `<bounds>` element.
    pub fn bounds(&mut self, bounds: &Bounds) -> ProtocolResult<()> {
        writeln!(
            self.out,
            "  <bounds minlat=\"{}\" minlon=\"{}\" maxlat=\"{}\" maxlon=\"{}\"/>",
            bounds.min_lat, bounds.min_lon, bounds.max_lat, bounds.max_lon
        )?;
        Ok(())
    }

    /// Writes a primitive.
    pub fn primitive(&mut self, primitive: &Primitive) -> ProtocolResult<()> {
        write_primitive(&mut self.out, primitive, None, Flavor::Bulk, "  ")
    }

    /// Writes changeset metadata.
    pub fn changeset(&mut self, changeset: &Changeset) -> ProtocolResult<()> {
        write_changeset(&mut self.out, changeset, "  ")
    }

    /// Closes the document and returns the sink.
    pub fn finish(mut self) -> ProtocolResult<W> {
        writeln!(self.out, "</osm>")?;
        self.out.flush()?;
        Ok(self.out)
    }
}
