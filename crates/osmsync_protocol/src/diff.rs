//! `<diffResult>` documents returned by a diff upload.

use crate::error::{ProtocolError, ProtocolResult};
use crate::primitive::{PrimitiveId, PrimitiveType};
use crate::reader::{PullParser, XmlEvent};
use crate::{GENERATOR, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::io::{BufReader, Read, Write};

/// Outcome of one uploaded primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffResultEntry {
    /// Id as sent in the upload (placeholder for creations).
    pub old_id: PrimitiveId,
    /// Id on the server; `None` for deletions.
    pub new_id: Option<i64>,
    /// Version on the server; `None` for deletions.
    pub new_version: Option<u32>,
}

impl DiffResultEntry {
    /// Returns true if the entry reports a deletion.
    pub fn is_deleted(&self) -> bool {
        self.new_id.is_none()
    }
}

/// Parsed diff upload response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffResult {
    entries: Vec<DiffResultEntry>,
}

impl DiffResult {
    /// Creates an empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry.
    pub fn push(&mut self, entry: DiffResultEntry) {
        self.entries.push(entry);
    }

    /// Entries in document order.
    pub fn entries(&self) -> &[DiffResultEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry for an uploaded id.
    pub fn get(&self, old_id: &PrimitiveId) -> Option<&DiffResultEntry> {
        self.entries.iter().find(|e| e.old_id == *old_id)
    }

    /// Placeholder ids mapped to the ids the server assigned.
    pub fn id_mapping(&self) -> HashMap<PrimitiveId, i64> {
        self.entries
            .iter()
            .filter(|e| e.old_id.is_new())
            .filter_map(|e| e.new_id.map(|new_id| (e.old_id, new_id)))
            .collect()
    }

    /// Parses a `<diffResult>` document.
    pub fn parse<R: Read>(input: R) -> ProtocolResult<Self> {
        let mut parser = PullParser::new(BufReader::new(input));
        match parser.next_event()? {
            XmlEvent::Start { name, empty, .. } if name == "diffResult" => {
                if empty {
                    return Ok(Self::new());
                }
            }
            XmlEvent::Start { name, .. } | XmlEvent::End { name } => {
                return Err(ProtocolError::malformed(format!(
                    "expected <diffResult>, found <{}>",
                    name
                )))
            }
            XmlEvent::Eof => return Err(ProtocolError::malformed("empty diff result")),
        }

        let mut result = Self::new();
        loop {
            match parser.next_event()? {
                XmlEvent::Start { name, attrs, empty } => {
                    if let Some(kind) = PrimitiveType::from_api_name(&name) {
                        result.push(DiffResultEntry {
                            old_id: PrimitiveId::new(kind, attrs.parse_required("old_id")?),
                            new_id: attrs.parse("new_id")?,
                            new_version: attrs.parse("new_version")?,
                        });
                    }
                    if !empty {
                        parser.skip_element()?;
                    }
                }
                XmlEvent::End { .. } => return Ok(result),
                XmlEvent::Eof => {
                    return Err(ProtocolError::malformed("unterminated diff result"))
                }
            }
        }
    }

    /// Writes the result as a `<diffResult>` document.
    pub fn write<W: Write>(&self, mut out: W) -> ProtocolResult<()> {
        writeln!(out, "<?xml version=\"1.0\" encoding=\"UTF-8\"?>")?;
        writeln!(
            out,
            "<diffResult version=\"{}\" generator=\"{}\">",
            PROTOCOL_VERSION, GENERATOR
        )?;
        for entry in &self.entries {
            write!(
                out,
                "  <{} old_id=\"{}\"",
                entry.old_id.kind.api_name(),
                entry.old_id.id
            )?;
            if let Some(new_id) = entry.new_id {
                write!(out, " new_id=\"{}\"", new_id)?;
            }
            if let Some(new_version) = entry.new_version {
                write!(out, " new_version=\"{}\"", new_version)?;
            }
            writeln!(out, "/>")?;
        }
        writeln!(out, "</diffResult>")?;
        out.flush()?;
        Ok(())
    }
}
