//! Pull-style streaming reader for `<osm>` and `<osmChange>` documents.
//!
//! The reader never materializes the document. Each call to
//! [`OsmReader::next_record`] pulls XML events until one complete record
//! (primitive, changeset or bounds) is available.

use crate::changeset::{parse_timestamp, Changeset};
use crate::error::{ProtocolError, ProtocolResult};
use crate::primitive::{
    Bounds, ChangeAction, LatLon, Member, Primitive, PrimitiveData, PrimitiveType,
};
use crate::sanitize::InvalidXmlCharFilter;
use crate::PROTOCOL_VERSION;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::str::FromStr;
use tracing::debug;

/// Owned form of the XML events the protocol cares about.
#[derive(Debug)]
pub(crate) enum XmlEvent {
    Start {
        name: String,
        attrs: Attrs,
        empty: bool,
    },
    End {
        name: String,
    },
    Eof,
}

/// Attributes of one element, in document order.
#[derive(Debug, Default)]
pub(crate) struct Attrs {
    element: String,
    values: Vec<(String, String)>,
}

impl Attrs {
    fn from_start(start: &BytesStart<'_>) -> ProtocolResult<Self> {
        let element = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut values = Vec::new();
        for attr in start.attributes() {
            let attr = attr?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            values.push((key, value));
        }
        Ok(Self { element, values })
    }

    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub(crate) fn require(&self, key: &str) -> ProtocolResult<&str> {
        self.get(key)
            .ok_or_else(|| ProtocolError::missing(&self.element, key))
    }

    pub(crate) fn parse<T: FromStr>(&self, key: &str) -> ProtocolResult<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| ProtocolError::invalid(&self.element, key, raw)),
        }
    }

    pub(crate) fn parse_required<T: FromStr>(&self, key: &str) -> ProtocolResult<T> {
        self.parse(key)?
            .ok_or_else(|| ProtocolError::missing(&self.element, key))
    }

    fn parse_bool(&self, key: &str) -> ProtocolResult<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some("true") => Ok(Some(true)),
            Some("false") => Ok(Some(false)),
            Some(raw) => Err(ProtocolError::invalid(&self.element, key, raw)),
        }
    }

    fn parse_time(&self, key: &str) -> Option<chrono::DateTime<chrono::Utc>> {
        let raw = self.get(key)?;
        let parsed = parse_timestamp(raw);
        if parsed.is_none() {
            debug!(element = %self.element, attribute = key, value = raw, "unparseable timestamp");
        }
        parsed
    }
}

/// Thin pull parser over quick-xml that yields owned events.
pub(crate) struct PullParser<B: BufRead> {
    reader: Reader<B>,
    buf: Vec<u8>,
}

impl<B: BufRead> PullParser<B> {
    pub(crate) fn new(input: B) -> Self {
        let mut reader = Reader::from_reader(input);
        reader.config_mut().trim_text(true);
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Next element boundary; text, comments and declarations are dropped.
    pub(crate) fn next_event(&mut self) -> ProtocolResult<XmlEvent> {
        loop {
            self.buf.clear();
            let event = match self.reader.read_event_into(&mut self.buf)? {
                Event::Start(start) => XmlEvent::Start {
                    name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                    attrs: Attrs::from_start(&start)?,
                    empty: false,
                },
                Event::Empty(start) => XmlEvent::Start {
                    name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                    attrs: Attrs::from_start(&start)?,
                    empty: true,
                },
                Event::End(end) => XmlEvent::End {
                    name: String::from_utf8_lossy(end.name().as_ref()).into_owned(),
                },
                Event::Eof => XmlEvent::Eof,
                _ => continue,
            };
            return Ok(event);
        }
    }

    /// Consumes events until the element just opened is closed.
    pub(crate) fn skip_element(&mut self) -> ProtocolResult<()> {
        let mut depth = 1usize;
        while depth > 0 {
            match self.next_event()? {
                XmlEvent::Start { empty: false, .. } => depth += 1,
                XmlEvent::Start { empty: true, .. } => {}
                XmlEvent::End { .. } => depth -= 1,
                XmlEvent::Eof => {
                    return Err(ProtocolError::malformed("unexpected end of document"))
                }
            }
        }
        Ok(())
    }
}

/// Root element of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    /// `<osm>` bulk document.
    Osm,
    /// `<osmChange>` change document.
    OsmChange,
}

/// One record pulled from a document.
#[derive(Debug, Clone, PartialEq)]
pub enum OsmRecord {
    /// A primitive, with the edit it carries if any.
    ///
    /// In change documents the action comes from the enclosing group; in bulk
    /// documents from an optional `action` attribute.
    Primitive {
        /// Edit kind, if present.
        action: Option<ChangeAction>,
        /// The primitive.
        primitive: Primitive,
    },
    /// Changeset metadata.
    Changeset(Changeset),
    /// Document bounds.
    Bounds(Bounds),
}

struct ChangesetDraft {
    id: u64,
    created_at: Option<chrono::DateTime<chrono::Utc>>,
    closed_at: Option<chrono::DateTime<chrono::Utc>>,
    open: bool,
    changes_count: u64,
    tags: BTreeMap<String, String>,
}

impl ChangesetDraft {
    fn from_attrs(attrs: &Attrs) -> ProtocolResult<Self> {
        let changes_count = match attrs.parse::<u64>("changes_count")? {
            Some(count) => count,
            None => attrs.parse::<u64>("num_changes")?.unwrap_or(0),
        };
        Ok(Self {
            id: attrs.parse("id")?.unwrap_or(0),
            created_at: attrs.parse_time("created_at"),
            closed_at: attrs.parse_time("closed_at"),
            open: attrs.parse_bool("open")?.unwrap_or(false),
            changes_count,
            tags: BTreeMap::new(),
        })
    }

    fn build(self) -> Changeset {
        Changeset::from_server(
            self.id,
            self.created_at,
            self.closed_at,
            self.open,
            self.changes_count,
            self.tags,
        )
    }
}

enum ParseState {
    Prolog,
    Body,
    Group(ChangeAction),
    Primitive {
        group: Option<ChangeAction>,
        action: Option<ChangeAction>,
        primitive: Primitive,
    },
    Changeset(ChangesetDraft),
    Finished,
}

/// Streaming reader for protocol documents.
pub struct OsmReader<R: Read> {
    parser: PullParser<BufReader<InvalidXmlCharFilter<R>>>,
    state: ParseState,
    kind: Option<DocumentKind>,
}

impl<R: Read> OsmReader<R> {
    /// Creates a reader over a raw byte stream.
    pub fn new(input: R) -> Self {
        Self {
            parser: PullParser::new(BufReader::new(InvalidXmlCharFilter::new(input))),
            state: ParseState::Prolog,
            kind: None,
        }
    }

    /// Root element kind, known after the first record is pulled.
    pub fn kind(&self) -> Option<DocumentKind> {
        self.kind
    }

    /// Pulls the next record, or `None` at the end of the document.
    ///
    /// After an error the reader is finished and returns `None`.
    pub fn next_record(&mut self) -> ProtocolResult<Option<OsmRecord>> {
        match self.advance() {
            Ok(record) => Ok(record),
            Err(err) => {
                self.state = ParseState::Finished;
                Err(err)
            }
        }
    }

    fn advance(&mut self) -> ProtocolResult<Option<OsmRecord>> {
        loop {
            if matches!(self.state, ParseState::Finished) {
                return Ok(None);
            }
            let event = self.parser.next_event()?;
            let state = std::mem::replace(&mut self.state, ParseState::Finished);
            let (next, record) = self.step(state, event)?;
            self.state = next;
            if record.is_some() {
                return Ok(record);
            }
        }
    }

    fn step(
        &mut self,
        state: ParseState,
        event: XmlEvent,
    ) -> ProtocolResult<(ParseState, Option<OsmRecord>)> {
        match (state, event) {
            (ParseState::Prolog, XmlEvent::Start { name, attrs, empty }) => {
                let kind = match name.as_str() {
                    "osm" => DocumentKind::Osm,
                    "osmChange" => DocumentKind::OsmChange,
                    other => {
                        return Err(ProtocolError::malformed(format!(
                            "unexpected root element <{}>",
                            other
                        )))
                    }
                };
                let version = attrs.require("version")?;
                if version != PROTOCOL_VERSION {
                    return Err(ProtocolError::UnsupportedVersion(version.to_string()));
                }
                self.kind = Some(kind);
                let next = if empty {
                    ParseState::Finished
                } else {
                    ParseState::Body
                };
                Ok((next, None))
            }
            (ParseState::Prolog, XmlEvent::Eof) => Err(ProtocolError::malformed("empty document")),

            (ParseState::Body, XmlEvent::Start { name, attrs, empty }) => {
                let in_change = self.kind == Some(DocumentKind::OsmChange);
                if in_change {
                    if let Some(action) = ChangeAction::from_tag_name(&name) {
                        let next = if empty {
                            ParseState::Body
                        } else {
                            ParseState::Group(action)
                        };
                        return Ok((next, None));
                    }
                }
                if let Some(kind) = PrimitiveType::from_api_name(&name) {
                    let action = match attrs.get("action") {
                        Some(raw) => ChangeAction::from_tag_name(raw),
                        None => None,
                    };
                    let primitive = primitive_from_attrs(kind, &attrs)?;
                    return Ok(Self::open_primitive(None, action, primitive, empty));
                }
                match name.as_str() {
                    "changeset" => {
                        let draft = ChangesetDraft::from_attrs(&attrs)?;
                        if empty {
                            Ok((ParseState::Body, Some(OsmRecord::Changeset(draft.build()))))
                        } else {
                            Ok((ParseState::Changeset(draft), None))
                        }
                    }
                    "bounds" => {
                        let bounds = Bounds::new(
                            attrs.parse_required("minlat")?,
                            attrs.parse_required("minlon")?,
                            attrs.parse_required("maxlat")?,
                            attrs.parse_required("maxlon")?,
                        );
                        if !empty {
                            self.parser.skip_element()?;
                        }
                        Ok((ParseState::Body, Some(OsmRecord::Bounds(bounds))))
                    }
                    _ => {
                        self.skip_unknown(&name, empty)?;
                        Ok((ParseState::Body, None))
                    }
                }
            }
            (ParseState::Body, XmlEvent::End { .. }) => Ok((ParseState::Finished, None)),

            (ParseState::Group(action), XmlEvent::Start { name, attrs, empty }) => {
                match PrimitiveType::from_api_name(&name) {
                    Some(kind) => {
                        let primitive = primitive_from_attrs(kind, &attrs)?;
                        Ok(Self::open_primitive(
                            Some(action),
                            Some(action),
                            primitive,
                            empty,
                        ))
                    }
                    None => {
                        self.skip_unknown(&name, empty)?;
                        Ok((ParseState::Group(action), None))
                    }
                }
            }
            (ParseState::Group(_), XmlEvent::End { .. }) => Ok((ParseState::Body, None)),

            (
                ParseState::Primitive {
                    group,
                    action,
                    mut primitive,
                },
                XmlEvent::Start { name, attrs, empty },
            ) => {
                match (name.as_str(), &mut primitive.data) {
                    ("tag", _) => {
                        let key = attrs.require("k")?.to_string();
                        let value = attrs.get("v").unwrap_or_default().to_string();
                        primitive.tags.insert(key, value);
                    }
                    ("nd", PrimitiveData::Way(nodes)) => {
                        nodes.push(attrs.parse_required("ref")?);
                    }
                    ("member", PrimitiveData::Relation(members)) => {
                        let raw_kind = attrs.require("type")?;
                        let kind = PrimitiveType::from_api_name(raw_kind)
                            .ok_or_else(|| ProtocolError::invalid("member", "type", raw_kind))?;
                        let role = attrs.get("role").unwrap_or_default();
                        members.push(Member::new(kind, attrs.parse_required("ref")?, role));
                    }
                    _ => {}
                }
                if !empty {
                    self.parser.skip_element()?;
                }
                Ok((
                    ParseState::Primitive {
                        group,
                        action,
                        primitive,
                    },
                    None,
                ))
            }
            (
                ParseState::Primitive {
                    group,
                    action,
                    primitive,
                },
                XmlEvent::End { .. },
            ) => {
                let next = match group {
                    Some(group) => ParseState::Group(group),
                    None => ParseState::Body,
                };
                Ok((next, Some(OsmRecord::Primitive { action, primitive })))
            }

            (ParseState::Changeset(mut draft), XmlEvent::Start { name, attrs, empty }) => {
                if name == "tag" {
                    let key = attrs.require("k")?.to_string();
                    let value = attrs.get("v").unwrap_or_default().to_string();
                    draft.tags.insert(key, value);
                }
                if !empty {
                    self.parser.skip_element()?;
                }
                Ok((ParseState::Changeset(draft), None))
            }
            (ParseState::Changeset(draft), XmlEvent::End { .. }) => {
                Ok((ParseState::Body, Some(OsmRecord::Changeset(draft.build()))))
            }

            (ParseState::Prolog, XmlEvent::End { name }) => Err(ProtocolError::malformed(
                format!("unexpected closing tag </{}>", name),
            )),
            (ParseState::Finished, _) => Ok((ParseState::Finished, None)),
            (_, XmlEvent::Eof) => Err(ProtocolError::malformed("unexpected end of document")),
        }
    }

    fn open_primitive(
        group: Option<ChangeAction>,
        action: Option<ChangeAction>,
        primitive: Primitive,
        empty: bool,
    ) -> (ParseState, Option<OsmRecord>) {
        if empty {
            let next = match group {
                Some(group) => ParseState::Group(group),
                None => ParseState::Body,
            };
            (next, Some(OsmRecord::Primitive { action, primitive }))
        } else {
            (
                ParseState::Primitive {
                    group,
                    action,
                    primitive,
                },
                None,
            )
        }
    }

    fn skip_unknown(&mut self, name: &str, empty: bool) -> ProtocolResult<()> {
        debug!(element = name, "skipping unknown element");
        if !empty {
            self.parser.skip_element()?;
        }
        Ok(())
    }
}

impl<R: Read> Iterator for OsmReader<R> {
    type Item = ProtocolResult<OsmRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

fn primitive_from_attrs(kind: PrimitiveType, attrs: &Attrs) -> ProtocolResult<Primitive> {
    let mut primitive = Primitive::empty(kind, attrs.parse_required("id")?);
    primitive.version = attrs.parse("version")?.unwrap_or(0);
    primitive.changeset_id = attrs.parse("changeset")?.unwrap_or(0);
    primitive.visible = attrs.parse_bool("visible")?.unwrap_or(true);
    primitive.timestamp = attrs.get("timestamp").map(str::to_string);
    primitive.user = attrs.get("user").map(str::to_string);
    if kind == PrimitiveType::Node {
        let lat: Option<f64> = attrs.parse("lat")?;
        let lon: Option<f64> = attrs.parse("lon")?;
        if let (Some(lat), Some(lon)) = (lat, lon) {
            primitive.data = PrimitiveData::Node(Some(LatLon { lat, lon }));
        }
    }
    Ok(primitive)
}
