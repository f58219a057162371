//! Server capabilities document.

use crate::error::{ProtocolError, ProtocolResult};
use crate::reader::{PullParser, XmlEvent};
use crate::{GENERATOR, PROTOCOL_VERSION};
use std::collections::BTreeMap;
use std::io::{BufReader, Read};

/// Limits and versions announced by `GET capabilities`.
///
/// Values are kept as an `(element, attribute) -> value` map so that
/// unknown entries survive a round trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capabilities {
    values: BTreeMap<(String, String), String>,
}

fn version_key(version: &str) -> Option<Vec<u32>> {
    version
        .split('.')
        .map(|part| part.trim().parse::<u32>().ok())
        .collect()
}

impl Capabilities {
    /// Creates an empty capability set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a value.
    pub fn with(
        mut self,
        element: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.put(element, attribute, value);
        self
    }

    /// Sets a value in place.
    pub fn put(
        &mut self,
        element: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.values
            .insert((element.into(), attribute.into()), value.into());
    }

    /// Raw value of an attribute.
    pub fn get(&self, element: &str, attribute: &str) -> Option<&str> {
        self.values
            .get(&(element.to_string(), attribute.to_string()))
            .map(String::as_str)
    }

    /// Parsed numeric value of an attribute.
    pub fn get_u64(&self, element: &str, attribute: &str) -> Option<u64> {
        self.get(element, attribute)?.trim().parse().ok()
    }

    /// Returns true if `version` lies within the announced range.
    pub fn supports_version(&self, version: &str) -> bool {
        let (Some(min), Some(max)) = (
            self.get("version", "minimum").and_then(version_key),
            self.get("version", "maximum").and_then(version_key),
        ) else {
            return false;
        };
        match version_key(version) {
            Some(wanted) => min <= wanted && wanted <= max,
            None => false,
        }
    }

    /// Maximum number of edits a single changeset may hold.
    pub fn max_changeset_size(&self) -> Option<usize> {
        self.get_u64("changesets", "maximum_elements")
            .and_then(|v| usize::try_from(v).ok())
            .filter(|v| *v > 0)
    }

    /// Maximum number of nodes per way.
    pub fn max_way_nodes(&self) -> Option<u64> {
        self.get_u64("waynodes", "maximum")
    }

    /// Server-side request timeout in seconds.
    pub fn timeout_seconds(&self) -> Option<u64> {
        self.get_u64("timeout", "seconds")
    }

    /// Parses a capabilities document.
    pub fn parse<R: Read>(input: R) -> ProtocolResult<Self> {
        let mut parser = PullParser::new(BufReader::new(input));
        let mut caps = Self::new();
        let mut stack: Vec<String> = Vec::new();
        let mut saw_api = false;
        loop {
            match parser.next_event()? {
                XmlEvent::Start { name, attrs, empty } => {
                    let in_api = stack.last().map(String::as_str) == Some("api");
                    if name == "api" {
                        saw_api = true;
                    } else if in_api {
                        for (key, value) in attrs.iter() {
                            caps.put(name.clone(), key, value);
                        }
                    }
                    if !empty {
                        stack.push(name);
                    }
                }
                XmlEvent::End { .. } => {
                    stack.pop();
                }
                XmlEvent::Eof => break,
            }
        }
        if !saw_api {
            return Err(ProtocolError::malformed("capabilities without <api> element"));
        }
        Ok(caps)
    }

    /// Renders the capabilities as an `<osm><api>` document.
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str(&format!(
            "<osm version=\"{}\" generator=\"{}\">\n  <api>\n",
            PROTOCOL_VERSION, GENERATOR
        ));
        let mut current: Option<&str> = None;
        for ((element, attribute), value) in &self.values {
            if current != Some(element.as_str()) {
                if current.is_some() {
                    out.push_str("/>\n");
                }
                out.push_str(&format!("    <{}", element));
                current = Some(element.as_str());
            }
            out.push_str(&format!(
                " {}=\"{}\"",
                attribute,
                quick_xml::escape::escape(value.as_str())
            ));
        }
        if current.is_some() {
            out.push_str("/>\n");
        }
        out.push_str("  </api>\n</osm>\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<osm version="0.6" generator="server">
  <api>
    <version minimum="0.6" maximum="0.6"/>
    <area maximum="0.25"/>
    <changesets maximum_elements="10000"/>
    <timeout seconds="300"/>
  </api>
  <policy><imagery><blacklist regex=".*"/></imagery></policy>
</osm>"#;

    #[test]
    fn parses_limits() {
        let caps = Capabilities::parse(DOC.as_bytes()).unwrap();
        assert!(caps.supports_version("0.6"));
        assert!(!caps.supports_version("0.5"));
        assert_eq!(caps.max_changeset_size(), Some(10000));
        assert_eq!(caps.timeout_seconds(), Some(300));
        assert_eq!(caps.get("area", "maximum"), Some("0.25"));
        assert_eq!(caps.get("blacklist", "regex"), None);
    }

    #[test]
    fn round_trips_through_xml() {
        let caps = Capabilities::new()
            .with("version", "minimum", "0.6")
            .with("version", "maximum", "0.6")
            .with("changesets", "maximum_elements", "50");
        let parsed = Capabilities::parse(caps.to_xml().as_bytes()).unwrap();
        assert_eq!(parsed, caps);
    }

    #[test]
    fn missing_version_range_is_unsupported() {
        let caps = Capabilities::new().with("changesets", "maximum_elements", "0");
        assert!(!caps.supports_version("0.6"));
        assert_eq!(caps.max_changeset_size(), None);
    }

    #[test]
    fn requires_api_element() {
        assert!(Capabilities::parse(r#"<osm version="0.6"/>"#.as_bytes()).is_err());
    }
}
