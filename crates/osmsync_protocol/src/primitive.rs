//! Primitive identity, version and edit records.
//!
//! Only the parts of a primitive that the transfer layer needs are modelled
//! here: identity, version, tags and references to other primitives. Geometry
//! semantics belong to the caller.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Kind of a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    /// A node.
    Node,
    /// A way.
    Way,
    /// A relation.
    Relation,
}

impl PrimitiveType {
    /// All primitive types, in upload dependency order.
    pub const ALL: [PrimitiveType; 3] = [
        PrimitiveType::Node,
        PrimitiveType::Way,
        PrimitiveType::Relation,
    ];

    /// Element and URL segment name (`node`, `way`, `relation`).
    pub fn api_name(&self) -> &'static str {
        match self {
            PrimitiveType::Node => "node",
            PrimitiveType::Way => "way",
            PrimitiveType::Relation => "relation",
        }
    }

    /// Plural name used by multi-fetch URLs (`nodes`, `ways`, `relations`).
    pub fn plural_name(&self) -> &'static str {
        match self {
            PrimitiveType::Node => "nodes",
            PrimitiveType::Way => "ways",
            PrimitiveType::Relation => "relations",
        }
    }

    /// Parses an element or URL segment name.
    pub fn from_api_name(name: &str) -> Option<Self> {
        match name {
            "node" => Some(PrimitiveType::Node),
            "way" => Some(PrimitiveType::Way),
            "relation" => Some(PrimitiveType::Relation),
            _ => None,
        }
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_name())
    }
}

/// Typed primitive identity.
///
/// Ids `<= 0` are placeholders for primitives not yet created on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrimitiveId {
    /// Primitive kind.
    pub kind: PrimitiveType,
    /// Numeric id.
    pub id: i64,
}

impl PrimitiveId {
    /// Creates a new primitive id.
    pub fn new(kind: PrimitiveType, id: i64) -> Self {
        Self { kind, id }
    }

    /// Node id.
    pub fn node(id: i64) -> Self {
        Self::new(PrimitiveType::Node, id)
    }

    /// Way id.
    pub fn way(id: i64) -> Self {
        Self::new(PrimitiveType::Way, id)
    }

    /// Relation id.
    pub fn relation(id: i64) -> Self {
        Self::new(PrimitiveType::Relation, id)
    }

    /// Returns true if the id is a local placeholder.
    pub fn is_new(&self) -> bool {
        self.id <= 0
    }
}

impl fmt::Display for PrimitiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// WGS84 coordinate of a node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatLon {
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    pub lon: f64,
}

/// Relation member reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    /// Member kind.
    pub kind: PrimitiveType,
    /// Member id.
    pub ref_id: i64,
    /// Member role (may be empty).
    pub role: String,
}

impl Member {
    /// Creates a member reference.
    pub fn new(kind: PrimitiveType, ref_id: i64, role: impl Into<String>) -> Self {
        Self {
            kind,
            ref_id,
            role: role.into(),
        }
    }

    /// Typed id of the referenced primitive.
    pub fn primitive_id(&self) -> PrimitiveId {
        PrimitiveId::new(self.kind, self.ref_id)
    }
}

/// Kind-specific payload of a primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum PrimitiveData {
    /// Node coordinate (absent for deleted nodes).
    Node(Option<LatLon>),
    /// Ordered node references of a way.
    Way(Vec<i64>),
    /// Ordered members of a relation.
    Relation(Vec<Member>),
}

/// A node, way or relation as transferred on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Primitive {
    /// Numeric id (`<= 0` for new primitives).
    pub id: i64,
    /// Version (0 for new primitives).
    pub version: u32,
    /// Changeset the version belongs to (0 if unknown).
    pub changeset_id: u64,
    /// Visibility flag.
    pub visible: bool,
    /// Raw timestamp as sent by the server.
    pub timestamp: Option<String>,
    /// Display name of the last editor.
    pub user: Option<String>,
    /// Tags.
    pub tags: BTreeMap<String, String>,
    /// Kind-specific payload.
    pub data: PrimitiveData,
}

impl Primitive {
    fn with_data(id: i64, data: PrimitiveData) -> Self {
        Self {
            id,
            version: 0,
            changeset_id: 0,
            visible: true,
            timestamp: None,
            user: None,
            tags: BTreeMap::new(),
            data,
        }
    }

    /// Creates a node.
    pub fn node(id: i64, lat: f64, lon: f64) -> Self {
        Self::with_data(id, PrimitiveData::Node(Some(LatLon { lat, lon })))
    }

    /// Creates a way.
    pub fn way(id: i64, nodes: Vec<i64>) -> Self {
        Self::with_data(id, PrimitiveData::Way(nodes))
    }

    /// Creates a relation.
    pub fn relation(id: i64, members: Vec<Member>) -> Self {
        Self::with_data(id, PrimitiveData::Relation(members))
    }

    /// Creates an empty primitive of the given kind.
    pub fn empty(kind: PrimitiveType, id: i64) -> Self {
        let data = match kind {
            PrimitiveType::Node => PrimitiveData::Node(None),
            PrimitiveType::Way => PrimitiveData::Way(Vec::new()),
            PrimitiveType::Relation => PrimitiveData::Relation(Vec::new()),
        };
        Self::with_data(id, data)
    }

    /// Sets the version.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Adds a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Kind of this primitive.
    pub fn kind(&self) -> PrimitiveType {
        match self.data {
            PrimitiveData::Node(_) => PrimitiveType::Node,
            PrimitiveData::Way(_) => PrimitiveType::Way,
            PrimitiveData::Relation(_) => PrimitiveType::Relation,
        }
    }

    /// Typed id of this primitive.
    pub fn primitive_id(&self) -> PrimitiveId {
        PrimitiveId::new(self.kind(), self.id)
    }

    /// Returns true if the primitive is not yet created on the server.
    pub fn is_new(&self) -> bool {
        self.id <= 0
    }

    /// Rewrites references to placeholder ids using server-assigned ids.
    ///
    /// Returns the number of references rewritten.
    pub fn remap_references(&mut self, assigned: &HashMap<PrimitiveId, i64>) -> usize {
        let mut rewritten = 0;
        match &mut self.data {
            PrimitiveData::Node(_) => {}
            PrimitiveData::Way(nodes) => {
                for node in nodes.iter_mut().filter(|n| **n <= 0) {
                    if let Some(new_id) = assigned.get(&PrimitiveId::node(*node)) {
                        *node = *new_id;
                        rewritten += 1;
                    }
                }
            }
            PrimitiveData::Relation(members) => {
                for member in members.iter_mut().filter(|m| m.ref_id <= 0) {
                    if let Some(new_id) = assigned.get(&member.primitive_id()) {
                        member.ref_id = *new_id;
                        rewritten += 1;
                    }
                }
            }
        }
        rewritten
    }
}

/// The kind of edit applied to a primitive in a change document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    /// Primitive is created.
    Create,
    /// Primitive is modified.
    Modify,
    /// Primitive is deleted.
    Delete,
}

impl ChangeAction {
    /// Name of the enclosing group element.
    pub fn tag_name(&self) -> &'static str {
        match self {
            ChangeAction::Create => "create",
            ChangeAction::Modify => "modify",
            ChangeAction::Delete => "delete",
        }
    }

    /// Parses a group element name.
    pub fn from_tag_name(name: &str) -> Option<Self> {
        match name {
            "create" => Some(ChangeAction::Create),
            "modify" => Some(ChangeAction::Modify),
            "delete" => Some(ChangeAction::Delete),
            _ => None,
        }
    }
}

/// A primitive together with the edit to apply to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Edit {
    /// Edit kind.
    pub action: ChangeAction,
    /// Edited primitive.
    pub primitive: Primitive,
}

impl Edit {
    /// Creates an edit.
    pub fn new(action: ChangeAction, primitive: Primitive) -> Self {
        Self { action, primitive }
    }

    /// A create edit.
    pub fn create(primitive: Primitive) -> Self {
        Self::new(ChangeAction::Create, primitive)
    }

    /// A modify edit.
    pub fn modify(primitive: Primitive) -> Self {
        Self::new(ChangeAction::Modify, primitive)
    }

    /// A delete edit.
    pub fn delete(primitive: Primitive) -> Self {
        Self::new(ChangeAction::Delete, primitive)
    }

    /// Typed id of the edited primitive.
    pub fn primitive_id(&self) -> PrimitiveId {
        self.primitive.primitive_id()
    }
}

/// Bounding box announced by a bulk document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    /// Minimum latitude.
    pub min_lat: f64,
    /// Minimum longitude.
    pub min_lon: f64,
    /// Maximum latitude.
    pub max_lat: f64,
    /// Maximum longitude.
    pub max_lon: f64,
}

impl Bounds {
    /// Creates bounds.
    pub fn new(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        }
    }

    /// Formats as the `bbox` query value (`left,bottom,right,top`).
    pub fn to_bbox_param(&self) -> String {
        format!(
            "{},{},{},{}",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }

    /// Parses a `bbox` query value (`left,bottom,right,top`).
    pub fn from_bbox_param(value: &str) -> Option<Self> {
        let parts: Vec<f64> = value
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .ok()?;
        match parts.as_slice() {
            [left, bottom, right, top] => Some(Self::new(*bottom, *left, *top, *right)),
            _ => None,
        }
    }

    /// Returns true if the coordinate lies inside.
    pub fn contains(&self, coord: &LatLon) -> bool {
        coord.lat >= self.min_lat
            && coord.lat <= self.max_lat
            && coord.lon >= self.min_lon
            && coord.lon <= self.max_lon
    }
}
