//! In-memory primitive and changeset store.
//!
//! A diff upload is validated against a staging area first and committed
//! only if every edit in it is valid, so a rejected upload leaves no trace.

use crate::error::{ServerError, ServerResult};
use chrono::{DateTime, SecondsFormat, Utc};
use osmsync_protocol::{
    Bounds, ChangeAction, Changeset, DiffResult, DiffResultEntry, Edit, Primitive, PrimitiveData,
    PrimitiveId, PrimitiveType,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

#[derive(Debug)]
struct ChangesetRecord {
    changeset: Changeset,
    owner: String,
}

#[derive(Debug)]
struct StoreState {
    primitives: HashMap<PrimitiveId, Primitive>,
    next_ids: HashMap<PrimitiveType, i64>,
    changesets: BTreeMap<u64, ChangesetRecord>,
    next_changeset_id: u64,
}

impl StoreState {
    fn next_id(&mut self, kind: PrimitiveType) -> i64 {
        let next = self.next_ids.entry(kind).or_insert(1);
        let id = *next;
        *next += 1;
        id
    }

    fn open_changeset(&mut self, id: u64) -> ServerResult<&mut ChangesetRecord> {
        let record = self
            .changesets
            .get_mut(&id)
            .ok_or_else(|| ServerError::NotFound(format!("changeset {} not found", id)))?;
        if !record.changeset.is_open() {
            return Err(ServerError::ChangesetClosed {
                id,
                closed_at: record.changeset.closed_at().unwrap_or_else(Utc::now),
            });
        }
        Ok(record)
    }
}

/// Primitives staged by a diff upload on top of the committed state.
struct Staging<'a> {
    committed: &'a HashMap<PrimitiveId, Primitive>,
    staged: HashMap<PrimitiveId, Primitive>,
    placeholders: HashMap<PrimitiveId, i64>,
}

impl Staging<'_> {
    fn get(&self, id: &PrimitiveId) -> Option<&Primitive> {
        self.staged.get(id).or_else(|| self.committed.get(id))
    }

    /// Resolves a placeholder id sent by the client to its assigned id.
    fn resolve(&self, id: PrimitiveId) -> PrimitiveId {
        match self.placeholders.get(&id) {
            Some(assigned) => PrimitiveId::new(id.kind, *assigned),
            None => id,
        }
    }

    fn current(&self, id: PrimitiveId, version: u32) -> ServerResult<&Primitive> {
        let current = self
            .get(&id)
            .ok_or_else(|| ServerError::NotFound(format!("{} not found", id)))?;
        if !current.visible {
            return Err(ServerError::Gone {
                kind: id.kind,
                id: id.id,
            });
        }
        if current.version != version {
            return Err(ServerError::VersionMismatch {
                primitive: id,
                provided: version,
                current: current.version,
            });
        }
        Ok(current)
    }

    fn check_references(&self, primitive: &Primitive) -> ServerResult<()> {
        for target in references(primitive) {
            match self.get(&target) {
                Some(found) if found.visible => {}
                _ => {
                    return Err(ServerError::PreconditionFailed(format!(
                        "{} {} requires {}, which does not exist or is deleted",
                        primitive.kind(),
                        primitive.id,
                        target
                    )))
                }
            }
        }
        Ok(())
    }

    fn check_unused(&self, target: PrimitiveId) -> ServerResult<()> {
        let staged = self.staged.values();
        let committed = self
            .committed
            .iter()
            .filter(|(id, _)| !self.staged.contains_key(id))
            .map(|(_, p)| p);
        let user = staged
            .chain(committed)
            .filter(|p| p.visible)
            .find(|p| references(p).contains(&target));
        match user {
            Some(user) => Err(ServerError::PreconditionFailed(format!(
                "{} is still used by {}",
                target,
                user.primitive_id()
            ))),
            None => Ok(()),
        }
    }
}

fn references(primitive: &Primitive) -> Vec<PrimitiveId> {
    match &primitive.data {
        PrimitiveData::Node(_) => Vec::new(),
        PrimitiveData::Way(nodes) => nodes.iter().map(|n| PrimitiveId::node(*n)).collect(),
        PrimitiveData::Relation(members) => members.iter().map(|m| m.primitive_id()).collect(),
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Thread-safe store behind the reference server.
#[derive(Debug)]
pub struct OsmStore {
    state: RwLock<StoreState>,
    max_changeset_elements: u64,
}

impl OsmStore {
    /// Creates an empty store with a changeset element limit.
    pub fn new(max_changeset_elements: u64) -> Self {
        Self {
            state: RwLock::new(StoreState {
                primitives: HashMap::new(),
                next_ids: HashMap::new(),
                changesets: BTreeMap::new(),
                next_changeset_id: 1,
            }),
            max_changeset_elements,
        }
    }

    /// Changeset element limit.
    pub fn max_changeset_elements(&self) -> u64 {
        self.max_changeset_elements
    }

    /// Inserts a primitive directly, as version 1 if it has no version.
    ///
    /// Returns the id it was stored under; placeholder ids get a fresh one.
    pub fn seed(&self, mut primitive: Primitive) -> i64 {
        let mut state = self.state.write();
        if primitive.is_new() {
            primitive.id = state.next_id(primitive.kind());
        } else {
            let next = state.next_ids.entry(primitive.kind()).or_insert(1);
            *next = (*next).max(primitive.id + 1);
        }
        primitive.version = primitive.version.max(1);
        primitive.visible = true;
        let id = primitive.id;
        state.primitives.insert(primitive.primitive_id(), primitive);
        id
    }

    /// Current state of a primitive, deleted ones included.
    pub fn primitive(&self, id: PrimitiveId) -> Option<Primitive> {
        self.state.read().primitives.get(&id).cloned()
    }

    /// Number of visible primitives.
    pub fn visible_count(&self) -> usize {
        self.state
            .read()
            .primitives
            .values()
            .filter(|p| p.visible)
            .count()
    }

    /// Fetches primitives of one kind. Fails if any id is unknown.
    pub fn fetch(&self, kind: PrimitiveType, ids: &[i64]) -> ServerResult<Vec<Primitive>> {
        let state = self.state.read();
        ids.iter()
            .map(|id| {
                let id = PrimitiveId::new(kind, *id);
                state
                    .primitives
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| ServerError::NotFound(format!("{} not found", id)))
            })
            .collect()
    }

    /// Visible nodes inside `bounds`, the ways using them with all their
    /// nodes, and the relations referencing any of those.
    pub fn map(&self, bounds: &Bounds) -> Vec<Primitive> {
        let state = self.state.read();
        let visible = || state.primitives.values().filter(|p| p.visible);

        let mut selected: BTreeSet<PrimitiveId> = visible()
            .filter(|p| match &p.data {
                PrimitiveData::Node(Some(coord)) => bounds.contains(coord),
                _ => false,
            })
            .map(Primitive::primitive_id)
            .collect();
        let ways: Vec<&Primitive> = visible()
            .filter(|p| {
                p.kind() == PrimitiveType::Way
                    && references(p).iter().any(|r| selected.contains(r))
            })
            .collect();
        for way in ways {
            selected.insert(way.primitive_id());
            selected.extend(references(way));
        }
        let relations: Vec<PrimitiveId> = visible()
            .filter(|p| {
                p.kind() == PrimitiveType::Relation
                    && references(p).iter().any(|r| selected.contains(r))
            })
            .map(Primitive::primitive_id)
            .collect();
        selected.extend(relations);

        selected
            .iter()
            .filter_map(|id| state.primitives.get(id))
            .filter(|p| p.visible)
            .cloned()
            .collect()
    }

    /// Opens a changeset for `owner`.
    pub fn create_changeset(&self, tags: BTreeMap<String, String>, owner: &str) -> u64 {
        let mut state = self.state.write();
        let id = state.next_changeset_id;
        state.next_changeset_id += 1;
        let changeset = Changeset::from_server(id, Some(Utc::now()), None, true, 0, tags);
        state.changesets.insert(
            id,
            ChangesetRecord {
                changeset,
                owner: owner.to_string(),
            },
        );
        info!(changeset_id = id, owner, "changeset opened");
        id
    }

    /// Current state of a changeset.
    pub fn changeset(&self, id: u64) -> ServerResult<Changeset> {
        self.state
            .read()
            .changesets
            .get(&id)
            .map(|r| r.changeset.clone())
            .ok_or_else(|| ServerError::NotFound(format!("changeset {} not found", id)))
    }

    /// Known changesets among `ids`, in the order given.
    pub fn changesets(&self, ids: &[u64]) -> Vec<Changeset> {
        let state = self.state.read();
        ids.iter()
            .filter_map(|id| state.changesets.get(id))
            .map(|r| r.changeset.clone())
            .collect()
    }

    /// Replaces the tags of an open changeset.
    pub fn update_changeset(
        &self,
        id: u64,
        tags: BTreeMap<String, String>,
        user: &str,
    ) -> ServerResult<Changeset> {
        let mut state = self.state.write();
        let record = state.open_changeset(id)?;
        check_owner(record, user)?;
        record.changeset.set_tags(tags);
        Ok(record.changeset.clone())
    }

    /// Closes an open changeset.
    pub fn close_changeset(&self, id: u64, user: &str) -> ServerResult<()> {
        let mut state = self.state.write();
        let record = state.open_changeset(id)?;
        check_owner(record, user)?;
        record.changeset.mark_closed(Some(Utc::now()));
        info!(changeset_id = id, "changeset closed");
        Ok(())
    }

    /// Closes a changeset regardless of its owner, as an expiry would.
    pub fn expire_changeset(&self, id: u64) -> bool {
        let mut state = self.state.write();
        match state.changesets.get_mut(&id) {
            Some(record) if record.changeset.is_open() => {
                record.changeset.mark_closed(Some(Utc::now()));
                true
            }
            _ => false,
        }
    }

    /// Applies a diff upload atomically.
    ///
    /// A changeset that would exceed the element limit is closed and the
    /// upload rejected; one that reaches it exactly is closed after commit.
    pub fn apply(&self, changeset_id: u64, edits: &[Edit], user: &str) -> ServerResult<DiffResult> {
        let mut state = self.state.write();
        let now = Utc::now();
        let limit = self.max_changeset_elements;
        {
            let record = state.open_changeset(changeset_id)?;
            check_owner(record, user)?;
            let count = record.changeset.changes_count();
            if count + edits.len() as u64 > limit {
                record.changeset.mark_closed(Some(now));
                info!(
                    changeset_id,
                    count,
                    incoming = edits.len(),
                    limit,
                    "changeset full, closing"
                );
                return Err(ServerError::ChangesetClosed {
                    id: changeset_id,
                    closed_at: now,
                });
            }
        }

        let mut next_ids = state.next_ids.clone();
        let (staged, result) = {
            let mut staging = Staging {
                committed: &state.primitives,
                staged: HashMap::new(),
                placeholders: HashMap::new(),
            };
            let mut result = DiffResult::new();
            for edit in edits {
                let entry = stage(&mut staging, edit, changeset_id, user, now, &mut next_ids)?;
                result.push(entry);
            }
            (staging.staged, result)
        };

        state.primitives.extend(staged);
        state.next_ids = next_ids;
        if let Some(record) = state.changesets.get_mut(&changeset_id) {
            record.changeset.record_upload(edits.len() as u64);
            if record.changeset.changes_count() >= limit {
                record.changeset.mark_closed(Some(now));
                info!(changeset_id, "changeset reached its limit, closed");
            }
        }
        debug!(changeset_id, edits = edits.len(), "diff applied");
        Ok(result)
    }
}

fn check_owner(record: &ChangesetRecord, user: &str) -> ServerResult<()> {
    if record.owner != user {
        return Err(ServerError::Conflict(format!(
            "The user {} is not the owner of changeset {}",
            user,
            record.changeset.id()
        )));
    }
    Ok(())
}

fn stage(
    staging: &mut Staging<'_>,
    edit: &Edit,
    changeset_id: u64,
    user: &str,
    now: DateTime<Utc>,
    next_ids: &mut HashMap<PrimitiveType, i64>,
) -> ServerResult<DiffResultEntry> {
    let old_id = edit.primitive_id();
    let mut primitive = edit.primitive.clone();
    primitive.remap_references(&staging.placeholders);
    primitive.changeset_id = changeset_id;
    primitive.user = Some(user.to_string());
    primitive.timestamp = Some(timestamp(now));

    match edit.action {
        ChangeAction::Create => {
            if !old_id.is_new() {
                return Err(ServerError::BadRequest(format!(
                    "cannot create {} with a positive id",
                    old_id
                )));
            }
            staging.check_references(&primitive)?;
            let next = next_ids.entry(old_id.kind).or_insert(1);
            let new_id = *next;
            *next += 1;
            primitive.id = new_id;
            primitive.version = 1;
            primitive.visible = true;
            staging.placeholders.insert(old_id, new_id);
            staging.staged.insert(primitive.primitive_id(), primitive);
            Ok(DiffResultEntry {
                old_id,
                new_id: Some(new_id),
                new_version: Some(1),
            })
        }
        ChangeAction::Modify => {
            let id = staging.resolve(old_id);
            let version = staging.current(id, edit.primitive.version)?.version;
            staging.check_references(&primitive)?;
            primitive.id = id.id;
            primitive.version = version + 1;
            primitive.visible = true;
            staging.staged.insert(id, primitive);
            Ok(DiffResultEntry {
                old_id,
                new_id: Some(id.id),
                new_version: Some(version + 1),
            })
        }
        ChangeAction::Delete => {
            let id = staging.resolve(old_id);
            let mut deleted = staging.current(id, edit.primitive.version)?.clone();
            staging.check_unused(id)?;
            deleted.version += 1;
            deleted.visible = false;
            deleted.changeset_id = changeset_id;
            deleted.user = primitive.user;
            deleted.timestamp = primitive.timestamp;
            deleted.tags.clear();
            deleted.data = Primitive::empty(id.kind, id.id).data;
            staging.staged.insert(id, deleted);
            Ok(DiffResultEntry {
                old_id,
                new_id: None,
                new_version: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osmsync_protocol::Member;

    fn store(limit: u64) -> (OsmStore, u64) {
        let store = OsmStore::new(limit);
        let id = store.create_changeset(BTreeMap::new(), "alice");
        (store, id)
    }

    #[test]
    fn create_assigns_ids_and_resolves_placeholders() {
        let (store, cs) = store(100);
        let edits = vec![
            Edit::create(Primitive::node(-1, 1.0, 1.0)),
            Edit::create(Primitive::node(-2, 2.0, 2.0)),
            Edit::create(Primitive::way(-1, vec![-1, -2])),
        ];
        let result = store.apply(cs, &edits, "alice").unwrap();
        assert_eq!(result.len(), 3);
        let mapping = result.id_mapping();
        let way_id = mapping[&PrimitiveId::way(-1)];
        let way = store.primitive(PrimitiveId::way(way_id)).unwrap();
        assert_eq!(
            way.data,
            PrimitiveData::Way(vec![
                mapping[&PrimitiveId::node(-1)],
                mapping[&PrimitiveId::node(-2)]
            ])
        );
        assert_eq!(way.version, 1);
        assert_eq!(store.changeset(cs).unwrap().changes_count(), 3);
    }

    #[test]
    fn failed_diff_leaves_no_trace() {
        let (store, cs) = store(100);
        let edits = vec![
            Edit::create(Primitive::node(-1, 1.0, 1.0)),
            Edit::create(Primitive::way(-1, vec![-1, 99])),
        ];
        let err = store.apply(cs, &edits, "alice").unwrap_err();
        assert_eq!(err.status(), 412);
        assert_eq!(store.visible_count(), 0);
        assert_eq!(store.changeset(cs).unwrap().changes_count(), 0);
    }

    #[test]
    fn modify_checks_versions() {
        let (store, cs) = store(100);
        let id = store.seed(Primitive::node(0, 1.0, 1.0));
        let stale = Edit::modify(Primitive::node(id, 5.0, 5.0).with_version(3));
        let err = store.apply(cs, &[stale], "alice").unwrap_err();
        assert!(matches!(err, ServerError::VersionMismatch { current: 1, .. }));

        let fresh = Edit::modify(Primitive::node(id, 5.0, 5.0).with_version(1));
        let result = store.apply(cs, &[fresh], "alice").unwrap();
        assert_eq!(result.entries()[0].new_version, Some(2));
    }

    #[test]
    fn delete_twice_is_gone() {
        let (store, cs) = store(100);
        let id = store.seed(Primitive::node(7, 1.0, 1.0));
        let delete = Edit::delete(Primitive::node(id, 0.0, 0.0).with_version(1));
        let result = store.apply(cs, std::slice::from_ref(&delete), "alice").unwrap();
        assert!(result.entries()[0].is_deleted());
        assert!(!store.primitive(PrimitiveId::node(7)).unwrap().visible);

        let again = Edit::delete(Primitive::node(id, 0.0, 0.0).with_version(2));
        let err = store.apply(cs, &[again], "alice").unwrap_err();
        assert_eq!(err.status(), 410);
        assert_eq!(
            err.error_header(),
            "The node with the id 7 has already been deleted"
        );
    }

    #[test]
    fn delete_of_used_node_fails() {
        let (store, cs) = store(100);
        let a = store.seed(Primitive::node(0, 1.0, 1.0));
        let b = store.seed(Primitive::node(0, 2.0, 2.0));
        store.seed(Primitive::way(0, vec![a, b]));
        let err = store
            .apply(cs, &[Edit::delete(Primitive::node(a, 0.0, 0.0).with_version(1))], "alice")
            .unwrap_err();
        assert_eq!(err.status(), 412);
    }

    #[test]
    fn full_changeset_is_closed() {
        let (store, cs) = store(3);
        let two = vec![
            Edit::create(Primitive::node(-1, 1.0, 1.0)),
            Edit::create(Primitive::node(-2, 1.0, 1.0)),
        ];
        store.apply(cs, &two, "alice").unwrap();
        let err = store.apply(cs, &two, "alice").unwrap_err();
        assert!(matches!(err, ServerError::ChangesetClosed { id, .. } if id == cs));
        assert!(!store.changeset(cs).unwrap().is_open());
        assert_eq!(store.visible_count(), 2);
    }

    #[test]
    fn changeset_closes_at_limit() {
        let (store, cs) = store(1);
        store
            .apply(cs, &[Edit::create(Primitive::node(-1, 1.0, 1.0))], "alice")
            .unwrap();
        let changeset = store.changeset(cs).unwrap();
        assert!(!changeset.is_open());
        assert!(changeset.closed_at().is_some());
    }

    #[test]
    fn owner_is_checked() {
        let (store, cs) = store(10);
        let err = store.close_changeset(cs, "mallory").unwrap_err();
        assert_eq!(err.status(), 409);
        store.close_changeset(cs, "alice").unwrap();
        assert!(matches!(
            store.close_changeset(cs, "alice"),
            Err(ServerError::ChangesetClosed { .. })
        ));
    }

    #[test]
    fn map_selects_ways_and_relations() {
        let store = OsmStore::new(10);
        let inside = store.seed(Primitive::node(0, 1.0, 1.0));
        let outside = store.seed(Primitive::node(0, 50.0, 50.0));
        let far = store.seed(Primitive::node(0, 60.0, 60.0));
        let way = store.seed(Primitive::way(0, vec![inside, outside]));
        store.seed(Primitive::way(0, vec![outside, far]));
        let relation = store.seed(Primitive::relation(
            0,
            vec![Member::new(PrimitiveType::Way, way, "outer")],
        ));

        let ids: Vec<PrimitiveId> = store
            .map(&Bounds::new(0.0, 0.0, 2.0, 2.0))
            .iter()
            .map(Primitive::primitive_id)
            .collect();
        assert_eq!(
            ids,
            vec![
                PrimitiveId::node(inside),
                PrimitiveId::node(outside),
                PrimitiveId::way(way),
                PrimitiveId::relation(relation),
            ]
        );
    }

    #[test]
    fn fetch_reports_unknown_ids() {
        let store = OsmStore::new(10);
        let id = store.seed(Primitive::node(0, 1.0, 1.0));
        assert_eq!(store.fetch(PrimitiveType::Node, &[id]).unwrap().len(), 1);
        assert_eq!(
            store.fetch(PrimitiveType::Node, &[id, 404]).unwrap_err().status(),
            404
        );
    }
}
