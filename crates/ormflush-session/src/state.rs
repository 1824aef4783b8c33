//! Per-instance state: committed vs. pending attribute values and relationship history.
//!
//! Instances live in a [`StateArena`] owned by the session and are addressed
//! by copyable [`InstanceId`] handles. Each [`InstanceState`] shadows its
//! instance's attributes with an [`AttributeHistory`] (committed and pending
//! value), its to-one relationships with a [`ReferenceHistory`] and its
//! to-many relationships with a [`CollectionHistory`]. Flushes read these
//! histories to compute INSERT parameters, UPDATE SET clauses and the
//! foreign-key synchronization between related rows.

use crate::identity_map::IdentityKey;
use ormflush_core::{Error, Mapper, Result, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Handle to an instance in the session's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstanceId(pub(crate) usize);

impl InstanceId {
    /// Position of the instance in the arena.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle status of an instance relative to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstanceStatus {
    /// Created but never added to the session.
    Transient,
    /// Added to the session; INSERTed on the next flush.
    Pending,
    /// Has an identity key and a row in the database.
    Persistent,
    /// Its DELETE has been flushed.
    Deleted,
    /// Removed from the session; changes are no longer tracked.
    Detached,
}

/// Committed and pending value of one column attribute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeHistory {
    committed: Option<Value>,
    pending: Option<Value>,
}

impl AttributeHistory {
    /// History for a value loaded from the database.
    pub fn loaded(value: Value) -> Self {
        Self {
            committed: Some(value),
            pending: None,
        }
    }

    /// The value the instance currently holds.
    pub fn current(&self) -> Option<&Value> {
        self.pending.as_ref().or(self.committed.as_ref())
    }

    pub fn committed(&self) -> Option<&Value> {
        self.committed.as_ref()
    }

    /// Assign a new value. Assigning the committed value back clears the change.
    pub fn set(&mut self, value: Value) {
        match &self.committed {
            Some(committed) if committed.same_as(&value) => self.pending = None,
            _ => self.pending = Some(value),
        }
    }

    pub fn has_changes(&self) -> bool {
        self.pending.is_some()
    }

    /// The newly assigned value, if changed.
    pub fn added(&self) -> Option<&Value> {
        self.pending.as_ref()
    }

    /// The committed value being replaced, if changed.
    pub fn deleted(&self) -> Option<&Value> {
        if self.pending.is_some() {
            self.committed.as_ref()
        } else {
            None
        }
    }

    /// Make the pending value the committed one.
    pub fn commit(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.committed = Some(pending);
        }
    }
}

/// Committed and current target of a to-one relationship.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceHistory {
    committed: Option<InstanceId>,
    current: Option<InstanceId>,
}

impl ReferenceHistory {
    pub fn loaded(target: Option<InstanceId>) -> Self {
        Self {
            committed: target,
            current: target,
        }
    }

    pub fn current(&self) -> Option<InstanceId> {
        self.current
    }

    pub fn set(&mut self, target: Option<InstanceId>) {
        self.current = target;
    }

    pub fn has_changes(&self) -> bool {
        self.committed != self.current
    }

    /// Newly referenced target.
    pub fn added(&self) -> Option<InstanceId> {
        if self.has_changes() { self.current } else { None }
    }

    /// Target that is still referenced.
    pub fn unchanged(&self) -> Option<InstanceId> {
        if self.has_changes() { None } else { self.committed }
    }

    /// Previously referenced target that was replaced or cleared.
    pub fn deleted(&self) -> Option<InstanceId> {
        if self.has_changes() { self.committed } else { None }
    }

    /// Every target involved: current and replaced.
    pub fn all(&self) -> Vec<InstanceId> {
        let mut out: Vec<InstanceId> = self.current.into_iter().collect();
        if let Some(old) = self.deleted() {
            out.push(old);
        }
        out
    }

    pub fn commit(&mut self) {
        self.committed = self.current;
    }
}

/// Committed membership of a to-many relationship plus pending additions and removals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionHistory {
    committed: Vec<InstanceId>,
    added: Vec<InstanceId>,
    removed: Vec<InstanceId>,
}

impl CollectionHistory {
    pub fn loaded(members: Vec<InstanceId>) -> Self {
        Self {
            committed: members,
            added: Vec::new(),
            removed: Vec::new(),
        }
    }

    /// Add a member. Re-adding a removed committed member cancels the removal.
    pub fn append(&mut self, member: InstanceId) {
        if let Some(pos) = self.removed.iter().position(|m| *m == member) {
            self.removed.remove(pos);
        } else if !self.committed.contains(&member) && !self.added.contains(&member) {
            self.added.push(member);
        }
    }

    /// Remove a member. Removing a pending addition forgets it.
    pub fn remove(&mut self, member: InstanceId) {
        if let Some(pos) = self.added.iter().position(|m| *m == member) {
            self.added.remove(pos);
        } else if self.committed.contains(&member) && !self.removed.contains(&member) {
            self.removed.push(member);
        }
    }

    pub fn contains(&self, member: InstanceId) -> bool {
        self.added.contains(&member)
            || (self.committed.contains(&member) && !self.removed.contains(&member))
    }

    pub fn added(&self) -> &[InstanceId] {
        &self.added
    }

    pub fn deleted(&self) -> &[InstanceId] {
        &self.removed
    }

    /// Committed members that are still present.
    pub fn unchanged(&self) -> Vec<InstanceId> {
        self.committed
            .iter()
            .copied()
            .filter(|m| !self.removed.contains(m))
            .collect()
    }

    /// Current membership in order: unchanged committed members, then additions.
    pub fn current(&self) -> Vec<InstanceId> {
        let mut out = self.unchanged();
        out.extend(self.added.iter().copied());
        out
    }

    /// Every member involved: current and removed.
    pub fn all(&self) -> Vec<InstanceId> {
        let mut out = self.current();
        out.extend(self.removed.iter().copied());
        out
    }

    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    pub fn commit(&mut self) {
        self.committed = self.current();
        self.added.clear();
        self.removed.clear();
    }

    /// Forget a member entirely, e.g. after its row was deleted.
    pub fn forget(&mut self, member: InstanceId) {
        self.committed.retain(|m| *m != member);
        self.added.retain(|m| *m != member);
        self.removed.retain(|m| *m != member);
    }
}

/// Shadow record of one mapped instance.
#[derive(Debug, Clone)]
pub struct InstanceState {
    mapper: Arc<Mapper>,
    pub(crate) key: Option<IdentityKey>,
    attributes: BTreeMap<String, AttributeHistory>,
    references: BTreeMap<String, ReferenceHistory>,
    collections: BTreeMap<String, CollectionHistory>,
    pub(crate) status: InstanceStatus,
    pub(crate) insert_order: u64,
    pub(crate) expired: bool,
}

impl InstanceState {
    pub(crate) fn new(mapper: Arc<Mapper>) -> Self {
        Self {
            mapper,
            key: None,
            attributes: BTreeMap::new(),
            references: BTreeMap::new(),
            collections: BTreeMap::new(),
            status: InstanceStatus::Transient,
            insert_order: 0,
            expired: false,
        }
    }

    pub fn mapper(&self) -> &Arc<Mapper> {
        &self.mapper
    }

    /// Identity key, assigned once the row exists.
    pub fn key(&self) -> Option<&IdentityKey> {
        self.key.as_ref()
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    /// Whether committed values are stale after a commit.
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Current value of a column attribute.
    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.attributes.get(attr).and_then(AttributeHistory::current)
    }

    /// Current value, with an absent value read as NULL.
    pub fn value(&self, attr: &str) -> Value {
        self.get(attr).cloned().unwrap_or(Value::Null)
    }

    pub fn history(&self, attr: &str) -> Option<&AttributeHistory> {
        self.attributes.get(attr)
    }

    /// Assign a column attribute.
    pub fn set(&mut self, attr: &str, value: Value) -> Result<()> {
        if !self.mapper.has_attr(attr) {
            return Err(Error::invalid_state(format!(
                "mapper '{}' has no attribute '{}'",
                self.mapper.name(),
                attr
            )));
        }
        self.attributes
            .entry(attr.to_string())
            .or_default()
            .set(value);
        Ok(())
    }

    /// Record a value as committed, replacing any history.
    pub(crate) fn set_committed(&mut self, attr: &str, value: Value) {
        self.attributes
            .insert(attr.to_string(), AttributeHistory::loaded(value));
    }

    /// Primary key values in mapper order, if all are present and non-null.
    pub fn primary_key_values(&self) -> Option<Vec<Value>> {
        self.mapper
            .primary_key()
            .iter()
            .map(|attr| self.get(attr).filter(|v| !v.is_null()).cloned())
            .collect()
    }

    /// Committed primary key values, used to locate the existing row.
    pub fn committed_key_values(&self) -> Vec<Value> {
        self.mapper
            .primary_key()
            .iter()
            .map(|attr| {
                self.attributes
                    .get(attr)
                    .and_then(|h| h.committed().or(h.current()))
                    .cloned()
                    .unwrap_or(Value::Null)
            })
            .collect()
    }

    pub fn reference(&self, rel: &str) -> Option<&ReferenceHistory> {
        self.references.get(rel)
    }

    pub fn reference_mut(&mut self, rel: &str) -> &mut ReferenceHistory {
        self.references.entry(rel.to_string()).or_default()
    }

    pub fn collection(&self, rel: &str) -> Option<&CollectionHistory> {
        self.collections.get(rel)
    }

    pub fn collection_mut(&mut self, rel: &str) -> &mut CollectionHistory {
        self.collections.entry(rel.to_string()).or_default()
    }

    /// Every instance related through `rel`, current and replaced or removed.
    pub fn related(&self, rel: &str) -> Vec<InstanceId> {
        if let Some(r) = self.references.get(rel) {
            return r.all();
        }
        self.collections
            .get(rel)
            .map(CollectionHistory::all)
            .unwrap_or_default()
    }

    /// Whether any column, reference or collection differs from its committed state.
    pub fn has_changes(&self) -> bool {
        self.attributes.values().any(AttributeHistory::has_changes)
            || self.references.values().any(ReferenceHistory::has_changes)
            || self.collections.values().any(CollectionHistory::has_changes)
    }

    /// Whether collection membership is the only pending change.
    ///
    /// Such an instance needs no row written; it takes part in a flush only
    /// so its collections' processors run.
    pub fn only_collections_changed(&self) -> bool {
        self.collections.values().any(CollectionHistory::has_changes)
            && !self.attributes.values().any(AttributeHistory::has_changes)
            && !self.references.values().any(ReferenceHistory::has_changes)
    }

    /// Members added to or removed from any collection since the last commit.
    pub fn collection_changes(&self) -> Vec<InstanceId> {
        self.collections
            .values()
            .flat_map(|c| c.added().iter().chain(c.deleted()).copied())
            .collect()
    }

    /// Names of column attributes with pending changes.
    pub fn changed_attributes(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|(_, h)| h.has_changes())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Commit every history after a successful flush.
    pub(crate) fn commit_all(&mut self) {
        for history in self.attributes.values_mut() {
            history.commit();
        }
        for history in self.references.values_mut() {
            history.commit();
        }
        for history in self.collections.values_mut() {
            history.commit();
        }
    }

    /// Commit only relationship histories, leaving column changes pending.
    pub(crate) fn commit_relationships(&mut self) {
        for history in self.references.values_mut() {
            history.commit();
        }
        for history in self.collections.values_mut() {
            history.commit();
        }
    }

    /// Take over the row of a persistent instance being deleted in the same flush.
    ///
    /// The old committed values become this instance's committed values, so only
    /// attributes that differ are written by the resulting UPDATE.
    pub(crate) fn switch_from(&mut self, old: &InstanceState) {
        let current: Vec<(String, Value)> = self
            .attributes
            .iter()
            .filter_map(|(name, h)| h.current().map(|v| (name.clone(), v.clone())))
            .collect();
        self.attributes = old
            .attributes
            .iter()
            .filter_map(|(name, h)| {
                h.committed()
                    .map(|v| (name.clone(), AttributeHistory::loaded(v.clone())))
            })
            .collect();
        for (name, value) in current {
            self.attributes.entry(name).or_default().set(value);
        }
        self.key = old.key.clone();
    }

    /// Drop a deleted instance from every relationship history.
    pub(crate) fn forget_related(&mut self, member: InstanceId) {
        for history in self.collections.values_mut() {
            history.forget(member);
        }
        for history in self.references.values_mut() {
            if history.current == Some(member) {
                history.current = None;
            }
            if history.committed == Some(member) {
                history.committed = None;
            }
        }
    }

    /// JSON object of the current column values.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .attributes
            .iter()
            .filter_map(|(name, h)| {
                h.current().map(|v| {
                    (
                        name.clone(),
                        serde_json::to_value(v).unwrap_or(serde_json::Value::Null),
                    )
                })
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Arena of instance states addressed by [`InstanceId`].
#[derive(Debug, Clone, Default)]
pub struct StateArena {
    states: Vec<Option<InstanceState>>,
    next_insert_order: u64,
}

impl StateArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new transient state.
    pub fn insert(&mut self, state: InstanceState) -> InstanceId {
        let id = InstanceId(self.states.len());
        self.states.push(Some(state));
        id
    }

    pub fn get(&self, id: InstanceId) -> Result<&InstanceState> {
        self.states
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::invalid_state(format!("unknown instance {}", id)))
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Result<&mut InstanceState> {
        self.states
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::invalid_state(format!("unknown instance {}", id)))
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        matches!(self.states.get(id.0), Some(Some(_)))
    }

    /// Drop a state; its handle becomes invalid.
    pub fn remove(&mut self, id: InstanceId) -> Option<InstanceState> {
        self.states.get_mut(id.0).and_then(Option::take)
    }

    /// Stamp the next insert order onto an instance becoming pending.
    pub(crate) fn stamp_insert_order(&mut self, id: InstanceId) -> Result<()> {
        self.next_insert_order += 1;
        let order = self.next_insert_order;
        self.get_mut(id)?.insert_order = order;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (InstanceId, &InstanceState)> {
        self.states
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (InstanceId(i), s)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (InstanceId, &mut InstanceState)> {
        self.states
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|s| (InstanceId(i), s)))
    }

    pub fn len(&self) -> usize {
        self.states.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormflush_core::{Column, MapperRegistry};

    fn mapper() -> Arc<Mapper> {
        let mut registry = MapperRegistry::new();
        registry
            .register(
                Mapper::builder("Doc")
                    .table("doc")
                    .column(Column::new("id").autoincrement())
                    .column(Column::new("title"))
                    .column(Column::new("body").nullable()),
            )
            .unwrap()
    }

    #[test]
    fn test_attribute_history_set_back_clears_change() {
        let mut h = AttributeHistory::loaded(Value::Int(1));
        assert!(!h.has_changes());

        h.set(Value::Int(2));
        assert!(h.has_changes());
        assert_eq!(h.added(), Some(&Value::Int(2)));
        assert_eq!(h.deleted(), Some(&Value::Int(1)));

        h.set(Value::BigInt(1));
        assert!(!h.has_changes());
        assert_eq!(h.current(), Some(&Value::Int(1)));
    }

    #[test]
    fn test_collection_history_views() {
        let (a, b, c) = (InstanceId(1), InstanceId(2), InstanceId(3));
        let mut h = CollectionHistory::loaded(vec![a, b]);
        h.remove(b);
        h.append(c);

        assert_eq!(h.unchanged(), vec![a]);
        assert_eq!(h.added(), &[c]);
        assert_eq!(h.deleted(), &[b]);
        assert_eq!(h.current(), vec![a, c]);
        assert!(h.contains(c));
        assert!(!h.contains(b));

        // Re-adding a removed member and removing a pending one cancel out.
        h.append(b);
        h.remove(c);
        assert!(!h.has_changes());

        h.append(c);
        h.commit();
        assert_eq!(h.current(), vec![a, b, c]);
        assert!(!h.has_changes());
    }

    #[test]
    fn test_reference_history() {
        let mut h = ReferenceHistory::loaded(Some(InstanceId(4)));
        assert_eq!(h.unchanged(), Some(InstanceId(4)));

        h.set(Some(InstanceId(5)));
        assert_eq!(h.added(), Some(InstanceId(5)));
        assert_eq!(h.deleted(), Some(InstanceId(4)));
        assert_eq!(h.all(), vec![InstanceId(5), InstanceId(4)]);

        h.commit();
        assert!(!h.has_changes());
    }

    #[test]
    fn test_instance_state_changes_and_json() {
        let mut state = InstanceState::new(mapper());
        state.set_committed("id", Value::BigInt(7));
        state.set_committed("title", Value::Text("old".into()));
        assert!(!state.has_changes());
        assert_eq!(state.primary_key_values(), Some(vec![Value::BigInt(7)]));

        state.set("title", Value::Text("new".into())).unwrap();
        assert_eq!(state.changed_attributes(), vec!["title"]);
        assert!(state.set("missing", Value::Null).is_err());

        let json = state.to_json();
        assert_eq!(json["title"], serde_json::json!({ "Text": "new" }));

        state.commit_all();
        assert!(!state.has_changes());
    }

    #[test]
    fn test_switch_from_keeps_only_differences() {
        let mut old = InstanceState::new(mapper());
        old.set_committed("id", Value::BigInt(3));
        old.set_committed("title", Value::Text("same".into()));
        old.set_committed("body", Value::Text("old".into()));
        old.key = Some(IdentityKey::new("Doc", vec![Value::BigInt(3)]));

        let mut new = InstanceState::new(mapper());
        new.set("id", Value::BigInt(3)).unwrap();
        new.set("title", Value::Text("same".into())).unwrap();
        new.set("body", Value::Text("new".into())).unwrap();
        new.switch_from(&old);

        assert_eq!(new.changed_attributes(), vec!["body"]);
        assert_eq!(new.key(), old.key());
    }

    #[test]
    fn test_arena_handles() {
        let mut arena = StateArena::new();
        let a = arena.insert(InstanceState::new(mapper()));
        let b = arena.insert(InstanceState::new(mapper()));
        arena.stamp_insert_order(b).unwrap();
        arena.stamp_insert_order(a).unwrap();
        assert!(arena.get(a).unwrap().insert_order > arena.get(b).unwrap().insert_order);

        arena.remove(a);
        assert!(!arena.contains(a));
        assert!(arena.get(a).is_err());
        assert_eq!(arena.len(), 1);
    }
}
