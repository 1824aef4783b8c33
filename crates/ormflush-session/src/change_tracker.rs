//! Change tracking for the session: which instances are new, dirty or deleted.
//!
//! The tracker keeps three insertion-ordered, set-like working sets. Adding
//! an instance to one set leaves its membership in the others untouched; a
//! successful flush clears the flushed instances from all three with
//! [`ChangeTracker::register_clean`]. Per-attribute history lives on the
//! instance state itself; the tracker only records intent.

use crate::state::{InstanceId, InstanceState};
use std::collections::HashSet;

/// Insertion-ordered set of instance handles.
#[derive(Debug, Clone, Default)]
struct OrderedSet {
    order: Vec<InstanceId>,
    members: HashSet<InstanceId>,
}

impl OrderedSet {
    fn insert(&mut self, id: InstanceId) -> bool {
        if self.members.insert(id) {
            self.order.push(id);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: InstanceId) -> bool {
        if self.members.remove(&id) {
            self.order.retain(|m| *m != id);
            true
        } else {
            false
        }
    }

    fn contains(&self, id: InstanceId) -> bool {
        self.members.contains(&id)
    }

    fn iter(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.order.iter().copied()
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

/// Count of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Instances pending INSERT.
    pub new: usize,
    /// Instances pending UPDATE.
    pub dirty: usize,
    /// Instances pending DELETE.
    pub deleted: usize,
}

impl PendingCounts {
    /// Total number of pending operations.
    #[must_use]
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    /// Check if there are no pending operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new == 0 && self.dirty == 0 && self.deleted == 0
    }
}

/// Tracks new, dirty and deleted instances of a session.
#[derive(Debug, Clone, Default)]
pub struct ChangeTracker {
    new: OrderedSet,
    dirty: OrderedSet,
    deleted: OrderedSet,
}

impl ChangeTracker {
    /// Create a new empty change tracker.
    pub fn new() -> Self {
        Self::default()
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub fn register_new(&mut self, id: InstanceId) {
        self.new.insert(id);
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub fn register_dirty(&mut self, id: InstanceId) {
        self.dirty.insert(id);
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub fn register_deleted(&mut self, id: InstanceId) {
        self.deleted.insert(id);
    }

    /// Remove an instance from every working set.
    pub fn register_clean(&mut self, id: InstanceId) {
        self.new.remove(id);
        self.dirty.remove(id);
        self.deleted.remove(id);
    }

    /// Undo a deletion request.
    pub fn unregister_deleted(&mut self, id: InstanceId) -> bool {
        self.deleted.remove(id)
    }

    /// Value-changed callback fired when an attribute or relationship of a
    /// tracked instance is mutated.
    ///
    /// Instances with an identity are marked dirty; pending ones are already
    /// covered by the new set.
    pub fn value_changed(&mut self, id: InstanceId, state: &InstanceState) {
        if state.key().is_some() {
            self.register_dirty(id);
        } else {
            self.register_new(id);
        }
    }

    pub fn is_new(&self, id: InstanceId) -> bool {
        self.new.contains(id)
    }

    pub fn is_dirty(&self, id: InstanceId) -> bool {
        self.dirty.contains(id)
    }

    pub fn is_deleted(&self, id: InstanceId) -> bool {
        self.deleted.contains(id)
    }

    /// Whether the instance is in any working set.
    pub fn is_tracked(&self, id: InstanceId) -> bool {
        self.is_new(id) || self.is_dirty(id) || self.is_deleted(id)
    }

    /// New instances in registration order.
    pub fn new_ids(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.new.iter()
    }

    /// Dirty instances in registration order.
    pub fn dirty_ids(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.dirty.iter()
    }

    /// Deleted instances in registration order.
    pub fn deleted_ids(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.deleted.iter()
    }

    pub fn pending_counts(&self) -> PendingCounts {
        PendingCounts {
            new: self.new.len(),
            dirty: self.dirty.len(),
            deleted: self.deleted.len(),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_counts().is_empty()
    }

    pub fn clear(&mut self) {
        self.new.clear();
        self.dirty.clear();
        self.deleted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity_map::IdentityKey;
    use crate::state::StateArena;
    use ormflush_core::{Column, Mapper, MapperRegistry, Value};

    fn arena_with(n: usize) -> (StateArena, Vec<InstanceId>) {
        let registry = MapperRegistry::new()
            .with(
                Mapper::builder("Hero")
                    .table("hero")
                    .column(Column::new("id").autoincrement()),
            )
            .unwrap();
        let mapper = registry.get("Hero").unwrap().clone();
        let mut arena = StateArena::new();
        let ids = (0..n)
            .map(|_| arena.insert(InstanceState::new(mapper.clone())))
            .collect();
        (arena, ids)
    }

    #[test]
    fn test_sets_are_idempotent_and_ordered() {
        let (_, ids) = arena_with(3);
        let mut tracker = ChangeTracker::new();
        tracker.register_new(ids[2]);
        tracker.register_new(ids[0]);
        tracker.register_new(ids[2]);

        assert_eq!(tracker.new_ids().collect::<Vec<_>>(), vec![ids[2], ids[0]]);
        assert_eq!(tracker.pending_counts().new, 2);
    }

    #[test]
    fn test_membership_independent_until_clean() {
        let (_, ids) = arena_with(1);
        let id = ids[0];
        let mut tracker = ChangeTracker::new();
        tracker.register_dirty(id);
        tracker.register_deleted(id);

        assert!(tracker.is_dirty(id));
        assert!(tracker.is_deleted(id));
        assert_eq!(tracker.pending_counts().total(), 2);

        tracker.register_clean(id);
        assert!(!tracker.is_tracked(id));
        assert!(!tracker.has_pending());
    }

    #[test]
    fn test_value_changed_routes_by_identity() {
        let (mut arena, ids) = arena_with(2);
        let mut tracker = ChangeTracker::new();

        arena.get_mut(ids[1]).unwrap().key =
            Some(IdentityKey::new("Hero", vec![Value::BigInt(1)]));

        tracker.value_changed(ids[0], arena.get(ids[0]).unwrap());
        tracker.value_changed(ids[1], arena.get(ids[1]).unwrap());

        assert!(tracker.is_new(ids[0]));
        assert!(tracker.is_dirty(ids[1]));
        assert!(!tracker.is_dirty(ids[0]));
    }
}
