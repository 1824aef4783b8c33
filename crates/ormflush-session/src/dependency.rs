//! Dependency processors: one per relationship taking part in a flush.
//!
//! A processor knows three things about its relationship:
//!
//! - which task nodes it orders ([`DependencyProcessor::edges`]);
//! - which further instances a flush must include ([`DependencyProcessor::preprocess`]),
//!   such as cascaded deletes, orphans and children whose foreign key is nulled;
//! - how to copy key values between the two sides once the referenced rows
//!   exist ([`DependencyProcessor::process`]).
//!
//! Processing mutates instance state directly (foreign-key attributes) and
//! reports the extra statements it needs as [`SyncEffect`]s: post-update
//! UPDATEs and association-table rows.

use crate::state::{InstanceId, StateArena};
use ormflush_core::{
    Error, FlushError, FlushErrorKind, MapperRegistry, PassiveDeletes, RelationshipKind,
    RelationshipMeta, Result, Value,
};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// Handle to a processor registered in a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProcessorId(pub(crate) usize);

/// A node of the mapper-level dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum TaskNode {
    /// Instances of one mapper hierarchy, keyed by base mapper name.
    Mapper(String),
    /// Deferred foreign-key UPDATEs of one relationship.
    PostUpdate { mapper: String, relationship: String },
    /// Rows of a many-to-many association table.
    Association(String),
}

impl TaskNode {
    pub fn mapper_name(&self) -> Option<&str> {
        match self {
            TaskNode::Mapper(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskNode::Mapper(name) => write!(f, "{name}"),
            TaskNode::PostUpdate {
                mapper,
                relationship,
            } => write!(f, "{mapper}.{relationship} (post-update)"),
            TaskNode::Association(table) => write!(f, "association '{table}'"),
        }
    }
}

/// Extra statement requested while synchronizing keys.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEffect {
    /// UPDATE only these attributes of an already saved row.
    PostUpdate {
        instance: InstanceId,
        attrs: Vec<String>,
    },
    /// Insert one association row.
    LinkInsert {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    /// Delete one association row.
    LinkDelete {
        table: String,
        filter: Vec<(String, Value)>,
    },
}

/// What preprocessing asks the task graph builder to register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub instance: InstanceId,
    pub isdelete: bool,
}

/// Key synchronization logic for one relationship.
#[derive(Debug, Clone)]
pub struct DependencyProcessor {
    pub(crate) id: ProcessorId,
    /// Mapper declaring the relationship.
    owner: String,
    owner_base: String,
    target_base: String,
    relationship: RelationshipMeta,
    post_update: bool,
}

impl DependencyProcessor {
    pub(crate) fn new(
        id: ProcessorId,
        registry: &MapperRegistry,
        owner: &str,
        relationship: &RelationshipMeta,
    ) -> Result<Self> {
        let owner_mapper = registry.get(owner)?;
        let target_mapper = registry.get(&relationship.target)?;
        Ok(Self {
            id,
            owner: owner.to_string(),
            owner_base: owner_mapper.base_name().to_string(),
            target_base: target_mapper.base_name().to_string(),
            relationship: relationship.clone(),
            post_update: relationship.post_update,
        })
    }

    pub fn id(&self) -> ProcessorId {
        self.id
    }

    pub fn relationship(&self) -> &RelationshipMeta {
        &self.relationship
    }

    pub fn kind(&self) -> RelationshipKind {
        self.relationship.kind
    }

    pub fn is_post_update(&self) -> bool {
        self.post_update
    }

    /// Mapper declaring the relationship.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// `Owner.relationship`
    pub fn label(&self) -> String {
        format!("{}.{}", self.owner, self.relationship.name)
    }

    /// Both sides belong to the same mapper hierarchy.
    pub fn is_self_referential(&self) -> bool {
        !self.post_update
            && self.relationship.kind != RelationshipKind::ManyToMany
            && self.owner_base == self.target_base
    }

    /// Node whose instances this processor iterates over.
    pub fn target_node(&self) -> TaskNode {
        TaskNode::Mapper(self.owner_base.clone())
    }

    /// Node the processor runs from.
    pub fn attached_node(&self) -> TaskNode {
        if self.post_update {
            return self.post_update_node();
        }
        match self.relationship.kind {
            RelationshipKind::OneToMany => TaskNode::Mapper(self.owner_base.clone()),
            RelationshipKind::ManyToOne => TaskNode::Mapper(self.target_base.clone()),
            RelationshipKind::ManyToMany => self.association_node(),
        }
    }

    fn post_update_node(&self) -> TaskNode {
        TaskNode::PostUpdate {
            mapper: self.owner_base.clone(),
            relationship: self.relationship.name.clone(),
        }
    }

    fn association_node(&self) -> TaskNode {
        let table = self
            .relationship
            .secondary
            .as_ref()
            .map(|l| l.table_name.clone())
            .unwrap_or_else(|| self.label());
        TaskNode::Association(table)
    }

    /// Ordering edges `(before, after)` this relationship contributes.
    pub fn edges(&self) -> Vec<(TaskNode, TaskNode)> {
        let owner = TaskNode::Mapper(self.owner_base.clone());
        let target = TaskNode::Mapper(self.target_base.clone());
        if self.post_update {
            let stub = self.post_update_node();
            return vec![(owner, stub.clone()), (target, stub)];
        }
        match self.relationship.kind {
            RelationshipKind::OneToMany => vec![(owner, target)],
            RelationshipKind::ManyToOne => vec![(target, owner)],
            RelationshipKind::ManyToMany => {
                let stub = self.association_node();
                vec![(owner, stub.clone()), (target, stub)]
            }
        }
    }

    /// Whether the relationship can be wired by a follow-up UPDATE instead.
    ///
    /// Requires every foreign-key attribute on the dependent side to be nullable.
    pub(crate) fn can_post_update(&self, registry: &MapperRegistry) -> bool {
        let child = match self.relationship.kind {
            RelationshipKind::OneToMany => &self.relationship.target,
            RelationshipKind::ManyToOne => &self.owner,
            RelationshipKind::ManyToMany => return false,
        };
        let Ok(child) = registry.get(child) else {
            return false;
        };
        self.relationship
            .referencing_attrs()
            .all(|attr| child.is_nullable(attr))
    }

    pub(crate) fn set_post_update(&mut self) {
        self.post_update = true;
    }

    /// Whether an instance carries this relationship.
    pub(crate) fn applies_to(&self, states: &StateArena, id: InstanceId) -> bool {
        states.get(id).is_ok_and(|s| {
            s.mapper()
                .relationship(&self.relationship.name)
                .is_some_and(|r| r.kind == self.relationship.kind && r.target == self.relationship.target)
        })
    }

    /// Whether the instance holds any history for this relationship.
    pub(crate) fn has_history(&self, states: &StateArena, id: InstanceId) -> bool {
        let name = &self.relationship.name;
        states
            .get(id)
            .is_ok_and(|s| s.reference(name).is_some() || s.collection(name).is_some())
    }

    /// Instances related to `id` that matter for ordering in the given phase.
    ///
    /// Saving considers every member involved: added, unchanged and removed.
    /// A removed child still needs its foreign key rewritten after this
    /// instance's processors ran. Deleting considers remaining and removed
    /// members only.
    pub fn object_dependencies(
        &self,
        states: &StateArena,
        id: InstanceId,
        isdelete: bool,
    ) -> Vec<InstanceId> {
        let Ok(state) = states.get(id) else {
            return Vec::new();
        };
        let name = &self.relationship.name;
        if let Some(reference) = state.reference(name) {
            return if isdelete {
                reference.unchanged().into_iter().chain(reference.deleted()).collect()
            } else {
                reference.all()
            };
        }
        match state.collection(name) {
            Some(coll) if isdelete => {
                let mut out = coll.unchanged();
                out.extend(coll.deleted().iter().copied());
                out
            }
            Some(coll) => coll.all(),
            None => Vec::new(),
        }
    }

    /// Direction of the dependency between `obj` and a related `other`:
    /// `(first, second)` means `first` must be saved before `second`.
    pub fn whose_dependent_on_who(
        &self,
        obj: InstanceId,
        other: InstanceId,
    ) -> Option<(InstanceId, InstanceId)> {
        if self.post_update {
            return None;
        }
        match self.relationship.kind {
            RelationshipKind::OneToMany => Some((obj, other)),
            RelationshipKind::ManyToOne => Some((other, obj)),
            RelationshipKind::ManyToMany => None,
        }
    }

    /// Instances the flush must additionally include for `instances` in one phase.
    ///
    /// `is_deleting` reports whether an instance is already scheduled for deletion.
    pub(crate) fn preprocess(
        &self,
        states: &StateArena,
        instances: &[InstanceId],
        delete: bool,
        is_deleting: &dyn Fn(InstanceId) -> bool,
    ) -> Vec<Registration> {
        let rel = &self.relationship;
        let mut out = Vec::new();
        for &id in instances {
            if !self.applies_to(states, id) {
                continue;
            }
            let Ok(state) = states.get(id) else {
                continue;
            };
            match (rel.kind, delete) {
                (RelationshipKind::OneToMany, true) => {
                    let Some(coll) = state.collection(&rel.name) else {
                        continue;
                    };
                    let mut children = coll.unchanged();
                    children.extend(coll.deleted().iter().copied());
                    for child in children {
                        if is_deleting(child) {
                            continue;
                        }
                        if rel.cascade_delete {
                            out.push(Registration {
                                instance: child,
                                isdelete: true,
                            });
                        } else if rel.passive_deletes == PassiveDeletes::Active {
                            out.push(Registration {
                                instance: child,
                                isdelete: false,
                            });
                        }
                    }
                }
                (RelationshipKind::OneToMany, false) => {
                    let Some(coll) = state.collection(&rel.name) else {
                        continue;
                    };
                    for &child in coll.added() {
                        out.push(Registration {
                            instance: child,
                            isdelete: false,
                        });
                    }
                    for &child in coll.deleted() {
                        if is_deleting(child) {
                            continue;
                        }
                        let persistent = states.get(child).is_ok_and(|c| c.key().is_some());
                        out.push(Registration {
                            instance: child,
                            isdelete: rel.delete_orphan && persistent,
                        });
                    }
                }
                (RelationshipKind::ManyToOne, true) if rel.cascade_delete => {
                    if let Some(reference) = state.reference(&rel.name) {
                        for parent in reference.unchanged().into_iter().chain(reference.deleted()) {
                            if !is_deleting(parent) {
                                out.push(Registration {
                                    instance: parent,
                                    isdelete: true,
                                });
                            }
                        }
                    }
                }
                (RelationshipKind::ManyToOne, false) if rel.delete_orphan => {
                    if let Some(old) = state.reference(&rel.name).and_then(|r| r.deleted()) {
                        let persistent = states.get(old).is_ok_and(|o| o.key().is_some());
                        if persistent && !is_deleting(old) {
                            out.push(Registration {
                                instance: old,
                                isdelete: true,
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Synchronize keys for `instances` after the rows they depend on were saved.
    ///
    /// Returns the post-update and association statements to run next.
    pub(crate) fn process(
        &self,
        states: &mut StateArena,
        instances: &[InstanceId],
        delete: bool,
        deleting: &HashSet<InstanceId>,
    ) -> Result<Vec<SyncEffect>> {
        let rel = &self.relationship;
        let mut effects = Vec::new();
        for &id in instances {
            if !self.applies_to(states, id) {
                continue;
            }
            match rel.kind {
                RelationshipKind::OneToMany => {
                    self.process_one_to_many(states, id, delete, deleting, &mut effects)?;
                }
                RelationshipKind::ManyToOne => {
                    self.process_many_to_one(states, id, delete, &mut effects)?;
                }
                RelationshipKind::ManyToMany => {
                    self.process_many_to_many(states, id, delete, &mut effects)?;
                }
            }
        }
        Ok(effects)
    }

    fn process_one_to_many(
        &self,
        states: &mut StateArena,
        parent: InstanceId,
        delete: bool,
        deleting: &HashSet<InstanceId>,
        effects: &mut Vec<SyncEffect>,
    ) -> Result<()> {
        let rel = &self.relationship;
        let Some(coll) = states.get(parent)?.collection(&rel.name).cloned() else {
            return Ok(());
        };
        if delete {
            if rel.cascade_delete || rel.passive_deletes == PassiveDeletes::Passive {
                return Ok(());
            }
            let mut children = coll.unchanged();
            children.extend(coll.deleted().iter().copied());
            for child in children {
                if !deleting.contains(&child) {
                    self.clear_if_owned(states, parent, child, effects)?;
                }
            }
            return Ok(());
        }

        for &child in coll.added() {
            self.populate(states, parent, child)?;
            self.record_post_update(child, effects);
        }
        if !rel.delete_orphan {
            for &child in coll.deleted() {
                if !deleting.contains(&child) {
                    self.clear_if_owned(states, parent, child, effects)?;
                }
            }
        }
        Ok(())
    }

    fn process_many_to_one(
        &self,
        states: &mut StateArena,
        child: InstanceId,
        delete: bool,
        effects: &mut Vec<SyncEffect>,
    ) -> Result<()> {
        let rel = &self.relationship;
        let Some(reference) = states.get(child)?.reference(&rel.name).copied() else {
            return Ok(());
        };
        if delete {
            if self.post_update {
                self.clear(states, child)?;
                self.record_post_update(child, effects);
            }
            return Ok(());
        }
        match reference.current() {
            Some(parent) => self.populate(states, parent, child)?,
            None if reference.has_changes() => self.clear(states, child)?,
            None => return Ok(()),
        }
        self.record_post_update(child, effects);
        Ok(())
    }

    fn process_many_to_many(
        &self,
        states: &mut StateArena,
        owner: InstanceId,
        delete: bool,
        effects: &mut Vec<SyncEffect>,
    ) -> Result<()> {
        let rel = &self.relationship;
        let Some(link) = rel.secondary.as_ref() else {
            return Ok(());
        };
        let Some(coll) = states.get(owner)?.collection(&rel.name).cloned() else {
            return Ok(());
        };

        let (added, removed): (Vec<InstanceId>, Vec<InstanceId>) = if delete {
            if rel.passive_deletes == PassiveDeletes::Passive {
                return Ok(());
            }
            let mut gone = coll.unchanged();
            gone.extend(coll.deleted().iter().copied());
            (Vec::new(), gone)
        } else {
            (coll.added().to_vec(), coll.deleted().to_vec())
        };

        let owner_key = self.link_key(states, owner, &link.table_name)?;
        let mut columns = link.local_columns.clone();
        columns.extend(link.remote_columns.iter().cloned());

        for target in added {
            let mut values = owner_key.clone();
            values.extend(self.link_key(states, target, &link.table_name)?);
            effects.push(SyncEffect::LinkInsert {
                table: link.table_name.clone(),
                columns: columns.clone(),
                values,
            });
        }
        for target in removed {
            let mut values = owner_key.clone();
            values.extend(self.link_key(states, target, &link.table_name)?);
            effects.push(SyncEffect::LinkDelete {
                table: link.table_name.clone(),
                filter: columns.iter().cloned().zip(values).collect(),
            });
        }
        Ok(())
    }

    fn link_key(&self, states: &StateArena, id: InstanceId, table: &str) -> Result<Vec<Value>> {
        states.get(id)?.primary_key_values().ok_or_else(|| {
            Error::Flush(
                FlushError::new(
                    FlushErrorKind::NullPrimaryKey,
                    format!(
                        "Association row for {} on table '{}' references instance {} whose primary key is NULL",
                        self.label(),
                        table,
                        id
                    ),
                )
                .with_table(table),
            )
        })
    }

    /// Copy the referenced key values of `parent` into the foreign key of `child`.
    fn populate(&self, states: &mut StateArena, parent: InstanceId, child: InstanceId) -> Result<()> {
        let values: Vec<Value> = {
            let parent_state = states.get(parent)?;
            self.relationship
                .referenced_attrs()
                .map(|attr| parent_state.value(attr))
                .collect()
        };
        let child_state = states.get_mut(child)?;
        for (attr, value) in self.relationship.referencing_attrs().zip(values) {
            child_state.set(attr, value)?;
        }
        tracing::trace!(
            relationship = %self.label(),
            parent = %parent,
            child = %child,
            "Synchronized foreign key"
        );
        Ok(())
    }

    /// Null the foreign key of `child`.
    fn clear(&self, states: &mut StateArena, child: InstanceId) -> Result<()> {
        let child_state = states.get_mut(child)?;
        for attr in self.relationship.referencing_attrs() {
            if child_state.mapper().is_pk_attr(attr) {
                return Err(Error::Flush(
                    FlushError::new(
                        FlushErrorKind::InvalidState,
                        format!(
                            "Dependency rule tried to blank-out primary key attribute '{}' on instance {}",
                            attr, child
                        ),
                    )
                    .with_mapper(child_state.mapper().name()),
                ));
            }
            child_state.set(attr, Value::Null)?;
        }
        Ok(())
    }

    /// Null the child's foreign key unless it already points at another parent.
    fn clear_if_owned(
        &self,
        states: &mut StateArena,
        parent: InstanceId,
        child: InstanceId,
        effects: &mut Vec<SyncEffect>,
    ) -> Result<()> {
        let owned = {
            let parent_state = states.get(parent)?;
            let child_state = states.get(child)?;
            self.relationship.pairs.iter().all(|pair| {
                let fk = child_state.value(&pair.referencing);
                let committed = parent_state
                    .history(&pair.referenced)
                    .and_then(|h| h.committed())
                    .cloned()
                    .unwrap_or(Value::Null);
                fk.is_null() || fk.same_as(&parent_state.value(&pair.referenced)) || fk.same_as(&committed)
            })
        };
        if owned {
            self.clear(states, child)?;
            self.record_post_update(child, effects);
        }
        Ok(())
    }

    fn record_post_update(&self, instance: InstanceId, effects: &mut Vec<SyncEffect>) {
        if self.post_update {
            effects.push(SyncEffect::PostUpdate {
                instance,
                attrs: self
                    .relationship
                    .referencing_attrs()
                    .map(str::to_string)
                    .collect(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InstanceState;
    use ormflush_core::{Column, LinkTableInfo, Mapper};

    fn registry() -> MapperRegistry {
        MapperRegistry::new()
            .with(
                Mapper::builder("Parent")
                    .table("parent")
                    .column(Column::new("id").autoincrement())
                    .relationship(
                        RelationshipMeta::one_to_many("children", "Child").pair("id", "parent_id"),
                    )
                    .relationship(RelationshipMeta::many_to_many(
                        "tags",
                        "Tag",
                        LinkTableInfo::new("parent_tag", "parent_id", "tag_id"),
                    )),
            )
            .unwrap()
            .with(
                Mapper::builder("Child")
                    .table("child")
                    .column(Column::new("id").autoincrement())
                    .column(Column::new("parent_id").nullable())
                    .relationship(
                        RelationshipMeta::many_to_one("parent", "Parent").pair("id", "parent_id"),
                    ),
            )
            .unwrap()
            .with(
                Mapper::builder("Tag")
                    .table("tag")
                    .column(Column::new("id").autoincrement()),
            )
            .unwrap()
    }

    fn processor(registry: &MapperRegistry, owner: &str, rel: &str) -> DependencyProcessor {
        let mapper = registry.get(owner).unwrap();
        DependencyProcessor::new(
            ProcessorId(0),
            registry,
            owner,
            mapper.relationship(rel).unwrap(),
        )
        .unwrap()
    }

    fn instance(arena: &mut StateArena, registry: &MapperRegistry, mapper: &str) -> InstanceId {
        arena.insert(InstanceState::new(registry.get(mapper).unwrap().clone()))
    }

    #[test]
    fn test_edges_by_kind() {
        let registry = registry();
        let o2m = processor(&registry, "Parent", "children");
        assert_eq!(
            o2m.edges(),
            vec![(
                TaskNode::Mapper("Parent".into()),
                TaskNode::Mapper("Child".into())
            )]
        );
        assert_eq!(o2m.attached_node(), TaskNode::Mapper("Parent".into()));

        let m2o = processor(&registry, "Child", "parent");
        assert_eq!(
            m2o.edges(),
            vec![(
                TaskNode::Mapper("Parent".into()),
                TaskNode::Mapper("Child".into())
            )]
        );
        assert_eq!(m2o.attached_node(), TaskNode::Mapper("Parent".into()));
        assert_eq!(m2o.target_node(), TaskNode::Mapper("Child".into()));
        assert!(m2o.can_post_update(&registry));

        let m2m = processor(&registry, "Parent", "tags");
        assert_eq!(
            m2m.attached_node(),
            TaskNode::Association("parent_tag".into())
        );
        assert_eq!(m2m.edges().len(), 2);
    }

    #[test]
    fn test_one_to_many_populates_added_children() {
        let registry = registry();
        let p = processor(&registry, "Parent", "children");
        let mut arena = StateArena::new();
        let parent = instance(&mut arena, &registry, "Parent");
        let child = instance(&mut arena, &registry, "Child");
        arena.get_mut(parent).unwrap().set("id", Value::BigInt(42)).unwrap();
        arena.get_mut(parent).unwrap().collection_mut("children").append(child);

        let effects = p.process(&mut arena, &[parent], false, &HashSet::new()).unwrap();
        assert!(effects.is_empty());
        assert_eq!(arena.get(child).unwrap().value("parent_id"), Value::BigInt(42));
    }

    #[test]
    fn test_delete_without_cascade_nulls_children() {
        let registry = registry();
        let p = processor(&registry, "Parent", "children");
        let mut arena = StateArena::new();
        let parent = instance(&mut arena, &registry, "Parent");
        let child = instance(&mut arena, &registry, "Child");
        arena.get_mut(parent).unwrap().set_committed("id", Value::BigInt(1));
        arena.get_mut(child).unwrap().set_committed("parent_id", Value::BigInt(1));
        *arena.get_mut(parent).unwrap().collection_mut("children") =
            crate::state::CollectionHistory::loaded(vec![child]);

        let regs = p.preprocess(&arena, &[parent], true, &|_| false);
        assert_eq!(
            regs,
            vec![Registration {
                instance: child,
                isdelete: false
            }]
        );

        p.process(&mut arena, &[parent], true, &HashSet::new()).unwrap();
        assert_eq!(arena.get(child).unwrap().value("parent_id"), Value::Null);
    }

    #[test]
    fn test_whose_dependent_on_who() {
        let registry = registry();
        let (a, b) = (InstanceId(0), InstanceId(1));
        assert_eq!(
            processor(&registry, "Parent", "children").whose_dependent_on_who(a, b),
            Some((a, b))
        );
        assert_eq!(
            processor(&registry, "Child", "parent").whose_dependent_on_who(a, b),
            Some((b, a))
        );
        assert_eq!(
            processor(&registry, "Parent", "tags").whose_dependent_on_who(a, b),
            None
        );
    }

    #[test]
    fn test_many_to_many_link_rows() {
        let registry = registry();
        let p = processor(&registry, "Parent", "tags");
        let mut arena = StateArena::new();
        let parent = instance(&mut arena, &registry, "Parent");
        let tag = instance(&mut arena, &registry, "Tag");
        arena.get_mut(parent).unwrap().set("id", Value::BigInt(1)).unwrap();
        arena.get_mut(tag).unwrap().set("id", Value::BigInt(9)).unwrap();
        arena.get_mut(parent).unwrap().collection_mut("tags").append(tag);

        let effects = p.process(&mut arena, &[parent], false, &HashSet::new()).unwrap();
        assert_eq!(
            effects,
            vec![SyncEffect::LinkInsert {
                table: "parent_tag".into(),
                columns: vec!["parent_id".into(), "tag_id".into()],
                values: vec![Value::BigInt(1), Value::BigInt(9)],
            }]
        );
    }
}
