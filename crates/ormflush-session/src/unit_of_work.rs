//! Unit of Work: turns the session's pending changes into a flush plan.
//!
//! # Overview
//!
//! Building a plan goes through five stages:
//!
//! 1. **Classify** new, dirty and deleted instances into one task per base
//!    mapper, detecting row switches (a pending instance reusing the key of
//!    an instance deleted in the same flush).
//! 2. **Preprocess** every dependency processor until no new instances are
//!    registered: cascaded deletes, orphans and children whose foreign key
//!    must be nulled join the flush.
//! 3. **Break mapper cycles** by switching one relationship with nullable
//!    foreign keys to post-update mode.
//! 4. **Sort** tasks into a tree by their relationship edges. Tasks whose
//!    mapper depends on itself are decomposed per instance.
//! 5. **Flatten** the tree into [`FlushStep`]s.
//!
//! # Example
//!
//! ```ignore
//! let plan = UnitOfWork::plan(&registry, &states, &tracker, &identity_map, None)?;
//! print!("{}", plan.dump());
//! ```

use crate::change_tracker::ChangeTracker;
use crate::dependency::{DependencyProcessor, ProcessorId, TaskNode};
use crate::flush::{FlushPlan, FlushStep, sort_states};
use crate::identity_map::{IdentityKey, IdentityMap};
use crate::state::{InstanceId, InstanceStatus, StateArena};
use crate::topological;
use ormflush_core::{
    Error, FlushError, FlushErrorKind, Mapper, MapperRegistry, RelationshipKind, RelationshipMeta,
    Result,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Handle to a task in the unit of work's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(usize);

impl TaskId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// An instance registered with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskElement {
    pub instance: InstanceId,
    /// Listed only so processors see it; not written itself.
    pub listonly: bool,
    pub isdelete: bool,
    /// Per-instance task holding the instances that depend on this one.
    pub childtask: Option<TaskId>,
}

/// A processor bound to a task: run it over `target`'s instances of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskDependency {
    pub processor: ProcessorId,
    pub target: TaskId,
    pub isdelete: bool,
}

/// A group of instances written together, with the processors to run after them.
#[derive(Debug, Clone)]
pub struct Task {
    node: TaskNode,
    elements: Vec<TaskElement>,
    positions: HashMap<InstanceId, usize>,
    dependencies: Vec<TaskDependency>,
    childtasks: Vec<TaskId>,
    circular: Option<TaskId>,
}

impl Task {
    fn new(node: TaskNode) -> Self {
        Self {
            node,
            elements: Vec::new(),
            positions: HashMap::new(),
            dependencies: Vec::new(),
            childtasks: Vec::new(),
            circular: None,
        }
    }

    pub fn node(&self) -> &TaskNode {
        &self.node
    }

    pub fn elements(&self) -> &[TaskElement] {
        &self.elements
    }

    pub fn element(&self, id: InstanceId) -> Option<&TaskElement> {
        self.positions.get(&id).map(|i| &self.elements[*i])
    }

    pub fn dependencies(&self) -> &[TaskDependency] {
        &self.dependencies
    }

    pub fn childtasks(&self) -> &[TaskId] {
        &self.childtasks
    }

    /// Root of the per-instance decomposition, for self-referential mappers.
    pub fn circular(&self) -> Option<TaskId> {
        self.circular
    }

    /// Register an instance; a repeated registration can only widen it
    /// (listed to written, saved to deleted). Returns whether anything changed.
    fn append(&mut self, instance: InstanceId, listonly: bool, isdelete: bool) -> bool {
        match self.positions.get(&instance) {
            Some(&i) => {
                let element = &mut self.elements[i];
                let before = *element;
                element.listonly &= listonly;
                element.isdelete |= isdelete;
                *element != before
            }
            None => {
                self.push_element(TaskElement {
                    instance,
                    listonly,
                    isdelete,
                    childtask: None,
                });
                true
            }
        }
    }

    fn push_element(&mut self, element: TaskElement) {
        self.positions.insert(element.instance, self.elements.len());
        self.elements.push(element);
    }

    fn save_ids(&self, include_listonly: bool) -> Vec<InstanceId> {
        self.elements
            .iter()
            .filter(|e| !e.isdelete && (include_listonly || !e.listonly))
            .map(|e| e.instance)
            .collect()
    }

    fn delete_ids(&self, include_listonly: bool) -> Vec<InstanceId> {
        self.elements
            .iter()
            .filter(|e| e.isdelete && (include_listonly || !e.listonly))
            .map(|e| e.instance)
            .collect()
    }
}

/// Builds the task graph for one flush.
pub struct UnitOfWork<'a> {
    registry: &'a MapperRegistry,
    states: &'a StateArena,
    tasks: Vec<Task>,
    /// Canonical task of each graph node.
    nodes: HashMap<TaskNode, TaskId>,
    node_order: Vec<TaskNode>,
    processors: Vec<DependencyProcessor>,
    processor_keys: HashMap<(String, String), ProcessorId>,
    row_switches: Vec<(InstanceId, InstanceId)>,
    roots: Vec<TaskId>,
}

impl<'a> UnitOfWork<'a> {
    pub fn new(registry: &'a MapperRegistry, states: &'a StateArena) -> Self {
        Self {
            registry,
            states,
            tasks: Vec::new(),
            nodes: HashMap::new(),
            node_order: Vec::new(),
            processors: Vec::new(),
            processor_keys: HashMap::new(),
            row_switches: Vec::new(),
            roots: Vec::new(),
        }
    }

    /// Build the flush plan for the tracker's pending changes.
    ///
    /// With `objects`, only those instances (plus whatever their
    /// relationships cascade to) are flushed.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn plan(
        registry: &'a MapperRegistry,
        states: &'a StateArena,
        tracker: &ChangeTracker,
        identity_map: &IdentityMap,
        objects: Option<&[InstanceId]>,
    ) -> Result<FlushPlan> {
        let mut uow = Self::new(registry, states);
        uow.classify(tracker, identity_map, objects)?;
        uow.preprocess()?;
        uow.break_cycles()?;
        uow.attach_processors();
        uow.sort()?;
        let plan = uow.into_plan();
        tracing::debug!(
            steps = plan.steps().len(),
            saving = plan.saving.len(),
            deleting = plan.deleting.len(),
            "Computed flush plan"
        );
        Ok(plan)
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id.0)
    }

    /// Canonical task for a graph node, if one was created.
    pub fn task_id(&self, node: &TaskNode) -> Option<TaskId> {
        self.nodes.get(node).copied()
    }

    fn classify(
        &mut self,
        tracker: &ChangeTracker,
        identity_map: &IdentityMap,
        objects: Option<&[InstanceId]>,
    ) -> Result<()> {
        let in_scope = |id: InstanceId| objects.is_none_or(|o| o.contains(&id));
        let mut switched_out = HashSet::new();
        let mut seen = HashSet::new();

        let saves: Vec<InstanceId> = tracker.new_ids().chain(tracker.dirty_ids()).collect();
        for id in saves {
            if !in_scope(id) || tracker.is_deleted(id) || !seen.insert(id) {
                continue;
            }
            let state = self.states.get(id)?;
            if state.key().is_none() {
                if let Some(values) = state.primary_key_values() {
                    let key = IdentityKey::new(state.mapper().base_name(), values);
                    if let Some(existing) = identity_map.get(&key).filter(|e| *e != id) {
                        if tracker.is_deleted(existing) && switched_out.insert(existing) {
                            tracing::debug!(new = %id, old = %existing, key = %key, "Row switch");
                            self.row_switches.push((id, existing));
                        } else {
                            return Err(Error::Flush(
                                FlushError::new(
                                    FlushErrorKind::IdentityConflict,
                                    format!(
                                        "New instance {} with identity key {} conflicts with persistent instance {}",
                                        id, key, existing
                                    ),
                                )
                                .with_mapper(state.mapper().name()),
                            ));
                        }
                    }
                }
            }
            let listonly = state.key().is_some() && state.only_collections_changed();
            let members = state.collection_changes();
            self.register_object(id, false, listonly)?;
            for member in members {
                if in_scope(member) && !tracker.is_deleted(member) {
                    self.register_object(member, false, true)?;
                }
            }
        }

        let deletes: Vec<InstanceId> = tracker.deleted_ids().collect();
        for id in deletes {
            if in_scope(id) && !switched_out.contains(&id) {
                self.register_object(id, true, false)?;
            }
        }
        Ok(())
    }

    /// Add an instance to its mapper's task and make sure processors exist
    /// for all of its relationships.
    pub fn register_object(
        &mut self,
        id: InstanceId,
        isdelete: bool,
        listonly: bool,
    ) -> Result<()> {
        let state = self.states.get(id)?;
        if !matches!(
            state.status(),
            InstanceStatus::Pending | InstanceStatus::Persistent
        ) {
            tracing::trace!(instance = %id, status = ?state.status(), "Skipping instance outside the session");
            return Ok(());
        }
        let mapper = Arc::clone(state.mapper());
        let task = self.task_for(TaskNode::Mapper(mapper.base_name().to_string()));
        if self.tasks[task.0].append(id, listonly, isdelete) {
            tracing::trace!(instance = %id, mapper = %mapper.name(), isdelete, listonly, "Registered instance");
        }
        for rel in mapper.relationships() {
            self.register_processor(&mapper, rel)?;
        }
        Ok(())
    }

    /// Processor for a relationship, created on first use.
    pub fn register_processor(
        &mut self,
        mapper: &Mapper,
        rel: &RelationshipMeta,
    ) -> Result<ProcessorId> {
        let owner = self.declaring_mapper(mapper, &rel.name);
        let key = (owner.clone(), rel.name.clone());
        if let Some(id) = self.processor_keys.get(&key) {
            return Ok(*id);
        }
        let id = ProcessorId(self.processors.len());
        let processor = DependencyProcessor::new(id, self.registry, &owner, rel)?;
        for (before, after) in processor.edges() {
            self.register_dependency(before, after);
        }
        tracing::trace!(processor = %processor.label(), "Registered dependency processor");
        self.processors.push(processor);
        self.processor_keys.insert(key, id);
        Ok(id)
    }

    /// Ensure the mapper-level tasks on both ends of an edge exist.
    fn register_dependency(&mut self, before: TaskNode, after: TaskNode) {
        for node in [before, after] {
            if node.mapper_name().is_some() {
                self.task_for(node);
            }
        }
    }

    /// The topmost mapper in `mapper`'s inheritance chain that declares `rel`.
    fn declaring_mapper(&self, mapper: &Mapper, rel: &str) -> String {
        let mut name = mapper.name().to_string();
        let mut parent = mapper.inherits().map(str::to_string);
        while let Some(candidate) = parent {
            match self.registry.get(&candidate) {
                Ok(m) if m.relationship(rel).is_some() => {
                    parent = m.inherits().map(str::to_string);
                    name = candidate;
                }
                _ => break,
            }
        }
        name
    }

    fn task_for(&mut self, node: TaskNode) -> TaskId {
        if let Some(id) = self.nodes.get(&node) {
            return *id;
        }
        let id = self.new_task(node.clone());
        self.nodes.insert(node.clone(), id);
        self.node_order.push(node);
        id
    }

    fn new_task(&mut self, node: TaskNode) -> TaskId {
        let id = TaskId(self.tasks.len());
        self.tasks.push(Task::new(node));
        id
    }

    fn is_deleting(&self, id: InstanceId) -> bool {
        let Ok(state) = self.states.get(id) else {
            return false;
        };
        self.nodes
            .get(&TaskNode::Mapper(state.mapper().base_name().to_string()))
            .and_then(|t| self.tasks[t.0].element(id))
            .is_some_and(|e| e.isdelete)
    }

    /// Run every processor's preprocessing until no instance is added or changed.
    fn preprocess(&mut self) -> Result<()> {
        let mut done: HashSet<(ProcessorId, bool, InstanceId)> = HashSet::new();
        loop {
            let mut changed = false;
            let mut idx = 0;
            while idx < self.processors.len() {
                let pid = ProcessorId(idx);
                for delete in [false, true] {
                    let node = self.processors[idx].target_node();
                    let Some(&task) = self.nodes.get(&node) else {
                        continue;
                    };
                    let ids: Vec<InstanceId> = self.tasks[task.0]
                        .elements
                        .iter()
                        .filter(|e| e.isdelete == delete && !done.contains(&(pid, delete, e.instance)))
                        .map(|e| e.instance)
                        .collect();
                    if ids.is_empty() {
                        continue;
                    }
                    done.extend(ids.iter().map(|i| (pid, delete, *i)));
                    changed = true;

                    let registrations = self.processors[idx].preprocess(
                        self.states,
                        &ids,
                        delete,
                        &|i| self.is_deleting(i),
                    );
                    for reg in registrations {
                        self.register_object(reg.instance, reg.isdelete, false)?;
                    }
                }
                idx += 1;
            }
            if !changed {
                return Ok(());
            }
        }
    }

    /// Switch relationships to post-update until the mapper graph is acyclic.
    fn break_cycles(&mut self) -> Result<()> {
        loop {
            let edges: Vec<(TaskNode, TaskNode)> = self
                .processors
                .iter()
                .filter(|p| !p.is_post_update() && p.kind() != RelationshipKind::ManyToMany)
                .flat_map(DependencyProcessor::edges)
                .collect();
            let Some(cycle) = topological::find_cycle(&self.node_order, &edges) else {
                return Ok(());
            };
            let cycle_edges: Vec<(TaskNode, TaskNode)> = cycle
                .windows(2)
                .map(|w| (w[0].clone(), w[1].clone()))
                .collect();
            let path = cycle
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" -> ");

            let candidate = self.processors.iter().position(|p| {
                !p.is_post_update()
                    && p.kind() != RelationshipKind::ManyToMany
                    && p.edges().iter().any(|e| cycle_edges.contains(e))
                    && p.can_post_update(self.registry)
            });
            match candidate {
                Some(i) => {
                    tracing::debug!(
                        relationship = %self.processors[i].label(),
                        cycle = %path,
                        "Breaking mapper cycle with post-update"
                    );
                    self.processors[i].set_post_update();
                }
                None => {
                    return Err(Error::Flush(FlushError::new(
                        FlushErrorKind::CircularDependency,
                        format!(
                            "Circular dependency detected between mappers: {}. \
                             Mark one of the relationships post_update; its foreign key must be nullable",
                            path
                        ),
                    )));
                }
            }
        }
    }

    /// Bind each processor to the task it runs from, for both phases.
    fn attach_processors(&mut self) {
        for idx in 0..self.processors.len() {
            let (id, attached, target) = {
                let p = &self.processors[idx];
                (p.id(), p.attached_node(), p.target_node())
            };
            let attached = self.task_for(attached);
            let target = self.task_for(target);
            for isdelete in [false, true] {
                self.tasks[attached.0].dependencies.push(TaskDependency {
                    processor: id,
                    target,
                    isdelete,
                });
            }
        }
    }

    fn sort(&mut self) -> Result<()> {
        let index: HashMap<&TaskNode, usize> = self
            .node_order
            .iter()
            .enumerate()
            .map(|(i, n)| (n, i))
            .collect();
        let items: Vec<usize> = (0..self.node_order.len()).collect();
        let edges: Vec<(usize, usize)> = self
            .processors
            .iter()
            .flat_map(DependencyProcessor::edges)
            .filter_map(|(a, b)| Some((*index.get(&a)?, *index.get(&b)?)))
            .collect();
        let tree = topological::sort_tree(&items, &edges).map_err(|cycle| {
            let path = cycle
                .iter()
                .map(|i| self.node_order[*i].to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            Error::Flush(FlushError::new(
                FlushErrorKind::CircularDependency,
                format!("Circular dependency detected between tasks: {}", path),
            ))
        })?;

        let ids: Vec<TaskId> = self
            .node_order
            .iter()
            .map(|n| self.nodes.get(n).copied().unwrap_or(TaskId(0)))
            .collect();
        for node in &tree.nodes {
            let parent = ids[node.item];
            for &child in &node.children {
                self.tasks[parent.0]
                    .childtasks
                    .push(ids[tree.nodes[child].item]);
            }
        }
        self.roots = tree.roots.iter().map(|r| ids[tree.nodes[*r].item]).collect();

        for node in &tree.nodes {
            if node.circular {
                self.sort_circular(ids[node.item])?;
            }
        }
        Ok(())
    }

    /// Decompose a self-referential task into per-instance levels.
    ///
    /// Each level holds instances that do not depend on each other; an
    /// element's `childtask` is the level of the instances depending on it.
    /// Processors of the self-referential relationships are bound to the
    /// level whose save makes their key values available.
    fn sort_circular(&mut self, task: TaskId) -> Result<()> {
        let node = self.tasks[task.0].node.clone();
        let selfref: Vec<ProcessorId> = self
            .processors
            .iter()
            .filter(|p| p.is_self_referential() && p.target_node() == node)
            .map(DependencyProcessor::id)
            .collect();
        if selfref.is_empty() {
            return Ok(());
        }

        let elements: HashMap<InstanceId, TaskElement> = self.tasks[task.0]
            .elements
            .iter()
            .map(|e| (e.instance, *e))
            .collect();
        let mut ids: Vec<InstanceId> = elements.keys().copied().collect();
        sort_states(self.states, &mut ids);

        let mut tuples = Vec::new();
        let mut related_of: HashMap<(ProcessorId, InstanceId), Vec<InstanceId>> = HashMap::new();
        for &id in &ids {
            let Some(element) = elements.get(&id) else {
                continue;
            };
            for &pid in &selfref {
                let p = &self.processors[pid.0];
                if !p.applies_to(self.states, id) || !p.has_history(self.states, id) {
                    continue;
                }
                let related: Vec<InstanceId> = p
                    .object_dependencies(self.states, id, element.isdelete)
                    .into_iter()
                    .filter(|o| *o != id && elements.contains_key(o))
                    .collect();
                tuples.extend(
                    related
                        .iter()
                        .filter_map(|other| p.whose_dependent_on_who(id, *other)),
                );
                related_of.insert((pid, id), related);
            }
        }

        let tree = topological::sort_tree(&ids, &tuples).map_err(|cycle| {
            let path = cycle
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" -> ");
            Error::Flush(
                FlushError::new(
                    FlushErrorKind::CircularDependency,
                    format!(
                        "Circular dependency detected between instances of {}: {}",
                        node, path
                    ),
                )
                .with_mapper(node.to_string()),
            )
        })?;

        let root = self.new_task(node.clone());
        let first = self.new_task(node.clone());
        self.tasks[root.0].childtasks.push(first);

        let mut level_of: HashMap<InstanceId, TaskId> = HashMap::new();
        let mut pending_levels = vec![(first, tree.roots.clone())];
        while let Some((level, slots)) = pending_levels.pop() {
            for slot in slots {
                let tree_node = &tree.nodes[slot];
                let Some(element) = elements.get(&tree_node.item).copied() else {
                    continue;
                };
                let childtask = if tree_node.children.is_empty() {
                    None
                } else {
                    let t = self.new_task(node.clone());
                    pending_levels.push((t, tree_node.children.clone()));
                    Some(t)
                };
                self.tasks[level.0].push_element(TaskElement {
                    childtask,
                    ..element
                });
                level_of.insert(tree_node.item, level);
            }
        }

        let position: HashMap<InstanceId, usize> = tree
            .preorder()
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();
        for &pid in &selfref {
            let kind = self.processors[pid.0].kind();
            for &id in &ids {
                let (Some(related), Some(element)) =
                    (related_of.get(&(pid, id)), elements.get(&id).copied())
                else {
                    continue;
                };
                let level = match kind {
                    RelationshipKind::OneToMany => level_of.get(&id).copied(),
                    _ => related
                        .iter()
                        .max_by_key(|o| position.get(*o).copied().unwrap_or(0))
                        .and_then(|parent| level_of.get(parent).copied()),
                };
                self.bind(level.unwrap_or(root), pid, element);
            }
        }

        self.tasks[task.0]
            .dependencies
            .retain(|d| !selfref.contains(&d.processor));
        self.tasks[task.0].circular = Some(root);
        tracing::debug!(task = %node, instances = ids.len(), "Decomposed self-referential task");
        Ok(())
    }

    /// Bind `processor` to `level` for one instance, sharing one target task per phase.
    fn bind(&mut self, level: TaskId, processor: ProcessorId, element: TaskElement) {
        let existing = self.tasks[level.0]
            .dependencies
            .iter()
            .find(|d| d.processor == processor && d.isdelete == element.isdelete)
            .map(|d| d.target);
        let target = match existing {
            Some(t) => t,
            None => {
                let node = self.tasks[level.0].node.clone();
                let t = self.new_task(node);
                self.tasks[level.0].dependencies.push(TaskDependency {
                    processor,
                    target: t,
                    isdelete: element.isdelete,
                });
                t
            }
        };
        self.tasks[target.0].push_element(TaskElement {
            childtask: None,
            ..element
        });
    }

    fn into_plan(self) -> FlushPlan {
        let mut steps = Vec::new();
        for &root in &self.roots {
            self.flatten(root, &mut steps);
        }

        let mut saving = Vec::new();
        let mut listonly = Vec::new();
        let mut deleting = HashSet::new();
        for node in &self.node_order {
            let Some(task) = self.nodes.get(node) else {
                continue;
            };
            for e in &self.tasks[task.0].elements {
                match (e.listonly, e.isdelete) {
                    (true, _) => listonly.push(e.instance),
                    (false, false) => saving.push(e.instance),
                    (false, true) => {
                        deleting.insert(e.instance);
                    }
                }
            }
        }
        sort_states(self.states, &mut saving);

        FlushPlan {
            steps,
            processors: self.processors,
            saving,
            listonly,
            deleting,
            row_switches: self.row_switches,
        }
    }

    fn flatten(&self, task: TaskId, out: &mut Vec<FlushStep>) {
        let t = &self.tasks[task.0];
        match t.circular {
            Some(root) => {
                self.save_phase(root, out);
                self.push_process(t, false, out);
                self.push_process(t, true, out);
                for &child in &t.childtasks {
                    self.flatten(child, out);
                }
                self.delete_phase(root, out);
            }
            None => {
                self.push_save(t, out);
                self.push_process(t, false, out);
                self.push_process(t, true, out);
                for &child in &t.childtasks {
                    self.flatten(child, out);
                }
                self.push_delete(t, out);
            }
        }
    }

    /// Saves of one level, then its processors (which only rewrite foreign
    /// keys of deeper levels), then the deeper levels.
    fn save_phase(&self, level: TaskId, out: &mut Vec<FlushStep>) {
        let t = &self.tasks[level.0];
        self.push_save(t, out);
        self.push_process(t, false, out);
        self.push_process(t, true, out);
        for e in &t.elements {
            if let Some(child) = e.childtask {
                self.save_phase(child, out);
            }
        }
        for &child in &t.childtasks {
            self.save_phase(child, out);
        }
    }

    fn delete_phase(&self, level: TaskId, out: &mut Vec<FlushStep>) {
        let t = &self.tasks[level.0];
        for &child in &t.childtasks {
            self.delete_phase(child, out);
        }
        for e in &t.elements {
            if let Some(child) = e.childtask {
                self.delete_phase(child, out);
            }
        }
        self.push_delete(t, out);
    }

    fn push_save(&self, t: &Task, out: &mut Vec<FlushStep>) {
        let mut instances = t.save_ids(false);
        if !instances.is_empty() {
            sort_states(self.states, &mut instances);
            out.push(FlushStep::Save {
                task: t.node.clone(),
                instances,
            });
        }
    }

    fn push_delete(&self, t: &Task, out: &mut Vec<FlushStep>) {
        let mut instances = t.delete_ids(false);
        if !instances.is_empty() {
            sort_states(self.states, &mut instances);
            out.push(FlushStep::Delete {
                task: t.node.clone(),
                instances,
            });
        }
    }

    fn push_process(&self, t: &Task, isdelete: bool, out: &mut Vec<FlushStep>) {
        for dep in t.dependencies.iter().filter(|d| d.isdelete == isdelete) {
            let target = &self.tasks[dep.target.0];
            let mut instances = if isdelete {
                target.delete_ids(true)
            } else {
                target.save_ids(true)
            };
            if instances.is_empty() {
                continue;
            }
            sort_states(self.states, &mut instances);
            out.push(FlushStep::Process {
                processor: dep.processor,
                instances,
                delete: isdelete,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InstanceState;
    use ormflush_core::{Column, Value};

    struct Fixture {
        registry: MapperRegistry,
        states: StateArena,
        tracker: ChangeTracker,
        identity_map: IdentityMap,
    }

    impl Fixture {
        fn new(registry: MapperRegistry) -> Self {
            Self {
                registry,
                states: StateArena::new(),
                tracker: ChangeTracker::new(),
                identity_map: IdentityMap::new(),
            }
        }

        fn pending(&mut self, mapper: &str) -> InstanceId {
            let mut state = InstanceState::new(self.registry.get(mapper).unwrap().clone());
            state.status = InstanceStatus::Pending;
            let id = self.states.insert(state);
            self.states.stamp_insert_order(id).unwrap();
            self.tracker.register_new(id);
            id
        }

        fn persistent(&mut self, mapper: &str, pk: i64) -> InstanceId {
            let m = self.registry.get(mapper).unwrap().clone();
            let key = IdentityKey::new(m.base_name(), vec![Value::BigInt(pk)]);
            let mut state = InstanceState::new(m);
            state.set_committed("id", Value::BigInt(pk));
            state.key = Some(key.clone());
            state.status = InstanceStatus::Persistent;
            let id = self.states.insert(state);
            self.identity_map.put(key, id).unwrap();
            id
        }

        fn plan(&self) -> Result<FlushPlan> {
            UnitOfWork::plan(
                &self.registry,
                &self.states,
                &self.tracker,
                &self.identity_map,
                None,
            )
        }
    }

    fn parent_child(cascade: bool) -> MapperRegistry {
        let mut children = RelationshipMeta::one_to_many("children", "Child").pair("id", "parent_id");
        if cascade {
            children = children.cascade_delete();
        }
        MapperRegistry::new()
            .with(
                Mapper::builder("Parent")
                    .table("parent")
                    .column(Column::new("id").autoincrement())
                    .relationship(children),
            )
            .unwrap()
            .with(
                Mapper::builder("Child")
                    .table("child")
                    .column(Column::new("id").autoincrement())
                    .column(Column::new("parent_id").nullable()),
            )
            .unwrap()
    }

    fn tree_registry() -> MapperRegistry {
        MapperRegistry::new()
            .with(
                Mapper::builder("Node")
                    .table("node")
                    .column(Column::new("id").autoincrement())
                    .column(Column::new("parent_id").nullable())
                    .relationship(
                        RelationshipMeta::one_to_many("children", "Node").pair("id", "parent_id"),
                    ),
            )
            .unwrap()
    }

    fn mutual(nullable: bool) -> MapperRegistry {
        let fk = |name: &str| {
            let col = Column::new(name);
            if nullable { col.nullable() } else { col }
        };
        MapperRegistry::new()
            .with(
                Mapper::builder("A")
                    .table("a")
                    .column(Column::new("id").autoincrement())
                    .column(fk("b_id"))
                    .relationship(RelationshipMeta::many_to_one("b", "B").pair("id", "b_id")),
            )
            .unwrap()
            .with(
                Mapper::builder("B")
                    .table("b")
                    .column(Column::new("id").autoincrement())
                    .column(fk("a_id"))
                    .relationship(RelationshipMeta::many_to_one("a", "A").pair("id", "a_id")),
            )
            .unwrap()
    }

    #[test]
    fn test_parent_saved_before_children() {
        let mut fx = Fixture::new(parent_child(false));
        let parent = fx.pending("Parent");
        let c1 = fx.pending("Child");
        let c2 = fx.pending("Child");
        let coll = fx.states.get_mut(parent).unwrap().collection_mut("children");
        coll.append(c1);
        coll.append(c2);

        let plan = fx.plan().unwrap();
        assert_eq!(
            plan.dump(),
            "Save Parent [#0]\nProcess Parent.children (save) [#0]\nSave Child [#1, #2]\n"
        );
        assert!(plan.row_switches().is_empty());
    }

    #[test]
    fn test_cascade_delete_removes_children_first() {
        let mut fx = Fixture::new(parent_child(true));
        let parent = fx.persistent("Parent", 1);
        let child = fx.persistent("Child", 10);
        *fx.states.get_mut(parent).unwrap().collection_mut("children") =
            crate::state::CollectionHistory::loaded(vec![child]);
        fx.tracker.register_deleted(parent);

        let plan = fx.plan().unwrap();
        assert_eq!(
            plan.dump(),
            "Process Parent.children (delete) [#0]\nDelete Child [#1]\nDelete Parent [#0]\n"
        );
        assert!(plan.deleting.contains(&child));
    }

    #[test]
    fn test_collection_only_change_registers_owner_listonly() {
        let mut fx = Fixture::new(parent_child(false));
        let parent = fx.persistent("Parent", 1);
        let child = fx.persistent("Child", 10);
        let coll = fx.states.get_mut(parent).unwrap().collection_mut("children");
        *coll = crate::state::CollectionHistory::loaded(vec![child]);
        coll.remove(child);
        fx.tracker.register_dirty(parent);

        let plan = fx.plan().unwrap();
        // the removed child is widened to a full save by the processor
        assert_eq!(
            plan.dump(),
            "Process Parent.children (save) [#0]\nSave Child [#1]\n"
        );
        assert_eq!(plan.listonly, vec![parent]);
        assert_eq!(plan.saving, vec![child]);
    }

    #[test]
    fn test_listonly_element_widened_by_full_registration() {
        let mut task = Task::new(TaskNode::Mapper("Child".into()));
        let id = InstanceId(3);
        assert!(task.append(id, true, false));
        assert!(task.save_ids(false).is_empty());
        assert_eq!(task.save_ids(true), vec![id]);

        task.append(id, false, false);
        assert_eq!(task.save_ids(false), vec![id]);
        task.append(id, true, true);
        assert_eq!(task.delete_ids(false), vec![id]);
        assert_eq!(task.elements.len(), 1);
    }

    #[test]
    fn test_owner_with_column_change_is_saved_in_full() {
        let mut fx = Fixture::new(parent_child(false));
        let parent = fx.persistent("Parent", 1);
        let child = fx.persistent("Child", 10);
        let state = fx.states.get_mut(parent).unwrap();
        state.set("id", Value::BigInt(2)).unwrap();
        state.collection_mut("children").append(child);
        fx.tracker.register_dirty(parent);

        let plan = fx.plan().unwrap();
        assert!(plan.listonly.is_empty());
        assert_eq!(plan.saving.len(), 2);
        assert!(plan.saving.contains(&parent) && plan.saving.contains(&child));
    }

    #[test]
    fn test_delete_without_cascade_updates_children() {
        let mut fx = Fixture::new(parent_child(false));
        let parent = fx.persistent("Parent", 1);
        let child = fx.persistent("Child", 10);
        *fx.states.get_mut(parent).unwrap().collection_mut("children") =
            crate::state::CollectionHistory::loaded(vec![child]);
        fx.tracker.register_deleted(parent);

        let plan = fx.plan().unwrap();
        assert_eq!(
            plan.dump(),
            "Process Parent.children (delete) [#0]\nSave Child [#1]\nDelete Parent [#0]\n"
        );
    }

    #[test]
    fn test_self_referential_instances_sorted_per_object() {
        let mut fx = Fixture::new(tree_registry());
        // child added to the session before its parent
        let child = fx.pending("Node");
        let parent = fx.pending("Node");
        fx.states
            .get_mut(parent)
            .unwrap()
            .collection_mut("children")
            .append(child);

        let plan = fx.plan().unwrap();
        assert_eq!(
            plan.dump(),
            "Save Node [#1]\nProcess Node.children (save) [#1]\nSave Node [#0]\n"
        );
    }

    #[test]
    fn test_self_referential_siblings_share_a_level() {
        let mut fx = Fixture::new(tree_registry());
        let root = fx.pending("Node");
        let a = fx.pending("Node");
        let b = fx.pending("Node");
        let coll = fx.states.get_mut(root).unwrap().collection_mut("children");
        coll.append(a);
        coll.append(b);

        let plan = fx.plan().unwrap();
        assert_eq!(
            plan.dump(),
            "Save Node [#0]\nProcess Node.children (save) [#0]\nSave Node [#1, #2]\n"
        );
    }

    #[test]
    fn test_instance_cycle_is_an_error() {
        let mut fx = Fixture::new(tree_registry());
        let a = fx.pending("Node");
        let b = fx.pending("Node");
        fx.states.get_mut(a).unwrap().collection_mut("children").append(b);
        fx.states.get_mut(b).unwrap().collection_mut("children").append(a);

        let err = fx.plan().unwrap_err();
        assert_eq!(err.flush_kind(), Some(FlushErrorKind::CircularDependency));
    }

    #[test]
    fn test_mutual_nullable_cycle_uses_post_update() {
        let mut fx = Fixture::new(mutual(true));
        let a = fx.pending("A");
        let b = fx.pending("B");
        fx.states.get_mut(a).unwrap().reference_mut("b").set(Some(b));
        fx.states.get_mut(b).unwrap().reference_mut("a").set(Some(a));

        let plan = fx.plan().unwrap();
        assert_eq!(plan.post_update_relationships(), vec!["A.b".to_string()]);
        assert_eq!(
            plan.dump(),
            "Save A [#0]\nProcess B.a (save) [#1]\nSave B [#1]\nProcess A.b (save) [#0]\n"
        );
    }

    #[test]
    fn test_mutual_required_cycle_is_an_error() {
        let mut fx = Fixture::new(mutual(false));
        let a = fx.pending("A");
        let b = fx.pending("B");
        fx.states.get_mut(a).unwrap().reference_mut("b").set(Some(b));

        let err = fx.plan().unwrap_err();
        assert_eq!(err.flush_kind(), Some(FlushErrorKind::CircularDependency));
        assert!(err.to_string().contains("A -> B -> A") || err.to_string().contains("B -> A -> B"));
    }

    #[test]
    fn test_row_switch_and_identity_conflict() {
        let registry = MapperRegistry::new()
            .with(
                Mapper::builder("Hero")
                    .table("hero")
                    .column(Column::new("id").primary_key())
                    .column(Column::new("name").nullable()),
            )
            .unwrap();
        let mut fx = Fixture::new(registry);
        let old = fx.persistent("Hero", 5);
        let new = fx.pending("Hero");
        fx.states.get_mut(new).unwrap().set("id", Value::BigInt(5)).unwrap();

        let err = fx.plan().unwrap_err();
        assert_eq!(err.flush_kind(), Some(FlushErrorKind::IdentityConflict));

        fx.tracker.register_deleted(old);
        let plan = fx.plan().unwrap();
        assert_eq!(plan.row_switches(), &[(new, old)]);
        assert_eq!(plan.dump(), "Save Hero [#1]\n");
    }

    #[test]
    fn test_subset_flush_only_plans_listed_instances() {
        let mut fx = Fixture::new(parent_child(false));
        let p1 = fx.pending("Parent");
        let _p2 = fx.pending("Parent");

        let plan = UnitOfWork::plan(
            &fx.registry,
            &fx.states,
            &fx.tracker,
            &fx.identity_map,
            Some(&[p1]),
        )
        .unwrap();
        assert_eq!(plan.dump(), "Save Parent [#0]\n");
    }
}
