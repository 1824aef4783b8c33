//! Flush plans: the dependency-ordered list of steps a flush executes.
//!
//! The unit of work sorts its tasks into a tree and flattens it into a
//! sequence of [`FlushStep`]s:
//!
//! - `Save` inserts or updates the instances of one task
//! - `Process` runs a dependency processor over instances whose related rows exist
//! - `Delete` deletes the instances of one task, after everything depending on them
//!
//! A plan is plain data. It can be inspected with [`FlushPlan::dump`] or
//! [`FlushPlan::to_json`] before (or without) executing it.

use crate::dependency::{DependencyProcessor, ProcessorId, TaskNode};
use crate::state::{InstanceId, StateArena};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt::Write;

/// One step of a flush plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushStep {
    Save {
        task: TaskNode,
        instances: Vec<InstanceId>,
    },
    Process {
        processor: ProcessorId,
        instances: Vec<InstanceId>,
        delete: bool,
    },
    Delete {
        task: TaskNode,
        instances: Vec<InstanceId>,
    },
}

impl FlushStep {
    pub fn instances(&self) -> &[InstanceId] {
        match self {
            FlushStep::Save { instances, .. }
            | FlushStep::Process { instances, .. }
            | FlushStep::Delete { instances, .. } => instances,
        }
    }
}

/// Ordered steps of one flush plus the bookkeeping needed to finalize it.
#[derive(Debug, Clone, Default)]
pub struct FlushPlan {
    pub(crate) steps: Vec<FlushStep>,
    pub(crate) processors: Vec<DependencyProcessor>,
    /// Instances written by a Save step.
    pub(crate) saving: Vec<InstanceId>,
    /// Instances listed only so their relationships get processed.
    pub(crate) listonly: Vec<InstanceId>,
    pub(crate) deleting: HashSet<InstanceId>,
    /// `(new, old)`: a pending instance taking over the row of a deleted one.
    pub(crate) row_switches: Vec<(InstanceId, InstanceId)>,
}

impl FlushPlan {
    pub fn steps(&self) -> &[FlushStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn processors(&self) -> &[DependencyProcessor] {
        &self.processors
    }

    pub fn processor(&self, id: ProcessorId) -> Option<&DependencyProcessor> {
        self.processors.get(id.0)
    }

    pub fn row_switches(&self) -> &[(InstanceId, InstanceId)] {
        &self.row_switches
    }

    /// Relationships that ended up wired through post-update UPDATEs.
    pub fn post_update_relationships(&self) -> Vec<String> {
        self.processors
            .iter()
            .filter(|p| p.is_post_update())
            .map(DependencyProcessor::label)
            .collect()
    }

    fn label(&self, id: ProcessorId) -> String {
        self.processor(id)
            .map_or_else(|| format!("processor {}", id.0), DependencyProcessor::label)
    }

    /// Deterministic, line-per-step rendering of the plan.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for step in &self.steps {
            let ids = render_ids(step.instances());
            let _ = match step {
                FlushStep::Save { task, .. } => writeln!(out, "Save {} [{}]", task, ids),
                FlushStep::Process {
                    processor, delete, ..
                } => writeln!(
                    out,
                    "Process {} ({}) [{}]",
                    self.label(*processor),
                    if *delete { "delete" } else { "save" },
                    ids
                ),
                FlushStep::Delete { task, .. } => writeln!(out, "Delete {} [{}]", task, ids),
            };
        }
        out
    }

    /// JSON rendering of the steps.
    pub fn to_json(&self) -> serde_json::Value {
        let steps: Vec<serde_json::Value> = self
            .steps
            .iter()
            .map(|step| match step {
                FlushStep::Save { task, instances } => serde_json::json!({
                    "op": "save",
                    "task": task.to_string(),
                    "instances": instances,
                }),
                FlushStep::Process {
                    processor,
                    instances,
                    delete,
                } => serde_json::json!({
                    "op": "process",
                    "processor": self.label(*processor),
                    "delete": delete,
                    "instances": instances,
                }),
                FlushStep::Delete { task, instances } => serde_json::json!({
                    "op": "delete",
                    "task": task.to_string(),
                    "instances": instances,
                }),
            })
            .collect();
        serde_json::json!({
            "steps": steps,
            "post_update": self.post_update_relationships(),
        })
    }
}

fn render_ids(ids: &[InstanceId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result of a flush operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    /// Number of instances inserted.
    pub inserted: usize,
    /// Number of instances updated.
    pub updated: usize,
    /// Number of instances deleted.
    pub deleted: usize,
    /// Statements sent, including transaction control.
    pub statements: usize,
}

impl FlushResult {
    /// Create a new empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of instance operations performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// Order instances for execution: pending ones by the order they were
/// added, then persistent ones by identity key.
pub(crate) fn sort_states(states: &StateArena, ids: &mut [InstanceId]) {
    ids.sort_by(|a, b| {
        let (sa, sb) = (states.get(*a).ok(), states.get(*b).ok());
        let by_state = match (sa.and_then(|s| s.key()), sb.and_then(|s| s.key())) {
            (None, None) => {
                let oa = sa.map_or(0, |s| s.insert_order);
                let ob = sb.map_or(0, |s| s.insert_order);
                oa.cmp(&ob)
            }
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(ka), Some(kb)) => ka.cmp(kb),
        };
        by_state.then(a.cmp(b))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity_map::IdentityKey;
    use crate::state::InstanceState;
    use ormflush_core::{Column, Mapper, MapperRegistry, Value};

    #[test]
    fn test_sort_states_pending_first_then_by_key() {
        let registry = MapperRegistry::new()
            .with(
                Mapper::builder("Hero")
                    .table("hero")
                    .column(Column::new("id").autoincrement()),
            )
            .unwrap();
        let mapper = registry.get("Hero").unwrap();
        let mut arena = StateArena::new();
        let persistent_9 = arena.insert(InstanceState::new(mapper.clone()));
        let pending_late = arena.insert(InstanceState::new(mapper.clone()));
        let persistent_2 = arena.insert(InstanceState::new(mapper.clone()));
        let pending_early = arena.insert(InstanceState::new(mapper.clone()));

        arena.get_mut(persistent_9).unwrap().key =
            Some(IdentityKey::new("Hero", vec![Value::BigInt(9)]));
        arena.get_mut(persistent_2).unwrap().key =
            Some(IdentityKey::new("Hero", vec![Value::BigInt(2)]));
        arena.stamp_insert_order(pending_early).unwrap();
        arena.stamp_insert_order(pending_late).unwrap();

        let mut ids = vec![persistent_9, pending_late, persistent_2, pending_early];
        sort_states(&arena, &mut ids);
        assert_eq!(ids, vec![pending_early, pending_late, persistent_2, persistent_9]);
    }

    #[test]
    fn test_flush_result_total_and_json() {
        let result = FlushResult {
            inserted: 2,
            updated: 1,
            deleted: 3,
            statements: 9,
        };
        assert_eq!(result.total(), 6);
        let json = serde_json::to_value(result).unwrap();
        assert_eq!(json["statements"], 9);
    }

    #[test]
    fn test_dump_renders_each_step() {
        let plan = FlushPlan {
            steps: vec![
                FlushStep::Save {
                    task: TaskNode::Mapper("Parent".into()),
                    instances: vec![InstanceId(0)],
                },
                FlushStep::Delete {
                    task: TaskNode::Mapper("Child".into()),
                    instances: vec![InstanceId(1), InstanceId(2)],
                },
            ],
            ..FlushPlan::default()
        };
        assert_eq!(plan.dump(), "Save Parent [#0]\nDelete Child [#1, #2]\n");
        assert_eq!(plan.to_json()["steps"][1]["op"], "delete");
    }
}
