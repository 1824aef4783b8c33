//! Session lifecycle callbacks and per-mapper persistence events.
//!
//! Session callbacks take no arguments and fire around flush, commit and
//! rollback. Mapper events fire for each instance as its row is written and
//! receive an [`EventContext`] that can read and modify the instance before
//! the statement is built. Events registered on a mapper also fire for its
//! subclasses.
//!
//! Returning `Err` from any callback aborts the surrounding operation.

use crate::state::{InstanceId, InstanceState};
use ormflush_core::{Error, MapperRegistry, Result, Value};
use std::collections::HashMap;

type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Handler for a mapper-level persistence event.
pub type MapperEventFn = Box<dyn FnMut(&mut EventContext<'_>) -> Result<()> + Send>;

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush computes its plan.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired before commit (after flush).
    BeforeCommit,
    /// Fired after commit completes successfully.
    AfterCommit,
    /// Fired after rollback completes.
    AfterRollback,
}

/// Holds registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    pub fn on(&mut self, event: SessionEvent, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.slot(event).push(Box::new(f));
    }

    fn slot(&mut self, event: SessionEvent) -> &mut Vec<SessionEventFn> {
        match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        }
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn fire(&mut self, event: SessionEvent) -> Result<()> {
        for cb in self.slot(event).iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Per-row persistence events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapperEvent {
    BeforeInsert,
    AfterInsert,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
}

/// The instance a mapper event fires for.
pub struct EventContext<'a> {
    instance: InstanceId,
    state: &'a mut InstanceState,
}

impl<'a> EventContext<'a> {
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Name of the instance's concrete mapper.
    pub fn mapper(&self) -> &str {
        self.state.mapper().name()
    }

    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.state.get(attr)
    }

    /// Assign an attribute; before-events can change what gets written.
    pub fn set(&mut self, attr: &str, value: Value) -> Result<()> {
        self.state.set(attr, value)
    }

    pub fn state(&self) -> &InstanceState {
        self.state
    }
}

/// Mapper-level event handlers keyed by mapper name.
#[derive(Default)]
pub struct MapperEvents {
    handlers: HashMap<(String, MapperEvent), Vec<MapperEventFn>>,
}

impl std::fmt::Debug for MapperEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count: usize = self.handlers.values().map(Vec::len).sum();
        f.debug_struct("MapperEvents")
            .field("handlers", &count)
            .finish()
    }
}

impl MapperEvents {
    pub fn listen(
        &mut self,
        mapper: &str,
        event: MapperEvent,
        f: impl FnMut(&mut EventContext<'_>) -> Result<()> + Send + 'static,
    ) {
        self.handlers
            .entry((mapper.to_string(), event))
            .or_default()
            .push(Box::new(f));
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Fire `event` for one instance: its own mapper's handlers first, then each ancestor's.
    pub(crate) fn dispatch(
        &mut self,
        registry: &MapperRegistry,
        event: MapperEvent,
        instance: InstanceId,
        state: &mut InstanceState,
    ) -> Result<()> {
        if self.handlers.is_empty() {
            return Ok(());
        }
        let mut chain = Vec::new();
        let mut next = Some(state.mapper().name().to_string());
        while let Some(name) = next {
            next = registry.get(&name)?.inherits().map(str::to_string);
            chain.push(name);
        }

        let mut ctx = EventContext { instance, state };
        for name in chain {
            if let Some(handlers) = self.handlers.get_mut(&(name, event)) {
                for handler in handlers.iter_mut() {
                    handler(&mut ctx).map_err(|e| {
                        tracing::debug!(instance = %instance, event = ?event, error = %e, "Mapper event aborted flush");
                        e
                    })?;
                }
            }
        }
        Ok(())
    }
}

/// Build an abort error for use inside event handlers.
pub fn abort(message: impl Into<String>) -> Error {
    Error::Custom(message.into())
}
