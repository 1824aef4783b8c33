//! Session and Unit of Work for ormflush.
//!
//! `ormflush-session` is the **unit-of-work layer**. It keeps one shadow
//! record per mapped instance, tracks what changed, and on flush writes every
//! change in an order that respects the foreign keys between rows.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: a single in-memory instance per primary key.
//! - **Change tracking**: records new, dirty and deleted instances before flush.
//! - **Unit of work**: sorts the pending changes into a dependency-ordered plan.
//! - **Transactional safety**: every flush runs inside a transaction on each
//!   connection it touches and is rolled back as a whole on failure.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: the caller passes the session and `Cx` to every call.
//! - **Handles, not references**: instances live in an arena and are addressed
//!   by copyable [`InstanceId`]s, so cyclic object graphs need no shared ownership.
//! - **All or nothing**: a failed flush restores the in-memory state it started from.
//! - **Cancel-correct**: All async operations use `Cx` + `Outcome` via `ormflush-core`.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(registry, conn);
//!
//! let parent = session.create("Parent", [("name", Value::Text("p".into()))])?;
//! let child = session.create("Child", [("name", Value::Text("c".into()))])?;
//! session.append(parent, "children", child)?;
//!
//! // INSERT parent, then child with parent_id set from the generated key
//! session.flush(&cx, None).await;
//! ```

pub mod change_tracker;
pub mod dependency;
pub mod events;
pub mod flush;
pub mod identity_map;
pub mod state;
pub mod topological;
pub mod transaction;
pub mod unit_of_work;

mod persistence;

#[cfg(test)]
mod mock;

pub use change_tracker::{ChangeTracker, PendingCounts};
pub use dependency::{DependencyProcessor, ProcessorId, SyncEffect, TaskNode};
pub use events::{EventContext, MapperEvent, MapperEvents, SessionEvent, SessionEventCallbacks, abort};
pub use flush::{FlushPlan, FlushResult, FlushStep};
pub use identity_map::{IdentityKey, IdentityMap};
pub use state::{
    AttributeHistory, CollectionHistory, InstanceId, InstanceState, InstanceStatus,
    ReferenceHistory, StateArena,
};
pub use transaction::Binds;
pub use unit_of_work::{Task, TaskElement, TaskId, UnitOfWork};

use asupersync::{Cx, Outcome};
use ormflush_core::{
    Connection, Error, FlushError, FlushErrorKind, IsolationLevel, Mapper, MapperRegistry,
    RelationshipKind, RelationshipMeta, Result, Row, TransactionError, TransactionErrorKind, Value,
};
use persistence::Executor;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use transaction::Coordinator;

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Flush pending changes before committing a session transaction.
    pub auto_flush: bool,
    /// Mark persistent instances expired after commit, so the next load
    /// of their row refreshes committed values.
    pub expire_on_commit: bool,
    /// Commit through PREPARE TRANSACTION / COMMIT PREPARED.
    pub two_phase: bool,
    /// Wrap flushes inside a session transaction in a SAVEPOINT, so a failed
    /// flush leaves the transaction usable.
    pub nested_flush: bool,
    /// Isolation level requested when a transaction begins.
    pub isolation: Option<IsolationLevel>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_flush: true,
            expire_on_commit: true,
            two_phase: false,
            nested_flush: true,
            isolation: None,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn auto_flush(mut self, value: bool) -> Self {
        self.auto_flush = value;
        self
    }

    #[must_use]
    pub fn expire_on_commit(mut self, value: bool) -> Self {
        self.expire_on_commit = value;
        self
    }

    #[must_use]
    pub fn two_phase(mut self, value: bool) -> Self {
        self.two_phase = value;
        self
    }

    #[must_use]
    pub fn nested_flush(mut self, value: bool) -> Self {
        self.nested_flush = value;
        self
    }

    #[must_use]
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }
}

/// In-memory state captured before a flush or at `begin`, restored on failure.
#[derive(Debug, Clone)]
struct Snapshot {
    states: StateArena,
    identity_map: IdentityMap,
    tracker: ChangeTracker,
}

#[derive(Debug)]
struct SessionTransaction {
    /// Binds whose database transaction has been begun.
    begun: Vec<Option<String>>,
    snapshot: Snapshot,
}

// ============================================================================
// Session
// ============================================================================

/// The unit-of-work session.
///
/// Owns the connections (one default plus named binds), the instance arena,
/// the identity map and the change tracker.
pub struct Session<C: Connection> {
    registry: Arc<MapperRegistry>,
    binds: Binds<C>,
    states: StateArena,
    identity_map: IdentityMap,
    tracker: ChangeTracker,
    config: SessionConfig,
    event_callbacks: SessionEventCallbacks,
    mapper_events: MapperEvents,
    transaction: Option<SessionTransaction>,
    flush_count: u64,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("instances", &self.states.len())
            .field("identity_map", &self.identity_map.len())
            .field("pending", &self.tracker.pending_counts())
            .field("in_transaction", &self.transaction.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Session<C> {
    /// Create a session writing through `conn`.
    pub fn new(registry: Arc<MapperRegistry>, conn: C) -> Self {
        Self::with_config(registry, conn, SessionConfig::default())
    }

    pub fn with_config(registry: Arc<MapperRegistry>, conn: C, config: SessionConfig) -> Self {
        Self {
            registry,
            binds: Binds::new(conn),
            states: StateArena::new(),
            identity_map: IdentityMap::new(),
            tracker: ChangeTracker::new(),
            config,
            event_callbacks: SessionEventCallbacks::default(),
            mapper_events: MapperEvents::default(),
            transaction: None,
            flush_count: 0,
        }
    }

    /// Route mappers configured with `.bind(name)` to `conn`.
    pub fn bind(&mut self, name: impl Into<String>, conn: C) -> Option<C> {
        self.binds.insert(name, conn)
    }

    pub fn registry(&self) -> &MapperRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn connection(&self) -> &C {
        self.binds.default_connection()
    }

    pub fn binds(&self) -> &Binds<C> {
        &self.binds
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Register a session lifecycle callback.
    pub fn on(&mut self, event: SessionEvent, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.on(event, f);
    }

    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.on(SessionEvent::BeforeFlush, f);
    }

    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.on(SessionEvent::AfterFlush, f);
    }

    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.on(SessionEvent::BeforeCommit, f);
    }

    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.on(SessionEvent::AfterCommit, f);
    }

    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.on(SessionEvent::AfterRollback, f);
    }

    /// Register a per-row persistence handler on `mapper` and its subclasses.
    pub fn listen(
        &mut self,
        mapper: &str,
        event: MapperEvent,
        f: impl FnMut(&mut EventContext<'_>) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.registry.get(mapper)?;
        self.mapper_events.listen(mapper, event, f);
        Ok(())
    }

    // ========================================================================
    // Instance lifecycle
    // ========================================================================

    /// Create a transient instance of `mapper`; it is not tracked until added.
    pub fn new_instance(&mut self, mapper: &str) -> Result<InstanceId> {
        let mapper = Arc::clone(self.registry.get(mapper)?);
        Ok(self.states.insert(InstanceState::new(mapper)))
    }

    /// Create an instance with the given attribute values and add it.
    pub fn create<'v>(
        &mut self,
        mapper: &str,
        values: impl IntoIterator<Item = (&'v str, Value)>,
    ) -> Result<InstanceId> {
        let id = self.new_instance(mapper)?;
        let state = self.states.get_mut(id)?;
        for (attr, value) in values {
            state.set(attr, value)?;
        }
        self.add(id)?;
        Ok(id)
    }

    /// Add an instance, and every transient instance reachable through its
    /// relationships, to the session.
    ///
    /// Adding an instance marked for deletion cancels the deletion.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn add(&mut self, id: InstanceId) -> Result<()> {
        match self.states.get(id)?.status() {
            InstanceStatus::Deleted | InstanceStatus::Detached => {
                return Err(Error::invalid_state(format!(
                    "instance {} is {:?} and cannot be added",
                    id,
                    self.states.get(id)?.status()
                )));
            }
            InstanceStatus::Persistent => {
                self.tracker.unregister_deleted(id);
            }
            InstanceStatus::Transient | InstanceStatus::Pending => {}
        }
        self.cascade_add(id)
    }

    /// Breadth-first over current relationship members, making transient
    /// instances pending in discovery order.
    fn cascade_add(&mut self, root: InstanceId) -> Result<()> {
        let mut queue = VecDeque::from([root]);
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let state = self.states.get(id)?;
            match state.status() {
                InstanceStatus::Transient => {
                    self.states.get_mut(id)?.status = InstanceStatus::Pending;
                    self.states.stamp_insert_order(id)?;
                    self.tracker.register_new(id);
                }
                InstanceStatus::Pending | InstanceStatus::Persistent => {}
                InstanceStatus::Deleted | InstanceStatus::Detached => {
                    tracing::trace!(instance = %id, "Cascade skips instance outside the session");
                    continue;
                }
            }
            let state = self.states.get(id)?;
            for rel in state.mapper().relationships() {
                match rel.kind {
                    RelationshipKind::ManyToOne => {
                        queue.extend(state.reference(&rel.name).and_then(ReferenceHistory::current));
                    }
                    RelationshipKind::OneToMany | RelationshipKind::ManyToMany => {
                        if let Some(coll) = state.collection(&rel.name) {
                            queue.extend(coll.current());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Mark an instance for deletion on the next flush.
    ///
    /// A pending instance that was never flushed is simply expunged.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn delete(&mut self, id: InstanceId) -> Result<()> {
        match self.states.get(id)?.status() {
            InstanceStatus::Pending => {
                self.tracker.register_clean(id);
                self.states.get_mut(id)?.status = InstanceStatus::Transient;
                Ok(())
            }
            InstanceStatus::Persistent => {
                self.tracker.register_deleted(id);
                Ok(())
            }
            status => Err(Error::invalid_state(format!(
                "instance {} is {:?}; only persistent instances can be deleted",
                id, status
            ))),
        }
    }

    /// Stop tracking an instance. Its handle stays readable.
    pub fn expunge(&mut self, id: InstanceId) -> Result<()> {
        let state = self.states.get_mut(id)?;
        if let Some(key) = state.key.take() {
            if self.identity_map.get(&key) == Some(id) {
                self.identity_map.remove(&key);
            }
        }
        state.status = InstanceStatus::Detached;
        self.tracker.register_clean(id);
        Ok(())
    }

    // ========================================================================
    // Attributes and relationships
    // ========================================================================

    /// Assign a column attribute.
    pub fn set(&mut self, id: InstanceId, attr: &str, value: Value) -> Result<()> {
        let state = self.states.get_mut(id)?;
        state.set(attr, value)?;
        self.changed(id)
    }

    pub fn get(&self, id: InstanceId, attr: &str) -> Result<Option<&Value>> {
        Ok(self.states.get(id)?.get(attr))
    }

    fn changed(&mut self, id: InstanceId) -> Result<()> {
        let state = self.states.get(id)?;
        if matches!(
            state.status(),
            InstanceStatus::Pending | InstanceStatus::Persistent
        ) {
            self.tracker.value_changed(id, state);
        }
        Ok(())
    }

    fn relationship_of(
        &self,
        id: InstanceId,
        rel: &str,
        expect_collection: bool,
    ) -> Result<RelationshipMeta> {
        let mapper = self.states.get(id)?.mapper();
        let meta = mapper.relationship(rel).ok_or_else(|| {
            Error::invalid_state(format!(
                "mapper '{}' has no relationship '{}'",
                mapper.name(),
                rel
            ))
        })?;
        let is_collection = !matches!(meta.kind, RelationshipKind::ManyToOne);
        if is_collection != expect_collection {
            return Err(Error::invalid_state(format!(
                "relationship '{}.{}' is {:?}",
                mapper.name(),
                rel,
                meta.kind
            )));
        }
        Ok(meta.clone())
    }

    fn check_target(&self, rel: &RelationshipMeta, target: InstanceId) -> Result<()> {
        let mapper = self.states.get(target)?.mapper().name().to_string();
        if !self.registry.isa(&mapper, &rel.target) {
            return Err(Error::invalid_state(format!(
                "relationship '{}' expects '{}', got instance {} of '{}'",
                rel.name, rel.target, target, mapper
            )));
        }
        Ok(())
    }

    /// Whether the owner is tracked, so relationship targets cascade into the session.
    fn in_session(&self, id: InstanceId) -> Result<bool> {
        Ok(matches!(
            self.states.get(id)?.status(),
            InstanceStatus::Pending | InstanceStatus::Persistent
        ))
    }

    /// Point a many-to-one relationship at `target`, or clear it.
    pub fn set_reference(&mut self, id: InstanceId, rel: &str, target: Option<InstanceId>) -> Result<()> {
        let meta = self.relationship_of(id, rel, false)?;
        if let Some(target) = target {
            self.check_target(&meta, target)?;
        }
        self.states.get_mut(id)?.reference_mut(rel).set(target);
        self.changed(id)?;
        if self.in_session(id)? {
            if let Some(target) = target {
                self.cascade_add(target)?;
            }
        }
        Ok(())
    }

    pub fn reference(&self, id: InstanceId, rel: &str) -> Result<Option<InstanceId>> {
        self.relationship_of(id, rel, false)?;
        Ok(self
            .states
            .get(id)?
            .reference(rel)
            .and_then(ReferenceHistory::current))
    }

    /// Append to a one-to-many or many-to-many collection.
    pub fn append(&mut self, id: InstanceId, rel: &str, member: InstanceId) -> Result<()> {
        let meta = self.relationship_of(id, rel, true)?;
        self.check_target(&meta, member)?;
        self.states.get_mut(id)?.collection_mut(rel).append(member);
        self.changed(id)?;
        if self.in_session(id)? {
            self.cascade_add(member)?;
        }
        Ok(())
    }

    pub fn remove(&mut self, id: InstanceId, rel: &str, member: InstanceId) -> Result<()> {
        self.relationship_of(id, rel, true)?;
        self.states.get_mut(id)?.collection_mut(rel).remove(member);
        self.changed(id)
    }

    pub fn collection(&self, id: InstanceId, rel: &str) -> Result<Vec<InstanceId>> {
        self.relationship_of(id, rel, true)?;
        Ok(self
            .states
            .get(id)?
            .collection(rel)
            .map(CollectionHistory::current)
            .unwrap_or_default())
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Register a row loaded from the database as a persistent instance.
    ///
    /// Row columns are matched by the mapper's column names. If the row's
    /// identity is already in the session the existing instance is returned.
    pub fn load(&mut self, mapper: &str, row: &Row) -> Result<InstanceId> {
        let mapper = Arc::clone(self.registry.get(mapper)?);
        let mut values: Vec<(String, Value)> = Vec::new();
        for col in mapper.columns() {
            if values.iter().any(|(attr, _)| *attr == col.attr) {
                continue;
            }
            if let Some(value) = row.get_by_name(&col.column) {
                values.push((col.attr.clone(), value.clone()));
            }
        }
        self.load_resolved(mapper, values)
    }

    /// Like [`Session::load`], with values given by attribute name.
    pub fn load_values<'v>(
        &mut self,
        mapper: &str,
        values: impl IntoIterator<Item = (&'v str, Value)>,
    ) -> Result<InstanceId> {
        let mapper = Arc::clone(self.registry.get(mapper)?);
        let mut resolved = Vec::new();
        for (attr, value) in values {
            if !mapper.has_attr(attr) {
                return Err(Error::invalid_state(format!(
                    "mapper '{}' has no attribute '{}'",
                    mapper.name(),
                    attr
                )));
            }
            resolved.push((attr.to_string(), value));
        }
        self.load_resolved(mapper, resolved)
    }

    fn load_resolved(&mut self, mapper: Arc<Mapper>, values: Vec<(String, Value)>) -> Result<InstanceId> {
        let pk: Option<Vec<Value>> = mapper
            .primary_key()
            .iter()
            .map(|attr| {
                values
                    .iter()
                    .find(|(name, _)| name == attr)
                    .map(|(_, v)| v.clone())
                    .filter(|v| !v.is_null())
            })
            .collect();
        let Some(pk) = pk else {
            return Err(Error::Flush(
                FlushError::new(
                    FlushErrorKind::NullPrimaryKey,
                    "loaded row has no primary key value",
                )
                .with_mapper(mapper.name()),
            ));
        };
        let key = IdentityKey::new(mapper.base_name(), pk);

        if let Some(existing) = self.identity_map.get(&key) {
            let state = self.states.get_mut(existing)?;
            if state.is_expired() {
                for (attr, value) in values {
                    if !state.history(&attr).is_some_and(AttributeHistory::has_changes) {
                        state.set_committed(&attr, value);
                    }
                }
                state.expired = false;
            }
            return Ok(existing);
        }

        let mut state = InstanceState::new(mapper);
        for (attr, value) in values {
            state.set_committed(&attr, value);
        }
        state.key = Some(key.clone());
        state.status = InstanceStatus::Persistent;
        let id = self.states.insert(state);
        self.identity_map.put(key, id)?;
        Ok(id)
    }

    /// Record the loaded target of a many-to-one relationship.
    pub fn attach_loaded_reference(
        &mut self,
        id: InstanceId,
        rel: &str,
        target: Option<InstanceId>,
    ) -> Result<()> {
        self.relationship_of(id, rel, false)?;
        *self.states.get_mut(id)?.reference_mut(rel) = ReferenceHistory::loaded(target);
        Ok(())
    }

    /// Record the loaded members of a collection.
    pub fn attach_loaded_collection(
        &mut self,
        id: InstanceId,
        rel: &str,
        members: Vec<InstanceId>,
    ) -> Result<()> {
        self.relationship_of(id, rel, true)?;
        *self.states.get_mut(id)?.collection_mut(rel) = CollectionHistory::loaded(members);
        Ok(())
    }

    // ========================================================================
    // Lookup and status
    // ========================================================================

    pub fn identity(&self, key: &IdentityKey) -> Option<InstanceId> {
        self.identity_map.get(key)
    }

    /// Find the instance for a primary key of `mapper`'s hierarchy.
    pub fn lookup(&self, mapper: &str, pk: Vec<Value>) -> Result<Option<InstanceId>> {
        let base = self.registry.get(mapper)?.base_name().to_string();
        Ok(self.identity_map.get(&IdentityKey::new(base, pk)))
    }

    pub fn state(&self, id: InstanceId) -> Result<&InstanceState> {
        self.states.get(id)
    }

    pub fn status(&self, id: InstanceId) -> Result<InstanceStatus> {
        Ok(self.states.get(id)?.status())
    }

    pub fn is_new(&self, id: InstanceId) -> bool {
        self.tracker.is_new(id)
    }

    pub fn is_dirty(&self, id: InstanceId) -> bool {
        self.tracker.is_dirty(id)
            || self
                .states
                .get(id)
                .is_ok_and(|s| s.status() == InstanceStatus::Persistent && s.has_changes())
    }

    pub fn is_deleted(&self, id: InstanceId) -> bool {
        self.tracker.is_deleted(id)
    }

    pub fn pending_counts(&self) -> PendingCounts {
        self.tracker.pending_counts()
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Compute the flush plan without executing it.
    pub fn plan(&self, objects: Option<&[InstanceId]>) -> Result<FlushPlan> {
        UnitOfWork::plan(
            &self.registry,
            &self.states,
            &self.tracker,
            &self.identity_map,
            objects,
        )
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            states: self.states.clone(),
            identity_map: self.identity_map.clone(),
            tracker: self.tracker.clone(),
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.states = snapshot.states;
        self.identity_map = snapshot.identity_map;
        self.tracker = snapshot.tracker;
    }

    /// Write pending changes to the database.
    ///
    /// `objects` restricts the flush to the listed instances. Outside a
    /// session transaction the flush commits itself; inside one it runs in a
    /// savepoint (see [`SessionConfig::nested_flush`]). On any failure every
    /// begun transaction is rolled back and the in-memory state is restored.
    #[tracing::instrument(level = "info", skip(self, cx, objects))]
    pub async fn flush(&mut self, cx: &Cx, objects: Option<&[InstanceId]>) -> Outcome<FlushResult, Error> {
        let started = Instant::now();
        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeFlush) {
            return Outcome::Err(e);
        }

        let plan = match self.plan(objects) {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };
        if plan.is_empty() {
            tracing::debug!("Nothing to flush");
            if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterFlush) {
                return Outcome::Err(e);
            }
            return Outcome::Ok(FlushResult::new());
        }
        tracing::trace!(plan = %plan.dump(), "Flush plan");

        let snapshot = self.snapshot();
        self.flush_count += 1;
        let in_transaction = self.transaction.is_some();
        let (begun, savepoint) = match &self.transaction {
            Some(tx) => (
                tx.begun.clone(),
                self.config
                    .nested_flush
                    .then(|| format!("ormflush_flush_{}", self.flush_count)),
            ),
            None => (Vec::new(), None),
        };
        let nested = savepoint.is_some();

        let mut coordinator = Coordinator::new(&self.binds, self.config.isolation, begun, savepoint);
        let (outcome, mut result, touched, expired) = {
            let mut executor = Executor::new(
                &self.registry,
                &mut self.states,
                &mut self.mapper_events,
                &mut coordinator,
            );
            let outcome = executor.run(cx, &plan).await;
            (outcome, executor.result, executor.touched, executor.expired)
        };

        let outcome = match outcome {
            Outcome::Ok(()) if !in_transaction => coordinator.commit(cx, self.config.two_phase).await,
            Outcome::Ok(()) if nested => coordinator.release_savepoints(cx).await,
            Outcome::Ok(()) => Outcome::Ok(()),
            failure => {
                if nested {
                    coordinator.rollback_to_savepoints(cx).await;
                } else {
                    coordinator.rollback(cx).await;
                }
                failure
            }
        };
        result.statements += coordinator.statements();
        let begun = coordinator.into_begun();

        let failure = match outcome {
            Outcome::Ok(()) => None,
            other => Some(other),
        };
        if let Some(failure) = failure {
            if in_transaction && !nested {
                // The whole database transaction is gone.
                if let Some(tx) = self.transaction.take() {
                    self.restore(tx.snapshot);
                }
                if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterRollback) {
                    tracing::warn!(error = %e, "after_rollback callback failed");
                }
            } else {
                if let Some(tx) = self.transaction.as_mut() {
                    tx.begun = begun;
                }
                self.restore(snapshot);
            }
            tracing::debug!(statements = result.statements, "Flush failed; state restored");
            return match failure {
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
                Outcome::Ok(()) => Outcome::Ok(result),
            };
        }

        if let Some(tx) = self.transaction.as_mut() {
            tx.begun = begun;
        }
        if let Err(e) = self.finalize(&plan, &touched, &expired) {
            return Outcome::Err(e);
        }

        tracing::info!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            statements = result.statements,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Flush complete"
        );
        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterFlush) {
            return Outcome::Err(e);
        }
        Outcome::Ok(result)
    }

    /// Bring in-memory state in line with what the flush wrote.
    ///
    /// Instances in `expired` hold server defaults that were never read back,
    /// so they are left expired for the next load to refresh.
    fn finalize(
        &mut self,
        plan: &FlushPlan,
        touched: &BTreeSet<InstanceId>,
        expired: &BTreeSet<InstanceId>,
    ) -> Result<()> {
        for &(_, old) in plan.row_switches() {
            let state = self.states.get_mut(old)?;
            state.key = None;
            state.status = InstanceStatus::Detached;
            self.tracker.register_clean(old);
        }

        for &id in &plan.saving {
            let state = self.states.get_mut(id)?;
            let Some(pk) = state.primary_key_values() else {
                return Err(Error::Flush(
                    FlushError::new(
                        FlushErrorKind::NullPrimaryKey,
                        format!("instance {} was saved without a primary key", id),
                    )
                    .with_mapper(state.mapper().name()),
                ));
            };
            let key = IdentityKey::new(state.mapper().base_name(), pk);
            if state.key.as_ref() != Some(&key) {
                if let Some(old) = state.key.take() {
                    if self.identity_map.get(&old) == Some(id) {
                        self.identity_map.remove(&old);
                    }
                }
            }
            if let Some(previous) = self.identity_map.replace(key.clone(), id) {
                if previous != id {
                    tracing::trace!(key = %key, new = %id, old = %previous, "Identity handed over");
                }
            }
            state.key = Some(key);
            state.status = InstanceStatus::Persistent;
            state.expired = false;
            state.commit_all();
            self.tracker.register_clean(id);
        }

        for &id in &plan.listonly {
            let state = self.states.get_mut(id)?;
            state.commit_relationships();
            if state.status() == InstanceStatus::Persistent && !state.has_changes() {
                self.tracker.register_clean(id);
            }
        }
        for &id in touched {
            self.states.get_mut(id)?.commit_all();
        }
        for &id in expired {
            self.states.get_mut(id)?.expired = true;
        }

        for &id in &plan.deleting {
            let state = self.states.get_mut(id)?;
            if let Some(key) = state.key.take() {
                if self.identity_map.get(&key) == Some(id) {
                    self.identity_map.remove(&key);
                }
            }
            state.status = InstanceStatus::Deleted;
            self.tracker.register_clean(id);
        }
        if !plan.deleting.is_empty() {
            for (_, state) in self.states.iter_mut() {
                for &id in &plan.deleting {
                    state.forget_related(id);
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Begin a session transaction spanning several flushes.
    ///
    /// No statement is sent until the first flush touches a connection.
    pub fn begin(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyActive,
                message: "session transaction already begun".to_string(),
            }));
        }
        self.transaction = Some(SessionTransaction {
            begun: Vec::new(),
            snapshot: self.snapshot(),
        });
        tracing::debug!("Session transaction begun");
        Ok(())
    }

    /// Flush (if `auto_flush`) and commit the session transaction.
    ///
    /// Without an open session transaction this is a plain flush.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        let mut result = FlushResult::new();
        if self.config.auto_flush || self.transaction.is_none() {
            result = ormflush_core::try_outcome!(self.flush(cx, None).await);
        }

        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeCommit) {
            if self.transaction.is_some() {
                ormflush_core::try_outcome!(self.rollback(cx).await);
            }
            return Outcome::Err(e);
        }

        if let Some(tx) = self.transaction.take() {
            let SessionTransaction { begun, snapshot } = tx;
            let (outcome, statements) = {
                let mut coordinator = Coordinator::new(&self.binds, self.config.isolation, begun, None);
                let outcome = coordinator.commit(cx, self.config.two_phase).await;
                (outcome, coordinator.statements())
            };
            result.statements += statements;
            match outcome {
                Outcome::Ok(()) => {}
                failure => {
                    self.restore(snapshot);
                    if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterRollback) {
                        tracing::warn!(error = %e, "after_rollback callback failed");
                    }
                    return match failure {
                        Outcome::Err(e) => Outcome::Err(e),
                        Outcome::Cancelled(r) => Outcome::Cancelled(r),
                        Outcome::Panicked(p) => Outcome::Panicked(p),
                        Outcome::Ok(()) => Outcome::Ok(result),
                    };
                }
            }
        }

        if self.config.expire_on_commit {
            let mut expired = 0usize;
            for (_, state) in self.states.iter_mut() {
                if state.status() == InstanceStatus::Persistent {
                    state.expired = true;
                    expired += 1;
                }
            }
            tracing::debug!(count = expired, "Expired all session objects");
        }

        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterCommit) {
            return Outcome::Err(e);
        }
        Outcome::Ok(result)
    }

    /// Roll back the session transaction and restore the in-memory state
    /// captured at [`Session::begin`].
    ///
    /// Instances created after `begin` are discarded.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let Some(tx) = self.transaction.take() else {
            return Outcome::Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NotActive,
                message: "no session transaction to roll back".to_string(),
            }));
        };
        let SessionTransaction { begun, snapshot } = tx;
        {
            let mut coordinator = Coordinator::new(&self.binds, None, begun, None);
            coordinator.rollback(cx).await;
        }
        self.restore(snapshot);
        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterRollback) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    // ========================================================================
    // Debug
    // ========================================================================

    /// Get a summary of the session's state.
    pub fn debug_state(&self) -> SessionDebugInfo {
        let counts = self.tracker.pending_counts();
        SessionDebugInfo {
            tracked: self
                .states
                .iter()
                .filter(|(_, s)| {
                    matches!(
                        s.status(),
                        InstanceStatus::Pending | InstanceStatus::Persistent
                    )
                })
                .count(),
            identities: self.identity_map.len(),
            pending_new: counts.new,
            pending_delete: counts.deleted,
            pending_dirty: counts.dirty,
            in_transaction: self.transaction.is_some(),
        }
    }
}

/// Debug information about session state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDebugInfo {
    /// Pending and persistent instances.
    pub tracked: usize,
    /// Entries in the identity map.
    pub identities: usize,
    /// Instances pending INSERT.
    pub pending_new: usize,
    /// Instances pending DELETE.
    pub pending_delete: usize,
    /// Instances pending UPDATE.
    pub pending_dirty: usize,
    /// Whether a session transaction is open.
    pub in_transaction: bool,
}

// ============================================================================
// Unit Tests
// ============================================================================
