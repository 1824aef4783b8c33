//! Executes a [`FlushPlan`] against the database.
//!
//! Each step turns into INSERT, UPDATE and DELETE statements built with
//! `ormflush-query`. Rows of one table that share a column list are written
//! with a single multi-row INSERT, unless generated keys must be matched back
//! on a dialect that does not keep RETURNING rows in order; UPDATEs and DELETEs of one table go out as
//! one batch and their affected-row counts are checked against the number of
//! instances. Generated keys are copied back onto the instances as soon as
//! their INSERT returns, so later steps can read them.

use crate::dependency::{DependencyProcessor, SyncEffect};
use crate::events::{MapperEvent, MapperEvents};
use crate::flush::{FlushPlan, FlushResult, FlushStep};
use crate::state::{InstanceId, InstanceState, StateArena};
use crate::transaction::Coordinator;
use asupersync::{Cx, Outcome};
use ormflush_core::{
    Connection, Error, FlushError, FlushErrorKind, Mapper, MapperRegistry, Value, try_outcome,
};
use ormflush_query::{DeleteStatement, InsertStatement, UpdateStatement};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Return the error of a `Result` from a function returning `Outcome`.
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(err) => return Outcome::Err(err),
        }
    };
}

/// One instance's row for one table, ready for INSERT.
#[derive(Debug)]
struct PendingRow {
    instance: InstanceId,
    bind: Option<String>,
    columns: Vec<String>,
    values: Vec<Value>,
    /// `(column, attribute)` key pairs the database must generate.
    generated: Vec<(String, String)>,
    /// Non-key `(column, attribute)` pairs left to a server default.
    fetched: Vec<(String, String)>,
}

impl PendingRow {
    fn same_shape(&self, other: &PendingRow) -> bool {
        self.bind == other.bind
            && self.columns == other.columns
            && self.generated == other.generated
            && self.fetched == other.fetched
    }
}

/// A statement whose affected-row count is checked.
#[derive(Debug)]
struct CheckedStatement {
    bind: Option<String>,
    statement: Built,
    versioned: bool,
}

#[derive(Debug)]
enum Built {
    Update(UpdateStatement),
    Delete(DeleteStatement),
}

/// Runs the steps of one flush plan.
pub(crate) struct Executor<'s, 'b, C> {
    registry: &'s MapperRegistry,
    states: &'s mut StateArena,
    events: &'s mut MapperEvents,
    tx: &'s mut Coordinator<'b, C>,
    pub(crate) result: FlushResult,
    /// Instances whose attributes were written outside their own Save step.
    pub(crate) touched: BTreeSet<InstanceId>,
    /// Inserted instances holding server defaults that could not be read back.
    pub(crate) expired: BTreeSet<InstanceId>,
}

impl<'s, 'b, C: Connection> Executor<'s, 'b, C> {
    pub(crate) fn new(
        registry: &'s MapperRegistry,
        states: &'s mut StateArena,
        events: &'s mut MapperEvents,
        tx: &'s mut Coordinator<'b, C>,
    ) -> Self {
        Self {
            registry,
            states,
            events,
            tx,
            result: FlushResult::new(),
            touched: BTreeSet::new(),
            expired: BTreeSet::new(),
        }
    }

    pub(crate) async fn run(&mut self, cx: &Cx, plan: &FlushPlan) -> Outcome<(), Error> {
        for &(new, old) in plan.row_switches() {
            let old_state = try_result!(self.states.get(old)).clone();
            try_result!(self.states.get_mut(new)).switch_from(&old_state);
            tracing::debug!(new = %new, old = %old, "Row switch: UPDATE replaces DELETE + INSERT");
        }

        for step in plan.steps() {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            if cx.is_cancel_requested() {
                return Outcome::Err(Error::Cancelled);
            }
            match step {
                FlushStep::Save { task, instances } => {
                    tracing::trace!(task = %task, count = instances.len(), "Save");
                    try_outcome!(self.save(cx, instances).await);
                }
                FlushStep::Process {
                    processor,
                    instances,
                    delete,
                } => {
                    let Some(p) = plan.processor(*processor) else {
                        return Outcome::Err(Error::invalid_state(format!(
                            "plan references unknown processor {}",
                            processor.0
                        )));
                    };
                    tracing::trace!(processor = %p.label(), delete, count = instances.len(), "Process");
                    let effects =
                        try_result!(p.process(self.states, instances, *delete, &plan.deleting));
                    try_outcome!(self.apply_effects(cx, p, effects).await);
                }
                FlushStep::Delete { task, instances } => {
                    tracing::trace!(task = %task, count = instances.len(), "Delete");
                    try_outcome!(self.delete(cx, instances).await);
                }
            }
        }
        Outcome::Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn dispatch(&mut self, event: MapperEvent, id: InstanceId) -> ormflush_core::Result<()> {
        let state = self.states.get_mut(id)?;
        self.events.dispatch(self.registry, event, id, state)
    }

    /// Tables touched by `ids`, base tables first.
    #[allow(clippy::result_large_err)]
    fn table_order(&self, ids: &[InstanceId]) -> ormflush_core::Result<Vec<String>> {
        let mut tables: Vec<String> = Vec::new();
        for &id in ids {
            for table in self.states.get(id)?.mapper().tables() {
                if !tables.contains(&table.name) {
                    tables.push(table.name.clone());
                }
            }
        }
        Ok(tables)
    }

    async fn save(&mut self, cx: &Cx, ids: &[InstanceId]) -> Outcome<(), Error> {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        for &id in ids {
            if try_result!(self.states.get(id)).key().is_none() {
                inserts.push(id);
            } else {
                updates.push(id);
            }
        }

        for &id in &inserts {
            try_result!(self.dispatch(MapperEvent::BeforeInsert, id));
            let state = try_result!(self.states.get_mut(id));
            let mapper = Arc::clone(state.mapper());
            if let Some(version) = mapper.version_attr() {
                if state.get(version).is_none_or(Value::is_null) {
                    try_result!(state.set(version, Value::BigInt(1)));
                }
            }
        }

        let mut old_versions = HashMap::new();
        for &id in &updates {
            try_result!(self.dispatch(MapperEvent::BeforeUpdate, id));
            let state = try_result!(self.states.get_mut(id));
            let mapper = Arc::clone(state.mapper());
            let Some(version) = mapper.version_attr() else {
                continue;
            };
            let bumped_by_user = state.history(version).is_some_and(|h| h.has_changes());
            let committed = state
                .history(version)
                .and_then(|h| h.committed().or(h.current()))
                .cloned()
                .unwrap_or(Value::Null);
            if !bumped_by_user && state.changed_attributes().is_empty() {
                continue;
            }
            if !bumped_by_user {
                let next = committed.as_i64().unwrap_or(0) + 1;
                try_result!(state.set(version, Value::BigInt(next)));
            }
            old_versions.insert(id, committed);
        }

        if !inserts.is_empty() {
            try_outcome!(self.emit_inserts(cx, &inserts).await);
        }
        if !updates.is_empty() {
            try_outcome!(self.emit_updates(cx, &updates, &old_versions).await);
        }

        for &id in &inserts {
            try_result!(self.dispatch(MapperEvent::AfterInsert, id));
        }
        for &id in &updates {
            try_result!(self.dispatch(MapperEvent::AfterUpdate, id));
        }
        Outcome::Ok(())
    }

    async fn emit_inserts(&mut self, cx: &Cx, ids: &[InstanceId]) -> Outcome<(), Error> {
        for table in try_result!(self.table_order(ids)) {
            let mut rows = Vec::new();
            for &id in ids {
                let state = try_result!(self.states.get(id));
                let mapper = state.mapper();
                if !mapper.tables().iter().any(|t| t.name == table) {
                    continue;
                }
                let mut row = PendingRow {
                    instance: id,
                    bind: mapper.bind().map(str::to_string),
                    columns: Vec::new(),
                    values: Vec::new(),
                    generated: Vec::new(),
                    fetched: Vec::new(),
                };
                for col in mapper.table_columns(&table) {
                    let value = state.get(&col.attr).filter(|v| !v.is_null());
                    let db_fills = col.autoincrement || col.server_default;
                    match value {
                        Some(v) => {
                            row.columns.push(col.column.clone());
                            row.values.push(v.clone());
                        }
                        None if db_fills => {
                            let pair = (col.column.clone(), col.attr.clone());
                            if col.primary_key {
                                row.generated.push(pair);
                            } else if col.server_default {
                                row.fetched.push(pair);
                            }
                        }
                        None => {
                            row.columns.push(col.column.clone());
                            row.values.push(Value::Null);
                        }
                    }
                }
                rows.push(row);
            }

            let mut start = 0;
            while start < rows.len() {
                let mut end = start + 1;
                while end < rows.len() && rows[end].same_shape(&rows[start]) {
                    end += 1;
                }
                try_outcome!(self.insert_group(cx, &table, &rows[start..end]).await);
                start = end;
            }
        }

        for &id in ids {
            let state = try_result!(self.states.get(id));
            if state.primary_key_values().is_none() {
                return Outcome::Err(Error::Flush(
                    FlushError::new(
                        FlushErrorKind::NullPrimaryKey,
                        format!(
                            "instance {} has a NULL primary key after INSERT; \
                             assign it or mark the column autoincrement",
                            id
                        ),
                    )
                    .with_mapper(state.mapper().name()),
                ));
            }
        }
        self.result.inserted += ids.len();
        Outcome::Ok(())
    }

    /// INSERT rows sharing one column list, as one statement when possible.
    async fn insert_group(&mut self, cx: &Cx, table: &str, group: &[PendingRow]) -> Outcome<(), Error> {
        let Some(first) = group.first() else {
            return Outcome::Ok(());
        };
        let conn = try_outcome!(self.tx.connection(cx, first.bind.as_deref()).await);
        let dialect = conn.dialect();
        let has_default = group
            .iter()
            .any(|r| r.values.iter().any(Value::is_server_computed));
        let mut read_back = first.generated.clone();
        if dialect.supports_returning() {
            read_back.extend(first.fetched.iter().cloned());
        } else {
            self.expired.extend(
                group
                    .iter()
                    .filter(|r| !r.fetched.is_empty())
                    .map(|r| r.instance),
            );
        }
        let returning: Vec<String> = read_back.iter().map(|(c, _)| c.clone()).collect();
        let batchable =
            !has_default && (returning.is_empty() || dialect.returning_preserves_order());
        let chunk_size = if batchable { group.len() } else { 1 };

        for chunk in group.chunks(chunk_size) {
            let mut stmt = InsertStatement::new(table, first.columns.clone());
            for row in chunk {
                stmt.push_row(row.values.clone());
            }
            self.result.statements += 1;

            if returning.is_empty() {
                let (sql, params) = stmt.build_with_dialect(dialect);
                tracing::debug!(table, rows = chunk.len(), sql = %sql, "INSERT");
                try_outcome!(conn.execute(cx, &sql, &params).await);
                continue;
            }

            if dialect.supports_returning() {
                let stmt = stmt.returning(returning.clone());
                let (sql, params) = stmt.build_with_dialect(dialect);
                tracing::debug!(table, rows = chunk.len(), sql = %sql, "INSERT ... RETURNING");
                let returned = try_outcome!(conn.query(cx, &sql, &params).await);
                if returned.len() != chunk.len() {
                    return Outcome::Err(Error::Flush(
                        FlushError::new(
                            FlushErrorKind::InvalidState,
                            format!(
                                "INSERT returned {} rows for {} instances",
                                returned.len(),
                                chunk.len()
                            ),
                        )
                        .with_table(table),
                    ));
                }
                for (row, keys) in chunk.iter().zip(returned) {
                    let state = try_result!(self.states.get_mut(row.instance));
                    for (i, (_, attr)) in read_back.iter().enumerate() {
                        let value = keys.get(i).cloned().unwrap_or(Value::Null);
                        try_result!(state.set(attr, value));
                    }
                }
                continue;
            }

            let [(_, attr)] = row_generated(chunk) else {
                return Outcome::Err(Error::Flush(
                    FlushError::new(
                        FlushErrorKind::NullPrimaryKey,
                        format!(
                            "{:?} can only report one generated key per INSERT without RETURNING",
                            dialect
                        ),
                    )
                    .with_table(table),
                ));
            };
            let (sql, params) = stmt.build_with_dialect(dialect);
            tracing::debug!(table, sql = %sql, "INSERT");
            let id = try_outcome!(conn.insert(cx, &sql, &params).await);
            try_result!(
                try_result!(self.states.get_mut(chunk[0].instance)).set(attr, Value::BigInt(id))
            );
        }
        Outcome::Ok(())
    }

    async fn emit_updates(
        &mut self,
        cx: &Cx,
        ids: &[InstanceId],
        old_versions: &HashMap<InstanceId, Value>,
    ) -> Outcome<(), Error> {
        let mut updated = BTreeSet::new();
        for table in try_result!(self.table_order(ids)) {
            let mut statements = Vec::new();
            for &id in ids {
                let state = try_result!(self.states.get(id));
                let mapper = state.mapper();
                if !mapper.tables().iter().any(|t| t.name == table) {
                    continue;
                }
                let mut stmt = UpdateStatement::new(table.clone());
                for col in mapper.table_columns(&table) {
                    if state.history(&col.attr).is_some_and(|h| h.has_changes()) {
                        stmt = stmt.set(col.column.clone(), state.value(&col.attr));
                    }
                }
                if stmt.is_empty() {
                    continue;
                }
                for (column, value) in try_result!(locate_row(id, state, &table, false)) {
                    stmt = stmt.filter(column, value);
                }
                let mut versioned = false;
                if let Some(version) = mapper.version_attr() {
                    if let Some(col) = mapper.table_columns(&table).find(|c| c.attr == version) {
                        let old = old_versions.get(&id).cloned().unwrap_or(Value::Null);
                        stmt = stmt.filter(col.column.clone(), old);
                        versioned = true;
                    }
                }
                statements.push(CheckedStatement {
                    bind: mapper.bind().map(str::to_string),
                    statement: Built::Update(stmt),
                    versioned,
                });
                updated.insert(id);
            }
            try_outcome!(self.run_checked(cx, &table, "UPDATE", statements).await);
        }
        self.result.updated += updated.len();
        Outcome::Ok(())
    }

    async fn delete(&mut self, cx: &Cx, ids: &[InstanceId]) -> Outcome<(), Error> {
        for &id in ids {
            try_result!(self.dispatch(MapperEvent::BeforeDelete, id));
        }

        let mut tables = try_result!(self.table_order(ids));
        tables.reverse();
        for table in tables {
            let mut statements = Vec::new();
            for &id in ids {
                let state = try_result!(self.states.get(id));
                let mapper = state.mapper();
                if !mapper.tables().iter().any(|t| t.name == table) {
                    continue;
                }
                let mut stmt = DeleteStatement::new(table.clone());
                for (column, value) in try_result!(locate_row(id, state, &table, true)) {
                    stmt = stmt.filter(column, value);
                }
                let mut versioned = false;
                if let Some(version) = mapper.version_attr() {
                    if let Some(col) = mapper.table_columns(&table).find(|c| c.attr == version) {
                        let committed = state
                            .history(version)
                            .and_then(|h| h.committed().or(h.current()))
                            .cloned()
                            .unwrap_or(Value::Null);
                        stmt = stmt.filter(col.column.clone(), committed);
                        versioned = true;
                    }
                }
                statements.push(CheckedStatement {
                    bind: mapper.bind().map(str::to_string),
                    statement: Built::Delete(stmt),
                    versioned,
                });
            }
            try_outcome!(self.run_checked(cx, &table, "DELETE", statements).await);
        }

        for &id in ids {
            try_result!(self.dispatch(MapperEvent::AfterDelete, id));
        }
        self.result.deleted += ids.len();
        Outcome::Ok(())
    }

    /// Send UPDATE/DELETE statements in per-connection batches and verify
    /// every one matched exactly one row.
    async fn run_checked(
        &mut self,
        cx: &Cx,
        table: &str,
        verb: &str,
        statements: Vec<CheckedStatement>,
    ) -> Outcome<(), Error> {
        let mut by_bind: Vec<(Option<String>, Vec<CheckedStatement>)> = Vec::new();
        for stmt in statements {
            match by_bind.iter_mut().find(|(bind, _)| *bind == stmt.bind) {
                Some((_, group)) => group.push(stmt),
                None => by_bind.push((stmt.bind.clone(), vec![stmt])),
            }
        }

        for (bind, group) in by_bind {
            let conn = try_outcome!(self.tx.connection(cx, bind.as_deref()).await);
            let dialect = conn.dialect();
            let built: Vec<(String, Vec<Value>)> = group
                .iter()
                .map(|s| match &s.statement {
                    Built::Update(stmt) => stmt.build_with_dialect(dialect),
                    Built::Delete(stmt) => stmt.build_with_dialect(dialect),
                })
                .collect();
            for (sql, _) in &built {
                tracing::debug!(table, sql = %sql, "{}", verb);
            }
            self.result.statements += built.len();
            let counts = try_outcome!(conn.batch(cx, &built).await);

            if !conn.supports_rowcount() {
                continue;
            }
            let matched: u64 = counts.iter().sum();
            let expected = group.len() as u64;
            if matched != expected {
                let versioned = group.iter().any(|s| s.versioned);
                let kind = if versioned {
                    FlushErrorKind::VersionConflict
                } else {
                    FlushErrorKind::StaleData
                };
                return Outcome::Err(Error::Flush(
                    FlushError::new(
                        kind,
                        format!(
                            "{} statement on table '{}' expected to {} {} row(s); {} were matched.",
                            verb,
                            table,
                            verb.to_lowercase(),
                            expected,
                            matched
                        ),
                    )
                    .with_table(table),
                ));
            }
        }
        Outcome::Ok(())
    }

    async fn apply_effects(
        &mut self,
        cx: &Cx,
        processor: &DependencyProcessor,
        effects: Vec<SyncEffect>,
    ) -> Outcome<(), Error> {
        let mut post_updates = Vec::new();
        let mut link_inserts: Vec<(String, Vec<String>, Vec<Vec<Value>>)> = Vec::new();
        let mut link_deletes: Vec<(String, DeleteStatement)> = Vec::new();
        for effect in effects {
            match effect {
                SyncEffect::PostUpdate { instance, attrs } => post_updates.push((instance, attrs)),
                SyncEffect::LinkInsert {
                    table,
                    columns,
                    values,
                } => match link_inserts
                    .iter_mut()
                    .find(|(t, c, _)| *t == table && *c == columns)
                {
                    Some((_, _, rows)) => rows.push(values),
                    None => link_inserts.push((table, columns, vec![values])),
                },
                SyncEffect::LinkDelete { table, filter } => {
                    let stmt = filter
                        .into_iter()
                        .fold(DeleteStatement::new(table.clone()), |s, (c, v)| s.filter(c, v));
                    link_deletes.push((table, stmt));
                }
            }
        }

        if !post_updates.is_empty() {
            try_outcome!(self.post_update(cx, &post_updates).await);
        }
        if link_deletes.is_empty() && link_inserts.is_empty() {
            return Outcome::Ok(());
        }

        let owner = try_result!(self.registry.get(processor.owner()));
        let bind = owner.bind().map(str::to_string);
        let mut deletes_by_table: Vec<(String, Vec<CheckedStatement>)> = Vec::new();
        for (table, stmt) in link_deletes {
            let checked = CheckedStatement {
                bind: bind.clone(),
                statement: Built::Delete(stmt),
                versioned: false,
            };
            match deletes_by_table.iter_mut().find(|(t, _)| *t == table) {
                Some((_, group)) => group.push(checked),
                None => deletes_by_table.push((table, vec![checked])),
            }
        }
        for (table, statements) in deletes_by_table {
            try_outcome!(self.run_checked(cx, &table, "DELETE", statements).await);
        }

        if link_inserts.is_empty() {
            return Outcome::Ok(());
        }
        let conn = try_outcome!(self.tx.connection(cx, bind.as_deref()).await);
        for (table, columns, rows) in link_inserts {
            let stmt = rows
                .into_iter()
                .fold(InsertStatement::new(table.clone(), columns), |s, r| s.row(r));
            let (sql, params) = stmt.build_with_dialect(conn.dialect());
            tracing::debug!(table = %table, rows = stmt.row_count(), sql = %sql, "INSERT association");
            self.result.statements += 1;
            try_outcome!(conn.execute(cx, &sql, &params).await);
        }
        Outcome::Ok(())
    }

    /// UPDATE only the foreign-key attributes a post-update processor set.
    async fn post_update(&mut self, cx: &Cx, targets: &[(InstanceId, Vec<String>)]) -> Outcome<(), Error> {
        let tables = try_result!(self.table_order(
            &targets.iter().map(|(id, _)| *id).collect::<Vec<_>>()
        ));
        for table in tables {
            let mut statements = Vec::new();
            for (id, attrs) in targets {
                let state = try_result!(self.states.get(*id));
                let mapper = state.mapper();
                let mut stmt = UpdateStatement::new(table.clone());
                for col in mapper.table_columns(&table) {
                    if attrs.contains(&col.attr) {
                        stmt = stmt.set(col.column.clone(), state.value(&col.attr));
                    }
                }
                if stmt.is_empty() {
                    continue;
                }
                for col in mapper.table_pk_columns(&table) {
                    let value = state.value(&col.attr);
                    if value.is_null() {
                        return Outcome::Err(null_key(mapper, &table, *id, false));
                    }
                    stmt = stmt.filter(col.column.clone(), value);
                }
                statements.push(CheckedStatement {
                    bind: mapper.bind().map(str::to_string),
                    statement: Built::Update(stmt),
                    versioned: false,
                });
                self.touched.insert(*id);
            }
            try_outcome!(self.run_checked(cx, &table, "UPDATE", statements).await);
        }
        Outcome::Ok(())
    }
}

fn row_generated(chunk: &[PendingRow]) -> &[(String, String)] {
    chunk.first().map_or(&[], |row| row.generated.as_slice())
}

fn null_key(mapper: &Mapper, table: &str, id: InstanceId, delete: bool) -> Error {
    let action = if delete { "delete from" } else { "update" };
    Error::Flush(
        FlushError::new(
            FlushErrorKind::NullPrimaryKey,
            format!(
                "Can't {} table '{}' using NULL for primary key value (instance {})",
                action, table, id
            ),
        )
        .with_mapper(mapper.name())
        .with_table(table),
    )
}

/// WHERE predicates on the committed primary key of `table`.
#[allow(clippy::result_large_err)]
fn locate_row(
    id: InstanceId,
    state: &InstanceState,
    table: &str,
    delete: bool,
) -> ormflush_core::Result<Vec<(String, Value)>> {
    let mapper = state.mapper();
    let mut filter = Vec::new();
    for col in mapper.table_pk_columns(table) {
        let value = state
            .history(&col.attr)
            .and_then(|h| h.committed().or(h.current()))
            .cloned()
            .unwrap_or(Value::Null);
        if value.is_null() {
            return Err(null_key(mapper, table, id, delete));
        }
        filter.push((col.column.clone(), value));
    }
    Ok(filter)
}
