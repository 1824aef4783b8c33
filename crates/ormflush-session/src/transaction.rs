//! Transaction coordination across the connections a flush touches.
//!
//! A transaction is begun lazily on each connection the first time a
//! statement needs it. Commit walks the begun connections in order, either
//! committing each in turn or, in two-phase mode, preparing all of them
//! before committing any. Rollback is attempted on every begun connection
//! regardless of which one failed.

use asupersync::{Cx, Outcome};
use ormflush_core::{
    Connection, Dialect, Error, IsolationLevel, TransactionError, TransactionErrorKind,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_XID: AtomicU64 = AtomicU64::new(1);

/// The connections a session writes through: a default one plus named binds.
///
/// Mappers select a named bind with `Mapper::builder(..).bind("name")`.
#[derive(Debug)]
pub struct Binds<C> {
    default: C,
    named: BTreeMap<String, C>,
}

impl<C: Connection> Binds<C> {
    pub fn new(default: C) -> Self {
        Self {
            default,
            named: BTreeMap::new(),
        }
    }

    /// Register a named connection, returning the one it replaces.
    pub fn insert(&mut self, name: impl Into<String>, conn: C) -> Option<C> {
        self.named.insert(name.into(), conn)
    }

    #[allow(clippy::result_large_err)]
    pub fn get(&self, bind: Option<&str>) -> ormflush_core::Result<&C> {
        match bind {
            None => Ok(&self.default),
            Some(name) => self
                .named
                .get(name)
                .ok_or_else(|| Error::config(format!("no connection bound for '{}'", name))),
        }
    }

    pub fn default_connection(&self) -> &C {
        &self.default
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.named.keys().map(String::as_str)
    }
}

/// Statements opening a transaction at `isolation`.
fn begin_statements(dialect: Dialect, isolation: Option<IsolationLevel>) -> Vec<String> {
    match (dialect, isolation) {
        (_, None) => vec![dialect.begin_sql().to_string()],
        (Dialect::Postgres, Some(level)) => {
            vec![format!("BEGIN ISOLATION LEVEL {}", level.as_sql())]
        }
        (Dialect::Mysql, Some(level)) => vec![
            format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()),
            dialect.begin_sql().to_string(),
        ],
        (Dialect::Sqlite, Some(level)) => {
            tracing::debug!(isolation = level.as_sql(), "SQLite ignores isolation levels");
            vec![dialect.begin_sql().to_string()]
        }
    }
}

async fn run<C: Connection>(cx: &Cx, conn: &C, sql: &str) -> Outcome<u64, Error> {
    tracing::debug!(sql, "Transaction control");
    conn.execute(cx, sql, &[]).await
}

fn discard<T>(outcome: Outcome<T, Error>) -> Outcome<(), Error> {
    match outcome {
        Outcome::Ok(_) => Outcome::Ok(()),
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

/// Run a statement whose failure must not mask the error being handled.
async fn best_effort<C: Connection>(cx: &Cx, conn: &C, sql: &str) {
    match run(cx, conn, sql).await {
        Outcome::Ok(_) => {}
        Outcome::Err(e) => tracing::warn!(sql, error = %e, "Rollback statement failed"),
        Outcome::Cancelled(r) => tracing::warn!(sql, reason = ?r, "Rollback statement cancelled"),
        Outcome::Panicked(p) => tracing::warn!(sql, panic = ?p, "Rollback statement panicked"),
    }
}

/// Tracks which connections hold an open transaction during a flush or
/// session transaction.
#[derive(Debug)]
pub(crate) struct Coordinator<'b, C> {
    binds: &'b Binds<C>,
    isolation: Option<IsolationLevel>,
    /// Binds with an open transaction, in the order they were begun.
    begun: Vec<Option<String>>,
    /// Savepoint opened on each connection before its first statement.
    savepoint: Option<String>,
    savepoints_open: Vec<Option<String>>,
    statements: usize,
}

impl<'b, C: Connection> Coordinator<'b, C> {
    /// `begun` lists binds whose transaction is already open, e.g. by an
    /// earlier flush inside the same session transaction.
    pub(crate) fn new(
        binds: &'b Binds<C>,
        isolation: Option<IsolationLevel>,
        begun: Vec<Option<String>>,
        savepoint: Option<String>,
    ) -> Self {
        Self {
            binds,
            isolation,
            begun,
            savepoint,
            savepoints_open: Vec::new(),
            statements: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn begun(&self) -> &[Option<String>] {
        &self.begun
    }

    pub(crate) fn into_begun(self) -> Vec<Option<String>> {
        self.begun
    }

    /// Transaction-control statements sent so far.
    pub(crate) fn statements(&self) -> usize {
        self.statements
    }

    /// The connection for `bind`, with a transaction (and savepoint) open on it.
    pub(crate) async fn connection(&mut self, cx: &Cx, bind: Option<&str>) -> Outcome<&'b C, Error> {
        let conn = match self.binds.get(bind) {
            Ok(conn) => conn,
            Err(e) => return Outcome::Err(e),
        };
        let key = bind.map(str::to_string);

        if !self.begun.contains(&key) {
            for sql in begin_statements(conn.dialect(), self.isolation) {
                self.statements += 1;
                ormflush_core::try_outcome!(run(cx, conn, &sql).await);
            }
            tracing::debug!(bind = ?key, "Transaction begun");
            self.begun.push(key.clone());
        }

        if let Some(name) = &self.savepoint {
            if !self.savepoints_open.contains(&key) {
                let sql = format!("SAVEPOINT {}", conn.dialect().quote_identifier(name));
                self.statements += 1;
                ormflush_core::try_outcome!(run(cx, conn, &sql).await);
                self.savepoints_open.push(key);
            }
        }

        Outcome::Ok(conn)
    }

    fn conn(&self, bind: &Option<String>) -> ormflush_core::Result<&'b C> {
        self.binds.get(bind.as_deref())
    }

    /// Commit every begun connection.
    pub(crate) async fn commit(&mut self, cx: &Cx, two_phase: bool) -> Outcome<(), Error> {
        if self.begun.is_empty() {
            return Outcome::Ok(());
        }
        if two_phase {
            return self.commit_two_phase(cx).await;
        }

        let begun = std::mem::take(&mut self.begun);
        for (i, key) in begun.iter().enumerate() {
            let conn = match self.conn(key) {
                Ok(conn) => conn,
                Err(e) => {
                    self.begun = begun[i..].to_vec();
                    self.rollback(cx).await;
                    return Outcome::Err(e);
                }
            };
            self.statements += 1;
            let outcome = run(cx, conn, "COMMIT").await;
            if !matches!(outcome, Outcome::Ok(_)) {
                if i > 0 {
                    tracing::warn!(
                        committed = i,
                        bind = ?key,
                        "COMMIT failed after earlier connections committed"
                    );
                }
                self.begun = begun[i..].to_vec();
                self.rollback(cx).await;
                return discard(outcome);
            }
        }
        tracing::debug!(connections = begun.len(), "Transaction committed");
        Outcome::Ok(())
    }

    async fn commit_two_phase(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let begun = self.begun.clone();
        let mut targets = Vec::with_capacity(begun.len());
        for key in &begun {
            match self.conn(key) {
                Ok(conn) if conn.dialect().supports_two_phase() => targets.push(conn),
                Ok(conn) => {
                    let dialect = conn.dialect();
                    self.rollback(cx).await;
                    return Outcome::Err(Error::Transaction(TransactionError {
                        kind: TransactionErrorKind::TwoPhaseNotSupported,
                        message: format!("two-phase commit is not supported by {:?}", dialect),
                    }));
                }
                Err(e) => {
                    self.rollback(cx).await;
                    return Outcome::Err(e);
                }
            }
        }

        let base = NEXT_XID.fetch_add(1, Ordering::Relaxed);
        let mut prepared: Vec<(&C, String)> = Vec::new();
        for (i, conn) in targets.iter().enumerate() {
            let xid = format!("ormflush-{}-{}-{}", std::process::id(), base, i);
            let Some(sql) = conn.dialect().prepare_sql(&xid) else {
                continue;
            };
            self.statements += 1;
            let outcome = run(cx, *conn, &sql).await;
            if !matches!(outcome, Outcome::Ok(_)) {
                for (conn, xid) in &prepared {
                    if let Some(sql) = conn.dialect().rollback_prepared_sql(xid) {
                        self.statements += 1;
                        best_effort(cx, *conn, &sql).await;
                    }
                }
                // The failed connection and the unprepared ones still hold open transactions.
                for conn in &targets[i..] {
                    self.statements += 1;
                    best_effort(cx, *conn, "ROLLBACK").await;
                }
                self.begun.clear();
                return discard(outcome);
            }
            prepared.push((*conn, xid));
        }

        self.begun.clear();
        for (conn, xid) in &prepared {
            let Some(sql) = conn.dialect().commit_prepared_sql(xid) else {
                continue;
            };
            self.statements += 1;
            let outcome = run(cx, *conn, &sql).await;
            if !matches!(outcome, Outcome::Ok(_)) {
                tracing::error!(xid = %xid, "COMMIT PREPARED failed; transaction left in doubt");
                return discard(outcome);
            }
        }
        tracing::debug!(connections = prepared.len(), "Two-phase transaction committed");
        Outcome::Ok(())
    }

    /// Roll back every begun connection. Failures are logged, never returned.
    pub(crate) async fn rollback(&mut self, cx: &Cx) {
        let begun = std::mem::take(&mut self.begun);
        self.savepoints_open.clear();
        for key in &begun {
            match self.conn(key) {
                Ok(conn) => {
                    self.statements += 1;
                    best_effort(cx, conn, "ROLLBACK").await;
                }
                Err(e) => tracing::warn!(bind = ?key, error = %e, "Cannot roll back unknown bind"),
            }
        }
        if !begun.is_empty() {
            tracing::debug!(connections = begun.len(), "Transaction rolled back");
        }
    }

    /// Release the flush savepoint on every connection that opened it.
    pub(crate) async fn release_savepoints(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let Some(name) = self.savepoint.clone() else {
            return Outcome::Ok(());
        };
        for key in std::mem::take(&mut self.savepoints_open) {
            let conn = match self.conn(&key) {
                Ok(conn) => conn,
                Err(e) => return Outcome::Err(e),
            };
            let sql = format!("RELEASE SAVEPOINT {}", conn.dialect().quote_identifier(&name));
            self.statements += 1;
            ormflush_core::try_outcome!(run(cx, conn, &sql).await);
        }
        Outcome::Ok(())
    }

    /// Undo the flush back to its savepoint, leaving the outer transaction open.
    pub(crate) async fn rollback_to_savepoints(&mut self, cx: &Cx) {
        let Some(name) = self.savepoint.clone() else {
            return;
        };
        for key in std::mem::take(&mut self.savepoints_open) {
            match self.conn(&key) {
                Ok(conn) => {
                    let sql = format!(
                        "ROLLBACK TO SAVEPOINT {}",
                        conn.dialect().quote_identifier(&name)
                    );
                    self.statements += 1;
                    best_effort(cx, conn, &sql).await;
                }
                Err(e) => tracing::warn!(bind = ?key, error = %e, "Cannot roll back unknown bind"),
            }
        }
    }
}
