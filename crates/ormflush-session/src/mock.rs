//! Recording connection used by the unit tests.

use asupersync::types::{CancelKind, CancelReason};
use asupersync::{Cx, Outcome};
use ormflush_core::{Connection, Dialect, Error, QueryError, QueryErrorKind, Row, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct MockState {
    statements: Vec<(String, Vec<Value>)>,
    last_id: i64,
    rowcounts: VecDeque<u64>,
    fail_on: Option<String>,
    cancel_on: Option<String>,
}

/// Records every statement; generated keys count up from 1.
///
/// UPDATE and DELETE report one affected row unless a count was scripted
/// with [`MockConnection::script_rowcount`].
#[derive(Debug, Clone)]
pub(crate) struct MockConnection {
    state: Arc<Mutex<MockState>>,
    dialect: Dialect,
}

impl MockConnection {
    pub(crate) fn new(dialect: Dialect) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            dialect,
        }
    }

    pub(crate) fn statements(&self) -> Vec<String> {
        let guard = self.state.lock().expect("lock poisoned");
        guard.statements.iter().map(|(sql, _)| sql.clone()).collect()
    }

    pub(crate) fn params(&self, index: usize) -> Vec<Value> {
        let guard = self.state.lock().expect("lock poisoned");
        guard.statements[index].1.clone()
    }

    pub(crate) fn clear(&self) {
        self.state.lock().expect("lock poisoned").statements.clear();
    }

    pub(crate) fn script_rowcount(&self, count: u64) {
        self.state
            .lock()
            .expect("lock poisoned")
            .rowcounts
            .push_back(count);
    }

    /// Fail the first statement containing `fragment`.
    pub(crate) fn fail_on(&self, fragment: &str) {
        self.state.lock().expect("lock poisoned").fail_on = Some(fragment.to_string());
    }

    /// Report the first statement containing `fragment` as cancelled.
    pub(crate) fn cancel_on(&self, fragment: &str) {
        self.state.lock().expect("lock poisoned").cancel_on = Some(fragment.to_string());
    }

    fn cancelled(&self, sql: &str) -> Option<CancelReason> {
        let mut guard = self.state.lock().expect("lock poisoned");
        if guard.cancel_on.as_deref().is_some_and(|f| sql.contains(f)) {
            guard.cancel_on = None;
            return Some(CancelReason::new(CancelKind::User));
        }
        None
    }

    fn record(&self, sql: &str, params: &[Value]) -> Result<(), Error> {
        let mut guard = self.state.lock().expect("lock poisoned");
        guard.statements.push((sql.to_string(), params.to_vec()));
        if guard.fail_on.as_deref().is_some_and(|f| sql.contains(f)) {
            guard.fail_on = None;
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Constraint,
                sql: Some(sql.to_string()),
                sqlstate: Some("23505".into()),
                message: "duplicate key value violates unique constraint".into(),
                source: None,
            }));
        }
        Ok(())
    }

    fn affected(&self, sql: &str) -> u64 {
        let mut guard = self.state.lock().expect("lock poisoned");
        if sql.starts_with("UPDATE") || sql.starts_with("DELETE") {
            guard.rowcounts.pop_front().unwrap_or(1)
        } else {
            0
        }
    }

    fn next_id(&self) -> i64 {
        let mut guard = self.state.lock().expect("lock poisoned");
        guard.last_id += 1;
        guard.last_id
    }
}

impl Connection for MockConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let cancelled = self.cancelled(sql);
        let result = self.record(sql, params).map(|()| {
            let rows = sql.matches("), (").count() + 1;
            let returning = sql
                .split(" RETURNING ")
                .nth(1)
                .map_or(0, |cols| cols.split(", ").count());
            (0..rows)
                .map(|_| {
                    let names = (0..returning).map(|i| format!("k{i}")).collect();
                    let values = (0..returning)
                        .map(|_| Value::BigInt(self.next_id()))
                        .collect();
                    Row::new(names, values)
                })
                .collect()
        });
        async move {
            if let Some(reason) = cancelled {
                return Outcome::Cancelled(reason);
            }
            match result {
                Ok(rows) => Outcome::Ok(rows),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let cancelled = self.cancelled(sql);
        let result = self.record(sql, params).map(|()| self.affected(sql));
        async move {
            if let Some(reason) = cancelled {
                return Outcome::Cancelled(reason);
            }
            match result {
                Ok(n) => Outcome::Ok(n),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let cancelled = self.cancelled(sql);
        let result = self.record(sql, params).map(|()| self.next_id());
        async move {
            if let Some(reason) = cancelled {
                return Outcome::Cancelled(reason);
            }
            match result {
                Ok(id) => Outcome::Ok(id),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn batch(
        &self,
        _cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        let cancelled = statements.iter().find_map(|(sql, _)| self.cancelled(sql));
        let result: Result<Vec<u64>, Error> = statements
            .iter()
            .map(|(sql, params)| self.record(sql, params).map(|()| self.affected(sql)))
            .collect();
        async move {
            if let Some(reason) = cancelled {
                return Outcome::Cancelled(reason);
            }
            match result {
                Ok(counts) => Outcome::Ok(counts),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }

    fn close(self, _cx: &Cx) -> impl Future<Output = ormflush_core::Result<()>> + Send {
        async { Ok(()) }
    }
}
