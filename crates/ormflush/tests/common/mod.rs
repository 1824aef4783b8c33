//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};

use ormflush::{Connection, Cx, Dialect, Error, Outcome, Row, Value};
use ormflush_core::{QueryError, QueryErrorKind};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => std::panic::panic_any(format!("unexpected error: {e}")),
        Outcome::Cancelled(r) => std::panic::panic_any(format!("cancelled: {r:?}")),
        Outcome::Panicked(p) => std::panic::panic_any(p),
    }
}

pub fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

#[derive(Debug, Default)]
struct Log {
    statements: Vec<(String, Vec<Value>)>,
    next_key: i64,
    rowcounts: Vec<u64>,
    fail_on: Option<String>,
}

/// Connection that records `(sql, params)` and answers like a cooperative database.
///
/// Every RETURNING row gets the next key from a per-connection counter.
#[derive(Debug, Clone)]
pub struct RecordingConnection {
    log: Arc<Mutex<Log>>,
    dialect: Dialect,
}

impl RecordingConnection {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            log: Arc::new(Mutex::new(Log::default())),
            dialect,
        }
    }

    pub fn postgres() -> Self {
        Self::new(Dialect::Postgres)
    }

    pub fn sql(&self) -> Vec<String> {
        let log = self.log.lock().unwrap();
        log.statements.iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn entries(&self) -> Vec<(String, Vec<Value>)> {
        self.log.lock().unwrap().statements.clone()
    }

    pub fn params_of(&self, sql: &str) -> Vec<Value> {
        let log = self.log.lock().unwrap();
        log.statements
            .iter()
            .find(|(s, _)| s == sql)
            .map(|(_, p)| p.clone())
            .unwrap_or_default()
    }

    pub fn reset(&self) {
        self.log.lock().unwrap().statements.clear();
    }

    /// Next UPDATE/DELETE reports `count` matched rows.
    pub fn matched_next(&self, count: u64) {
        self.log.lock().unwrap().rowcounts.push(count);
    }

    pub fn fail_on(&self, fragment: &str) {
        self.log.lock().unwrap().fail_on = Some(fragment.to_string());
    }

    fn run(&self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        let mut log = self.log.lock().unwrap();
        log.statements.push((sql.to_string(), params.to_vec()));
        if log.fail_on.as_deref().is_some_and(|f| sql.contains(f)) {
            log.fail_on = None;
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Constraint,
                sql: Some(sql.to_string()),
                sqlstate: Some("23503".to_string()),
                message: "violates foreign key constraint".to_string(),
                source: None,
            }));
        }
        if sql.starts_with("UPDATE") || sql.starts_with("DELETE") {
            if log.rowcounts.is_empty() {
                Ok(1)
            } else {
                Ok(log.rowcounts.remove(0))
            }
        } else {
            Ok(0)
        }
    }

    fn key(&self) -> i64 {
        let mut log = self.log.lock().unwrap();
        log.next_key += 1;
        log.next_key
    }
}

fn ready<T: Send>(result: Result<T, Error>) -> impl Future<Output = Outcome<T, Error>> + Send {
    async move {
        match result {
            Ok(v) => Outcome::Ok(v),
            Err(e) => Outcome::Err(e),
        }
    }
}

impl Connection for RecordingConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.run(sql, params).map(|_| {
            let rows = sql.matches("), (").count() + 1;
            let returning = sql
                .split(" RETURNING ")
                .nth(1)
                .map_or(0, |cols| cols.split(", ").count());
            (0..rows)
                .map(|_| {
                    Row::new(
                        (0..returning).map(|i| format!("c{i}")).collect(),
                        (0..returning).map(|_| Value::BigInt(self.key())).collect(),
                    )
                })
                .collect()
        });
        ready(result)
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        ready(self.run(sql, params))
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        ready(self.run(sql, params).map(|_| self.key()))
    }

    fn batch(
        &self,
        _cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        ready(
            statements
                .iter()
                .map(|(sql, params)| self.run(sql, params))
                .collect(),
        )
    }

    fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }

    fn close(self, _cx: &Cx) -> impl Future<Output = ormflush::Result<()>> + Send {
        async { Ok(()) }
    }
}
