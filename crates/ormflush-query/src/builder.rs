//! Statement descriptions for INSERT, UPDATE and DELETE.
//!
//! The unit of work describes each write as one of these statements and
//! compiles it for the target connection's dialect into SQL text plus
//! positional bind parameters.

use asupersync::{Cx, Outcome};
use ormflush_core::{Connection, Dialect, Error, Row, Value};

/// Render `col = $n` (or `col IS NULL`) predicates joined by AND.
fn render_filter(
    dialect: Dialect,
    filter: &[(String, Value)],
    params: &mut Vec<Value>,
) -> String {
    let mut clauses = Vec::with_capacity(filter.len());
    for (col, value) in filter {
        if value.is_null() {
            clauses.push(format!("{} IS NULL", dialect.quote_identifier(col)));
        } else {
            params.push(value.clone());
            clauses.push(format!(
                "{} = {}",
                dialect.quote_identifier(col),
                dialect.placeholder(params.len())
            ));
        }
    }
    clauses.join(" AND ")
}

/// Multi-row INSERT.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    table: String,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    returning: Vec<String>,
}

impl InsertStatement {
    /// Create an INSERT into `table` with the given column list.
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            columns,
            rows: Vec::new(),
            returning: Vec::new(),
        }
    }

    /// Append one VALUES row; must line up with the column list.
    pub fn row(mut self, values: Vec<Value>) -> Self {
        self.push_row(values);
        self
    }

    pub fn push_row(&mut self, values: Vec<Value>) {
        debug_assert_eq!(values.len(), self.columns.len());
        self.rows.push(values);
    }

    /// Request generated column values back (`RETURNING`).
    pub fn returning(mut self, columns: Vec<String>) -> Self {
        self.returning = columns;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn has_returning(&self) -> bool {
        !self.returning.is_empty()
    }

    /// Build the INSERT SQL and parameters with default dialect (Postgres).
    pub fn build(&self) -> (String, Vec<Value>) {
        self.build_with_dialect(Dialect::default())
    }

    /// Build the INSERT SQL and parameters with specific dialect.
    ///
    /// `Value::Default` renders as the `DEFAULT` keyword and binds nothing.
    /// An INSERT with no columns renders `DEFAULT VALUES`.
    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let table = dialect.quote_identifier(&self.table);
        let mut params = Vec::new();

        let mut sql = if self.columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", table)
        } else {
            let columns: Vec<_> = self
                .columns
                .iter()
                .map(|c| dialect.quote_identifier(c))
                .collect();
            let mut groups = Vec::with_capacity(self.rows.len());
            for row in &self.rows {
                let mut slots = Vec::with_capacity(row.len());
                for value in row {
                    if value.is_server_computed() {
                        slots.push("DEFAULT".to_string());
                    } else {
                        params.push(value.clone());
                        slots.push(dialect.placeholder(params.len()));
                    }
                }
                groups.push(format!("({})", slots.join(", ")));
            }
            format!(
                "INSERT INTO {} ({}) VALUES {}",
                table,
                columns.join(", "),
                groups.join(", ")
            )
        };

        if !self.returning.is_empty() {
            let returning: Vec<_> = self
                .returning
                .iter()
                .map(|c| dialect.quote_identifier(c))
                .collect();
            sql.push_str(" RETURNING ");
            sql.push_str(&returning.join(", "));
        }

        (sql, params)
    }

    /// Execute with `RETURNING` and collect the generated rows.
    pub async fn fetch<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<Vec<Row>, Error> {
        let (sql, params) = self.build_with_dialect(conn.dialect());
        conn.query(cx, &sql, &params).await
    }

    /// Execute and return rows affected.
    pub async fn execute<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<u64, Error> {
        let (sql, params) = self.build_with_dialect(conn.dialect());
        conn.execute(cx, &sql, &params).await
    }

    /// Execute a single-row INSERT and return the database-generated ID.
    pub async fn execute_returning_id<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
    ) -> Outcome<i64, Error> {
        let (sql, params) = self.build_with_dialect(conn.dialect());
        conn.insert(cx, &sql, &params).await
    }
}

/// Single-row UPDATE located by a column filter.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    table: String,
    set: Vec<(String, Value)>,
    filter: Vec<(String, Value)>,
}

impl UpdateStatement {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            set: Vec::new(),
            filter: Vec::new(),
        }
    }

    /// Add a `column = value` assignment.
    pub fn set(mut self, column: impl Into<String>, value: Value) -> Self {
        self.set.push((column.into(), value));
        self
    }

    /// Add a `column = value` predicate to the WHERE clause.
    pub fn filter(mut self, column: impl Into<String>, value: Value) -> Self {
        self.filter.push((column.into(), value));
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Build the UPDATE SQL and parameters with default dialect (Postgres).
    pub fn build(&self) -> (String, Vec<Value>) {
        self.build_with_dialect(Dialect::default())
    }

    /// Build the UPDATE SQL and parameters with specific dialect.
    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut set_clauses = Vec::with_capacity(self.set.len());

        for (col, value) in &self.set {
            if value.is_server_computed() {
                set_clauses.push(format!("{} = DEFAULT", dialect.quote_identifier(col)));
            } else {
                params.push(value.clone());
                set_clauses.push(format!(
                    "{} = {}",
                    dialect.quote_identifier(col),
                    dialect.placeholder(params.len())
                ));
            }
        }

        let mut sql = format!(
            "UPDATE {} SET {}",
            dialect.quote_identifier(&self.table),
            set_clauses.join(", ")
        );

        if !self.filter.is_empty() {
            let where_sql = render_filter(dialect, &self.filter, &mut params);
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }

        (sql, params)
    }

    /// Execute the UPDATE and return rows affected.
    pub async fn execute<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<u64, Error> {
        let (sql, params) = self.build_with_dialect(conn.dialect());
        conn.execute(cx, &sql, &params).await
    }
}

/// DELETE located by a column filter.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    table: String,
    filter: Vec<(String, Value)>,
}

impl DeleteStatement {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: Vec::new(),
        }
    }

    /// Add a `column = value` predicate to the WHERE clause.
    pub fn filter(mut self, column: impl Into<String>, value: Value) -> Self {
        self.filter.push((column.into(), value));
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Build the DELETE SQL and parameters with default dialect (Postgres).
    pub fn build(&self) -> (String, Vec<Value>) {
        self.build_with_dialect(Dialect::default())
    }

    /// Build the DELETE SQL and parameters with specific dialect.
    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut sql = format!("DELETE FROM {}", dialect.quote_identifier(&self.table));
        let mut params = Vec::new();

        if !self.filter.is_empty() {
            let where_sql = render_filter(dialect, &self.filter, &mut params);
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }

        (sql, params)
    }

    /// Execute the DELETE and return rows affected.
    pub async fn execute<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<u64, Error> {
        let (sql, params) = self.build_with_dialect(conn.dialect());
        conn.execute(cx, &sql, &params).await
    }
}
