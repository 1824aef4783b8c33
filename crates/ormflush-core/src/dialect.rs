//! SQL dialect differences the persistence layer needs to know about.

/// SQL dialect for generating dialect-specific SQL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Properly escapes embedded quote characters by doubling them:
    /// - For Postgres/SQLite: `"` becomes `""`
    /// - For MySQL: `` ` `` becomes ``` `` ```
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }

    /// Whether `INSERT ... RETURNING` is available.
    pub const fn supports_returning(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Sqlite)
    }

    /// Whether a multi-row `INSERT ... RETURNING` yields rows in VALUES order.
    ///
    /// SQLite leaves the order of RETURNING rows unspecified, so generated
    /// keys can only be matched to rows one statement at a time.
    pub const fn returning_preserves_order(self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    /// Whether PREPARE TRANSACTION / COMMIT PREPARED are available.
    pub const fn supports_two_phase(self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    /// Statement opening a transaction.
    pub const fn begin_sql(self) -> &'static str {
        match self {
            Dialect::Mysql => "START TRANSACTION",
            Dialect::Postgres | Dialect::Sqlite => "BEGIN",
        }
    }

    /// Statement preparing the current transaction for two-phase commit.
    pub fn prepare_sql(self, xid: &str) -> Option<String> {
        match self {
            Dialect::Postgres => Some(format!("PREPARE TRANSACTION '{}'", xid.replace('\'', "''"))),
            Dialect::Sqlite | Dialect::Mysql => None,
        }
    }

    /// Statement committing a prepared transaction.
    pub fn commit_prepared_sql(self, xid: &str) -> Option<String> {
        match self {
            Dialect::Postgres => Some(format!("COMMIT PREPARED '{}'", xid.replace('\'', "''"))),
            Dialect::Sqlite | Dialect::Mysql => None,
        }
    }

    /// Statement rolling back a prepared transaction.
    pub fn rollback_prepared_sql(self, xid: &str) -> Option<String> {
        match self {
            Dialect::Postgres => Some(format!("ROLLBACK PREPARED '{}'", xid.replace('\'', "''"))),
            Dialect::Sqlite | Dialect::Mysql => None,
        }
    }
}
