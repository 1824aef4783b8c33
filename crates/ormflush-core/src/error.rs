//! Error types for ormflush operations.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// The primary error type for all ormflush operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, timeout)
    Connection(ConnectionError),
    /// Query execution errors
    Query(QueryError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Pool errors
    Pool(PoolError),
    /// Configuration errors (mapper compilation, session and pool settings)
    Config(ConfigError),
    /// Unit-of-work flush errors
    Flush(FlushError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Connection lost during operation
    Disconnected,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// A transaction is already open where a new one was requested
    AlreadyActive,
    /// No transaction is open
    NotActive,
    /// Two-phase commit not supported by the dialect
    TwoPhaseNotSupported,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Connection checkout timeout
    Timeout,
    /// Pool is closed
    Closed,
    /// Configuration error
    Config,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// A failure raised by the unit of work while building or executing a flush.
#[derive(Debug, Clone)]
pub struct FlushError {
    pub kind: FlushErrorKind,
    /// Mapper the failure is attributed to, if any
    pub mapper: Option<String>,
    /// Table the failing statement targeted, if any
    pub table: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushErrorKind {
    /// A new instance collides with a live persistent instance
    IdentityConflict,
    /// UPDATE/DELETE matched a different number of rows than expected
    StaleData,
    /// UPDATE/DELETE guarded by a version column matched no row
    VersionConflict,
    /// A row could not be located because a primary key value is NULL
    NullPrimaryKey,
    /// Dependency cycle that cannot be ordered
    CircularDependency,
    /// Engine misuse: unknown handle, detached instance, occupied identity slot
    InvalidState,
}

impl FlushError {
    /// Create a flush error of the given kind.
    pub fn new(kind: FlushErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            mapper: None,
            table: None,
            message: message.into(),
        }
    }

    /// Attach the mapper name.
    pub fn with_mapper(mut self, mapper: impl Into<String>) -> Self {
        self.mapper = Some(mapper.into());
        self
    }

    /// Attach the table name.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

impl Error {
    /// Shorthand for an `InvalidState` flush error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Error::Flush(FlushError::new(FlushErrorKind::InvalidState, message))
    }

    /// Shorthand for a configuration error without a source.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// Did a pool checkout give up waiting for a free connection?
    pub fn is_pool_timeout(&self) -> bool {
        matches!(self, Error::Pool(p) if p.kind == PoolErrorKind::Timeout)
    }

    /// Does this error mean the underlying connection is dead?
    ///
    /// True for `Disconnected` connection errors and driver errors whose
    /// text carries a known disconnect signature.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Connection(c) => {
                c.kind == ConnectionErrorKind::Disconnected || is_disconnect_message(&c.message)
            }
            Error::Query(q) => is_disconnect_message(&q.message),
            Error::Custom(msg) => is_disconnect_message(msg),
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// Kind of flush failure, if this is one.
    pub fn flush_kind(&self) -> Option<FlushErrorKind> {
        match self {
            Error::Flush(f) => Some(f.kind),
            _ => None,
        }
    }
}

/// Driver error texts that mean the connection is gone.
const DISCONNECT_SIGNATURES: &str = r"(?i)(server closed the connection|connection already closed|terminating connection|connection reset by peer|broken pipe|server has gone away|lost connection to (mysql )?server|attempt to use a closed connection|invalid connection state|could not receive data from server|\[08S01\]|\b08006\b|\b08003\b)";

fn disconnect_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    REGEX
        .get_or_init(|| match Regex::new(DISCONNECT_SIGNATURES) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(error = %e, "disconnect signature pattern failed to compile");
                None
            }
        })
        .as_ref()
}

/// Check a driver error message against the known disconnect signatures.
pub fn is_disconnect_message(message: &str) -> bool {
    disconnect_regex().is_some_and(|re| re.is_match(message))
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Flush(e) => write!(f, "Flush error: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Pool(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for FlushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<FlushError> for Error {
    fn from(err: FlushError) -> Self {
        Error::Flush(err)
    }
}

/// Result type alias for ormflush operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn query_error(kind: QueryErrorKind, message: &str) -> QueryError {
        QueryError {
            kind,
            sql: Some("SELECT 1".to_string()),
            sqlstate: None,
            message: message.to_string(),
            source: None,
        }
    }

    #[test]
    fn test_sqlstate_helpers() {
        let mut query = query_error(QueryErrorKind::Constraint, "unique violation");
        query.sqlstate = Some("23505".to_string());

        assert!(query.is_unique_violation());
        assert!(!query.is_foreign_key_violation());

        let err = Error::Query(query);
        assert_eq!(err.sqlstate(), Some("23505"));
        assert_eq!(err.sql(), Some("SELECT 1"));
    }

    #[test]
    fn test_pool_timeout_and_disconnect_flags() {
        let timeout = Error::Pool(PoolError {
            kind: PoolErrorKind::Timeout,
            message: "timed out".to_string(),
            source: None,
        });
        assert!(timeout.is_pool_timeout());
        assert!(!timeout.is_disconnect());

        let conn_error = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: "lost connection".to_string(),
            source: None,
        });
        assert!(conn_error.is_disconnect());
        assert!(!conn_error.is_pool_timeout());
    }

    #[test]
    fn test_disconnect_signatures() {
        assert!(is_disconnect_message(
            "FATAL: terminating connection due to administrator command"
        ));
        assert!(is_disconnect_message("MySQL server has gone away"));
        assert!(is_disconnect_message("[08S01] communication link failure"));
        assert!(!is_disconnect_message("duplicate key value violates unique constraint"));

        let err = Error::Query(query_error(
            QueryErrorKind::Database,
            "server closed the connection unexpectedly",
        ));
        assert!(err.is_disconnect());
        assert!(!Error::Query(query_error(QueryErrorKind::Database, "syntax error")).is_disconnect());
    }

    #[test]
    fn test_flush_error_display_and_kind() {
        let err: Error = FlushError::new(
            FlushErrorKind::StaleData,
            "UPDATE statement on table 'child' expected to update 1 row(s); 0 were matched.",
        )
        .with_table("child")
        .into();

        assert_eq!(err.flush_kind(), Some(FlushErrorKind::StaleData));
        assert_eq!(
            err.to_string(),
            "Flush error: UPDATE statement on table 'child' expected to update 1 row(s); 0 were matched."
        );
        assert_eq!(Error::Cancelled.flush_kind(), None);
    }
}
