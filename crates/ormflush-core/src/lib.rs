//! Core types and traits for ormflush.
//!
//! This crate provides the foundational abstractions shared by the unit of work:
//!
//! - `Value` and `Row` for dynamically typed column data
//! - `Error` taxonomy, including flush failures
//! - `Connection` trait for executing statements
//! - `Mapper` metadata: tables, columns, relationships, inheritance
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod dialect;
pub mod error;
pub mod mapper;
pub mod relationship;
pub mod row;
pub mod value;

pub use connection::{Connection, IsolationLevel};
pub use dialect::Dialect;
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, FlushError, FlushErrorKind,
    PoolError, PoolErrorKind, QueryError, QueryErrorKind, Result, TransactionError,
    TransactionErrorKind, is_disconnect_message,
};
pub use mapper::{Column, ColumnMeta, Mapper, MapperBuilder, MapperRegistry, TableMeta};
pub use relationship::{KeyPair, LinkTableInfo, PassiveDeletes, RelationshipKind, RelationshipMeta};
pub use row::Row;
pub use value::Value;

/// Unwrap an `Outcome::Ok`, returning any other variant from the enclosing function.
///
/// The enclosing function must itself return `Outcome<_, Error>`.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(err) => return $crate::Outcome::Err(err),
            $crate::Outcome::Cancelled(reason) => return $crate::Outcome::Cancelled(reason),
            $crate::Outcome::Panicked(payload) => return $crate::Outcome::Panicked(payload),
        }
    };
}
