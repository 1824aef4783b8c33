//! INSERT/UPDATE/DELETE statement compilation for ormflush.
//!
//! The unit of work never writes SQL text by hand; it describes each write as
//! an [`InsertStatement`], [`UpdateStatement`] or [`DeleteStatement`] and
//! compiles it for the dialect of the connection the statement runs on.

pub mod builder;

pub use builder::{DeleteStatement, InsertStatement, UpdateStatement};
pub use ormflush_core::Dialect;
