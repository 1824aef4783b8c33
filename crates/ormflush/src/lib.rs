//! ormflush - unit-of-work persistence for Rust.
//!
//! ormflush keeps an in-memory copy of the rows you work with and, on flush,
//! writes every change in an order the database's foreign keys accept:
//!
//! - One instance per primary key (identity map)
//! - Attribute and relationship change tracking
//! - Dependency-ordered INSERT/UPDATE/DELETE, batched where possible
//! - Self-referential graphs sorted per object
//! - Cycles broken with post-update statements
//! - All-or-nothing flushes across one or more connections
//!
//! # Quick Start
//!
//! ```ignore
//! use ormflush::prelude::*;
//!
//! let session = SessionBuilder::new()
//!     .mapper(
//!         Mapper::builder("Parent")
//!             .table("parent")
//!             .column(Column::new("id").autoincrement())
//!             .column(Column::new("name"))
//!             .relationship(
//!                 RelationshipMeta::one_to_many("children", "Child").pair("id", "parent_id"),
//!             ),
//!     )?
//!     .mapper(
//!         Mapper::builder("Child")
//!             .table("child")
//!             .column(Column::new("id").autoincrement())
//!             .column(Column::new("parent_id").nullable()),
//!     )?
//!     .build(conn)?;
//!
//! let parent = session.create("Parent", [("name", Value::Text("p".into()))])?;
//! let child = session.new_instance("Child")?;
//! session.append(parent, "children", child)?;
//!
//! // BEGIN; INSERT parent RETURNING id; INSERT child (parent_id); COMMIT
//! session.flush(&cx, None).await;
//! ```
//!
//! # Features
//!
//! - **Structured concurrency**: Built on asupersync for cancel-correct operations
//! - **Dialect aware**: Postgres, SQLite and MySQL placeholder, quoting and key retrieval
//! - **Connection pooling**: a pooled connection is itself a [`Connection`]

pub use ormflush_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Core types
    Column,
    ColumnMeta,
    Connection,
    Dialect,
    Error,
    FlushError,
    FlushErrorKind,
    IsolationLevel,
    KeyPair,
    LinkTableInfo,
    Mapper,
    MapperBuilder,
    MapperRegistry,
    PassiveDeletes,
    RelationshipKind,
    RelationshipMeta,
    Result,
    Row,
    TableMeta,
    TransactionError,
    TransactionErrorKind,
    Value,
    try_outcome,
};

pub use ormflush_query::{DeleteStatement, InsertStatement, UpdateStatement};

pub use ormflush_session::{
    EventContext, FlushPlan, FlushResult, FlushStep, IdentityKey, InstanceId, InstanceState,
    InstanceStatus, MapperEvent, Session, SessionConfig, SessionDebugInfo, SessionEvent,
    UnitOfWork, abort,
};

pub use ormflush_pool::{Pool, PoolConfig, PoolStats, PooledConnection};

pub mod session;
pub use session::SessionBuilder;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use ormflush::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Mapping
        Column,
        // Core traits and types
        Connection,
        Cx,
        Dialect,
        Error,
        FlushErrorKind,
        FlushResult,
        InstanceId,
        InstanceStatus,
        LinkTableInfo,
        Mapper,
        MapperEvent,
        MapperRegistry,
        Outcome,
        // Pool
        Pool,
        PoolConfig,
        RelationshipMeta,
        Result,
        Row,
        // Session
        Session,
        SessionBuilder,
        SessionConfig,
        SessionEvent,
        Value,
    };
}
