//! Session construction.
//!
//! [`SessionBuilder`] collects mapper definitions, named connection binds and
//! the session configuration, and checks them together before handing out a
//! [`Session`].
//!
//! # Example
//!
//! ```rust,ignore
//! use ormflush::prelude::*;
//!
//! let session = SessionBuilder::new()
//!     .mapper(Mapper::builder("Hero").table("hero").column(Column::new("id").autoincrement()))?
//!     .mapper(Mapper::builder("AuditEntry").table("audit").bind("audit").column(Column::new("id").autoincrement()))?
//!     .config(SessionConfig::new().two_phase(true))
//!     .bind("audit", audit_conn)
//!     .build(main_conn)?;
//! ```

use std::sync::Arc;

use ormflush_core::{Connection, Error, MapperBuilder, MapperRegistry, Result};
use ormflush_session::{Session, SessionConfig};

/// Builder for creating [`Session`] instances with a fluent API.
#[derive(Debug)]
pub struct SessionBuilder<C: Connection> {
    registry: MapperRegistry,
    config: SessionConfig,
    binds: Vec<(String, C)>,
}

impl<C: Connection> Default for SessionBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connection> SessionBuilder<C> {
    /// Create a builder with an empty mapper registry.
    #[must_use]
    pub fn new() -> Self {
        Self::from_registry(MapperRegistry::new())
    }

    /// Start from mappers registered elsewhere.
    #[must_use]
    pub fn from_registry(registry: MapperRegistry) -> Self {
        Self {
            registry,
            config: SessionConfig::default(),
            binds: Vec::new(),
        }
    }

    /// Register a mapper. Parents must be registered before mappers inheriting from them.
    pub fn mapper(mut self, builder: MapperBuilder) -> Result<Self> {
        self.registry.register(builder)?;
        Ok(self)
    }

    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Route mappers configured with `.bind(name)` to `conn`.
    #[must_use]
    pub fn bind(mut self, name: impl Into<String>, conn: C) -> Self {
        self.binds.push((name.into(), conn));
        self
    }

    /// Build the session with `conn` as the default connection.
    ///
    /// Fails with `Error::Config` when a relationship names an unknown
    /// mapper, or a mapper is bound to a name with no connection.
    pub fn build(self, conn: C) -> Result<Session<C>> {
        self.registry.validate()?;
        for mapper in self.registry.iter() {
            if let Some(bind) = mapper.bind() {
                if !self.binds.iter().any(|(name, _)| name == bind) {
                    return Err(Error::config(format!(
                        "mapper '{}' is bound to '{}' but no connection was provided for it",
                        mapper.name(),
                        bind
                    )));
                }
            }
        }

        tracing::debug!(
            mappers = self.registry.len(),
            binds = self.binds.len(),
            "Building session"
        );
        let mut session = Session::with_config(Arc::new(self.registry), conn, self.config);
        for (name, conn) in self.binds {
            session.bind(name, conn);
        }
        Ok(session)
    }
}
