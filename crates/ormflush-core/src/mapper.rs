//! Mapper metadata: which tables, columns and relationships an entity type maps to.
//!
//! Mappers are described with [`MapperBuilder`] and compiled into a
//! [`MapperRegistry`]. Compilation resolves the inheritance chain once: a
//! child mapper's table list is its parent's tables followed by its own, and
//! its column list is the flattened attribute-to-(table, column) map across
//! that chain. After registration a mapper is immutable and shared as
//! `Arc<Mapper>`.

use crate::error::{Error, Result};
use crate::relationship::{RelationshipKind, RelationshipMeta};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A column on one of a mapper's tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    /// Instance attribute the column stores.
    pub attr: String,
    /// Table the column lives on.
    pub table: String,
    /// Database column name (may differ from the attribute name).
    pub column: String,
    pub nullable: bool,
    pub primary_key: bool,
    /// Value generated by the database when omitted from INSERT.
    pub autoincrement: bool,
    /// Column has a server-side default.
    pub server_default: bool,
}

/// Column definition used while building a mapper.
#[derive(Debug, Clone)]
pub struct Column {
    attr: String,
    column: Option<String>,
    nullable: bool,
    primary_key: bool,
    autoincrement: bool,
    server_default: bool,
}

impl Column {
    /// A non-nullable column whose name equals the attribute name.
    pub fn new(attr: &str) -> Self {
        Self {
            attr: attr.to_string(),
            column: None,
            nullable: false,
            primary_key: false,
            autoincrement: false,
            server_default: false,
        }
    }

    /// Set the database column name.
    pub fn column(mut self, name: &str) -> Self {
        self.column = Some(name.to_string());
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Database-generated primary key.
    pub fn autoincrement(mut self) -> Self {
        self.primary_key = true;
        self.autoincrement = true;
        self
    }

    pub fn server_default(mut self) -> Self {
        self.server_default = true;
        self
    }
}

/// A table mapped by a mapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub name: String,
    /// Primary-key column names, in declaration order.
    pub primary_key: Vec<String>,
}

/// Compiled, immutable mapper.
#[derive(Debug, Clone)]
pub struct Mapper {
    name: String,
    inherits: Option<String>,
    base: String,
    tables: Vec<TableMeta>,
    columns: Vec<ColumnMeta>,
    primary_key: Vec<String>,
    version: Option<String>,
    relationships: Vec<RelationshipMeta>,
    bind: Option<String>,
}

impl Mapper {
    /// Start describing a mapper.
    pub fn builder(name: &str) -> MapperBuilder {
        MapperBuilder {
            name: name.to_string(),
            inherits: None,
            tables: Vec::new(),
            version: None,
            relationships: Vec::new(),
            bind: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the mapper this one inherits from, if any.
    pub fn inherits(&self) -> Option<&str> {
        self.inherits.as_deref()
    }

    /// Root of the inheritance chain; identity keys are scoped to it.
    pub fn base_name(&self) -> &str {
        &self.base
    }

    /// Tables in insert order (base first).
    pub fn tables(&self) -> &[TableMeta] {
        &self.tables
    }

    /// All columns across the inheritance chain.
    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    /// Columns stored on `table`.
    pub fn table_columns<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ColumnMeta> {
        self.columns.iter().filter(move |c| c.table == table)
    }

    /// Primary-key columns stored on `table`.
    pub fn table_pk_columns<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ColumnMeta> {
        self.table_columns(table).filter(|c| c.primary_key)
    }

    /// Primary-key attribute names, ordered like the base table's key.
    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// Whether `attr` is part of the primary key.
    pub fn is_pk_attr(&self, attr: &str) -> bool {
        self.primary_key.iter().any(|a| a == attr)
    }

    /// Whether the database generates (part of) the primary key.
    pub fn has_generated_key(&self) -> bool {
        self.columns.iter().any(|c| c.primary_key && c.autoincrement)
    }

    /// Attribute carrying the optimistic-concurrency version counter.
    pub fn version_attr(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Distinct column attributes, in first-declared order.
    pub fn attribute_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for col in &self.columns {
            if !names.contains(&col.attr.as_str()) {
                names.push(&col.attr);
            }
        }
        names
    }

    /// Whether `attr` is a mapped column attribute.
    pub fn has_attr(&self, attr: &str) -> bool {
        self.columns.iter().any(|c| c.attr == attr)
    }

    /// True when every column storing `attr` accepts NULL.
    pub fn is_nullable(&self, attr: &str) -> bool {
        let mut cols = self.columns.iter().filter(|c| c.attr == attr).peekable();
        cols.peek().is_some() && cols.all(|c| c.nullable)
    }

    pub fn relationships(&self) -> &[RelationshipMeta] {
        &self.relationships
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipMeta> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Named engine/connection this mapper's tables live on; `None` is the default bind.
    pub fn bind(&self) -> Option<&str> {
        self.bind.as_deref()
    }
}

/// Table being declared inside a [`MapperBuilder`].
#[derive(Debug, Clone)]
struct TableDef {
    name: String,
    columns: Vec<Column>,
}

/// Builder for [`Mapper`].
///
/// ```
/// use ormflush_core::{Column, Mapper, RelationshipMeta};
///
/// let parent = Mapper::builder("Parent")
///     .table("parent")
///     .column(Column::new("id").autoincrement())
///     .column(Column::new("name"))
///     .relationship(RelationshipMeta::one_to_many("children", "Child").pair("id", "parent_id"));
/// ```
#[derive(Debug, Clone)]
pub struct MapperBuilder {
    name: String,
    inherits: Option<String>,
    tables: Vec<TableDef>,
    version: Option<String>,
    relationships: Vec<RelationshipMeta>,
    bind: Option<String>,
}

impl MapperBuilder {
    /// Declare a table; subsequent columns belong to it.
    pub fn table(mut self, name: &str) -> Self {
        self.tables.push(TableDef {
            name: name.to_string(),
            columns: Vec::new(),
        });
        self
    }

    /// Add a column to the most recently declared table.
    ///
    /// A column declared before any table starts a table named after the mapper.
    pub fn column(mut self, column: Column) -> Self {
        if self.tables.is_empty() {
            self.tables.push(TableDef {
                name: self.name.to_lowercase(),
                columns: Vec::new(),
            });
        }
        if let Some(table) = self.tables.last_mut() {
            table.columns.push(column);
        }
        self
    }

    /// Inherit tables, columns and relationships from another mapper.
    pub fn inherits(mut self, parent: &str) -> Self {
        self.inherits = Some(parent.to_string());
        self
    }

    /// Use `attr` as an integer version counter checked on UPDATE and DELETE.
    pub fn version(mut self, attr: &str) -> Self {
        self.version = Some(attr.to_string());
        self
    }

    pub fn relationship(mut self, rel: RelationshipMeta) -> Self {
        self.relationships.push(rel);
        self
    }

    /// Route this mapper's statements to a named connection.
    pub fn bind(mut self, name: &str) -> Self {
        self.bind = Some(name.to_string());
        self
    }

    fn compile(self, parent: Option<&Mapper>) -> Result<Mapper> {
        let mut tables = Vec::new();
        let mut columns = Vec::new();
        let mut relationships = Vec::new();
        let mut primary_key = Vec::new();
        let mut version = None;
        let mut bind = None;
        let base;

        if let Some(parent) = parent {
            tables.extend(parent.tables.iter().cloned());
            columns.extend(parent.columns.iter().cloned());
            relationships.extend(parent.relationships.iter().cloned());
            primary_key.extend(parent.primary_key.iter().cloned());
            version.clone_from(&parent.version);
            bind.clone_from(&parent.bind);
            base = parent.base.clone();
        } else {
            base = self.name.clone();
        }

        for def in self.tables {
            if tables.iter().any(|t: &TableMeta| t.name == def.name) {
                return Err(Error::config(format!(
                    "mapper '{}' maps table '{}' twice",
                    self.name, def.name
                )));
            }
            let mut pk_cols = Vec::new();
            for col in def.columns {
                let column_name = col.column.unwrap_or_else(|| col.attr.clone());
                if col.primary_key {
                    pk_cols.push(column_name.clone());
                    if parent.is_none() {
                        if !primary_key.contains(&col.attr) {
                            primary_key.push(col.attr.clone());
                        }
                    } else if !primary_key.contains(&col.attr) {
                        return Err(Error::config(format!(
                            "mapper '{}': primary key attribute '{}' on table '{}' is not part of the inherited key {:?}",
                            self.name, col.attr, def.name, primary_key
                        )));
                    }
                }
                columns.push(ColumnMeta {
                    attr: col.attr,
                    table: def.name.clone(),
                    column: column_name,
                    nullable: col.nullable,
                    primary_key: col.primary_key,
                    autoincrement: col.autoincrement,
                    server_default: col.server_default,
                });
            }
            if pk_cols.is_empty() {
                return Err(Error::config(format!(
                    "mapper '{}': table '{}' has no primary key column",
                    self.name, def.name
                )));
            }
            tables.push(TableMeta {
                name: def.name,
                primary_key: pk_cols,
            });
        }

        if tables.is_empty() {
            return Err(Error::config(format!(
                "mapper '{}' maps no table",
                self.name
            )));
        }
        if let Some(v) = self.version {
            version = Some(v);
        }
        if let Some(b) = self.bind {
            bind = Some(b);
        }
        for rel in self.relationships {
            if relationships.iter().any(|r: &RelationshipMeta| r.name == rel.name) {
                return Err(Error::config(format!(
                    "mapper '{}' declares relationship '{}' twice",
                    self.name, rel.name
                )));
            }
            relationships.push(rel);
        }

        let mapper = Mapper {
            name: self.name,
            inherits: self.inherits,
            base,
            tables,
            columns,
            primary_key,
            version,
            relationships,
            bind,
        };
        if let Some(v) = mapper.version_attr() {
            if !mapper.has_attr(v) {
                return Err(Error::config(format!(
                    "mapper '{}': version attribute '{}' is not a mapped column",
                    mapper.name, v
                )));
            }
        }
        Ok(mapper)
    }
}

/// Registry of compiled mappers.
#[derive(Debug, Clone, Default)]
pub struct MapperRegistry {
    mappers: BTreeMap<String, Arc<Mapper>>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and register a mapper. A parent named by `inherits` must already be registered.
    pub fn register(&mut self, builder: MapperBuilder) -> Result<Arc<Mapper>> {
        if self.mappers.contains_key(&builder.name) {
            return Err(Error::config(format!(
                "mapper '{}' is already registered",
                builder.name
            )));
        }
        let parent = match &builder.inherits {
            Some(name) => Some(Arc::clone(self.mappers.get(name).ok_or_else(|| {
                Error::config(format!(
                    "mapper '{}' inherits from unknown mapper '{}'",
                    builder.name, name
                ))
            })?)),
            None => None,
        };
        let mapper = Arc::new(builder.compile(parent.as_deref())?);
        tracing::trace!(
            mapper = %mapper.name(),
            tables = mapper.tables().len(),
            columns = mapper.columns().len(),
            "Compiled mapper"
        );
        self.mappers
            .insert(mapper.name().to_string(), Arc::clone(&mapper));
        Ok(mapper)
    }

    /// Builder-style registration.
    pub fn with(mut self, builder: MapperBuilder) -> Result<Self> {
        self.register(builder)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Result<&Arc<Mapper>> {
        self.mappers
            .get(name)
            .ok_or_else(|| Error::config(format!("unknown mapper '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.mappers.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Mapper>> {
        self.mappers.values()
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }

    /// Whether `mapper` is `ancestor` or inherits from it.
    pub fn isa(&self, mapper: &str, ancestor: &str) -> bool {
        let mut current = Some(mapper);
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            current = self.mappers.get(name).and_then(|m| m.inherits());
        }
        false
    }

    /// Check every relationship against the registered mappers.
    pub fn validate(&self) -> Result<()> {
        for mapper in self.mappers.values() {
            for rel in mapper.relationships() {
                let target = self.mappers.get(&rel.target).ok_or_else(|| {
                    Error::config(format!(
                        "relationship '{}.{}' targets unknown mapper '{}'",
                        mapper.name(),
                        rel.name,
                        rel.target
                    ))
                })?;
                let (parent, child) = match rel.kind {
                    RelationshipKind::OneToMany => (mapper.as_ref(), target.as_ref()),
                    RelationshipKind::ManyToOne => (target.as_ref(), mapper.as_ref()),
                    RelationshipKind::ManyToMany => {
                        let link = rel.secondary.as_ref().ok_or_else(|| {
                            Error::config(format!(
                                "many-to-many relationship '{}.{}' has no association table",
                                mapper.name(),
                                rel.name
                            ))
                        })?;
                        if link.local_columns.len() != mapper.primary_key().len()
                            || link.remote_columns.len() != target.primary_key().len()
                        {
                            return Err(Error::config(format!(
                                "association table '{}' columns do not line up with the primary keys of '{}' and '{}'",
                                link.table_name,
                                mapper.name(),
                                target.name()
                            )));
                        }
                        continue;
                    }
                };
                if rel.pairs.is_empty() {
                    return Err(Error::config(format!(
                        "relationship '{}.{}' declares no key pairs",
                        mapper.name(),
                        rel.name
                    )));
                }
                for pair in &rel.pairs {
                    if !parent.has_attr(&pair.referenced) || !child.has_attr(&pair.referencing) {
                        return Err(Error::config(format!(
                            "relationship '{}.{}': pair {}.{} -> {}.{} names an unmapped attribute",
                            mapper.name(),
                            rel.name,
                            parent.name(),
                            pair.referenced,
                            child.name(),
                            pair.referencing
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
