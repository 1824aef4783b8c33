//! Relationship metadata.
//!
//! A relationship describes how instances of one mapper reference instances of
//! another through foreign-key columns (or an association table). The unit of
//! work turns each relationship into ordering constraints and a dependency
//! processor that copies key values between the two sides.

/// The type of relationship between two mappers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelationshipKind {
    /// Many-to-one: many `Child`ren hold a reference to one `Parent`.
    #[default]
    ManyToOne,
    /// One-to-many: one `Parent` holds a collection of `Child`ren.
    OneToMany,
    /// Many-to-many: rows on both sides linked through an association table.
    ManyToMany,
}

impl RelationshipKind {
    /// Whether the attribute holds a collection rather than a single reference.
    pub const fn is_collection(self) -> bool {
        matches!(self, RelationshipKind::OneToMany | RelationshipKind::ManyToMany)
    }
}

/// Passive delete behavior for relationships.
///
/// Controls whether the unit of work nulls out or deletes dependent rows
/// itself, or relies on the database's foreign key ON DELETE action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PassiveDeletes {
    /// The unit of work handles dependent rows (default behavior).
    #[default]
    Active,
    /// The database's ON DELETE action handles dependent rows that are not
    /// already part of the flush.
    Passive,
}

/// Association table for many-to-many relationships.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// The link table name (e.g., `"hero_powers"`).
    pub table_name: String,
    /// Columns referencing the owning side, ordered like its primary key.
    pub local_columns: Vec<String>,
    /// Columns referencing the target side, ordered like its primary key.
    pub remote_columns: Vec<String>,
}

impl LinkTableInfo {
    /// Single-column link table.
    pub fn new(
        table_name: impl Into<String>,
        local_column: impl Into<String>,
        remote_column: impl Into<String>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            local_columns: vec![local_column.into()],
            remote_columns: vec![remote_column.into()],
        }
    }

    /// Composite link table.
    ///
    /// Column order matters:
    /// - `local_columns` must match the owning mapper's primary key ordering
    /// - `remote_columns` must match the target mapper's primary key ordering
    pub fn composite(
        table_name: impl Into<String>,
        local_columns: &[&str],
        remote_columns: &[&str],
    ) -> Self {
        Self {
            table_name: table_name.into(),
            local_columns: local_columns.iter().map(|c| (*c).to_string()).collect(),
            remote_columns: remote_columns.iter().map(|c| (*c).to_string()).collect(),
        }
    }
}

/// One referenced-key / foreign-key attribute pairing.
///
/// `referenced` is an attribute on the parent side (usually its primary key),
/// `referencing` the foreign-key attribute on the dependent side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub referenced: String,
    pub referencing: String,
}

/// A relationship property on a mapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipMeta {
    /// Attribute name holding the reference or collection.
    pub name: String,
    pub kind: RelationshipKind,
    /// Name of the related mapper.
    pub target: String,
    /// Key pairings; empty for many-to-many.
    pub pairs: Vec<KeyPair>,
    /// Association table; only for many-to-many.
    pub secondary: Option<LinkTableInfo>,
    /// Deleting the parent deletes the dependents.
    pub cascade_delete: bool,
    /// Dependents removed from the collection are deleted.
    pub delete_orphan: bool,
    /// Wire the foreign key with a separate UPDATE after both rows exist.
    pub post_update: bool,
    pub passive_deletes: PassiveDeletes,
}

impl RelationshipMeta {
    fn new(name: &str, kind: RelationshipKind, target: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            target: target.to_string(),
            pairs: Vec::new(),
            secondary: None,
            cascade_delete: false,
            delete_orphan: false,
            post_update: false,
            passive_deletes: PassiveDeletes::Active,
        }
    }

    /// A collection of `target` instances whose foreign key points back here.
    pub fn one_to_many(name: &str, target: &str) -> Self {
        Self::new(name, RelationshipKind::OneToMany, target)
    }

    /// A reference to a `target` instance through a local foreign key.
    pub fn many_to_one(name: &str, target: &str) -> Self {
        Self::new(name, RelationshipKind::ManyToOne, target)
    }

    /// A collection of `target` instances linked through an association table.
    pub fn many_to_many(name: &str, target: &str, secondary: LinkTableInfo) -> Self {
        let mut rel = Self::new(name, RelationshipKind::ManyToMany, target);
        rel.secondary = Some(secondary);
        rel
    }

    /// Add a key pairing: `referenced` on the parent side, `referencing` on the dependent side.
    pub fn pair(mut self, referenced: &str, referencing: &str) -> Self {
        self.pairs.push(KeyPair {
            referenced: referenced.to_string(),
            referencing: referencing.to_string(),
        });
        self
    }

    pub fn cascade_delete(mut self) -> Self {
        self.cascade_delete = true;
        self
    }

    /// Delete dependents removed from the collection; implies `cascade_delete`.
    pub fn delete_orphan(mut self) -> Self {
        self.cascade_delete = true;
        self.delete_orphan = true;
        self
    }

    pub fn post_update(mut self) -> Self {
        self.post_update = true;
        self
    }

    pub fn passive_deletes(mut self) -> Self {
        self.passive_deletes = PassiveDeletes::Passive;
        self
    }

    /// Attribute names on the referenced (parent) side, in pair order.
    pub fn referenced_attrs(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|p| p.referenced.as_str())
    }

    /// Foreign-key attribute names on the dependent side, in pair order.
    pub fn referencing_attrs(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|p| p.referencing.as_str())
    }
}
