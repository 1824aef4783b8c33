//! Identity Map pattern for tracking unique instances per primary key.
//!
//! The Identity Map ensures that each database row corresponds to exactly one
//! tracked instance within a session:
//!
//! - **Uniqueness**: the same key always resolves to the same [`InstanceId`]
//! - **Consistency**: changes made through one handle are the changes flushed
//!
//! Keys are built from the *base* mapper of an inheritance hierarchy, so a
//! `Manager` and an `Engineer` that share the `person` table share one
//! identity space.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! let key = IdentityKey::new("Person", vec![Value::BigInt(1)]);
//!
//! map.put(key.clone(), id)?;
//! assert_eq!(map.get(&key), Some(id));
//!
//! // A second instance under the same key is a conflict
//! assert!(map.put(key, other_id).is_err());
//! ```

use crate::state::InstanceId;
use ormflush_core::{Error, FlushError, FlushErrorKind, Result, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// (base mapper, primary-key tuple) identifying one persisted row.
#[derive(Debug, Clone)]
pub struct IdentityKey {
    mapper: String,
    values: Vec<Value>,
}

impl IdentityKey {
    /// Create a key; `mapper` must be the base mapper name.
    pub fn new(mapper: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            mapper: mapper.into(),
            values,
        }
    }

    pub fn mapper(&self) -> &str {
        &self.mapper
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

impl PartialEq for IdentityKey {
    fn eq(&self, other: &Self) -> bool {
        self.mapper == other.mapper
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| a.same_as(b))
    }
}

impl Eq for IdentityKey {}

impl Hash for IdentityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mapper.hash(state);
        self.values.len().hash(state);
        for v in &self.values {
            v.hash_into(state);
        }
    }
}

impl PartialOrd for IdentityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IdentityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.mapper.cmp(&other.mapper).then_with(|| {
            for (a, b) in self.values.iter().zip(&other.values) {
                let ord = a.total_cmp(b);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            self.values.len().cmp(&other.values.len())
        })
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, (", self.mapper)?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "))")
    }
}

/// Map from identity key to the single live instance for that row.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    entries: HashMap<IdentityKey, InstanceId>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the instance for a key.
    pub fn get(&self, key: &IdentityKey) -> Option<InstanceId> {
        self.entries.get(key).copied()
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Associate `id` with `key`.
    ///
    /// Re-putting the same instance is a no-op. A different instance under an
    /// occupied key is an identity conflict.
    pub fn put(&mut self, key: IdentityKey, id: InstanceId) -> Result<()> {
        match self.entries.get(&key) {
            Some(existing) if *existing == id => Ok(()),
            Some(existing) => Err(Error::Flush(
                FlushError::new(
                    FlushErrorKind::IdentityConflict,
                    format!(
                        "Can't attach instance {}; instance {} already occupies identity key {}",
                        id, existing, key
                    ),
                )
                .with_mapper(key.mapper.clone()),
            )),
            None => {
                tracing::trace!(key = %key, instance = %id, "Identity map put");
                self.entries.insert(key, id);
                Ok(())
            }
        }
    }

    /// Remove a key, making the identity available again.
    pub fn remove(&mut self, key: &IdentityKey) -> Option<InstanceId> {
        self.entries.remove(key)
    }

    /// Hand a key over from its current instance to `id` (row switch).
    pub(crate) fn replace(&mut self, key: IdentityKey, id: InstanceId) -> Option<InstanceId> {
        self.entries.insert(key, id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IdentityKey, InstanceId)> {
        self.entries.iter().map(|(k, v)| (k, *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{InstanceState, StateArena};
    use ormflush_core::{Column, Mapper, MapperRegistry};

    fn ids(n: usize) -> Vec<InstanceId> {
        let mapper = MapperRegistry::new()
            .with(
                Mapper::builder("Hero")
                    .table("hero")
                    .column(Column::new("id").autoincrement()),
            )
            .unwrap()
            .get("Hero")
            .unwrap()
            .clone();
        let mut arena = StateArena::new();
        (0..n)
            .map(|_| arena.insert(InstanceState::new(mapper.clone())))
            .collect()
    }

    #[test]
    fn test_key_equality_across_integer_widths() {
        let a = IdentityKey::new("Hero", vec![Value::Int(1)]);
        let b = IdentityKey::new("Hero", vec![Value::BigInt(1)]);
        let c = IdentityKey::new("Team", vec![Value::BigInt(1)]);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut map = IdentityMap::new();
        let id = ids(1)[0];
        map.put(a, id).unwrap();
        assert_eq!(map.get(&b), Some(id));
        assert_eq!(map.get(&c), None);
    }

    #[test]
    fn test_put_conflict() {
        let ids = ids(2);
        let key = IdentityKey::new("Hero", vec![Value::BigInt(5)]);
        let mut map = IdentityMap::new();

        map.put(key.clone(), ids[0]).unwrap();
        map.put(key.clone(), ids[0]).unwrap();

        let err = map.put(key.clone(), ids[1]).unwrap_err();
        assert_eq!(err.flush_kind(), Some(FlushErrorKind::IdentityConflict));
        assert_eq!(map.get(&key), Some(ids[0]));
    }

    #[test]
    fn test_remove_frees_identity() {
        let ids = ids(2);
        let key = IdentityKey::new("Hero", vec![Value::BigInt(5)]);
        let mut map = IdentityMap::new();

        map.put(key.clone(), ids[0]).unwrap();
        assert_eq!(map.remove(&key), Some(ids[0]));
        assert!(map.is_empty());
        map.put(key.clone(), ids[1]).unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_key_ordering_and_display() {
        let mut keys = vec![
            IdentityKey::new("Hero", vec![Value::BigInt(10)]),
            IdentityKey::new("Hero", vec![Value::Int(2)]),
            IdentityKey::new("Hero", vec![Value::BigInt(7)]),
        ];
        keys.sort();
        let firsts: Vec<_> = keys.iter().map(|k| k.values()[0].as_i64()).collect();
        assert_eq!(firsts, vec![Some(2), Some(7), Some(10)]);
        assert_eq!(keys[0].to_string(), "(Hero, (2))");
    }
}
