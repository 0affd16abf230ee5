//! Cross-entity key existence, through a caller-supplied lookup.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use wmsync_types::state::EntityName;

/// Answers "does this key exist in that entity?" for the referential layer.
/// The validator never owns I/O; callers decide where keys come from.
pub trait ReferenceLookup: Send + Sync {
    /// Whether `entity` can be checked at all. When `false`, references to
    /// it are skipped with a batch-level warning.
    fn entity_exists(&self, entity: &EntityName) -> bool;

    fn key_exists(&self, entity: &EntityName, key: &str) -> bool;
}

/// Keys committed through this process, per entity.
///
/// An entity only counts as checkable once it is marked known, which the
/// orchestrator does after an entity's stream has been fully committed.
/// Until then references to it are skipped rather than rejected.
#[derive(Debug, Default)]
pub struct CommittedKeyIndex {
    known: RwLock<BTreeSet<EntityName>>,
    keys: RwLock<HashMap<EntityName, HashSet<String>>>,
}

impl CommittedKeyIndex {
    #[must_use]
    pub fn new(entities: impl IntoIterator<Item = EntityName>) -> Self {
        Self {
            known: RwLock::new(entities.into_iter().collect()),
            keys: RwLock::default(),
        }
    }

    pub fn mark_known(&self, entity: EntityName) {
        self.known
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity);
    }

    pub fn record_committed(&self, entity: &EntityName, keys: impl IntoIterator<Item = String>) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(entity.clone())
            .or_default()
            .extend(keys);
    }

    #[must_use]
    pub fn committed_count(&self, entity: &EntityName) -> usize {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
            .map_or(0, HashSet::len)
    }
}

impl ReferenceLookup for CommittedKeyIndex {
    fn entity_exists(&self, entity: &EntityName) -> bool {
        self.known
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(entity)
    }

    fn key_exists(&self, entity: &EntityName, key: &str) -> bool {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
            .is_some_and(|keys| keys.contains(key))
    }
}

/// Consults `first`, then `second`.
#[derive(Clone)]
pub struct ChainedLookup {
    first: Arc<dyn ReferenceLookup>,
    second: Arc<dyn ReferenceLookup>,
}

impl ChainedLookup {
    #[must_use]
    pub fn new(first: Arc<dyn ReferenceLookup>, second: Arc<dyn ReferenceLookup>) -> Self {
        Self { first, second }
    }
}

impl ReferenceLookup for ChainedLookup {
    fn entity_exists(&self, entity: &EntityName) -> bool {
        self.first.entity_exists(entity) || self.second.entity_exists(entity)
    }

    fn key_exists(&self, entity: &EntityName, key: &str) -> bool {
        self.first.key_exists(entity, key) || self.second.key_exists(entity, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_knows_entities_and_committed_keys() {
        let orders = EntityName::from("orders");
        let index = CommittedKeyIndex::new([orders.clone()]);
        assert!(index.entity_exists(&orders));
        assert!(!index.key_exists(&orders, "1"));

        index.record_committed(&orders, ["1".to_string(), "2".to_string()]);
        assert!(index.key_exists(&orders, "1"));
        assert_eq!(index.committed_count(&orders), 2);
        assert!(!index.entity_exists(&EntityName::from("customers")));
    }

    #[test]
    fn chained_lookup_falls_through() {
        let orders = EntityName::from("orders");
        let customers = EntityName::from("customers");
        let a = Arc::new(CommittedKeyIndex::new([orders.clone()]));
        let b = Arc::new(CommittedKeyIndex::default());
        b.record_committed(&customers, ["c-1".to_string()]);
        assert!(!b.entity_exists(&customers));
        b.mark_known(customers.clone());

        let chained = ChainedLookup::new(a, b);
        assert!(chained.entity_exists(&orders));
        assert!(chained.entity_exists(&customers));
        assert!(chained.key_exists(&customers, "c-1"));
        assert!(!chained.key_exists(&orders, "c-1"));
    }
}
