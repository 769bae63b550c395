//! Identity scopes: where materialized entities are registered and looked up by key.

use super::instance::EntityInstance;
use crate::model::EntityTypeId;
use crate::value::Value;
use indexmap::IndexMap;
use std::sync::{Arc, Mutex};

/// Identity of an entity within a hierarchy: the root type plus primary-key values.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub root: EntityTypeId,
    pub values: Vec<Value>,
}

#[derive(Clone, Debug)]
pub struct EntityEntry {
    pub entity_type: EntityTypeId,
    pub key: EntityKey,
    pub instance: Arc<EntityInstance>,
    /// Original value of every mapped property, shadow properties included.
    pub snapshot: IndexMap<String, Value>,
}

impl EntityEntry {
    pub fn original_value(&self, property: &str) -> Option<&Value> {
        self.snapshot.get(property)
    }
}

pub trait IdentityScope: Send {
    fn try_get(&self, key: &EntityKey) -> Option<Arc<EntityInstance>>;

    /// Registers the entry unless its key is already tracked; returns the tracked instance.
    fn start_tracking(&mut self, entry: EntityEntry) -> Arc<EntityInstance>;
}

/// Default identity scope: an insertion-ordered map of entries by key.
#[derive(Debug, Default)]
pub struct StateManager {
    entries: IndexMap<EntityKey, EntityEntry>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, key: &EntityKey) -> Option<&EntityEntry> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &EntityEntry> {
        self.entries.values()
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
}

impl IdentityScope for StateManager {
    fn try_get(&self, key: &EntityKey) -> Option<Arc<EntityInstance>> {
        self.entries.get(key).map(|e| e.instance.clone())
    }

    fn start_tracking(&mut self, entry: EntityEntry) -> Arc<EntityInstance> {
        self.entries
            .entry(entry.key.clone())
            .or_insert(entry)
            .instance
            .clone()
    }
}

/// A context's state manager shared with running queries. Each call takes the lock briefly so no
/// guard is held across row reads.
#[derive(Clone, Debug, Default)]
pub struct SharedStateManager(Arc<Mutex<StateManager>>);

impl SharedStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&StateManager) -> R) -> R {
        let guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl IdentityScope for SharedStateManager {
    fn try_get(&self, key: &EntityKey) -> Option<Arc<EntityInstance>> {
        self.with(|s| s.try_get(key))
    }

    fn start_tracking(&mut self, entry: EntityEntry) -> Arc<EntityInstance> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .start_tracking(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64) -> EntityEntry {
        let mut values = IndexMap::new();
        values.insert("Id".to_string(), Value::Int(id));
        let instance = Arc::new(EntityInstance::new(EntityTypeId(0), "Blog", values.clone()));
        EntityEntry {
            entity_type: EntityTypeId(0),
            key: EntityKey {
                root: EntityTypeId(0),
                values: vec![Value::Int(id)],
            },
            instance,
            snapshot: values,
        }
    }

    #[test]
    fn first_registration_wins() {
        let mut sm = StateManager::new();
        let first = sm.start_tracking(entry(1));
        let second = sm.start_tracking(entry(1));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(sm.len(), 1);
        sm.start_tracking(entry(2));
        assert_eq!(sm.len(), 2);
    }

    #[test]
    fn shared_manager_sees_registrations() {
        let mut shared = SharedStateManager::new();
        let e = entry(7);
        let key = e.key.clone();
        shared.start_tracking(e);
        assert!(shared.try_get(&key).is_some());
        assert_eq!(shared.with(|s| s.len()), 1);
    }
}
