//! Shared cache of database identities.
//!
//! Resource type ids are preloaded at startup. Parameter name and code
//! system ids are few and kept forever. Common token values, canonical
//! values and logical resource ids are LRU bounded.
//!
//! Ids resolved inside a transaction live in [`PendingIdentities`] and are
//! only published to the shared cache after the transaction committed, so a
//! rolled back insert can never leak an id that does not exist.

use crate::config::IdentityCacheConfig;
use crate::metrics;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// `(code_system_id, token_value)`
pub type TokenValueKey = (i32, String);
/// `(resource_type, logical_id)`
pub type LogicalResourceKey = (String, String);

pub struct IdentityCache {
    resource_types: RwLock<HashMap<String, i32>>,
    parameter_names: RwLock<HashMap<String, i32>>,
    code_systems: RwLock<HashMap<String, i32>>,
    token_values: Mutex<LruCache<TokenValueKey, i64>>,
    canonicals: Mutex<LruCache<String, i64>>,
    logical_resources: Mutex<LruCache<LogicalResourceKey, i64>>,
}

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

impl IdentityCache {
    pub fn new(config: &IdentityCacheConfig) -> Self {
        Self {
            resource_types: RwLock::new(HashMap::new()),
            parameter_names: RwLock::new(HashMap::new()),
            code_systems: RwLock::new(HashMap::new()),
            token_values: Mutex::new(LruCache::new(capacity(config.token_value_capacity))),
            canonicals: Mutex::new(LruCache::new(capacity(config.canonical_capacity))),
            logical_resources: Mutex::new(LruCache::new(capacity(config.logical_resource_capacity))),
        }
    }

    pub fn preload_resource_types(&self, types: impl IntoIterator<Item = (String, i32)>) {
        let mut map = self.resource_types.write();
        map.extend(types);
        tracing::debug!(count = map.len(), "Preloaded resource type ids");
    }

    pub fn resource_type_id(&self, resource_type: &str) -> Option<i32> {
        lookup_map(&self.resource_types, "resource_type", resource_type)
    }

    pub fn parameter_name_id(&self, code: &str) -> Option<i32> {
        lookup_map(&self.parameter_names, "parameter_name", code)
    }

    pub fn code_system_id(&self, system: &str) -> Option<i32> {
        lookup_map(&self.code_systems, "code_system", system)
    }

    pub fn token_value_id(&self, key: &TokenValueKey) -> Option<i64> {
        lookup_lru(&self.token_values, "token_value", key)
    }

    pub fn canonical_id(&self, url: &str) -> Option<i64> {
        let mut cache = self.canonicals.lock();
        let found = cache.get(url).copied();
        metrics::record_cache_lookup("canonical", found.is_some());
        found
    }

    pub fn logical_resource_id(&self, key: &LogicalResourceKey) -> Option<i64> {
        lookup_lru(&self.logical_resources, "logical_resource", key)
    }

    /// Publish ids of a committed transaction.
    pub fn publish(&self, pending: PendingIdentities) {
        if pending.is_empty() {
            return;
        }
        self.resource_types.write().extend(pending.resource_types);
        self.parameter_names.write().extend(pending.parameter_names);
        self.code_systems.write().extend(pending.code_systems);
        put_all(&self.token_values, pending.token_values);
        put_all(&self.canonicals, pending.canonicals);
        put_all(&self.logical_resources, pending.logical_resources);
    }

    /// Forget erased logical resources.
    pub fn evict_logical_resource(&self, key: &LogicalResourceKey) {
        self.logical_resources.lock().pop(key);
    }

    pub fn clear(&self) {
        self.parameter_names.write().clear();
        self.code_systems.write().clear();
        self.token_values.lock().clear();
        self.canonicals.lock().clear();
        self.logical_resources.lock().clear();
    }
}

fn lookup_map<V: Copy>(map: &RwLock<HashMap<String, V>>, cache: &str, key: &str) -> Option<V> {
    let found = map.read().get(key).copied();
    metrics::record_cache_lookup(cache, found.is_some());
    found
}

fn lookup_lru<K: Hash + Eq, V: Copy>(lru: &Mutex<LruCache<K, V>>, cache: &str, key: &K) -> Option<V> {
    let found = lru.lock().get(key).copied();
    metrics::record_cache_lookup(cache, found.is_some());
    found
}

fn put_all<K: Hash + Eq, V>(lru: &Mutex<LruCache<K, V>>, entries: HashMap<K, V>) {
    let mut cache = lru.lock();
    for (k, v) in entries {
        cache.put(k, v);
    }
}

/// Ids resolved by one transaction, not yet visible to others.
#[derive(Debug, Default)]
pub struct PendingIdentities {
    pub resource_types: HashMap<String, i32>,
    pub parameter_names: HashMap<String, i32>,
    pub code_systems: HashMap<String, i32>,
    pub token_values: HashMap<TokenValueKey, i64>,
    pub canonicals: HashMap<String, i64>,
    pub logical_resources: HashMap<LogicalResourceKey, i64>,
}

impl PendingIdentities {
    pub fn is_empty(&self) -> bool {
        self.resource_types.is_empty()
            && self.parameter_names.is_empty()
            && self.code_systems.is_empty()
            && self.token_values.is_empty()
            && self.canonicals.is_empty()
            && self.logical_resources.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn parameter_name_id(&self, cache: &IdentityCache, code: &str) -> Option<i32> {
        self.parameter_names
            .get(code)
            .copied()
            .or_else(|| cache.parameter_name_id(code))
    }

    pub fn code_system_id(&self, cache: &IdentityCache, system: &str) -> Option<i32> {
        self.code_systems
            .get(system)
            .copied()
            .or_else(|| cache.code_system_id(system))
    }

    pub fn token_value_id(&self, cache: &IdentityCache, key: &TokenValueKey) -> Option<i64> {
        self.token_values
            .get(key)
            .copied()
            .or_else(|| cache.token_value_id(key))
    }

    pub fn canonical_id(&self, cache: &IdentityCache, url: &str) -> Option<i64> {
        self.canonicals.get(url).copied().or_else(|| cache.canonical_id(url))
    }

    pub fn logical_resource_id(&self, cache: &IdentityCache, key: &LogicalResourceKey) -> Option<i64> {
        self.logical_resources
            .get(key)
            .copied()
            .or_else(|| cache.logical_resource_id(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> IdentityCache {
        IdentityCache::new(&IdentityCacheConfig {
            logical_resource_capacity: 2,
            token_value_capacity: 2,
            canonical_capacity: 2,
        })
    }

    #[test]
    fn pending_ids_are_invisible_until_published() {
        let cache = cache();
        let mut pending = PendingIdentities::default();
        pending.parameter_names.insert("name".into(), 7);
        pending.code_systems.insert("http://loinc.org".into(), 3);

        assert_eq!(pending.parameter_name_id(&cache, "name"), Some(7));
        assert_eq!(cache.parameter_name_id("name"), None);

        cache.publish(pending);
        assert_eq!(cache.parameter_name_id("name"), Some(7));
        assert_eq!(cache.code_system_id("http://loinc.org"), Some(3));
    }

    #[test]
    fn rolled_back_ids_are_discarded() {
        let cache = cache();
        let mut pending = PendingIdentities::default();
        pending.token_values.insert((1, "abc".into()), 10);
        pending.clear();
        cache.publish(pending);
        assert_eq!(cache.token_value_id(&(1, "abc".into())), None);
    }

    #[test]
    fn logical_resources_are_lru_bounded() {
        let cache = cache();
        let mut pending = PendingIdentities::default();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            pending
                .logical_resources
                .insert(("Patient".into(), id.to_string()), i as i64);
        }
        cache.publish(pending);
        let cached = ["a", "b", "c"]
            .iter()
            .filter(|id| cache.logical_resource_id(&("Patient".into(), id.to_string())).is_some())
            .count();
        assert_eq!(cached, 2);

        cache.evict_logical_resource(&("Patient".into(), "c".into()));
        cache.evict_logical_resource(&("Patient".into(), "b".into()));
        cache.evict_logical_resource(&("Patient".into(), "a".into()));
        assert!(cache.logical_resource_id(&("Patient".into(), "a".into())).is_none());
    }

    #[test]
    fn resource_types_are_preloaded() {
        let cache = cache();
        cache.preload_resource_types([("Patient".to_string(), 1), ("Observation".to_string(), 2)]);
        assert_eq!(cache.resource_type_id("Observation"), Some(2));
        cache.clear();
        assert_eq!(cache.resource_type_id("Observation"), Some(2));
    }
}
