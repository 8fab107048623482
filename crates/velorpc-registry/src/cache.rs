use dashmap::DashMap;

use crate::instance::ServiceInstance;

/// Consumer-side view of discovered instances, keyed by service key.
///
/// A missing entry means "not fetched yet", not "no providers". Each
/// operation swaps a whole entry under the map's shard lock, so readers see
/// either the old list or the new one.
#[derive(Debug, Default)]
pub struct DiscoveryCache {
    entries: DashMap<String, Vec<ServiceInstance>>,
}

impl DiscoveryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, service_key: &str) -> Option<Vec<ServiceInstance>> {
        self.entries.get(service_key).map(|entry| entry.value().clone())
    }

    pub fn put(&self, service_key: &str, instances: Vec<ServiceInstance>) {
        self.entries.insert(service_key.to_string(), instances);
    }

    pub fn invalidate(&self, service_key: &str) -> bool {
        self.entries.remove(service_key).is_some()
    }

    /// Replaces the cached instance with the same node key, keeping its
    /// position. Returns whether anything was replaced.
    pub fn replace(&self, service_key: &str, instance: ServiceInstance) -> bool {
        let Some(mut entry) = self.entries.get_mut(service_key) else {
            return false;
        };
        let node_key = instance.node_key();
        match entry.iter_mut().find(|cached| cached.node_key() == node_key) {
            Some(slot) => {
                *slot = instance;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, service_key: &str) -> bool {
        self.entries.contains_key(service_key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
