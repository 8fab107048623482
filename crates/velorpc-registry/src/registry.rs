//! Lease-backed service registry.
//!
//! Providers publish a [`ServiceInstance`] under a lease that a background
//! task keeps alive; consumers discover instances by prefix scan and cache
//! them, watching every discovered node so the cache is dropped as soon as
//! one of them disappears.
//!
//! # Local State
//!
//! - **Discovery cache**: service key → instances, filled lazily
//! - **Watch set**: node key → running watch task, at most one per node
//! - **Lease table**: node key → lease and keep-alive task, owned nodes only
//! - **Local set**: node key → instance this process registered
//!
//! A node key is in the local set exactly when it has a lease table entry,
//! except during the short windows where registration or teardown is in
//! progress.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use velorpc_common::{RegistryConfig, Result, RpcError, StrategyRegistry};

use crate::cache::DiscoveryCache;
use crate::instance::{service_key_of, ServiceInstance};
use crate::store::{CoordinationStore, EtcdStore, LeaseId, LeaseKeepAlive, MemoryStore, WatchEvent, WatchStream};

/// Root under which every node key is stored.
pub const REGISTRY_ROOT: &str = "/rpc/";

/// Key of the registry backend used when none is configured.
pub const DEFAULT_REGISTRY: &str = "etcd";

const DEFAULT_LEASE_TTL_SECS: i64 = 10;
const LEASE_FAILURE_CAPACITY: usize = 64;

#[async_trait]
pub trait Registry: Send + Sync {
    /// Connects to the backend. Calling it again is a no-op.
    async fn init(&self, config: &RegistryConfig) -> Result<()>;

    /// Publishes a locally owned instance under a fresh lease.
    async fn register(&self, instance: &ServiceInstance) -> Result<()>;

    /// Withdraws a locally owned instance. Failures are logged, not returned.
    async fn unregister(&self, instance: &ServiceInstance);

    /// Live instances of `service_key`, from cache when possible.
    async fn discover(&self, service_key: &str) -> Result<Vec<ServiceInstance>>;

    /// Starts watching `node_key` unless it is already watched.
    async fn watch(&self, node_key: &str) -> Result<()>;

    /// Liveness is lease driven; this only reports.
    async fn heartbeat(&self);

    /// Withdraws everything this process registered and stops all tasks.
    async fn destroy(&self);

    /// Instances whose lease was lost without being unregistered.
    fn subscribe_lease_failures(&self) -> broadcast::Receiver<ServiceInstance>;
}

/// Registry backend keys and their implementations, `etcd` being the
/// default. Backends are created unconnected; call [`Registry::init`] on the
/// resolved one.
pub fn registry_strategies() -> StrategyRegistry<dyn Registry> {
    let strategies: StrategyRegistry<dyn Registry> =
        StrategyRegistry::new("registry", DEFAULT_REGISTRY, Arc::new(LeaseRegistry::etcd()));
    strategies.register("memory", Arc::new(LeaseRegistry::memory()));
    strategies
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Etcd,
    Memory,
    Provided,
}

struct LeaseEntry {
    lease_id: LeaseId,
    keepalive: JoinHandle<()>,
}

struct Shared {
    backend: Backend,
    store: OnceCell<Arc<dyn CoordinationStore>>,
    lease_ttl_secs: AtomicI64,
    cache: DiscoveryCache,
    watches: DashMap<String, JoinHandle<()>>,
    leases: DashMap<String, LeaseEntry>,
    local: DashMap<String, ServiceInstance>,
    lease_failures: broadcast::Sender<ServiceInstance>,
}

/// [`Registry`] over any [`CoordinationStore`].
#[derive(Clone)]
pub struct LeaseRegistry {
    shared: Arc<Shared>,
}

impl LeaseRegistry {
    fn with_backend(backend: Backend, store: OnceCell<Arc<dyn CoordinationStore>>) -> Self {
        let (lease_failures, _) = broadcast::channel(LEASE_FAILURE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                backend,
                store,
                lease_ttl_secs: AtomicI64::new(DEFAULT_LEASE_TTL_SECS),
                cache: DiscoveryCache::new(),
                watches: DashMap::new(),
                leases: DashMap::new(),
                local: DashMap::new(),
                lease_failures,
            }),
        }
    }

    /// Registry that connects to etcd on [`Registry::init`].
    pub fn etcd() -> Self {
        Self::with_backend(Backend::Etcd, OnceCell::new())
    }

    /// Registry over a fresh in-process [`MemoryStore`].
    pub fn memory() -> Self {
        Self::with_backend(Backend::Memory, OnceCell::new())
    }

    /// Registry over an already connected store; `init` only applies the
    /// lease TTL.
    pub fn with_store(store: Arc<dyn CoordinationStore>) -> Self {
        Self::with_backend(Backend::Provided, OnceCell::new_with(Some(store)))
    }

    pub fn with_lease_ttl(self, ttl_secs: i64) -> Self {
        self.shared.lease_ttl_secs.store(ttl_secs, Ordering::Relaxed);
        self
    }

    /// Cached instances of `service_key`, without touching the backend.
    pub fn cached(&self, service_key: &str) -> Option<Vec<ServiceInstance>> {
        self.shared.cache.get(service_key)
    }

    pub fn is_watching(&self, node_key: &str) -> bool {
        self.shared.watches.contains_key(node_key)
    }

    /// Lease currently held for a locally owned node.
    pub fn lease_id(&self, node_key: &str) -> Option<LeaseId> {
        self.shared.leases.get(node_key).map(|entry| entry.lease_id)
    }

    pub fn is_registered_locally(&self, node_key: &str) -> bool {
        self.shared.local.contains_key(node_key)
    }

    pub fn local_instances(&self) -> Vec<ServiceInstance> {
        self.shared.local.iter().map(|entry| entry.value().clone()).collect()
    }

    fn store(&self) -> Result<Arc<dyn CoordinationStore>> {
        self.shared
            .store
            .get()
            .cloned()
            .ok_or_else(|| RpcError::Connection("registry is not initialized".into()))
    }

    fn lease_ttl(&self) -> i64 {
        self.shared.lease_ttl_secs.load(Ordering::Relaxed)
    }

    /// Stops everything tied to a node this process owns, before it is
    /// registered again.
    async fn release_owned(&self, store: &Arc<dyn CoordinationStore>, node_key: &str) {
        if let Some((_, handle)) = self.shared.watches.remove(node_key) {
            handle.abort();
        }
        if let Some((_, entry)) = self.shared.leases.remove(node_key) {
            entry.keepalive.abort();
            if let Err(e) = store.revoke_lease(entry.lease_id).await {
                debug!("Revoking previous lease of {} failed: {}", node_key, e);
            }
        }
    }
}

fn store_key(node_key: &str) -> String {
    format!("{}{}", REGISTRY_ROOT, node_key)
}

impl Shared {
    fn on_node_deleted(&self, node_key: &str) {
        let service_key = service_key_of(node_key);
        if self.cache.invalidate(service_key) {
            debug!("Dropped cached instances of {} after {} was deleted", service_key, node_key);
        }
        self.watches.remove(node_key);

        if let Some(instance) = self.local.get(node_key).map(|entry| entry.value().clone()) {
            if let Some((_, entry)) = self.leases.remove(node_key) {
                entry.keepalive.abort();
                warn!("Registration of {} vanished from the registry", node_key);
                let _ = self.lease_failures.send(instance);
            }
        }
    }

    fn on_node_updated(&self, node_key: &str, value: &[u8]) {
        let service_key = service_key_of(node_key);
        match serde_json::from_slice::<ServiceInstance>(value) {
            Ok(instance) => {
                if self.cache.replace(service_key, instance) {
                    debug!("Updated cached instance {}", node_key);
                }
            }
            Err(e) => {
                warn!("Unparseable update for {}: {}", node_key, e);
                self.cache.invalidate(service_key);
            }
        }
    }

    /// Without a watch nothing keeps the cached list fresh, so the next
    /// discovery goes back to the store and watches again.
    fn on_watch_lost(&self, node_key: &str) {
        self.watches.remove(node_key);
        let service_key = service_key_of(node_key);
        if self.cache.invalidate(service_key) {
            debug!("Dropped cached instances of {} after losing the watch on {}", service_key, node_key);
        }
    }

    fn on_keepalive_failed(&self, node_key: &str, lease_id: LeaseId) {
        let removed = self
            .leases
            .remove_if(node_key, |_, entry| entry.lease_id == lease_id)
            .is_some();
        if !removed {
            return;
        }
        if let Some(instance) = self.local.get(node_key).map(|entry| entry.value().clone()) {
            let _ = self.lease_failures.send(instance);
        }
    }
}

async fn watch_loop(shared: Weak<Shared>, node_key: String, mut stream: Box<dyn WatchStream>) {
    loop {
        let event = stream.next_event().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };

        match event {
            Ok(Some(WatchEvent::Put(kv))) => shared.on_node_updated(&node_key, &kv.value),
            Ok(Some(WatchEvent::Delete { .. })) => {
                shared.on_node_deleted(&node_key);
                return;
            }
            Ok(None) => {
                debug!("Watch on {} closed", node_key);
                shared.on_watch_lost(&node_key);
                return;
            }
            Err(e) => {
                warn!("Watch on {} failed: {}", node_key, e);
                shared.on_watch_lost(&node_key);
                return;
            }
        }
    }
}

async fn keepalive_loop(
    shared: Weak<Shared>,
    node_key: String,
    lease_id: LeaseId,
    mut keeper: Box<dyn LeaseKeepAlive>,
    ttl_secs: i64,
) {
    let interval = Duration::from_millis(((ttl_secs * 1000) / 3).max(100) as u64);
    loop {
        tokio::time::sleep(interval).await;
        match keeper.renew().await {
            Ok(ttl) => debug!("Renewed lease {:x} for {} ({}s left)", lease_id, node_key, ttl),
            Err(e) => {
                warn!("Keep-alive for {} failed: {}", node_key, e);
                if let Some(shared) = shared.upgrade() {
                    shared.on_keepalive_failed(&node_key, lease_id);
                }
                return;
            }
        }
    }
}

#[async_trait]
impl Registry for LeaseRegistry {
    async fn init(&self, config: &RegistryConfig) -> Result<()> {
        self.shared
            .lease_ttl_secs
            .store(config.lease_ttl_secs, Ordering::Relaxed);

        let backend = self.shared.backend;
        self.shared
            .store
            .get_or_try_init(|| async move {
                let store: Arc<dyn CoordinationStore> = match backend {
                    Backend::Etcd => Arc::new(EtcdStore::connect(config).await?),
                    Backend::Memory | Backend::Provided => Arc::new(MemoryStore::new()),
                };
                info!("Registry initialized ({:?} backend)", backend);
                Ok::<_, RpcError>(store)
            })
            .await?;
        Ok(())
    }

    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        let store = self
            .store()
            .map_err(|e| RpcError::Registration(e.to_string()))?;
        let node_key = instance.node_key();
        let key = store_key(&node_key);

        if self.shared.leases.contains_key(&node_key) || self.shared.watches.contains_key(&node_key) {
            self.release_owned(&store, &node_key).await;
        }

        let value = serde_json::to_vec(instance)?;
        let ttl = self.lease_ttl();

        let lease_id = store
            .grant_lease(ttl)
            .await
            .map_err(|e| RpcError::Registration(format!("lease grant for {} failed: {}", node_key, e)))?;

        if let Err(e) = store.put(&key, value, Some(lease_id)).await {
            let _ = store.revoke_lease(lease_id).await;
            return Err(RpcError::Registration(format!("writing {} failed: {}", key, e)));
        }

        let keeper = match store.keep_alive(lease_id).await {
            Ok(keeper) => keeper,
            Err(e) => {
                let _ = store.revoke_lease(lease_id).await;
                return Err(RpcError::Registration(format!(
                    "keep-alive for {} failed: {}",
                    node_key, e
                )));
            }
        };

        let keepalive = tokio::spawn(keepalive_loop(
            Arc::downgrade(&self.shared),
            node_key.clone(),
            lease_id,
            keeper,
            ttl,
        ));
        self.shared
            .leases
            .insert(node_key.clone(), LeaseEntry { lease_id, keepalive });
        self.shared.local.insert(node_key.clone(), instance.clone());

        if let Err(e) = self.watch(&node_key).await {
            warn!("Could not watch own registration {}: {}", node_key, e);
        }

        info!("Registered {} with lease {:x} (ttl {}s)", node_key, lease_id, ttl);
        Ok(())
    }

    async fn unregister(&self, instance: &ServiceInstance) {
        let node_key = instance.node_key();

        // Out of the local set first, so the DELETE our own delete triggers
        // is not mistaken for a lost registration
        self.shared.local.remove(&node_key);

        let lease = self.shared.leases.remove(&node_key).map(|(_, entry)| entry);
        if let Some(entry) = &lease {
            entry.keepalive.abort();
        }

        match self.store() {
            Ok(store) => {
                if let Some(entry) = lease {
                    if let Err(e) = store.revoke_lease(entry.lease_id).await {
                        warn!("Revoking lease of {} failed: {}", node_key, e);
                    }
                }
                if let Err(e) = store.delete(&store_key(&node_key)).await {
                    warn!("Deleting {} failed: {}", node_key, e);
                }
            }
            Err(e) => warn!("Cannot unregister {}: {}", node_key, e),
        }

        if let Some((_, handle)) = self.shared.watches.remove(&node_key) {
            handle.abort();
        }

        info!("Unregistered {}", node_key);
    }

    async fn discover(&self, service_key: &str) -> Result<Vec<ServiceInstance>> {
        if service_key.trim().is_empty() {
            return Err(RpcError::InvalidRequest("service key must not be blank".into()));
        }

        if let Some(cached) = self.shared.cache.get(service_key) {
            return Ok(cached);
        }

        let store = self
            .store()
            .map_err(|e| RpcError::Discovery(e.to_string()))?;
        let prefix = format!("{}{}/", REGISTRY_ROOT, service_key);
        let entries = store
            .get_prefix(&prefix)
            .await
            .map_err(|e| RpcError::Discovery(format!("listing {} failed: {}", prefix, e)))?;

        let mut instances = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_slice::<ServiceInstance>(&entry.value) {
                Ok(instance) => instances.push(instance),
                Err(e) => warn!("Skipping malformed registry entry {}: {}", entry.key, e),
            }
        }

        for instance in &instances {
            if let Err(e) = self.watch(&instance.node_key()).await {
                warn!("Could not watch {}: {}", instance.node_key(), e);
            }
        }

        // An empty list is not cached: with nothing to watch it would never
        // be invalidated
        if !instances.is_empty() {
            self.shared.cache.put(service_key, instances.clone());
        }
        debug!("Discovered {} instance(s) of {}", instances.len(), service_key);
        Ok(instances)
    }

    async fn watch(&self, node_key: &str) -> Result<()> {
        if self.shared.watches.contains_key(node_key) {
            return Ok(());
        }

        let store = self
            .store()
            .map_err(|e| RpcError::Discovery(e.to_string()))?;
        let stream = store.watch(&store_key(node_key)).await?;

        match self.shared.watches.entry(node_key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {}
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let handle = tokio::spawn(watch_loop(
                    Arc::downgrade(&self.shared),
                    node_key.to_string(),
                    stream,
                ));
                slot.insert(handle);
            }
        }
        Ok(())
    }

    async fn heartbeat(&self) {
        debug!("{} lease(s) kept alive by keep-alive tasks", self.shared.leases.len());
    }

    async fn destroy(&self) {
        info!("Shutting down registry");
        let owned: Vec<String> = self.shared.local.iter().map(|e| e.key().clone()).collect();
        self.shared.local.clear();

        let leases: Vec<(String, LeaseEntry)> = owned
            .iter()
            .filter_map(|node| self.shared.leases.remove(node))
            .collect();
        for (_, entry) in &leases {
            entry.keepalive.abort();
        }

        if let Ok(store) = self.store() {
            for (node_key, entry) in &leases {
                if let Err(e) = store.revoke_lease(entry.lease_id).await {
                    debug!("Revoking lease of {} failed: {}", node_key, e);
                }
            }
            for node_key in &owned {
                if let Err(e) = store.delete(&store_key(node_key)).await {
                    warn!("Deleting {} failed: {}", node_key, e);
                }
            }
            if let Err(e) = store.close().await {
                warn!("Closing registry backend failed: {}", e);
            }
        }

        for entry in self.shared.leases.iter() {
            entry.keepalive.abort();
        }
        self.shared.leases.clear();
        for entry in self.shared.watches.iter() {
            entry.value().abort();
        }
        self.shared.watches.clear();
        self.shared.cache.clear();
    }

    fn subscribe_lease_failures(&self) -> broadcast::Receiver<ServiceInstance> {
        self.shared.lease_failures.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_registry() -> (LeaseRegistry, MemoryStore) {
        let store = MemoryStore::new();
        let registry = LeaseRegistry::with_store(Arc::new(store.clone()));
        (registry, store)
    }

    #[tokio::test]
    async fn test_uninitialized_registry_errors() {
        let registry = LeaseRegistry::memory();
        let instance = ServiceInstance::new("S", "1.0", "h", 1);
        assert!(matches!(registry.register(&instance).await, Err(RpcError::Registration(_))));
        assert!(matches!(registry.discover("S:default:1.0").await, Err(RpcError::Discovery(_))));
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let registry = LeaseRegistry::memory();
        let config = RegistryConfig::default();
        registry.init(&config).await.unwrap();
        registry.init(&config).await.unwrap();
        assert!(registry.store().is_ok());
    }

    #[tokio::test]
    async fn test_blank_service_key_rejected() {
        let (registry, _) = memory_registry();
        assert!(matches!(registry.discover("  ").await, Err(RpcError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_register_records_lease_and_watch() {
        let (registry, store) = memory_registry();
        let instance = ServiceInstance::new("S", "1.0", "h", 1);
        registry.register(&instance).await.unwrap();

        let node_key = instance.node_key();
        let lease = registry.lease_id(&node_key).unwrap();
        assert_eq!(store.lease_of(&store_key(&node_key)), Some(lease));
        assert!(registry.is_registered_locally(&node_key));
        assert!(registry.is_watching(&node_key));
    }

    #[tokio::test]
    async fn test_malformed_entries_skipped() {
        let (registry, store) = memory_registry();
        store
            .put("/rpc/S:default:1.0/bad:1", b"{not json".to_vec(), None)
            .await
            .unwrap();
        let good = ServiceInstance::new("S", "1.0", "good", 2);
        store
            .put(&store_key(&good.node_key()), serde_json::to_vec(&good).unwrap(), None)
            .await
            .unwrap();

        let found = registry.discover("S:default:1.0").await.unwrap();
        assert_eq!(found, vec![good]);
    }

    #[tokio::test]
    async fn test_empty_discovery_not_cached() {
        let (registry, _) = memory_registry();
        assert!(registry.discover("S:default:1.0").await.unwrap().is_empty());
        assert!(registry.cached("S:default:1.0").is_none());
    }

    #[test]
    fn test_builtin_registry_keys() {
        let strategies = registry_strategies();
        assert_eq!(strategies.keys(), vec!["etcd", "memory"]);
        assert_eq!(strategies.default_key(), DEFAULT_REGISTRY);
    }
}
