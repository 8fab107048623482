//! VeloRPC Service Registry
//!
//! Tracks which provider instances exist and keeps a consumer-side view of
//! them fresh.
//!
//! - [`ServiceInstance`]: one provider, keyed by service key and node key
//! - [`Registry`] / [`LeaseRegistry`]: registration under keep-alive leases,
//!   cached discovery, watch-driven invalidation
//! - [`store`]: the coordination store seam, with etcd and in-memory backends

pub mod cache;
pub mod instance;
pub mod registry;
pub mod store;

pub use cache::DiscoveryCache;
pub use instance::{service_key_of, ServiceInstance};
pub use registry::{registry_strategies, LeaseRegistry, Registry, DEFAULT_REGISTRY, REGISTRY_ROOT};
pub use store::{CoordinationStore, EtcdStore, MemoryStore};
