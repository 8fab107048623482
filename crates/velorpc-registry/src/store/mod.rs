//! Coordination store backends.
//!
//! The registry needs five primitives from its backing store: leases with a
//! TTL, puts bound to a lease, prefix scans, deletes, and per-key watches.
//! [`CoordinationStore`] captures exactly those. [`EtcdStore`] is the
//! production binding; [`MemoryStore`] implements the same contract inside
//! the process for single-node deployments and tests.

use async_trait::async_trait;
use velorpc_common::Result;

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

pub type LeaseId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String },
}

/// Handle that keeps one lease alive.
#[async_trait]
pub trait LeaseKeepAlive: Send {
    /// Renews the lease once and returns its remaining TTL in seconds.
    ///
    /// An error means the lease is gone and will not come back.
    async fn renew(&mut self) -> Result<i64>;
}

/// Ordered notifications for one watched key.
#[async_trait]
pub trait WatchStream: Send {
    /// Next event, or `Ok(None)` once the backend closed the watch.
    async fn next_event(&mut self) -> Result<Option<WatchEvent>>;
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// Writes `key`, bound to `lease` when given so it vanishes with the lease.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()>;

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Revokes a lease, deleting every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    async fn keep_alive(&self, lease: LeaseId) -> Result<Box<dyn LeaseKeepAlive>>;

    async fn watch(&self, key: &str) -> Result<Box<dyn WatchStream>>;

    async fn close(&self) -> Result<()>;
}
