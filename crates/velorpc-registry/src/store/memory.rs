use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;
use velorpc_common::{Result, RpcError};

use super::{CoordinationStore, KeyValue, LeaseId, LeaseKeepAlive, WatchEvent, WatchStream};

const EVENT_CAPACITY: usize = 1024;

/// In-process coordination store.
///
/// Leases expire lazily: every operation first purges leases whose TTL has
/// passed, deleting their keys and notifying watchers. Time comes from
/// `tokio::time`, so tests running on a paused clock control expiry.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
    closed: AtomicBool,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
}

struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl_secs: i64,
    expires_at: Instant,
    keys: HashSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                events,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Expires a lease immediately, as if its TTL had run out.
    pub fn expire_lease(&self, lease: LeaseId) -> bool {
        let mut state = self.state();
        self.drop_lease(&mut state, lease)
    }

    /// Lease a key is currently bound to.
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let mut state = self.state();
        self.purge_expired(&mut state);
        state.entries.get(key).and_then(|entry| entry.lease)
    }

    pub fn live_leases(&self) -> usize {
        let mut state = self.state();
        self.purge_expired(&mut state);
        state.leases.len()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::Connection("memory store is closed".into()));
        }
        Ok(())
    }

    fn purge_expired(&self, state: &mut State) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            tracing::debug!("Lease {:x} expired", id);
            self.drop_lease(state, id);
        }
    }

    fn drop_lease(&self, state: &mut State, id: LeaseId) -> bool {
        let Some(lease) = state.leases.remove(&id) else {
            return false;
        };
        for key in lease.keys {
            if state.entries.remove(&key).is_some() {
                self.notify(WatchEvent::Delete { key });
            }
        }
        true
    }

    fn remove_key(&self, state: &mut State, key: &str) {
        if let Some(entry) = state.entries.remove(key) {
            if let Some(lease) = entry.lease.and_then(|id| state.leases.get_mut(&id)) {
                lease.keys.remove(key);
            }
            self.notify(WatchEvent::Delete { key: key.to_string() });
        }
    }

    fn notify(&self, event: WatchEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        self.ensure_open()?;
        if ttl_secs <= 0 {
            return Err(RpcError::InvalidRequest(format!("lease TTL must be positive, got {}", ttl_secs)));
        }
        let mut state = self.state();
        self.purge_expired(&mut state);
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            Lease {
                ttl_secs,
                expires_at: Instant::now() + Duration::from_secs(ttl_secs as u64),
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state();
        self.purge_expired(&mut state);

        if let Some(id) = lease {
            match state.leases.get_mut(&id) {
                Some(lease) => {
                    lease.keys.insert(key.to_string());
                }
                None => return Err(RpcError::Connection(format!("lease {:x} not found", id))),
            }
        }

        let previous = state.entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
            },
        );
        if let Some(old_lease) = previous.and_then(|e| e.lease).filter(|old| Some(*old) != lease) {
            if let Some(old) = state.leases.get_mut(&old_lease) {
                old.keys.remove(key);
            }
        }

        self.notify(WatchEvent::Put(KeyValue {
            key: key.to_string(),
            value,
        }));
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        self.ensure_open()?;
        let mut state = self.state();
        self.purge_expired(&mut state);
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state();
        self.purge_expired(&mut state);
        self.remove_key(&mut state, key);
        Ok(())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state();
        self.purge_expired(&mut state);
        if !self.drop_lease(&mut state, lease) {
            return Err(RpcError::Connection(format!("lease {:x} not found", lease)));
        }
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Box<dyn LeaseKeepAlive>> {
        self.ensure_open()?;
        let mut state = self.state();
        self.purge_expired(&mut state);
        if !state.leases.contains_key(&lease) {
            return Err(RpcError::Connection(format!("lease {:x} not found", lease)));
        }
        Ok(Box::new(MemoryKeepAlive {
            store: self.clone(),
            lease,
        }))
    }

    async fn watch(&self, key: &str) -> Result<Box<dyn WatchStream>> {
        self.ensure_open()?;
        Ok(Box::new(MemoryWatch {
            key: key.to_string(),
            events: self.inner.events.subscribe(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct MemoryKeepAlive {
    store: MemoryStore,
    lease: LeaseId,
}

#[async_trait]
impl LeaseKeepAlive for MemoryKeepAlive {
    async fn renew(&mut self) -> Result<i64> {
        self.store.ensure_open()?;
        let mut state = self.store.state();
        self.store.purge_expired(&mut state);
        match state.leases.get_mut(&self.lease) {
            Some(lease) => {
                lease.expires_at = Instant::now() + Duration::from_secs(lease.ttl_secs as u64);
                Ok(lease.ttl_secs)
            }
            None => Err(RpcError::Registration(format!("lease {:x} expired", self.lease))),
        }
    }
}

struct MemoryWatch {
    key: String,
    events: broadcast::Receiver<WatchEvent>,
}

#[async_trait]
impl WatchStream for MemoryWatch {
    async fn next_event(&mut self) -> Result<Option<WatchEvent>> {
        loop {
            let event = match self.events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Err(RpcError::Connection(format!(
                        "watch on {} lagged and missed {} events",
                        self.key, missed
                    )))
                }
            };
            let key = match &event {
                WatchEvent::Put(kv) => &kv.key,
                WatchEvent::Delete { key } => key,
            };
            if *key == self.key {
                return Ok(Some(event));
            }
        }
    }
}
