use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions,
    Watcher,
};
use tracing::{debug, info};
use velorpc_common::{RegistryConfig, Result, RpcError};

use super::{CoordinationStore, KeyValue, LeaseId, LeaseKeepAlive, WatchEvent, WatchStream};

/// etcd-backed coordination store.
///
/// The etcd client multiplexes over one gRPC channel and is cheap to clone,
/// so every operation works on its own clone.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connects to the comma-separated endpoints in `config.address`.
    pub async fn connect(config: &RegistryConfig) -> Result<Self> {
        let endpoints: Vec<String> = config
            .address
            .split(',')
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        if endpoints.is_empty() {
            return Err(RpcError::Config("registry.address is empty".into()));
        }

        let mut options = ConnectOptions::new()
            .with_connect_timeout(Duration::from_millis(config.timeout_ms))
            .with_timeout(Duration::from_millis(config.timeout_ms));
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(user.clone(), password.clone());
        }

        let client = Client::connect(&endpoints, Some(options))
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to connect to etcd at {:?}: {}", endpoints, e)))?;

        info!("Connected to etcd at {:?}", endpoints);
        Ok(Self { client })
    }

    fn client(&self) -> Client {
        self.client.clone()
    }
}

fn etcd_error(op: &str, err: etcd_client::Error) -> RpcError {
    RpcError::Connection(format!("etcd {} failed: {}", op, err))
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let response = self
            .client()
            .lease_grant(ttl_secs, None)
            .await
            .map_err(|e| etcd_error("lease grant", e))?;
        Ok(response.id())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        self.client()
            .put(key, value, options)
            .await
            .map_err(|e| etcd_error("put", e))?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let response = self
            .client()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| etcd_error("get", e))?;

        let mut entries = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            match kv.key_str() {
                Ok(key) => entries.push(KeyValue {
                    key: key.to_string(),
                    value: kv.value().to_vec(),
                }),
                Err(e) => debug!("Skipping non-UTF-8 etcd key under {}: {}", prefix, e),
            }
        }
        Ok(entries)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client()
            .delete(key, None)
            .await
            .map_err(|e| etcd_error("delete", e))?;
        Ok(())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.client()
            .lease_revoke(lease)
            .await
            .map_err(|e| etcd_error("lease revoke", e))?;
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Box<dyn LeaseKeepAlive>> {
        let (keeper, stream) = self
            .client()
            .lease_keep_alive(lease)
            .await
            .map_err(|e| etcd_error("lease keep-alive", e))?;
        Ok(Box::new(EtcdKeepAlive { keeper, stream }))
    }

    async fn watch(&self, key: &str) -> Result<Box<dyn WatchStream>> {
        let (watcher, stream) = self
            .client()
            .watch(key, None)
            .await
            .map_err(|e| etcd_error("watch", e))?;
        Ok(Box::new(EtcdWatch {
            _watcher: watcher,
            stream,
            pending: VecDeque::new(),
        }))
    }

    async fn close(&self) -> Result<()> {
        // Dropping the last client clone closes the channel
        debug!("Closing etcd store");
        Ok(())
    }
}

struct EtcdKeepAlive {
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
}

#[async_trait]
impl LeaseKeepAlive for EtcdKeepAlive {
    async fn renew(&mut self) -> Result<i64> {
        let lease = self.keeper.id();
        self.keeper
            .keep_alive()
            .await
            .map_err(|e| etcd_error("lease keep-alive", e))?;

        match self.stream.message().await {
            Ok(Some(response)) if response.ttl() > 0 => Ok(response.ttl()),
            Ok(Some(_)) => Err(RpcError::Registration(format!("lease {:x} expired", lease))),
            Ok(None) => Err(RpcError::Connection(format!(
                "keep-alive stream for lease {:x} closed",
                lease
            ))),
            Err(e) => Err(etcd_error("lease keep-alive", e)),
        }
    }
}

struct EtcdWatch {
    // Dropping the watcher cancels the watch
    _watcher: Watcher,
    stream: etcd_client::WatchStream,
    pending: VecDeque<WatchEvent>,
}

#[async_trait]
impl WatchStream for EtcdWatch {
    async fn next_event(&mut self) -> Result<Option<WatchEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            let Some(response) = self
                .stream
                .message()
                .await
                .map_err(|e| etcd_error("watch", e))?
            else {
                return Ok(None);
            };

            if response.canceled() {
                return Ok(None);
            }

            for event in response.events() {
                let Some(kv) = event.kv() else { continue };
                let Ok(key) = kv.key_str() else { continue };
                let event = match event.event_type() {
                    EventType::Put => WatchEvent::Put(KeyValue {
                        key: key.to_string(),
                        value: kv.value().to_vec(),
                    }),
                    EventType::Delete => WatchEvent::Delete {
                        key: key.to_string(),
                    },
                };
                self.pending.push_back(event);
            }
        }
    }
}
