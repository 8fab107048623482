use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use velorpc_common::protocol::{service_key, DEFAULT_SERVICE_GROUP, DEFAULT_SERVICE_VERSION};
use velorpc_common::{Result, RpcConfig};
use velorpc_registry::{Registry, ServiceInstance};

use crate::dispatcher::Dispatcher;
use crate::http_server::HttpServer;
use crate::service::{LocalServiceTable, ServiceHandler};
use crate::tcp_server::RpcTcpServer;

/// How a service is advertised in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceExport {
    pub service_name: String,
    pub service_version: String,
    pub service_group: String,
    pub weight: u32,
}

impl ServiceExport {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_version: DEFAULT_SERVICE_VERSION.to_string(),
            service_group: DEFAULT_SERVICE_GROUP.to_string(),
            weight: 1,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.service_group = group.into();
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn service_key(&self) -> String {
        service_key(&self.service_name, &self.service_group, &self.service_version)
    }

    fn instance_at(&self, host: &str, port: u16) -> ServiceInstance {
        ServiceInstance::new(&self.service_name, &self.service_version, host, port)
            .with_group(&self.service_group)
            .with_weight(self.weight)
    }
}

struct Running {
    addr: SocketAddr,
    instances: Vec<ServiceInstance>,
    stop_server: oneshot::Sender<()>,
    server: JoinHandle<Result<()>>,
    supervisor: JoinHandle<()>,
}

/// Provider-side bootstrap.
///
/// Collects exported services, serves them on the configured transport,
/// registers one instance per service under a lease and keeps those
/// registrations alive: when the registry reports a lost lease the instance
/// is registered again.
pub struct Provider {
    config: RpcConfig,
    registry: Arc<dyn Registry>,
    services: Arc<LocalServiceTable>,
    exports: DashMap<String, ServiceExport>,
    running: Mutex<Option<Running>>,
}

impl Provider {
    /// `registry` must already be initialized.
    pub fn new(config: RpcConfig, registry: Arc<dyn Registry>) -> Self {
        Self {
            config,
            registry,
            services: Arc::new(LocalServiceTable::new()),
            exports: DashMap::new(),
            running: Mutex::new(None),
        }
    }

    /// Makes `handler` callable as `export`. Exports take effect in the
    /// registry on [`Provider::start`].
    pub fn export(&self, export: ServiceExport, handler: Arc<dyn ServiceHandler>) {
        let key = export.service_key();
        self.services.register(key.clone(), handler);
        self.exports.insert(key, export);
    }

    pub fn services(&self) -> &Arc<LocalServiceTable> {
        &self.services
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Address the listener is bound to, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|running| running.addr)
    }

    /// Instances registered by the running provider.
    pub async fn instances(&self) -> Vec<ServiceInstance> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.instances.clone())
            .unwrap_or_default()
    }

    /// Binds the listener and registers every export.
    ///
    /// The advertised port is the one actually bound, so `server.port = 0`
    /// works. Starting a running provider returns its address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            return Ok(current.addr);
        }
        self.config.validate()?;

        let bind_addr = format!("{}:{}", self.config.server_host, self.config.server_port);
        let dispatcher = Arc::new(Dispatcher::new(self.services.clone()));
        let (stop_server, stopped) = oneshot::channel::<()>();
        let shutdown = async move {
            let _ = stopped.await;
        };

        let (addr, server) = match self.config.transport.trim() {
            "http" => {
                let listener = HttpServer::bind(&bind_addr, dispatcher).await?;
                let addr = listener.local_addr()?;
                (addr, tokio::spawn(async move { listener.run_until(shutdown).await }))
            }
            _ => {
                let listener = RpcTcpServer::bind(&bind_addr, dispatcher).await?;
                let addr = listener.local_addr()?;
                (addr, tokio::spawn(async move { listener.run_until(shutdown).await }))
            }
        };

        // Subscribe before registering so no lease failure is missed
        let failures = self.registry.subscribe_lease_failures();

        let instances: Vec<ServiceInstance> = self
            .exports
            .iter()
            .map(|export| export.value().instance_at(&self.config.server_host, addr.port()))
            .collect();

        for (registered, instance) in instances.iter().enumerate() {
            if let Err(e) = self.registry.register(instance).await {
                error!("Failed to register {}: {}", instance.node_key(), e);
                for done in &instances[..registered] {
                    self.registry.unregister(done).await;
                }
                let _ = stop_server.send(());
                let _ = server.await;
                return Err(e);
            }
            info!("Registered {} at {}", instance.service_key(), instance.address());
        }

        let supervisor = tokio::spawn(supervise(
            self.registry.clone(),
            failures,
            instances
                .iter()
                .map(|instance| (instance.node_key(), instance.clone()))
                .collect(),
            Duration::from_millis(self.config.retry_interval_ms),
        ));

        info!(
            "Provider '{}' serving {} service(s) on {} ({})",
            self.config.name,
            instances.len(),
            addr,
            self.config.transport
        );

        *running = Some(Running {
            addr,
            instances,
            stop_server,
            server,
            supervisor,
        });
        Ok(addr)
    }

    /// Withdraws every registration, then stops the listener.
    ///
    /// Connections already accepted are not interrupted. Calling this on a
    /// stopped provider does nothing.
    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.supervisor.abort();
        for instance in &running.instances {
            self.registry.unregister(instance).await;
        }

        let _ = running.stop_server.send(());
        match running.server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Listener stopped with error: {}", e),
            Err(e) => warn!("Listener task failed: {}", e),
        }
        info!("Provider '{}' stopped", self.config.name);
    }
}

/// Registers lost instances again until it succeeds.
async fn supervise(
    registry: Arc<dyn Registry>,
    mut failures: broadcast::Receiver<ServiceInstance>,
    owned: HashMap<String, ServiceInstance>,
    retry_interval: Duration,
) {
    loop {
        let lost = match failures.recv().await {
            Ok(lost) => lost,
            Err(RecvError::Lagged(missed)) => {
                warn!("Missed {} lease failure events", missed);
                continue;
            }
            Err(RecvError::Closed) => return,
        };

        let node_key = lost.node_key();
        let Some(instance) = owned.get(&node_key) else {
            continue;
        };

        warn!("Lease lost for {}, registering again", node_key);
        loop {
            match registry.register(instance).await {
                Ok(()) => {
                    info!("Registered {} again", node_key);
                    break;
                }
                Err(e) => {
                    warn!("Registering {} again failed: {}", node_key, e);
                    tokio::time::sleep(retry_interval).await;
                }
            }
        }
    }
}
