use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use velorpc_common::{ReferenceConfig, Result, RpcConfig};
use velorpc_registry::{registry_strategies, Registry};

use crate::exchange::{exchange_for, Exchange};
use crate::pool::WorkerPool;
use crate::proxy::ServiceProxy;
use crate::strategies::Strategies;

/// Consumer-side entry point.
///
/// Owns the process-wide pieces of the call pipeline (registry, strategy
/// tables, worker pool and transport) and hands out [`ServiceProxy`]s that
/// share them. Cloning is cheap.
///
/// # Example
///
/// ```no_run
/// # use velorpc_client::RpcClient;
/// # use velorpc_common::{ReferenceConfig, RpcConfig, Value};
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = RpcClient::connect(RpcConfig::from_env()?).await?;
/// let greeter = client.proxy(ReferenceConfig::new("Greeter"));
/// let reply = greeter.invoke("greet", &["String"], vec![Value::from("world")]).await?;
/// println!("{:?}", reply);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    config: Arc<RpcConfig>,
    registry: Arc<dyn Registry>,
    strategies: Arc<Strategies>,
    pool: Arc<WorkerPool>,
    exchange: Arc<dyn Exchange>,
}

impl RpcClient {
    /// Validates `config`, resolves the registry backend it names and
    /// initializes it.
    pub async fn connect(config: RpcConfig) -> Result<Self> {
        config.validate()?;
        let registry = registry_strategies().resolve(Some(config.registry.kind.as_str()));
        registry.init(&config.registry).await?;
        info!(
            "Client '{}' connected to {} registry at {}",
            config.name, config.registry.kind, config.registry.address
        );
        Ok(Self::new(config, registry))
    }

    /// Client over an already initialized registry.
    pub fn new(config: RpcConfig, registry: Arc<dyn Registry>) -> Self {
        let exchange = exchange_for(&config.transport, Duration::from_millis(config.call_timeout_ms));
        Self {
            strategies: Arc::new(Strategies::builtin(&config)),
            pool: Arc::new(WorkerPool::new(&config.pool)),
            config: Arc::new(config),
            registry,
            exchange,
        }
    }

    /// Replaces the transport, e.g. with an in-process fake.
    pub fn with_exchange(mut self, exchange: Arc<dyn Exchange>) -> Self {
        self.exchange = exchange;
        self
    }

    pub fn with_strategies(mut self, strategies: Strategies) -> Self {
        self.strategies = Arc::new(strategies);
        self
    }

    /// Proxy for one remote interface.
    pub fn proxy(&self, reference: ReferenceConfig) -> ServiceProxy {
        ServiceProxy::new(
            reference,
            self.config.clone(),
            self.registry.clone(),
            self.strategies.clone(),
            self.pool.clone(),
            self.exchange.clone(),
        )
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn strategies(&self) -> &Strategies {
        &self.strategies
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}
