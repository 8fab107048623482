//! Retry strategies for a single exchange.
//!
//! Only recoverable errors (see [`RpcError::is_retryable`]) are retried.
//! Everything else is returned on the first failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::warn;
use velorpc_common::{CallResponse, Result, RpcConfig, StrategyRegistry};

/// Produces a fresh exchange future each time it is called.
pub type Attempt = Box<dyn FnMut() -> BoxFuture<'static, Result<CallResponse>> + Send>;

/// Key of the strategy used when none is configured.
pub const DEFAULT_RETRY_STRATEGY: &str = "fixed_interval";

#[async_trait]
pub trait RetryStrategy: Send + Sync {
    async fn execute(&self, attempt: Attempt) -> Result<CallResponse>;
}

/// Retries after a constant pause, up to `max_attempts` attempts in total.
#[derive(Debug, Clone)]
pub struct FixedIntervalRetry {
    max_attempts: u32,
    interval: Duration,
}

impl FixedIntervalRetry {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    pub fn from_config(config: &RpcConfig) -> Self {
        Self::new(
            config.max_retry_attempts,
            Duration::from_millis(config.retry_interval_ms),
        )
    }
}

#[async_trait]
impl RetryStrategy for FixedIntervalRetry {
    async fn execute(&self, mut attempt: Attempt) -> Result<CallResponse> {
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && tries < self.max_attempts => {
                    warn!(
                        "Exchange failed (attempt {}/{}): {}, retrying in {:?}",
                        tries, self.max_attempts, e, self.interval
                    );
                    tokio::time::sleep(self.interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Exponential backoff between attempts, capped at `max_backoff_ms`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffRetry {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// First pause. Default: 50ms
    pub initial_backoff_ms: u64,
    /// Default: 5000ms
    pub max_backoff_ms: u64,
    /// Default: 2.0
    pub backoff_multiplier: f64,
}

impl Default for ExponentialBackoffRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ExponentialBackoffRetry {
    pub fn from_config(config: &RpcConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            ..Self::default()
        }
    }

    fn next_backoff(&self, backoff_ms: u64) -> u64 {
        std::cmp::min(
            (backoff_ms as f64 * self.backoff_multiplier) as u64,
            self.max_backoff_ms,
        )
    }
}

#[async_trait]
impl RetryStrategy for ExponentialBackoffRetry {
    async fn execute(&self, mut attempt: Attempt) -> Result<CallResponse> {
        let mut backoff_ms = self.initial_backoff_ms;
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && tries < self.max_attempts => {
                    warn!(
                        "Exchange failed (attempt {}/{}): {}, retrying in {}ms",
                        tries, self.max_attempts, e, backoff_ms
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = self.next_backoff(backoff_ms);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Runs the exchange exactly once.
#[derive(Debug, Default)]
pub struct NoRetry;

#[async_trait]
impl RetryStrategy for NoRetry {
    async fn execute(&self, mut attempt: Attempt) -> Result<CallResponse> {
        attempt().await
    }
}

/// Built-in strategies keyed by name, sized from `config`.
pub fn retry_strategies(config: &RpcConfig) -> StrategyRegistry<dyn RetryStrategy> {
    let strategies: StrategyRegistry<dyn RetryStrategy> = StrategyRegistry::new(
        "retry strategy",
        DEFAULT_RETRY_STRATEGY,
        Arc::new(FixedIntervalRetry::from_config(config)),
    );
    strategies.register(
        "exponential_backoff",
        Arc::new(ExponentialBackoffRetry::from_config(config)),
    );
    strategies.register("no_retry", Arc::new(NoRetry));
    strategies
}
