//! Fault tolerance: turning a terminal call failure into a caller-visible
//! response.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, info, warn};
use velorpc_common::{CallResponse, Result, RpcError, StrategyRegistry};
use velorpc_registry::ServiceInstance;

/// Repeats the failed exchange against another instance.
pub type Reinvoke = Arc<dyn Fn(ServiceInstance) -> BoxFuture<'static, Result<CallResponse>> + Send + Sync>;

/// Key of the strategy used when none is configured.
pub const DEFAULT_TOLERANCE_STRATEGY: &str = "fail_fast";

/// What a tolerance strategy knows about the failed call.
pub struct FailureContext {
    pub service_key: String,
    pub method_name: String,
    /// Instance the final attempt went to
    pub failed: ServiceInstance,
    /// Everything discovery returned for the call, `failed` included
    pub candidates: Vec<ServiceInstance>,
    pub reinvoke: Reinvoke,
}

#[async_trait]
pub trait ToleranceStrategy: Send + Sync {
    async fn tolerate(&self, context: &FailureContext, error: RpcError) -> CallResponse;
}

/// Surfaces the error to the caller.
#[derive(Debug, Default)]
pub struct FailFast;

#[async_trait]
impl ToleranceStrategy for FailFast {
    async fn tolerate(&self, context: &FailureContext, error: RpcError) -> CallResponse {
        debug!(
            "{}.{} failed on {}: {}",
            context.service_key,
            context.method_name,
            context.failed.address(),
            error
        );
        CallResponse::failure(
            format!("call to {}.{} failed", context.service_key, context.method_name),
            error.to_string(),
        )
    }
}

/// Swallows the error and answers with an empty successful response.
#[derive(Debug, Default)]
pub struct FailSafe;

#[async_trait]
impl ToleranceStrategy for FailSafe {
    async fn tolerate(&self, context: &FailureContext, error: RpcError) -> CallResponse {
        info!(
            "Ignoring failed call {}.{}: {}",
            context.service_key, context.method_name, error
        );
        CallResponse::empty()
    }
}

/// Tries every other candidate once, in discovery order.
#[derive(Debug, Default)]
pub struct FailOver;

#[async_trait]
impl ToleranceStrategy for FailOver {
    async fn tolerate(&self, context: &FailureContext, error: RpcError) -> CallResponse {
        let failed_key = context.failed.node_key();
        let mut last_error = error;

        for candidate in context.candidates.iter().filter(|c| c.node_key() != failed_key) {
            warn!(
                "Failing over {}.{} to {} after: {}",
                context.service_key,
                context.method_name,
                candidate.address(),
                last_error
            );
            match (context.reinvoke)(candidate.clone()).await {
                Ok(response) => return response,
                Err(e) => last_error = e,
            }
        }

        CallResponse::failure(
            format!(
                "call to {}.{} failed on every provider",
                context.service_key, context.method_name
            ),
            last_error.to_string(),
        )
    }
}

/// Built-in strategies keyed by name.
pub fn tolerance_strategies() -> StrategyRegistry<dyn ToleranceStrategy> {
    let strategies: StrategyRegistry<dyn ToleranceStrategy> =
        StrategyRegistry::new("tolerance strategy", DEFAULT_TOLERANCE_STRATEGY, Arc::new(FailFast));
    strategies.register("fail_safe", Arc::new(FailSafe));
    strategies.register("fail_over", Arc::new(FailOver));
    strategies
}
