use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use velorpc_common::transport::codec;
use velorpc_common::{
    CallRequest, CallResponse, ReferenceConfig, Result, RpcConfig, RpcError, Value, WireMessage,
};
use velorpc_registry::{Registry, ServiceInstance};

use crate::exchange::{self, Exchange};
use crate::load_balancer::{RequestAttributes, METHOD_NAME_ATTRIBUTE};
use crate::pool::WorkerPool;
use crate::retry::Attempt;
use crate::strategies::Strategies;
use crate::tolerance::{FailureContext, Reinvoke};

/// Calls methods of one remote interface by name.
///
/// Every call goes through discovery, load balancing, serialization, the
/// worker pool, retry and fault tolerance. Strategy keys come from the
/// [`ReferenceConfig`] when set there and from the client's [`RpcConfig`]
/// otherwise.
#[derive(Clone)]
pub struct ServiceProxy {
    reference: ReferenceConfig,
    config: Arc<RpcConfig>,
    registry: Arc<dyn Registry>,
    strategies: Arc<Strategies>,
    pool: Arc<WorkerPool>,
    exchange: Arc<dyn Exchange>,
}

impl ServiceProxy {
    pub(crate) fn new(
        reference: ReferenceConfig,
        config: Arc<RpcConfig>,
        registry: Arc<dyn Registry>,
        strategies: Arc<Strategies>,
        pool: Arc<WorkerPool>,
        exchange: Arc<dyn Exchange>,
    ) -> Self {
        Self {
            reference,
            config,
            registry,
            strategies,
            pool,
            exchange,
        }
    }

    pub fn reference(&self) -> &ReferenceConfig {
        &self.reference
    }

    /// Invokes `method` and returns the provider's response.
    ///
    /// Exchange failures never surface as `Err`: they are retried and then
    /// converted by the tolerance strategy, and a call that outlives the
    /// call timeout yields a failed response. `Err` is reserved for problems
    /// found before anything is sent (bad arguments, discovery, encoding).
    pub async fn call(
        &self,
        method: &str,
        parameter_types: &[&str],
        args: Vec<Value>,
    ) -> Result<CallResponse> {
        if parameter_types.len() != args.len() {
            return Err(RpcError::InvalidRequest(format!(
                "{} parameter types for {} arguments",
                parameter_types.len(),
                args.len()
            )));
        }

        let request = CallRequest {
            service_name: self.reference.service_name.clone(),
            method_name: method.to_string(),
            service_version: self.reference.service_version.clone(),
            service_group: self.reference.service_group.clone(),
            parameter_types: parameter_types.iter().map(|t| t.to_string()).collect(),
            args,
        };

        if self.reference.mock.unwrap_or(self.config.mock) {
            debug!("Mock call {}.{}", request.service_key(), method);
            return Ok(CallResponse::success(Value::Null, Value::Null.kind_name()));
        }

        let service_key = request.service_key();
        let candidates = self.registry.discover(&service_key).await?;

        let load_balancer = self.strategies.load_balancers.resolve(Some(
            self.reference
                .load_balancer
                .as_deref()
                .unwrap_or(&self.config.load_balancer),
        ));
        let mut attributes = RequestAttributes::new();
        attributes.insert(METHOD_NAME_ATTRIBUTE.to_string(), method.to_string());
        let target = load_balancer
            .select(&attributes, &candidates)
            .ok_or_else(|| RpcError::NoProvidersAvailable(service_key.clone()))?;

        let serializer = self.strategies.serializers.resolve(Some(
            self.reference
                .serializer
                .as_deref()
                .unwrap_or(&self.config.serializer),
        ));
        let message = WireMessage::request(serializer.kind(), request);
        let request_id = message.request_id();
        let frame = codec::encode_with(&message, serializer.as_ref())?;

        let retry = self.strategies.retries.resolve(Some(
            self.reference
                .retry_strategy
                .as_deref()
                .unwrap_or(&self.config.retry_strategy),
        ));
        let tolerance = self.strategies.tolerances.resolve(Some(
            self.reference
                .tolerance_strategy
                .as_deref()
                .unwrap_or(&self.config.tolerance_strategy),
        ));

        let sender = Sender {
            exchange: self.exchange.clone(),
            frame: Arc::new(frame),
            request_id,
        };
        let method_name = method.to_string();
        let job_key = service_key.clone();

        let job = async move {
            match retry.execute(sender.attempt(target.clone())).await {
                Ok(response) => response,
                Err(error) => {
                    let context = FailureContext {
                        service_key: job_key,
                        method_name,
                        failed: target,
                        candidates,
                        reinvoke: sender.reinvoke(),
                    };
                    tolerance.tolerate(&context, error).await
                }
            }
        };

        let timeout_ms = self.config.call_timeout_ms;
        match self.pool.run(Duration::from_millis(timeout_ms), job).await {
            Ok(response) => Ok(response),
            Err(RpcError::Timeout(ms)) => {
                warn!("Call {}.{} timed out after {}ms", service_key, method, ms);
                Ok(CallResponse::failure(
                    format!("call timed out after {}ms", ms),
                    RpcError::Timeout(ms).to_string(),
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Invokes `method` and returns its result value.
    ///
    /// # Errors
    ///
    /// Everything [`ServiceProxy::call`] returns, plus `RemoteInvocation`
    /// when the response carries an error.
    pub async fn invoke(&self, method: &str, parameter_types: &[&str], args: Vec<Value>) -> Result<Value> {
        let response = self.call(method, parameter_types, args).await?;
        if let Some(error) = response.error {
            return Err(RpcError::RemoteInvocation(format!("{}: {}", response.message, error)));
        }
        Ok(response.data.unwrap_or_default())
    }

    /// Like [`ServiceProxy::invoke`], decoding the result into `T`.
    pub async fn invoke_as<T: DeserializeOwned>(
        &self,
        method: &str,
        parameter_types: &[&str],
        args: Vec<Value>,
    ) -> Result<T> {
        self.invoke(method, parameter_types, args).await?.decode()
    }
}

/// Everything needed to put the encoded request on the wire again.
#[derive(Clone)]
struct Sender {
    exchange: Arc<dyn Exchange>,
    frame: Arc<Vec<u8>>,
    request_id: u64,
}

impl Sender {
    fn send(&self, target: ServiceInstance) -> BoxFuture<'static, Result<CallResponse>> {
        let sender = self.clone();
        Box::pin(async move {
            exchange::send(
                sender.exchange.as_ref(),
                &target,
                sender.frame.as_ref().clone(),
                sender.request_id,
            )
            .await
        })
    }

    fn attempt(&self, target: ServiceInstance) -> Attempt {
        let sender = self.clone();
        Box::new(move || sender.send(target.clone()))
    }

    fn reinvoke(&self) -> Reinvoke {
        let sender = self.clone();
        Arc::new(move |target: ServiceInstance| sender.send(target))
    }
}
