use std::sync::Arc;

use velorpc_common::serializer::{builtin_serializers, PostcardSerializer, DEFAULT_SERIALIZER};
use velorpc_common::{RpcConfig, Serializer, StrategyRegistry};

use crate::load_balancer::{load_balancer_strategies, LoadBalancer};
use crate::retry::{retry_strategies, RetryStrategy};
use crate::tolerance::{tolerance_strategies, ToleranceStrategy};

/// Every pluggable capability of the call pipeline, resolved by key per call.
///
/// Applications add their own implementations through the public registries
/// before handing the set to an [`RpcClient`](crate::RpcClient).
pub struct Strategies {
    pub serializers: StrategyRegistry<dyn Serializer>,
    pub load_balancers: StrategyRegistry<dyn LoadBalancer>,
    pub retries: StrategyRegistry<dyn RetryStrategy>,
    pub tolerances: StrategyRegistry<dyn ToleranceStrategy>,
}

impl Strategies {
    /// The built-in implementations, with retry sized from `config`.
    pub fn builtin(config: &RpcConfig) -> Self {
        let serializers: StrategyRegistry<dyn Serializer> =
            StrategyRegistry::new("serializer", DEFAULT_SERIALIZER, Arc::new(PostcardSerializer));
        serializers.load(builtin_serializers());

        Self {
            serializers,
            load_balancers: load_balancer_strategies(),
            retries: retry_strategies(config),
            tolerances: tolerance_strategies(),
        }
    }
}
