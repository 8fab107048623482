//! VeloRPC Client
//!
//! The consumer side of a call: find providers in the registry, pick one,
//! encode the request, exchange it over TCP or HTTP and turn failures into
//! responses the caller can act on.
//!
//! # Pipeline
//!
//! 1. **Discovery** through the shared [`Registry`](velorpc_registry::Registry)
//! 2. **Load balancing** ([`load_balancer`]): random, round robin, weighted, consistent hash
//! 3. **Encoding** with the serializer resolved for the call
//! 4. **Worker pool** ([`pool`]): bounded concurrency with a caller-runs overflow
//! 5. **Retry** ([`retry`]) of recoverable transport errors
//! 6. **Fault tolerance** ([`tolerance`]) once retries are exhausted
//!
//! Every pluggable step is looked up by key in [`Strategies`], so a
//! [`ReferenceConfig`](velorpc_common::ReferenceConfig) can override any of
//! them per interface.

pub mod client;
pub mod exchange;
pub mod load_balancer;
pub mod pool;
pub mod proxy;
pub mod retry;
pub mod strategies;
pub mod tolerance;

pub use client::RpcClient;
pub use exchange::{Exchange, HttpExchange, TcpExchange};
pub use load_balancer::LoadBalancer;
pub use pool::WorkerPool;
pub use proxy::ServiceProxy;
pub use retry::RetryStrategy;
pub use strategies::Strategies;
pub use tolerance::ToleranceStrategy;
