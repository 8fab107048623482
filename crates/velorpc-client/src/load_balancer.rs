//! Endpoint selection policies.
//!
//! Every policy handles the degenerate cases the same way: no candidates
//! selects nothing, and a single candidate is returned directly without
//! consulting the policy.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use velorpc_common::StrategyRegistry;
use velorpc_registry::ServiceInstance;

/// Per-call attributes a policy may key on.
pub type RequestAttributes = HashMap<String, String>;

/// Attribute carrying the invoked method name.
pub const METHOD_NAME_ATTRIBUTE: &str = "methodName";

/// Key of the policy used when none is configured.
pub const DEFAULT_LOAD_BALANCER: &str = "random";

const VIRTUAL_NODES: usize = 100;

pub trait LoadBalancer: Send + Sync {
    fn select(&self, attributes: &RequestAttributes, candidates: &[ServiceInstance]) -> Option<ServiceInstance> {
        match candidates {
            [] => None,
            [only] => Some(only.clone()),
            _ => Some(candidates[self.pick(attributes, candidates)].clone()),
        }
    }

    /// Index into `candidates`, which holds at least two instances.
    fn pick(&self, attributes: &RequestAttributes, candidates: &[ServiceInstance]) -> usize;
}

/// Uniformly random selection.
#[derive(Debug, Default)]
pub struct RandomLoadBalancer;

impl LoadBalancer for RandomLoadBalancer {
    fn pick(&self, _: &RequestAttributes, candidates: &[ServiceInstance]) -> usize {
        rand::thread_rng().gen_range(0..candidates.len())
    }
}

/// Cycles through candidates in order.
#[derive(Debug, Default)]
pub struct RoundRobinLoadBalancer {
    next: AtomicUsize,
}

impl RoundRobinLoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn pick(&self, _: &RequestAttributes, candidates: &[ServiceInstance]) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % candidates.len()
    }
}

/// Random selection proportional to each instance's weight. A weight of
/// zero counts as one.
#[derive(Debug, Default)]
pub struct WeightedRandomLoadBalancer;

impl LoadBalancer for WeightedRandomLoadBalancer {
    fn pick(&self, _: &RequestAttributes, candidates: &[ServiceInstance]) -> usize {
        let weight = |i: &ServiceInstance| u64::from(i.weight.max(1));
        let total: u64 = candidates.iter().map(weight).sum();
        let mut point = rand::thread_rng().gen_range(0..total);
        for (index, candidate) in candidates.iter().enumerate() {
            let w = weight(candidate);
            if point < w {
                return index;
            }
            point -= w;
        }
        candidates.len() - 1
    }
}

/// Maps the method name onto a hash ring of the candidates, so calls to the
/// same method stick to the same instance while the candidate set is stable.
#[derive(Debug, Default)]
pub struct ConsistentHashLoadBalancer;

fn hash_of<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

impl LoadBalancer for ConsistentHashLoadBalancer {
    fn pick(&self, attributes: &RequestAttributes, candidates: &[ServiceInstance]) -> usize {
        let mut ring = BTreeMap::new();
        for (index, candidate) in candidates.iter().enumerate() {
            let node_key = candidate.node_key();
            for replica in 0..VIRTUAL_NODES {
                ring.insert(hash_of(&format!("{}#{}", node_key, replica)), index);
            }
        }

        let key = attributes
            .get(METHOD_NAME_ATTRIBUTE)
            .map(String::as_str)
            .unwrap_or_default();
        let point = hash_of(key);

        ring.range(point..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, index)| *index)
            .unwrap_or(0)
    }
}

/// Built-in policies keyed by name.
pub fn load_balancer_strategies() -> StrategyRegistry<dyn LoadBalancer> {
    let strategies: StrategyRegistry<dyn LoadBalancer> =
        StrategyRegistry::new("load balancer", DEFAULT_LOAD_BALANCER, Arc::new(RandomLoadBalancer));
    strategies.register("round_robin", Arc::new(RoundRobinLoadBalancer::new()));
    strategies.register("weighted_random", Arc::new(WeightedRandomLoadBalancer));
    strategies.register("consistent_hash", Arc::new(ConsistentHashLoadBalancer));
    strategies
}
