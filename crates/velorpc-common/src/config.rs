//! Runtime configuration.
//!
//! [`RpcConfig`] starts from built-in defaults and can be overridden from a
//! flat key-value map ([`RpcConfig::from_properties`]) or from `RPC_*`
//! environment variables ([`RpcConfig::from_env`]). Keys may carry an
//! optional `rpc.` prefix:
//!
//! ```text
//! rpc.serializer=json
//! rpc.registry.address=http://10.0.0.2:2379
//! rpc.pool.max_workers=32
//! ```
//!
//! The environment form replaces dots with underscores and upper-cases the
//! key, e.g. `RPC_REGISTRY_ADDRESS` or `RPC_LOAD_BALANCER`.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::protocol::error::{Result, RpcError};
use crate::protocol::requests::{service_key, DEFAULT_SERVICE_GROUP, DEFAULT_SERVICE_VERSION};

const KEY_PREFIX: &str = "rpc.";
const ENV_PREFIX: &str = "RPC_";

/// Every key understood by [`RpcConfig::set`].
pub const CONFIG_KEYS: &[&str] = &[
    "name",
    "version",
    "server.host",
    "server.port",
    "serializer",
    "load_balancer",
    "retry_strategy",
    "tolerance_strategy",
    "transport",
    "mock",
    "max_retry_attempts",
    "retry_interval_ms",
    "call_timeout_ms",
    "pool.max_workers",
    "pool.backlog",
    "registry.kind",
    "registry.address",
    "registry.username",
    "registry.password",
    "registry.timeout_ms",
    "registry.lease_ttl_secs",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcConfig {
    pub name: String,
    pub version: String,
    /// Host a provider advertises in the registry
    pub server_host: String,
    pub server_port: u16,
    pub serializer: String,
    pub load_balancer: String,
    pub retry_strategy: String,
    pub tolerance_strategy: String,
    /// `tcp` or `http`
    pub transport: String,
    /// Return placeholder results without any network traffic
    pub mock: bool,
    /// Total attempts per exchange, including the first
    pub max_retry_attempts: u32,
    pub retry_interval_ms: u64,
    /// How long a caller waits for a call before degrading
    pub call_timeout_ms: u64,
    pub pool: WorkerPoolConfig,
    pub registry: RegistryConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            name: "velorpc".to_string(),
            version: "1.0".to_string(),
            server_host: "localhost".to_string(),
            server_port: 8080,
            serializer: "postcard".to_string(),
            load_balancer: "random".to_string(),
            retry_strategy: "fixed_interval".to_string(),
            tolerance_strategy: "fail_fast".to_string(),
            transport: "tcp".to_string(),
            mock: false,
            max_retry_attempts: 5,
            retry_interval_ms: 200,
            call_timeout_ms: 1000,
            pool: WorkerPoolConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

/// Sizing of the client worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Exchanges allowed to run at once
    pub max_workers: usize,
    /// Submissions allowed to wait for a worker before callers run inline
    pub backlog: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            backlog: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry backend key (`etcd` or `memory`)
    pub kind: String,
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: u64,
    pub lease_ttl_secs: i64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: "etcd".to_string(),
            address: "http://localhost:2379".to_string(),
            username: None,
            password: None,
            timeout_ms: 5000,
            lease_ttl_secs: 10,
        }
    }
}

impl RpcConfig {
    /// Defaults overridden by `properties`.
    ///
    /// Unknown keys are ignored with a debug log so that one properties file
    /// can be shared with other components.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        config.apply_properties(properties)?;
        Ok(config)
    }

    /// Defaults overridden by `RPC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    pub fn apply_properties(&mut self, properties: &HashMap<String, String>) -> Result<()> {
        let mut keys: Vec<&String> = properties.keys().collect();
        keys.sort();
        for key in keys {
            let name = key.strip_prefix(KEY_PREFIX).unwrap_or(key);
            if CONFIG_KEYS.contains(&name) {
                self.set(name, &properties[key])?;
            } else {
                tracing::debug!("Ignoring unknown configuration key '{}'", key);
            }
        }
        Ok(())
    }

    /// Applies `RPC_*` variables from `vars`.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (var, value) in vars {
            let Some(suffix) = var.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let suffix = suffix.to_ascii_lowercase();
            if let Some(key) = CONFIG_KEYS.iter().find(|k| k.replace('.', "_") == suffix) {
                self.set(key, &value)?;
            }
        }
        Ok(())
    }

    /// Sets one key from its string form.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            "name" => self.name = value.to_string(),
            "version" => self.version = value.to_string(),
            "server.host" => self.server_host = value.to_string(),
            "server.port" => self.server_port = parse(key, value)?,
            "serializer" => self.serializer = value.to_string(),
            "load_balancer" => self.load_balancer = value.to_string(),
            "retry_strategy" => self.retry_strategy = value.to_string(),
            "tolerance_strategy" => self.tolerance_strategy = value.to_string(),
            "transport" => self.transport = value.to_string(),
            "mock" => self.mock = parse(key, value)?,
            "max_retry_attempts" => self.max_retry_attempts = parse(key, value)?,
            "retry_interval_ms" => self.retry_interval_ms = parse(key, value)?,
            "call_timeout_ms" => self.call_timeout_ms = parse(key, value)?,
            "pool.max_workers" => self.pool.max_workers = parse(key, value)?,
            "pool.backlog" => self.pool.backlog = parse(key, value)?,
            "registry.kind" => self.registry.kind = value.to_string(),
            "registry.address" => self.registry.address = value.to_string(),
            "registry.username" => self.registry.username = non_empty(value),
            "registry.password" => self.registry.password = non_empty(value),
            "registry.timeout_ms" => self.registry.timeout_ms = parse(key, value)?,
            "registry.lease_ttl_secs" => self.registry.lease_ttl_secs = parse(key, value)?,
            _ => return Err(RpcError::Config(format!("unknown configuration key '{}'", key))),
        }
        Ok(())
    }

    /// Rejects settings no component could run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_retry_attempts == 0 {
            return Err(RpcError::Config("max_retry_attempts must be at least 1".into()));
        }
        if self.call_timeout_ms == 0 {
            return Err(RpcError::Config("call_timeout_ms must be positive".into()));
        }
        if self.pool.max_workers == 0 {
            return Err(RpcError::Config("pool.max_workers must be at least 1".into()));
        }
        if self.registry.lease_ttl_secs <= 0 {
            return Err(RpcError::Config("registry.lease_ttl_secs must be positive".into()));
        }
        if !matches!(self.transport.as_str(), "tcp" | "http") {
            return Err(RpcError::Config(format!(
                "transport must be 'tcp' or 'http', got '{}'",
                self.transport
            )));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| RpcError::Config(format!("invalid value '{}' for '{}': {}", value, key, e)))
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Per-interface settings of a consumer. `None` fields inherit the
/// process-wide [`RpcConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceConfig {
    pub service_name: String,
    pub service_version: String,
    pub service_group: String,
    pub serializer: Option<String>,
    pub load_balancer: Option<String>,
    pub retry_strategy: Option<String>,
    pub tolerance_strategy: Option<String>,
    pub mock: Option<bool>,
}

impl ReferenceConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_version: DEFAULT_SERVICE_VERSION.to_string(),
            service_group: DEFAULT_SERVICE_GROUP.to_string(),
            serializer: None,
            load_balancer: None,
            retry_strategy: None,
            tolerance_strategy: None,
            mock: None,
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

    pub fn with_serializer(mut self, key: impl Into<String>) -> Self {
        self.serializer = Some(key.into());
        self
    }

    pub fn with_load_balancer(mut self, key: impl Into<String>) -> Self {
        self.load_balancer = Some(key.into());
        self
    }

    pub fn with_retry_strategy(mut self, key: impl Into<String>) -> Self {
        self.retry_strategy = Some(key.into());
        self
    }

    pub fn with_tolerance_strategy(mut self, key: impl Into<String>) -> Self {
        self.tolerance_strategy = Some(key.into());
        self
    }

    pub fn with_mock(mut self, mock: bool) -> Self {
        self.mock = Some(mock);
        self
    }

    pub fn service_key(&self) -> String {
        service_key(&self.service_name, &self.service_group, &self.service_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RpcConfig::default();
        assert_eq!(config.max_retry_attempts, 5);
        assert_eq!(config.retry_interval_ms, 200);
        assert_eq!(config.call_timeout_ms, 1000);
        assert_eq!(config.pool.max_workers, 10);
        assert_eq!(config.pool.backlog, 200);
        assert_eq!(config.registry.lease_ttl_secs, 10);
        assert_eq!(config.registry.timeout_ms, 5000);
        assert_eq!(config.load_balancer, "random");
        assert!(!config.mock);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_properties_with_and_without_prefix() {
        let mut props = HashMap::new();
        props.insert("rpc.serializer".to_string(), "json".to_string());
        props.insert("registry.address".to_string(), "http://10.0.0.2:2379".to_string());
        props.insert("rpc.pool.max_workers".to_string(), "32".to_string());
        props.insert("rpc.mock".to_string(), "true".to_string());
        props.insert("unrelated.key".to_string(), "x".to_string());

        let config = RpcConfig::from_properties(&props).unwrap();
        assert_eq!(config.serializer, "json");
        assert_eq!(config.registry.address, "http://10.0.0.2:2379");
        assert_eq!(config.pool.max_workers, 32);
        assert!(config.mock);
    }

    #[test]
    fn test_malformed_number_is_config_error() {
        let mut props = HashMap::new();
        props.insert("rpc.server.port".to_string(), "eighty".to_string());
        let err = RpcConfig::from_properties(&props).unwrap_err();
        assert!(matches!(err, RpcError::Config(_)));
        assert!(err.to_string().contains("server.port"));
    }

    #[test]
    fn test_env_overlay() {
        let mut config = RpcConfig::default();
        config
            .apply_env(vec![
                ("RPC_LOAD_BALANCER".to_string(), "round_robin".to_string()),
                ("RPC_REGISTRY_LEASE_TTL_SECS".to_string(), "30".to_string()),
                ("RPC_UNKNOWN".to_string(), "ignored".to_string()),
                ("PATH".to_string(), "/usr/bin".to_string()),
            ])
            .unwrap();
        assert_eq!(config.load_balancer, "round_robin");
        assert_eq!(config.registry.lease_ttl_secs, 30);
    }

    #[test]
    fn test_empty_credentials_are_none() {
        let mut config = RpcConfig::default();
        config.set("registry.username", "").unwrap();
        config.set("registry.password", "secret").unwrap();
        assert_eq!(config.registry.username, None);
        assert_eq!(config.registry.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_unknown_key_rejected_by_set() {
        let mut config = RpcConfig::default();
        assert!(matches!(config.set("nope", "1"), Err(RpcError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_attempts_and_bad_transport() {
        let mut config = RpcConfig::default();
        config.max_retry_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = RpcConfig::default();
        config.transport = "quic".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reference_config_service_key() {
        let reference = ReferenceConfig::new("Greeter").with_version("2.0").with_group("canary");
        assert_eq!(reference.service_key(), "Greeter:canary:2.0");
        assert_eq!(ReferenceConfig::new("Greeter").service_key(), "Greeter:default:1.0");
    }
}
