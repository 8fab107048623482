//! Provider-side service implementations and the table that routes calls to
//! them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tracing::{debug, info};
use velorpc_common::{CallResponse, Result, RpcError, Value};

/// A service implementation reachable over the wire.
///
/// Handlers receive calls already routed by service key. Choosing the
/// method by name and parameter types is up to the handler; [`MethodTable`]
/// does this for the common case.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn invoke(&self, method: &str, parameter_types: &[String], args: Vec<Value>) -> Result<CallResponse>;
}

type MethodFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

struct Method {
    return_type: String,
    call: MethodFn,
}

/// [`ServiceHandler`] built from closures, one per method signature.
///
/// Methods are keyed by name plus parameter type descriptors, so overloads
/// that share a name are told apart by what the caller says it passes.
///
/// # Example
///
/// ```
/// use velorpc_common::Value;
/// use velorpc_server::MethodTable;
///
/// let greeter = MethodTable::new("Greeter").method("greet", &["String"], "String", |args| async move {
///     let name = args[0].as_str().unwrap_or("nobody").to_string();
///     Ok(Value::from(format!("hello {}", name)))
/// });
/// assert_eq!(greeter.signatures(), vec!["greet(String)"]);
/// ```
pub struct MethodTable {
    service_name: String,
    methods: HashMap<(String, Vec<String>), Method>,
}

impl MethodTable {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            methods: HashMap::new(),
        }
    }

    /// Adds a method. A later method with the same signature replaces the
    /// earlier one.
    pub fn method<F, Fut>(mut self, name: &str, parameter_types: &[&str], return_type: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let call: MethodFn = Arc::new(move |args: Vec<Value>| -> BoxFuture<'static, Result<Value>> { Box::pin(f(args)) });
        let key = (
            name.to_string(),
            parameter_types.iter().map(|t| t.to_string()).collect(),
        );
        self.methods.insert(
            key,
            Method {
                return_type: return_type.to_string(),
                call,
            },
        );
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// `name(type, ...)` for every method, sorted.
    pub fn signatures(&self) -> Vec<String> {
        let mut signatures: Vec<String> = self
            .methods
            .keys()
            .map(|(name, types)| format!("{}({})", name, types.join(", ")))
            .collect();
        signatures.sort();
        signatures
    }
}

#[async_trait]
impl ServiceHandler for MethodTable {
    async fn invoke(&self, method: &str, parameter_types: &[String], args: Vec<Value>) -> Result<CallResponse> {
        let key = (method.to_string(), parameter_types.to_vec());
        let Some(entry) = self.methods.get(&key) else {
            return Err(RpcError::InvalidRequest(format!(
                "method not found: {}.{}({})",
                self.service_name,
                method,
                parameter_types.join(", ")
            )));
        };

        debug!("Invoking {}.{}", self.service_name, method);
        let value = (entry.call)(args).await?;
        Ok(CallResponse::success(value, entry.return_type.clone()))
    }
}

/// Service key to handler, shared by the dispatcher and the provider.
#[derive(Default)]
pub struct LocalServiceTable {
    services: DashMap<String, Arc<dyn ServiceHandler>>,
}

impl LocalServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `handler` reachable under `service_key`, returning the handler
    /// it replaced.
    pub fn register(&self, service_key: impl Into<String>, handler: Arc<dyn ServiceHandler>) -> Option<Arc<dyn ServiceHandler>> {
        let service_key = service_key.into();
        info!("Registered local service {}", service_key);
        self.services.insert(service_key, handler)
    }

    pub fn lookup(&self, service_key: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.services.get(service_key).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, service_key: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.services.remove(service_key).map(|(_, handler)| handler)
    }

    pub fn service_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.services.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
