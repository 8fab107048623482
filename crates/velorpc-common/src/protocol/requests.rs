use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use super::value::Value;

pub type RequestId = u64;

/// Group used when a service does not declare one.
pub const DEFAULT_SERVICE_GROUP: &str = "default";

/// Version used when a service does not declare one.
pub const DEFAULT_SERVICE_VERSION: &str = "1.0";

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn default_group() -> String {
    DEFAULT_SERVICE_GROUP.to_string()
}

/// A remote method invocation.
///
/// `parameter_types` carries one type descriptor per argument so providers
/// can pick between overloads that share a method name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallRequest {
    pub service_name: String,
    pub method_name: String,
    pub service_version: String,
    #[serde(default = "default_group")]
    pub service_group: String,
    pub parameter_types: Vec<String>,
    pub args: Vec<Value>,
}

impl CallRequest {
    pub fn new(service_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        CallRequest {
            service_name: service_name.into(),
            method_name: method_name.into(),
            service_version: DEFAULT_SERVICE_VERSION.to_string(),
            service_group: default_group(),
            parameter_types: Vec::new(),
            args: Vec::new(),
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

    /// Appends one argument together with its type descriptor.
    pub fn with_arg(mut self, type_name: impl Into<String>, arg: impl Into<Value>) -> Self {
        self.parameter_types.push(type_name.into());
        self.args.push(arg.into());
        self
    }

    /// `name:group:version`, the key providers are registered under.
    pub fn service_key(&self) -> String {
        service_key(&self.service_name, &self.service_group, &self.service_version)
    }
}

/// Builds the `name:group:version` key shared by the registry and the
/// provider-side service table.
pub fn service_key(name: &str, group: &str, version: &str) -> String {
    format!("{}:{}:{}", name, group, version)
}

pub fn next_request_id() -> RequestId {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let counter = REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst);

    // Upper 32 bits from the clock, lower 32 bits from the counter
    (timestamp & 0xFFFFFFFF00000000) | (counter & 0xFFFFFFFF)
}
