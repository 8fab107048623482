use serde::{Deserialize, Serialize};
use velorpc_common::{service_key, DEFAULT_SERVICE_GROUP};

fn default_group() -> String {
    DEFAULT_SERVICE_GROUP.to_string()
}

fn default_weight() -> u32 {
    1
}

/// One running provider of a service.
///
/// Stored in the coordination store as camelCase JSON under
/// `/rpc/<serviceKey>/<host>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub service_name: String,
    pub service_version: String,
    #[serde(default = "default_group")]
    pub service_group: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl ServiceInstance {
    pub fn new(
        service_name: impl Into<String>,
        service_version: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            service_version: service_version.into(),
            service_group: default_group(),
            host: host.into(),
            port,
            weight: default_weight(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.service_group = group.into();
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// `name:group:version`, shared by every instance of the service.
    pub fn service_key(&self) -> String {
        service_key(&self.service_name, &self.service_group, &self.service_version)
    }

    /// `serviceKey/host:port`, unique per live instance.
    pub fn node_key(&self) -> String {
        format!("{}/{}", self.service_key(), self.address())
    }

    /// `host:port` to connect to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The service key part of a node key.
pub fn service_key_of(node_key: &str) -> &str {
    node_key.split_once('/').map(|(service, _)| service).unwrap_or(node_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        let instance = ServiceInstance::new("Greeter", "1.0", "10.0.0.5", 9000);
        assert_eq!(instance.service_key(), "Greeter:default:1.0");
        assert_eq!(instance.node_key(), "Greeter:default:1.0/10.0.0.5:9000");
        assert_eq!(instance.address(), "10.0.0.5:9000");
        assert_eq!(service_key_of(&instance.node_key()), "Greeter:default:1.0");
    }

    #[test]
    fn test_json_is_camel_case() {
        let instance = ServiceInstance::new("Greeter", "1.0", "h", 1).with_weight(3);
        let json = serde_json::to_value(&instance).unwrap();
        assert_eq!(json["serviceName"], "Greeter");
        assert_eq!(json["serviceGroup"], "default");
        assert_eq!(json["weight"], 3);
    }

    #[test]
    fn test_missing_group_and_weight_default() {
        let json = r#"{"serviceName":"Greeter","serviceVersion":"1.0","host":"h","port":80}"#;
        let instance: ServiceInstance = serde_json::from_str(json).unwrap();
        assert_eq!(instance.service_group, "default");
        assert_eq!(instance.weight, 1);
    }
}
