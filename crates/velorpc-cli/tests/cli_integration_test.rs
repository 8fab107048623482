//! CLI Integration Tests
//!
//! Drives the same pieces the `velorpc` binary wires together: a config
//! loaded from a properties file plus overrides, the demo Greeter behind a
//! provider, and a client calling it with arguments parsed from the
//! command line form.

use std::sync::Arc;

use velorpc_cli::{greeter, load_config, parse_call_arg};
use velorpc_client::RpcClient;
use velorpc_common::{ReferenceConfig, RpcConfig, Value};
use velorpc_registry::{LeaseRegistry, MemoryStore, Registry};
use velorpc_server::{Provider, ServiceExport};

// ============================================================================
// Test Helpers
// ============================================================================

fn write_properties(name: &str, contents: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("velorpc-{}-{}.properties", name, std::process::id()));
    std::fs::write(&path, contents).unwrap();
    path
}

fn demo_config() -> RpcConfig {
    let path = write_properties(
        "demo",
        "\
rpc.name = cli-test
rpc.server.host = 127.0.0.1
rpc.serializer = postcard
rpc.transport = tcp
",
    );
    let config = load_config(Some(path.as_path()), Vec::new(), &["server.port=0".to_string()]).unwrap();
    std::fs::remove_file(&path).unwrap();
    config
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_properties_file_then_env_then_overrides() {
    let path = write_properties("layers", "rpc.serializer=json\nrpc.call_timeout_ms=2500\n");
    let env = vec![("RPC_CALL_TIMEOUT_MS".to_string(), "3000".to_string())];

    let config = load_config(Some(path.as_path()), env, &["serializer=postcard".to_string()]).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(config.serializer, "postcard");
    assert_eq!(config.call_timeout_ms, 3000);
}

#[test]
fn test_malformed_properties_value_is_rejected() {
    let path = write_properties("malformed", "rpc.mock=perhaps\n");
    let result = load_config(Some(path.as_path()), Vec::new(), &[]);
    std::fs::remove_file(&path).unwrap();

    assert!(result.is_err());
}

#[tokio::test]
async fn test_call_demo_greeter() {
    let config = demo_config();
    assert_eq!(config.name, "cli-test");

    let store = Arc::new(MemoryStore::new());
    let provider = Provider::new(config.clone(), Arc::new(LeaseRegistry::with_store(store.clone())));
    provider.export(ServiceExport::new("Greeter"), Arc::new(greeter()));
    provider.start().await.unwrap();

    let client = RpcClient::new(config, Arc::new(LeaseRegistry::with_store(store.clone())));
    let proxy = client.proxy(ReferenceConfig::new("Greeter"));

    let (type_name, value) = parse_call_arg("String=world").unwrap();
    let reply = proxy.invoke("greet", &[type_name.as_str()], vec![value]).await.unwrap();
    assert_eq!(reply, Value::from("hello world"));

    let (a_type, a) = parse_call_arg("int=40").unwrap();
    let (b_type, b) = parse_call_arg("int=2").unwrap();
    let sum = proxy
        .invoke("add", &[a_type.as_str(), b_type.as_str()], vec![a, b])
        .await
        .unwrap();
    assert_eq!(sum.to_json(), serde_json::json!(42));

    provider.shutdown().await;
    client.registry().destroy().await;
}
