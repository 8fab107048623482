// Integration tests for the client call pipeline
//
// Providers are registered in an in-memory registry and the network is
// replaced by a scripted exchange, so every pipeline stage runs for real
// except the socket.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use velorpc_client::{Exchange, RpcClient};
use velorpc_common::transport::codec;
use velorpc_common::{
    CallResponse, MessageStatus, ReferenceConfig, Result, RpcConfig, RpcError, SerializerKind, Value,
    WireMessage,
};
use velorpc_registry::{LeaseRegistry, MemoryStore, Registry, ServiceInstance};

// ============================================================================
// Test Helpers
// ============================================================================

/// Greets by the first argument, after failing a scripted number of times.
#[derive(Default)]
struct ScriptedExchange {
    failures_left: AtomicU32,
    calls: AtomicU32,
    /// Hosts that always refuse
    dead_hosts: Vec<String>,
    delay: Option<Duration>,
    remote_error: bool,
    serializers_seen: Mutex<Vec<SerializerKind>>,
}

impl ScriptedExchange {
    fn failing(times: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(times),
            ..Self::default()
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Exchange for ScriptedExchange {
    async fn exchange(&self, instance: &ServiceInstance, frame: Vec<u8>) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = codec::read_serializer(&frame) {
            self.serializers_seen.lock().unwrap().push(kind);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.dead_hosts.contains(&instance.host) {
            return Err(RpcError::Connection(format!("{} refused", instance.host)));
        }
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(RpcError::Connection("connection reset".into()));
        }

        let request = codec::decode(&frame)?;
        let header = request.header;
        let call = request.into_request().unwrap();
        let response = if self.remote_error {
            CallResponse::failure("Greeter.greet threw", "name must not be empty")
        } else {
            let name = call.args.first().and_then(Value::as_str).unwrap_or("nobody").to_string();
            CallResponse::success(Value::from(format!("hello {} from {}", name, instance.host)), "String")
        };
        codec::encode(&WireMessage::reply_to(&header, MessageStatus::Ok, response))
    }
}

fn config() -> RpcConfig {
    RpcConfig {
        max_retry_attempts: 3,
        retry_interval_ms: 1,
        ..RpcConfig::default()
    }
}

async fn client_with(config: RpcConfig, exchange: Arc<ScriptedExchange>, hosts: &[&str]) -> RpcClient {
    let registry = LeaseRegistry::with_store(Arc::new(MemoryStore::new()));
    for host in hosts {
        registry
            .register(&ServiceInstance::new("Greeter", "1.0", *host, 9000))
            .await
            .unwrap();
    }
    RpcClient::new(config, Arc::new(registry)).with_exchange(exchange)
}

fn greeter() -> ReferenceConfig {
    ReferenceConfig::new("Greeter")
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn test_invoke_returns_result() {
    let exchange = Arc::new(ScriptedExchange::default());
    let client = client_with(config(), exchange.clone(), &["10.0.0.1"]).await;

    let reply = client
        .proxy(greeter())
        .invoke("greet", &["String"], vec![Value::from("world")])
        .await
        .unwrap();

    assert_eq!(reply, Value::from("hello world from 10.0.0.1"));
    assert_eq!(exchange.calls(), 1);
}

#[tokio::test]
async fn test_invoke_as_decodes_result() {
    let exchange = Arc::new(ScriptedExchange::default());
    let client = client_with(config(), exchange, &["10.0.0.1"]).await;

    let reply: String = client
        .proxy(greeter())
        .invoke_as("greet", &["String"], vec![Value::from("world")])
        .await
        .unwrap();
    assert!(reply.starts_with("hello world"));
}

#[tokio::test]
async fn test_reference_serializer_overrides_default() {
    let exchange = Arc::new(ScriptedExchange::default());
    let client = client_with(config(), exchange.clone(), &["10.0.0.1"]).await;

    client
        .proxy(greeter())
        .call("greet", &["String"], vec![Value::from("a")])
        .await
        .unwrap();
    client
        .proxy(greeter().with_serializer("json"))
        .call("greet", &["String"], vec![Value::from("b")])
        .await
        .unwrap();

    assert_eq!(
        *exchange.serializers_seen.lock().unwrap(),
        vec![SerializerKind::Postcard, SerializerKind::Json]
    );
}

#[tokio::test]
async fn test_mock_skips_network() {
    let exchange = Arc::new(ScriptedExchange::default());
    // No providers at all: mock must not even discover
    let client = client_with(config(), exchange.clone(), &[]).await;

    let response = client
        .proxy(greeter().with_mock(true))
        .call("greet", &["String"], vec![Value::from("world")])
        .await
        .unwrap();

    assert!(response.is_success());
    assert_eq!(response.data, Some(Value::Null));
    assert_eq!(exchange.calls(), 0);
}

// ============================================================================
// Failures before sending
// ============================================================================

#[tokio::test]
async fn test_no_providers() {
    let exchange = Arc::new(ScriptedExchange::default());
    let client = client_with(config(), exchange.clone(), &[]).await;

    let err = client
        .proxy(greeter())
        .call("greet", &["String"], vec![Value::from("world")])
        .await
        .unwrap_err();

    assert!(matches!(err, RpcError::NoProvidersAvailable(ref key) if key == "Greeter:default:1.0"));
    assert_eq!(exchange.calls(), 0);
}

#[tokio::test]
async fn test_mismatched_parameter_types_rejected() {
    let exchange = Arc::new(ScriptedExchange::default());
    let client = client_with(config(), exchange, &["10.0.0.1"]).await;

    let err = client
        .proxy(greeter())
        .call("greet", &["String", "int"], vec![Value::from("world")])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::InvalidRequest(_)));
}

// ============================================================================
// Retry and tolerance
// ============================================================================

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let exchange = Arc::new(ScriptedExchange::failing(2));
    let client = client_with(config(), exchange.clone(), &["10.0.0.1"]).await;

    let reply = client
        .proxy(greeter())
        .invoke("greet", &["String"], vec![Value::from("world")])
        .await
        .unwrap();

    assert_eq!(reply, Value::from("hello world from 10.0.0.1"));
    assert_eq!(exchange.calls(), 3);
}

#[tokio::test]
async fn test_retry_ceiling_then_fail_fast() {
    let exchange = Arc::new(ScriptedExchange::failing(u32::MAX));
    let client = client_with(config(), exchange.clone(), &["10.0.0.1"]).await;

    let response = client
        .proxy(greeter())
        .call("greet", &["String"], vec![Value::from("world")])
        .await
        .unwrap();

    // Exactly max_retry_attempts exchanges, then the failure is surfaced
    assert_eq!(exchange.calls(), 3);
    assert!(!response.is_success());
    assert!(response.error.unwrap().contains("connection reset"));
}

#[tokio::test]
async fn test_fail_safe_returns_empty_response() {
    let exchange = Arc::new(ScriptedExchange::failing(u32::MAX));
    let client = client_with(config(), exchange, &["10.0.0.1"]).await;

    let reply = client
        .proxy(greeter().with_tolerance_strategy("fail_safe"))
        .invoke("greet", &["String"], vec![Value::from("world")])
        .await
        .unwrap();
    assert_eq!(reply, Value::Null);
}

#[tokio::test]
async fn test_fail_over_reaches_live_provider() {
    let exchange = Arc::new(ScriptedExchange {
        dead_hosts: vec!["10.0.0.1".to_string()],
        ..ScriptedExchange::default()
    });
    let client = client_with(config(), exchange, &["10.0.0.1", "10.0.0.2"]).await;
    let proxy = client.proxy(
        greeter()
            .with_retry_strategy("no_retry")
            .with_tolerance_strategy("fail_over"),
    );

    // Whichever provider is picked first, the call lands on the live one
    for _ in 0..5 {
        let reply = proxy
            .invoke("greet", &["String"], vec![Value::from("world")])
            .await
            .unwrap();
        assert_eq!(reply, Value::from("hello world from 10.0.0.2"));
    }
}

#[tokio::test]
async fn test_remote_error_surfaces_from_invoke() {
    let exchange = Arc::new(ScriptedExchange {
        remote_error: true,
        ..ScriptedExchange::default()
    });
    let client = client_with(config(), exchange, &["10.0.0.1"]).await;

    let err = client
        .proxy(greeter())
        .invoke("greet", &["String"], vec![Value::from("")])
        .await
        .unwrap_err();
    match err {
        RpcError::RemoteInvocation(message) => assert!(message.contains("name must not be empty")),
        other => panic!("expected RemoteInvocation, got {:?}", other),
    }
}

// ============================================================================
// Timeout
// ============================================================================

#[tokio::test]
async fn test_call_timeout_returns_failed_response() {
    let exchange = Arc::new(ScriptedExchange {
        delay: Some(Duration::from_millis(500)),
        ..ScriptedExchange::default()
    });
    let client = client_with(
        RpcConfig {
            call_timeout_ms: 50,
            ..config()
        },
        exchange.clone(),
        &["10.0.0.1"],
    )
    .await;

    let response = client
        .proxy(greeter())
        .call("greet", &["String"], vec![Value::from("world")])
        .await
        .unwrap();
    assert_eq!(response.message, "call timed out after 50ms");
    assert!(!response.is_success());

    // The worker was not cancelled and still reaches the provider
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(exchange.calls(), 1);
    assert_eq!(client.pool().idle_workers(), config().pool.max_workers);
}
