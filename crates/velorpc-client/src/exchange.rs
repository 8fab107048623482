//! One request/reply round trip with a provider.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use velorpc_common::transport::{codec, HttpTransport, TcpTransport};
use velorpc_common::{CallResponse, MessageType, RequestId, Result, RpcError};
use velorpc_registry::ServiceInstance;

/// Transport used when none is configured.
pub const DEFAULT_TRANSPORT: &str = "tcp";

/// Sends one encoded request frame and returns the encoded reply frame.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn exchange(&self, instance: &ServiceInstance, frame: Vec<u8>) -> Result<Vec<u8>>;
}

/// Framed codec over a fresh TCP connection per exchange.
#[derive(Debug, Clone, Default)]
pub struct TcpExchange {
    transport: TcpTransport,
}

impl TcpExchange {
    /// Bounds both the connect and the request/reply round trip by `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            transport: TcpTransport::new()
                .with_connect_timeout(timeout)
                .with_io_timeout(timeout),
        }
    }
}

#[async_trait]
impl Exchange for TcpExchange {
    async fn exchange(&self, instance: &ServiceInstance, frame: Vec<u8>) -> Result<Vec<u8>> {
        self.transport.exchange(&instance.address(), &frame).await
    }
}

/// Frame as the body of an HTTP POST to the provider's root path.
#[derive(Debug, Clone, Default)]
pub struct HttpExchange {
    transport: HttpTransport,
}

impl HttpExchange {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            transport: HttpTransport::new().with_request_timeout(request_timeout),
        }
    }
}

#[async_trait]
impl Exchange for HttpExchange {
    async fn exchange(&self, instance: &ServiceInstance, frame: Vec<u8>) -> Result<Vec<u8>> {
        self.transport.exchange(&instance.address(), frame).await
    }
}

/// Transport for a config key. Unknown keys fall back to TCP.
pub fn exchange_for(transport: &str, timeout: Duration) -> Arc<dyn Exchange> {
    match transport.trim() {
        "http" => Arc::new(HttpExchange::new(timeout)),
        "tcp" | "" => Arc::new(TcpExchange::new(timeout)),
        other => {
            warn!("Unknown transport '{}', using {}", other, DEFAULT_TRANSPORT);
            Arc::new(TcpExchange::new(timeout))
        }
    }
}

/// Exchanges `frame` with `instance` and unpacks the reply.
///
/// The reply must be a RESPONSE frame for `request_id`. A reply that fails to
/// decode surfaces as the codec error; a mismatched id as `RemoteInvocation`.
pub async fn send(
    exchange: &dyn Exchange,
    instance: &ServiceInstance,
    frame: Vec<u8>,
    request_id: RequestId,
) -> Result<CallResponse> {
    debug!("Sending request {:x} to {}", request_id, instance.address());
    let reply = exchange.exchange(instance, frame).await?;
    let message = codec::decode(&reply)?;

    if message.header.message_type != MessageType::Response {
        return Err(RpcError::RemoteInvocation(format!(
            "{} answered with a {:?} frame",
            instance.address(),
            message.header.message_type
        )));
    }
    if message.request_id() != request_id {
        return Err(RpcError::RemoteInvocation(format!(
            "reply for request {:x} does not match request {:x}",
            message.request_id(),
            request_id
        )));
    }

    message.into_response().ok_or_else(|| {
        RpcError::RemoteInvocation(format!("{} sent a reply without a response body", instance.address()))
    })
}
