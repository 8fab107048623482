use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::info;
use velorpc_common::transport::TcpServer;
use velorpc_common::Result;

use crate::dispatcher::Dispatcher;

/// Serves the dispatcher over raw TCP.
///
/// Connections are kept open across requests; each frame read from a
/// connection is dispatched and its reply written back in order.
pub struct RpcTcpServer {
    server: TcpServer,
    dispatcher: Arc<Dispatcher>,
}

impl RpcTcpServer {
    pub async fn bind(addr: &str, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let server = TcpServer::new(addr).await?;
        info!("TCP server listening on {}", server.local_addr()?);
        Ok(Self { server, dispatcher })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serves until `shutdown` resolves. Connections already accepted finish
    /// on their own.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let dispatcher = self.dispatcher.clone();
        self.server
            .run_until(
                move |frame: Bytes| {
                    let dispatcher = dispatcher.clone();
                    async move { dispatcher.dispatch(&frame).await }
                },
                shutdown,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{LocalServiceTable, MethodTable};
    use velorpc_common::transport::{codec, TcpTransport};
    use velorpc_common::{
        CallRequest, MessageStatus, SerializerKind, Value, WireMessage, HEADER_LENGTH, MAX_BODY_LENGTH, PROTOCOL_MAGIC,
    };

    async fn start() -> (SocketAddr, tokio::sync::oneshot::Sender<()>) {
        let services = Arc::new(LocalServiceTable::new());
        services.register(
            "Echo:default:1.0",
            Arc::new(MethodTable::new("Echo").method("echo", &["String"], "String", |mut args| async move {
                Ok(args.remove(0))
            })),
        );
        let server = RpcTcpServer::bind("127.0.0.1:0", Arc::new(Dispatcher::new(services)))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            server
                .run_until(async move {
                    let _ = rx.await;
                })
                .await
        });
        (addr, tx)
    }

    #[tokio::test]
    async fn test_serves_many_frames_per_connection() {
        let (addr, _shutdown) = start().await;
        let mut stream = TcpTransport::new().connect(&addr.to_string()).await.unwrap();
        let mut buffer = codec::FrameBuffer::new();

        for word in ["one", "two", "three"] {
            let request = WireMessage::request(
                SerializerKind::Postcard,
                CallRequest::new("Echo", "echo").with_arg("String", word),
            );
            velorpc_common::transport::tcp::send_frame(&mut stream, &codec::encode(&request).unwrap())
                .await
                .unwrap();
            let reply = velorpc_common::transport::tcp::receive_frame(&mut stream, &mut buffer)
                .await
                .unwrap()
                .unwrap();
            let reply = codec::decode(&reply).unwrap();
            assert_eq!(reply.request_id(), request.request_id());
            assert_eq!(reply.header.status, MessageStatus::Ok);
            assert_eq!(reply.into_response().unwrap().data, Some(Value::from(word)));
        }
    }

    /// Writes `frame` on a fresh connection, half-closes and reads the reply.
    async fn send_raw(addr: SocketAddr, frame: &[u8]) -> (WireMessage, tokio::net::TcpStream, codec::FrameBuffer) {
        use tokio::io::AsyncWriteExt;

        let mut stream = TcpTransport::new().connect(&addr.to_string()).await.unwrap();
        stream.write_all(frame).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut buffer = codec::FrameBuffer::new();
        let reply = velorpc_common::transport::tcp::receive_frame(&mut stream, &mut buffer)
            .await
            .unwrap()
            .expect("a reply before the connection closes");
        (codec::decode(&reply).unwrap(), stream, buffer)
    }

    #[tokio::test]
    async fn test_bad_magic_is_answered_then_closed() {
        let (addr, _shutdown) = start().await;
        let request = WireMessage::request(
            SerializerKind::Postcard,
            CallRequest::new("Echo", "echo").with_arg("String", "hi"),
        );
        let mut frame = codec::encode(&request).unwrap();
        frame[0] = PROTOCOL_MAGIC + 1;

        let (reply, mut stream, mut buffer) = send_raw(addr, &frame).await;
        assert_eq!(reply.header.status, MessageStatus::BadRequest);
        assert_eq!(reply.header.serializer, SerializerKind::Json);
        assert_eq!(reply.request_id(), 0);
        assert!(reply.into_response().unwrap().error.unwrap().contains("magic"));

        let next = velorpc_common::transport::tcp::receive_frame(&mut stream, &mut buffer).await;
        assert!(matches!(next, Ok(None)));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_answered_with_its_request_id() {
        let (addr, _shutdown) = start().await;
        let request = WireMessage::request(SerializerKind::Postcard, CallRequest::new("Echo", "echo"));
        let mut frame = codec::encode(&request).unwrap();
        frame[13..HEADER_LENGTH].copy_from_slice(&((MAX_BODY_LENGTH as u32) + 1).to_be_bytes());

        let (reply, _stream, _buffer) = send_raw(addr, &frame).await;
        assert_eq!(reply.header.status, MessageStatus::BadRequest);
        assert_eq!(reply.header.serializer, SerializerKind::Postcard);
        assert_eq!(reply.request_id(), request.request_id());
    }

    #[tokio::test]
    async fn test_stops_accepting_after_shutdown() {
        let (addr, shutdown) = start().await;
        shutdown.send(()).unwrap();

        let mut refused = false;
        for _ in 0..50 {
            if TcpTransport::new().connect(&addr.to_string()).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(refused);
    }
}
