use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::protocol::error::{Result, RpcError};
use crate::transport::codec::FrameBuffer;
use crate::transport::tcp::{receive_frame, send_frame};

/// How long a closing connection keeps draining unread input.
const LINGER: Duration = Duration::from_secs(1);

/// Async TCP server for VeloRPC frames.
///
/// Each accepted connection gets its own task. A connection carries any
/// number of request frames; the handler's reply frame is written back
/// before the next request is read.
pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    /// Creates a new TCP server bound to the specified address.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "0.0.0.0:9000")
    pub async fn new(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(Self { listener })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RpcError::Connection(format!("Failed to get local addr: {}", e)))
    }

    /// Runs the accept loop forever.
    pub async fn run_with_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<u8>> + Send + 'static,
    {
        self.run_until(handler, std::future::pending()).await
    }

    /// Runs the accept loop until `shutdown` resolves.
    ///
    /// Connections already accepted keep being served by their own tasks.
    pub async fn run_until<F, Fut, S>(&self, handler: F, shutdown: S) -> Result<()>
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<u8>> + Send + 'static,
        S: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        tokio::pin!(shutdown);

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("TCP server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted
                    .map_err(|e| RpcError::Connection(format!("Failed to accept connection: {}", e)))?,
            };

            tracing::debug!("Connection established from {}", peer_addr);

            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handler).await {
                    tracing::warn!("Connection from {} failed: {}", peer_addr, e);
                }
            });
        }
    }
}

async fn handle_connection<F, Fut>(mut stream: TcpStream, handler: Arc<F>) -> Result<()>
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<u8>> + Send + 'static,
{
    let mut buffer = FrameBuffer::new();
    loop {
        let frame = match receive_frame(&mut stream, &mut buffer).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!("Connection closed by peer");
                return Ok(());
            }
            Err(RpcError::Protocol(e)) => {
                // The stream cannot be resynchronized: answer once, then close
                tracing::warn!("Unframeable input ({}), replying and closing", e);
                let reply = handler(buffer.take_remaining()).await;
                send_frame(&mut stream, &reply).await?;
                close_gracefully(stream).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let reply = handler(frame).await;
        send_frame(&mut stream, &reply).await?;
    }
}

/// Sends FIN, then discards what the peer still has in flight so the
/// close does not turn into a reset that destroys the reply.
async fn close_gracefully(mut stream: TcpStream) {
    if stream.shutdown().await.is_err() {
        return;
    }
    let drain = async {
        let mut scratch = [0u8; 4096];
        while let Ok(read) = stream.read(&mut scratch).await {
            if read == 0 {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(LINGER, drain).await;
}
