use std::net::ToSocketAddrs;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::error::{Result, RpcError};
use crate::transport::codec::FrameBuffer;

/// Default timeout for establishing a TCP connection (5 seconds)
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for writing a request and reading its reply (30 seconds)
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Async TCP transport for VeloRPC frames.
///
/// Frames are self-delimiting (the header carries the body length), so the
/// transport writes them as-is and uses a [`FrameBuffer`] to cut the read
/// side back into frames.
///
/// # Example
///
/// ```no_run
/// use velorpc_common::transport::TcpTransport;
///
/// # async fn run(frame: Vec<u8>) -> velorpc_common::Result<()> {
/// let transport = TcpTransport::new();
/// let reply = transport.exchange("127.0.0.1:9000", &frame).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bounds the write of the request plus the read of the reply.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Connects to a remote endpoint.
    ///
    /// The address may resolve to several socket addresses; each is tried in
    /// turn until one accepts.
    pub async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let socket_addrs = addr
            .to_socket_addrs()
            .map_err(|e| RpcError::Connection(format!("Invalid address '{}': {}", addr, e)))?;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&socket_addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = Some(e.to_string()),
                Err(_) => last_err = Some(format!("timed out after {}ms", self.connect_timeout.as_millis())),
            }
        }

        Err(RpcError::Connection(format!(
            "Failed to connect to {}: {}",
            addr,
            last_err.unwrap_or_else(|| "no addresses resolved".to_string())
        )))
    }

    /// Sends one request frame on a fresh connection and reads one reply
    /// frame back.
    ///
    /// # Errors
    ///
    /// `Timeout` when the peer accepts but the reply does not arrive within
    /// the io timeout.
    pub async fn exchange(&self, addr: &str, frame: &[u8]) -> Result<Vec<u8>> {
        let mut stream = self.connect(addr).await?;

        let round_trip = async {
            send_frame(&mut stream, frame).await?;
            let mut buffer = FrameBuffer::new();
            receive_frame(&mut stream, &mut buffer).await
        };
        let reply = tokio::time::timeout(self.io_timeout, round_trip)
            .await
            .map_err(|_| RpcError::Timeout(self.io_timeout.as_millis() as u64))??;

        match reply {
            Some(reply) => Ok(reply.to_vec()),
            None => Err(RpcError::Connection(format!(
                "{} closed the connection before replying",
                addr
            ))),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes a complete frame and flushes.
pub async fn send_frame<W: AsyncWrite + Unpin>(stream: &mut W, frame: &[u8]) -> Result<()> {
    stream
        .write_all(frame)
        .await
        .map_err(|e| map_io_error(e, "writing frame"))?;
    stream
        .flush()
        .await
        .map_err(|e| map_io_error(e, "flushing stream"))?;
    Ok(())
}

/// Reads until `buffer` yields a whole frame.
///
/// Returns `Ok(None)` on a clean end of stream between frames. End of
/// stream in the middle of a frame is a connection error.
pub async fn receive_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut FrameBuffer,
) -> Result<Option<Bytes>> {
    loop {
        if let Some(frame) = buffer.next_frame()? {
            return Ok(Some(frame));
        }

        let read = stream
            .read_buf(buffer.buffer_mut())
            .await
            .map_err(|e| map_io_error(e, "reading frame"))?;

        if read == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(RpcError::Connection(format!(
                "Connection closed mid-frame with {} bytes buffered",
                buffer.buffered()
            )));
        }
    }
}

/// Map IO errors to appropriate RpcError variants
///
/// - Timeouts/would block -> `Timeout`
/// - Connection errors -> `Connection`
/// - Other IO errors -> `Io`
fn map_io_error(err: std::io::Error, context: &str) -> RpcError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            RpcError::Timeout(DEFAULT_CONNECT_TIMEOUT.as_millis() as u64)
        }
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected => {
            RpcError::Connection(format!("{}: Connection lost", context))
        }
        _ => RpcError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CallRequest, SerializerKind, WireMessage};
    use crate::transport::codec;

    fn frame() -> Vec<u8> {
        codec::encode(&WireMessage::request(
            SerializerKind::Postcard,
            CallRequest::new("Echo", "echo").with_arg("String", "hi"),
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_receive_frame_across_split_writes() {
        let bytes = frame();
        let (mut client, mut server) = tokio::io::duplex(8);

        let expected = bytes.clone();
        let writer = tokio::spawn(async move {
            for chunk in bytes.chunks(3) {
                client.write_all(chunk).await.unwrap();
            }
        });

        let mut buffer = FrameBuffer::new();
        let got = receive_frame(&mut server, &mut buffer).await.unwrap().unwrap();
        assert_eq!(&got[..], &expected[..]);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_eof_returns_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let mut buffer = FrameBuffer::new();
        assert!(receive_frame(&mut server, &mut buffer).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_connection_error() {
        let bytes = frame();
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&bytes[..bytes.len() / 2]).await.unwrap();
        drop(client);

        let mut buffer = FrameBuffer::new();
        let err = receive_frame(&mut server, &mut buffer).await.unwrap_err();
        assert!(matches!(err, RpcError::Connection(_)));
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // Bind then drop to obtain a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = TcpTransport::new().exchange(&addr, &frame()).await.unwrap_err();
        assert!(matches!(err, RpcError::Connection(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // Accepts and reads, never answers
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        });

        let transport = TcpTransport::new().with_io_timeout(Duration::from_millis(100));
        let started = std::time::Instant::now();
        let err = transport.exchange(&addr, &frame()).await.unwrap_err();

        assert!(matches!(err, RpcError::Timeout(100)), "{:?}", err);
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(5));
        peer.abort();
    }
}
