use thiserror::Error;

/// Framing and header validation failures raised by the wire codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid magic byte: 0x{found:02x}")]
    BadMagic { found: u8 },

    #[error("Unknown serializer id: {0}")]
    UnknownSerializer(u8),

    #[error("Unsupported message type: {0}")]
    UnsupportedMessageType(u8),

    #[error("Unknown message status: {0}")]
    UnknownStatus(u8),

    #[error("Incomplete frame: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    #[error("Frame body too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },
}

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("No providers available for {0}")]
    NoProvidersAvailable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Remote invocation failed: {0}")]
    RemoteInvocation(String),

    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Whether a failed exchange may succeed if attempted again.
    ///
    /// Only transport-level faults qualify. Protocol, serialization and
    /// remote invocation errors are deterministic and are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::Transport(_) | RpcError::Connection(_) | RpcError::Timeout(_) | RpcError::Io(_)
        )
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Serialization(err.to_string())
    }
}

impl From<postcard::Error> for RpcError {
    fn from(err: postcard::Error) -> Self {
        RpcError::Serialization(err.to_string())
    }
}

impl From<std::net::AddrParseError> for RpcError {
    fn from(err: std::net::AddrParseError) -> Self {
        RpcError::InvalidRequest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
