//! VeloRPC Transport Layer
//!
//! Moves encoded frames between processes.
//!
//! # Components
//!
//! - **[`codec`]**: frame encode/decode and stream reassembly
//! - **[`TcpTransport`]**: client side, one frame out and one frame back per connection
//! - **[`TcpServer`]**: accept loop serving many frames per connection
//! - **[`HttpTransport`]**: frames carried as HTTP POST bodies
//!
//! All transports enforce the 100 MB body limit of the frame header.

pub mod codec;
pub mod http;
pub mod tcp;
pub mod tcp_server;

pub use codec::FrameBuffer;
pub use http::{HttpTransport, HyperRequest, HyperResponse};
pub use tcp::TcpTransport;
pub use tcp_server::TcpServer;
