//! VeloRPC Server
//!
//! Provider side of VeloRPC: services are exported into a
//! [`LocalServiceTable`], served by a TCP or HTTP listener through the
//! [`Dispatcher`], and advertised in the registry by the [`Provider`].

pub mod dispatcher;
pub mod http_server;
pub mod provider;
pub mod service;
pub mod tcp_server;

pub use dispatcher::Dispatcher;
pub use http_server::HttpServer;
pub use provider::{Provider, ServiceExport};
pub use service::{LocalServiceTable, MethodTable, ServiceHandler};
pub use tcp_server::RpcTcpServer;
