//! HTTP Server for VeloRPC Providers
//!
//! Serves the dispatcher over HTTP/1.1 using hyper. Every request is a
//! `POST` whose body is one encoded request frame; the response body is
//! the encoded reply frame.
//!
//! # Architecture
//!
//! The HTTP server:
//! - Listens on a TCP socket for incoming HTTP connections
//! - Spawns a tokio task for each connection
//! - Hands each request body to the [`Dispatcher`]
//! - Returns the reply frame as an `application/octet-stream` body
//!
//! Requests that are not `POST` are refused with `405` before reaching the
//! dispatcher. Anything wrong inside the frame is the dispatcher's business
//! and still yields `200` with a `BadRequest` reply frame.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use velorpc_common::transport::{HttpTransport, HyperRequest, HyperResponse};
use velorpc_common::{Result, RpcError};

use crate::dispatcher::Dispatcher;

pub struct HttpServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl HttpServer {
    pub async fn bind(addr: &str, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RpcError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;

        tracing::info!(
            "HTTP server listening on {}",
            listener
                .local_addr()
                .map_err(|e| RpcError::Transport(format!("Failed to get local address: {}", e)))?
        );

        Ok(Self { listener, dispatcher })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RpcError::Transport(format!("Failed to get local address: {}", e)))
    }

    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serves until `shutdown` resolves.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let (stream, _) = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("HTTP server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted
                    .map_err(|e| RpcError::Transport(format!("Failed to accept connection: {}", e)))?,
            };

            let io = TokioIo::new(stream);
            let dispatcher = self.dispatcher.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let dispatcher = dispatcher.clone();
                    async move { Self::handle_request(dispatcher, req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::error!("Error serving connection: {}", err);
                }
            });
        }
    }

    async fn handle_request(dispatcher: Arc<Dispatcher>, req: HyperRequest) -> Result<HyperResponse> {
        // Only accept POST requests
        if req.method() != Method::POST {
            return Ok(HttpTransport::error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "Only POST requests are supported",
            ));
        }

        let body = match HttpTransport::read_body(req).await {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("Failed to read request body: {}", e);
                return Ok(HttpTransport::error_response(StatusCode::BAD_REQUEST, &e.to_string()));
            }
        };

        let reply = dispatcher.dispatch(&body).await;
        Ok(HttpTransport::frame_response(reply))
    }
}
