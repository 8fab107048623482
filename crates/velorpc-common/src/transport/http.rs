//! HTTP Transport Utilities
//!
//! Over HTTP a frame travels as the raw body of a POST request and the reply
//! frame comes back as the raw response body. The header inside the frame
//! still carries the request id and serializer, so HTTP adds nothing but
//! the envelope.
//!
//! # Components
//!
//! - **[`HttpTransport`]**: client-side `POST` of a frame, plus helpers for
//!   building server responses
//! - **[`HyperRequest`]**: Type alias for Hyper incoming requests
//! - **[`HyperResponse`]**: Type alias for Hyper responses

use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::protocol::error::{Result, RpcError};

/// Type alias for Hyper incoming requests
pub type HyperRequest = Request<Incoming>;

/// Type alias for Hyper responses with full body
pub type HyperResponse = Response<Full<Bytes>>;

/// Content type of a frame body.
pub const FRAME_CONTENT_TYPE: &str = "application/octet-stream";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HttpTransport {
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// POSTs one frame to `http://{addr}/` and returns the reply frame.
    pub async fn exchange(&self, addr: &str, frame: Vec<u8>) -> Result<Vec<u8>> {
        let url = format!("http://{}/", addr);
        let http_request = Request::builder()
            .method("POST")
            .uri(&url)
            .header("Content-Type", FRAME_CONTENT_TYPE)
            .body(Full::new(Bytes::from(frame)))
            .map_err(|e| RpcError::Transport(format!("Failed to build request: {}", e)))?;

        let client = Client::builder(TokioExecutor::new()).build_http();

        let response = tokio::time::timeout(self.request_timeout, client.request(http_request))
            .await
            .map_err(|_| RpcError::Timeout(self.request_timeout.as_millis() as u64))?
            .map_err(|e| RpcError::Transport(format!("HTTP request to {} failed: {}", addr, e)))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| RpcError::Transport(format!("Failed to read response: {}", e)))?
            .to_bytes();

        if !status.is_success() {
            return Err(RpcError::Transport(format!(
                "{} answered HTTP {}: {}",
                addr,
                status,
                String::from_utf8_lossy(&body)
            )));
        }

        Ok(body.to_vec())
    }

    /// Reads the whole body of an incoming request.
    pub async fn read_body(req: HyperRequest) -> Result<Bytes> {
        Ok(req
            .into_body()
            .collect()
            .await
            .map_err(|e| RpcError::Transport(format!("Failed to read request body: {}", e)))?
            .to_bytes())
    }

    /// Wraps a reply frame in a 200 response.
    pub fn frame_response(frame: Vec<u8>) -> HyperResponse {
        let mut response = Response::new(Full::new(Bytes::from(frame)));
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static(FRAME_CONTENT_TYPE),
        );
        response
    }

    /// Plain-text error response for requests that never reached the codec.
    pub fn error_response(status: StatusCode, message: &str) -> HyperResponse {
        let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
        *response.status_mut() = status;
        response
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}
