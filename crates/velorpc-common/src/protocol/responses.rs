//! VeloRPC Response Types
//!
//! This module defines the body carried by RESPONSE frames.

use serde::{Deserialize, Serialize};

use super::value::Value;

/// The outcome of a remote invocation.
///
/// A response is a failure when `error` is set; `message` is a short human
/// readable summary in both cases. Degraded results produced on the client
/// side by a tolerance strategy use the same shape, so callers handle
/// remote and local failures identically.
///
/// # Example
///
/// ```
/// use velorpc_common::{CallResponse, Value};
///
/// let ok = CallResponse::success(Value::from("hello world"), "String");
/// assert!(ok.is_success());
///
/// let failed = CallResponse::failure("Service not found", "Greeter:default:1.0");
/// assert!(!failed.is_success());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CallResponse {
    /// Return value (absent for failures and empty results)
    pub data: Option<Value>,
    /// Type descriptor of `data`
    pub data_type: Option<String>,
    pub message: String,
    /// Failure description (present on failure)
    pub error: Option<String>,
}

impl CallResponse {
    pub fn success(data: Value, data_type: impl Into<String>) -> Self {
        CallResponse {
            data: Some(data),
            data_type: Some(data_type.into()),
            message: "ok".to_string(),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>, error: impl Into<String>) -> Self {
        CallResponse {
            data: None,
            data_type: None,
            message: message.into(),
            error: Some(error.into()),
        }
    }

    /// A successful response with no payload.
    pub fn empty() -> Self {
        CallResponse::default()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
