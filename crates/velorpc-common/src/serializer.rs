//! Body serializers.
//!
//! A serializer turns [`CallRequest`] and [`CallResponse`] bodies into bytes
//! and back. Implementations are stateless, so a single instance is shared
//! by every caller and every thread.

use std::sync::Arc;

use crate::protocol::{CallRequest, CallResponse, Result, SerializerKind};

/// Key of the serializer used when none is configured.
pub const DEFAULT_SERIALIZER: &str = "postcard";

pub trait Serializer: Send + Sync {
    /// Id written into the frame header.
    fn kind(&self) -> SerializerKind;

    fn serialize_request(&self, request: &CallRequest) -> Result<Vec<u8>>;

    fn deserialize_request(&self, bytes: &[u8]) -> Result<CallRequest>;

    fn serialize_response(&self, response: &CallResponse) -> Result<Vec<u8>>;

    fn deserialize_response(&self, bytes: &[u8]) -> Result<CallResponse>;
}

/// Human-readable JSON bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn kind(&self) -> SerializerKind {
        SerializerKind::Json
    }

    fn serialize_request(&self, request: &CallRequest) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(request)?)
    }

    fn deserialize_request(&self, bytes: &[u8]) -> Result<CallRequest> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn serialize_response(&self, response: &CallResponse) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(response)?)
    }

    fn deserialize_response(&self, bytes: &[u8]) -> Result<CallResponse> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Compact binary bodies using postcard.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardSerializer;

impl Serializer for PostcardSerializer {
    fn kind(&self) -> SerializerKind {
        SerializerKind::Postcard
    }

    fn serialize_request(&self, request: &CallRequest) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(request)?)
    }

    fn deserialize_request(&self, bytes: &[u8]) -> Result<CallRequest> {
        Ok(postcard::from_bytes(bytes)?)
    }

    fn serialize_response(&self, response: &CallResponse) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(response)?)
    }

    fn deserialize_response(&self, bytes: &[u8]) -> Result<CallResponse> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

static JSON: JsonSerializer = JsonSerializer;
static POSTCARD: PostcardSerializer = PostcardSerializer;

/// The built-in serializer for a header id.
pub fn for_kind(kind: SerializerKind) -> &'static dyn Serializer {
    match kind {
        SerializerKind::Json => &JSON,
        SerializerKind::Postcard => &POSTCARD,
    }
}

/// Built-in serializers keyed by their strategy name.
pub fn builtin_serializers() -> Vec<(&'static str, Arc<dyn Serializer>)> {
    vec![
        (SerializerKind::Json.key(), Arc::new(JsonSerializer) as Arc<dyn Serializer>),
        (SerializerKind::Postcard.key(), Arc::new(PostcardSerializer) as Arc<dyn Serializer>),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Value;
    use std::collections::BTreeMap;

    fn sample_request() -> CallRequest {
        let mut map = BTreeMap::new();
        map.insert("retries".to_string(), Value::Int(3));
        map.insert("ratio".to_string(), Value::Float(0.25));
        CallRequest::new("Greeter", "greet")
            .with_arg("String", "world")
            .with_arg("Options", Value::Map(map))
            .with_arg("Bytes", vec![0u8, 1, 255])
    }

    #[test]
    fn test_json_request_roundtrip() {
        let req = sample_request();
        let bytes = JsonSerializer.serialize_request(&req).unwrap();
        assert_eq!(JsonSerializer.deserialize_request(&bytes).unwrap(), req);
    }

    #[test]
    fn test_postcard_request_roundtrip() {
        let req = sample_request();
        let bytes = PostcardSerializer.serialize_request(&req).unwrap();
        assert_eq!(PostcardSerializer.deserialize_request(&bytes).unwrap(), req);
    }

    #[test]
    fn test_postcard_is_smaller_than_json() {
        let req = sample_request();
        let json = JsonSerializer.serialize_request(&req).unwrap();
        let postcard = PostcardSerializer.serialize_request(&req).unwrap();
        assert!(postcard.len() < json.len());
    }

    #[test]
    fn test_response_roundtrip_both_kinds() {
        let resp = CallResponse::success(Value::List(vec![Value::Null, Value::Bool(true)]), "List");
        for (_, serializer) in builtin_serializers() {
            let bytes = serializer.serialize_response(&resp).unwrap();
            assert_eq!(serializer.deserialize_response(&bytes).unwrap(), resp);
        }
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        let err = JsonSerializer.deserialize_request(b"not json").unwrap_err();
        assert!(matches!(err, crate::RpcError::Serialization(_)));

        let err = PostcardSerializer.deserialize_response(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, crate::RpcError::Serialization(_)));
    }

    #[test]
    fn test_for_kind_matches_header_id() {
        assert_eq!(for_kind(SerializerKind::Json).kind(), SerializerKind::Json);
        assert_eq!(for_kind(SerializerKind::Postcard).kind(), SerializerKind::Postcard);
    }
}
