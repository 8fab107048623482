use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, warn};
use velorpc_common::transport::codec;
use velorpc_common::{
    CallRequest, CallResponse, MessageBody, MessageHeader, MessageStatus, SerializerKind, WireMessage,
};

use crate::service::LocalServiceTable;

/// Turns request frames into reply frames.
///
/// Every frame gets a reply. Frames that cannot be decoded are answered with
/// `BadRequest`, echoing whatever of the header could be read. Failures of
/// the called service, panics included, come back as `Ok` replies whose
/// response carries the error.
#[derive(Clone)]
pub struct Dispatcher {
    services: Arc<LocalServiceTable>,
}

impl Dispatcher {
    pub fn new(services: Arc<LocalServiceTable>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Arc<LocalServiceTable> {
        &self.services
    }

    pub async fn dispatch(&self, frame: &[u8]) -> Vec<u8> {
        let message = match codec::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Rejecting undecodable frame: {}", e);
                return bad_request(frame, &e.to_string());
            }
        };

        let header = message.header;
        let request = match message.body {
            MessageBody::Request(request) => request,
            MessageBody::Response(_) => {
                warn!("Rejecting RESPONSE frame {:x} sent to a provider", header.request_id);
                return encode_reply(
                    &header,
                    MessageStatus::BadRequest,
                    CallResponse::failure("bad request", "expected a REQUEST frame"),
                );
            }
        };

        let response = self.invoke(request).await;
        encode_reply(&header, MessageStatus::Ok, response)
    }

    async fn invoke(&self, request: CallRequest) -> CallResponse {
        let service_key = request.service_key();
        let Some(handler) = self.services.lookup(&service_key) else {
            debug!("No local service {}", service_key);
            let error = format!("service not found: {}", service_key);
            return CallResponse::failure(error.clone(), error);
        };

        let CallRequest {
            method_name,
            parameter_types,
            args,
            ..
        } = request;

        let outcome = AssertUnwindSafe(handler.invoke(&method_name, &parameter_types, args))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                debug!("{}.{} failed: {}", service_key, method_name, e);
                CallResponse::failure(format!("{}.{} failed", service_key, method_name), e.to_string())
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!("{}.{} panicked: {}", service_key, method_name, reason);
                CallResponse::failure(
                    format!("{}.{} panicked", service_key, method_name),
                    reason,
                )
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Reply to a frame that failed to decode.
fn bad_request(frame: &[u8], reason: &str) -> Vec<u8> {
    let request_id = codec::read_request_id(frame).unwrap_or_default();
    let serializer = codec::read_serializer(frame).unwrap_or(SerializerKind::Json);
    let header = MessageHeader::response(serializer, request_id, MessageStatus::BadRequest);
    encode_reply(&header, MessageStatus::BadRequest, CallResponse::failure("bad request", reason))
}

fn encode_reply(request: &MessageHeader, status: MessageStatus, response: CallResponse) -> Vec<u8> {
    match codec::encode(&WireMessage::reply_to(request, status, response)) {
        Ok(frame) => frame,
        Err(e) => {
            // Typically a result over the frame size limit
            error!("Failed to encode reply to {:x}: {}", request.request_id, e);
            let fallback = WireMessage::reply_to(
                request,
                MessageStatus::BadResponse,
                CallResponse::failure("bad response", e.to_string()),
            );
            codec::encode(&fallback).unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{MethodTable, ServiceHandler};
    use velorpc_common::{MessageType, Value, HEADER_LENGTH, PROTOCOL_MAGIC};

    fn dispatcher() -> Dispatcher {
        let services = Arc::new(LocalServiceTable::new());
        services.register(
            "Greeter:default:1.0",
            Arc::new(
                MethodTable::new("Greeter")
                    .method("greet", &["String"], "String", |args| async move {
                        let name = args[0].as_str().unwrap_or("nobody").to_string();
                        Ok(Value::from(format!("hello {}", name)))
                    })
                    .method("explode", &[], "null", |_| async move {
                        if true {
                            panic!("kaboom");
                        }
                        Ok(Value::Null)
                    }),
            ) as Arc<dyn ServiceHandler>,
        );
        Dispatcher::new(services)
    }

    fn request(kind: SerializerKind, req: CallRequest) -> (Vec<u8>, u64) {
        let message = WireMessage::request(kind, req);
        (codec::encode(&message).unwrap(), message.request_id())
    }

    #[tokio::test]
    async fn test_dispatch_greet() {
        for kind in [SerializerKind::Json, SerializerKind::Postcard] {
            let (frame, id) = request(kind, CallRequest::new("Greeter", "greet").with_arg("String", "world"));
            let reply = codec::decode(&dispatcher().dispatch(&frame).await).unwrap();

            assert_eq!(reply.header.message_type, MessageType::Response);
            assert_eq!(reply.header.status, MessageStatus::Ok);
            assert_eq!(reply.header.serializer, kind);
            assert_eq!(reply.request_id(), id);
            let response = reply.into_response().unwrap();
            assert_eq!(response.data, Some(Value::from("hello world")));
        }
    }

    #[tokio::test]
    async fn test_unknown_service_is_ok_status_with_error() {
        let (frame, id) = request(SerializerKind::Postcard, CallRequest::new("Missing", "greet"));
        let reply = codec::decode(&dispatcher().dispatch(&frame).await).unwrap();

        assert_eq!(reply.header.status, MessageStatus::Ok);
        assert_eq!(reply.request_id(), id);
        assert_eq!(
            reply.into_response().unwrap().error.as_deref(),
            Some("service not found: Missing:default:1.0")
        );
    }

    #[tokio::test]
    async fn test_bad_magic_is_bad_request() {
        let (mut frame, _) = request(SerializerKind::Postcard, CallRequest::new("Greeter", "greet"));
        frame[0] = PROTOCOL_MAGIC + 1;

        let reply = codec::decode(&dispatcher().dispatch(&frame).await).unwrap();
        assert_eq!(reply.header.status, MessageStatus::BadRequest);
        // A header with the wrong magic is not trusted for anything
        assert_eq!(reply.header.serializer, SerializerKind::Json);
        assert_eq!(reply.request_id(), 0);
        assert!(reply.into_response().unwrap().error.unwrap().contains("magic"));
    }

    #[tokio::test]
    async fn test_corrupt_body_echoes_header() {
        let (mut frame, id) = request(
            SerializerKind::Postcard,
            CallRequest::new("Greeter", "greet").with_arg("String", "world"),
        );
        for byte in &mut frame[HEADER_LENGTH..] {
            *byte = 0xFF;
        }

        let reply = codec::decode(&dispatcher().dispatch(&frame).await).unwrap();
        assert_eq!(reply.header.status, MessageStatus::BadRequest);
        assert_eq!(reply.header.serializer, SerializerKind::Postcard);
        assert_eq!(reply.request_id(), id);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_bad_request() {
        let reply = dispatcher().dispatch(&[PROTOCOL_MAGIC, 1, 2]).await;
        let reply = codec::decode(&reply).unwrap();
        assert_eq!(reply.header.status, MessageStatus::BadRequest);
        assert_eq!(reply.header.serializer, SerializerKind::Json);
        assert_eq!(reply.request_id(), 0);
    }

    #[tokio::test]
    async fn test_response_frame_is_bad_request() {
        let (frame, _) = request(SerializerKind::Json, CallRequest::new("Greeter", "greet"));
        let header = codec::decode(&frame).unwrap().header;
        let response = WireMessage::reply_to(&header, MessageStatus::Ok, CallResponse::empty());
        let reply = dispatcher().dispatch(&codec::encode(&response).unwrap()).await;

        let reply = codec::decode(&reply).unwrap();
        assert_eq!(reply.header.status, MessageStatus::BadRequest);
        assert_eq!(reply.request_id(), header.request_id);
    }

    #[tokio::test]
    async fn test_handler_panic_is_captured() {
        let (frame, _) = request(SerializerKind::Json, CallRequest::new("Greeter", "explode"));
        let reply = codec::decode(&dispatcher().dispatch(&frame).await).unwrap();

        assert_eq!(reply.header.status, MessageStatus::Ok);
        let response = reply.into_response().unwrap();
        assert_eq!(response.error.as_deref(), Some("kaboom"));
    }

    #[tokio::test]
    async fn test_unknown_method_reports_signature() {
        let (frame, _) = request(
            SerializerKind::Json,
            CallRequest::new("Greeter", "greet").with_arg("int", 5i64),
        );
        let reply = codec::decode(&dispatcher().dispatch(&frame).await).unwrap();
        let error = reply.into_response().unwrap().error.unwrap();
        assert!(error.contains("method not found: Greeter.greet(int)"), "{}", error);
    }
}
