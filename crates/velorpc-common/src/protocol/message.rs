//! VeloRPC Wire Message Types
//!
//! Every frame on the wire is a fixed 17-byte header followed by a body
//! serialized with the serializer the header names:
//!
//! ```text
//! offset  size  field
//! 0       1     magic
//! 1       1     version
//! 2       1     serializer id
//! 3       1     message type
//! 4       1     status
//! 5       8     request id (u64, big-endian)
//! 13      4     body length (u32, big-endian)
//! 17      N     body
//! ```
//!
//! The body length is not stored in [`MessageHeader`]: it is computed from
//! the serialized body when encoding and checked against the buffer when
//! decoding.

use super::requests::{next_request_id, CallRequest, RequestId};
use super::responses::CallResponse;

/// Magic byte every frame starts with.
pub const PROTOCOL_MAGIC: u8 = 0x1;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 0x1;

/// Size of the fixed frame header in bytes.
pub const HEADER_LENGTH: usize = 17;

/// Upper bound on a frame body (100 MB).
pub const MAX_BODY_LENGTH: usize = 100 * 1024 * 1024;

/// Serializer used for the frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SerializerKind {
    Json = 1,
    Postcard = 2,
}

impl SerializerKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(SerializerKind::Json),
            2 => Some(SerializerKind::Postcard),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Strategy key the serializer is registered under.
    pub fn key(self) -> &'static str {
        match self {
            SerializerKind::Json => "json",
            SerializerKind::Postcard => "postcard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Heartbeat = 2,
    Other = 3,
}

impl MessageType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(MessageType::Request),
            1 => Some(MessageType::Response),
            2 => Some(MessageType::Heartbeat),
            3 => Some(MessageType::Other),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageStatus {
    Ok = 20,
    BadRequest = 40,
    BadResponse = 50,
}

impl MessageStatus {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            20 => Some(MessageStatus::Ok),
            40 => Some(MessageStatus::BadRequest),
            50 => Some(MessageStatus::BadResponse),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: u8,
    pub version: u8,
    pub serializer: SerializerKind,
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub request_id: RequestId,
}

impl MessageHeader {
    /// Header for an outgoing request with a freshly generated id.
    pub fn request(serializer: SerializerKind) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            serializer,
            message_type: MessageType::Request,
            status: MessageStatus::Ok,
            request_id: next_request_id(),
        }
    }

    /// Header for a reply to `request_id`.
    pub fn response(serializer: SerializerKind, request_id: RequestId, status: MessageStatus) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            serializer,
            message_type: MessageType::Response,
            status,
            request_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Request(CallRequest),
    Response(CallResponse),
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Request(_) => MessageType::Request,
            MessageBody::Response(_) => MessageType::Response,
        }
    }
}

/// A decoded frame: header plus typed body.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl WireMessage {
    pub fn request(serializer: SerializerKind, request: CallRequest) -> Self {
        Self {
            header: MessageHeader::request(serializer),
            body: MessageBody::Request(request),
        }
    }

    /// Builds the reply to a request header, echoing its id and serializer.
    pub fn reply_to(request: &MessageHeader, status: MessageStatus, response: CallResponse) -> Self {
        Self {
            header: MessageHeader::response(request.serializer, request.request_id, status),
            body: MessageBody::Response(response),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.header.request_id
    }

    pub fn into_request(self) -> Option<CallRequest> {
        match self.body {
            MessageBody::Request(req) => Some(req),
            MessageBody::Response(_) => None,
        }
    }

    pub fn into_response(self) -> Option<CallResponse> {
        match self.body {
            MessageBody::Response(resp) => Some(resp),
            MessageBody::Request(_) => None,
        }
    }
}
