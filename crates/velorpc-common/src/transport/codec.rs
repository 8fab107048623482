//! Frame codec.
//!
//! [`encode`] and [`decode`] convert between [`WireMessage`] and its
//! 17-byte-header wire form. [`FrameBuffer`] sits in front of `decode` on
//! stream transports and cuts the incoming byte stream into whole frames.
//!
//! # Example
//!
//! ```
//! use velorpc_common::transport::codec;
//! use velorpc_common::{CallRequest, SerializerKind, WireMessage};
//!
//! let message = WireMessage::request(
//!     SerializerKind::Json,
//!     CallRequest::new("Greeter", "greet").with_arg("String", "world"),
//! );
//! let bytes = codec::encode(&message).unwrap();
//! assert_eq!(codec::decode(&bytes).unwrap(), message);
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::{
    MessageBody, MessageHeader, MessageStatus, MessageType, ProtocolError, RequestId, Result,
    RpcError, SerializerKind, WireMessage, HEADER_LENGTH, MAX_BODY_LENGTH, PROTOCOL_MAGIC,
};
use crate::serializer::{self, Serializer};

const REQUEST_ID_OFFSET: usize = 5;
const BODY_LENGTH_OFFSET: usize = 13;

/// Serializes a message into one frame.
///
/// # Errors
///
/// - `InvalidRequest` if the header type does not match the body
/// - `Serialization` if the body cannot be serialized
/// - `Protocol(FrameTooLarge)` if the body exceeds [`MAX_BODY_LENGTH`]
pub fn encode(message: &WireMessage) -> Result<Vec<u8>> {
    encode_with(message, serializer::for_kind(message.header.serializer))
}

/// Like [`encode`], but serializes the body with a caller-resolved
/// serializer, which must be of the kind the header declares.
pub fn encode_with(message: &WireMessage, serializer: &dyn Serializer) -> Result<Vec<u8>> {
    let header = &message.header;
    if header.message_type != message.body.message_type() {
        return Err(RpcError::InvalidRequest(format!(
            "header declares {:?} but body is {:?}",
            header.message_type,
            message.body.message_type()
        )));
    }
    if header.serializer != serializer.kind() {
        return Err(RpcError::InvalidRequest(format!(
            "header declares {:?} serializer but {:?} was supplied",
            header.serializer,
            serializer.kind()
        )));
    }

    let body = match &message.body {
        MessageBody::Request(req) => serializer.serialize_request(req)?,
        MessageBody::Response(resp) => serializer.serialize_response(resp)?,
    };

    if body.len() > MAX_BODY_LENGTH {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: MAX_BODY_LENGTH,
        }
        .into());
    }

    let mut buf = BytesMut::with_capacity(HEADER_LENGTH + body.len());
    buf.put_u8(header.magic);
    buf.put_u8(header.version);
    buf.put_u8(header.serializer.as_byte());
    buf.put_u8(header.message_type.as_byte());
    buf.put_u8(header.status.as_byte());
    buf.put_u64(header.request_id);
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);

    Ok(buf.to_vec())
}

/// Parses one frame.
///
/// The magic byte is checked before anything else is read. HEARTBEAT and
/// OTHER frames are recognised but not supported.
pub fn decode(bytes: &[u8]) -> Result<WireMessage> {
    let header = peek_header(bytes)?;

    let body_length = body_length(bytes);
    let needed = HEADER_LENGTH + body_length;
    if bytes.len() < needed {
        return Err(ProtocolError::Incomplete {
            needed,
            available: bytes.len(),
        }
        .into());
    }

    let serializer = serializer::for_kind(header.serializer);
    let body_bytes = &bytes[HEADER_LENGTH..needed];
    let body = match header.message_type {
        MessageType::Request => MessageBody::Request(serializer.deserialize_request(body_bytes)?),
        MessageType::Response => MessageBody::Response(serializer.deserialize_response(body_bytes)?),
        other => return Err(ProtocolError::UnsupportedMessageType(other.as_byte()).into()),
    };

    Ok(WireMessage { header, body })
}

/// Reads and validates the fixed header without touching the body.
pub fn peek_header(bytes: &[u8]) -> Result<MessageHeader> {
    match bytes.first() {
        None => {
            return Err(ProtocolError::Incomplete {
                needed: HEADER_LENGTH,
                available: 0,
            }
            .into())
        }
        Some(&magic) if magic != PROTOCOL_MAGIC => {
            return Err(ProtocolError::BadMagic { found: magic }.into())
        }
        Some(_) => {}
    }

    if bytes.len() < HEADER_LENGTH {
        return Err(ProtocolError::Incomplete {
            needed: HEADER_LENGTH,
            available: bytes.len(),
        }
        .into());
    }

    let serializer = SerializerKind::from_byte(bytes[2])
        .ok_or(ProtocolError::UnknownSerializer(bytes[2]))?;
    let message_type = MessageType::from_byte(bytes[3])
        .ok_or(ProtocolError::UnsupportedMessageType(bytes[3]))?;
    let status = MessageStatus::from_byte(bytes[4]).ok_or(ProtocolError::UnknownStatus(bytes[4]))?;

    let body_length = body_length(bytes);
    if body_length > MAX_BODY_LENGTH {
        return Err(ProtocolError::FrameTooLarge {
            size: body_length,
            max: MAX_BODY_LENGTH,
        }
        .into());
    }

    Ok(MessageHeader {
        magic: bytes[0],
        version: bytes[1],
        serializer,
        message_type,
        status,
        request_id: read_request_id(bytes).unwrap_or_default(),
    })
}

/// Request id of a frame whose header is at least present and carries the
/// right magic, even if other header fields are invalid.
pub fn read_request_id(bytes: &[u8]) -> Option<RequestId> {
    if bytes.len() < HEADER_LENGTH || bytes[0] != PROTOCOL_MAGIC {
        return None;
    }
    let mut id = &bytes[REQUEST_ID_OFFSET..BODY_LENGTH_OFFSET];
    Some(id.get_u64())
}

/// Serializer id of a frame, when the header is readable and the id known.
pub fn read_serializer(bytes: &[u8]) -> Option<SerializerKind> {
    if bytes.len() < HEADER_LENGTH || bytes[0] != PROTOCOL_MAGIC {
        return None;
    }
    SerializerKind::from_byte(bytes[2])
}

fn body_length(bytes: &[u8]) -> usize {
    let mut len = &bytes[BODY_LENGTH_OFFSET..HEADER_LENGTH];
    len.get_u32() as usize
}

/// Reassembles frames from a byte stream.
///
/// Chunks are appended with [`push`](FrameBuffer::push); each call to
/// [`next_frame`](FrameBuffer::next_frame) yields at most one complete
/// frame and keeps any trailing bytes for the next one. A bad magic byte or
/// an oversized body length is reported as soon as the header is visible,
/// since the stream cannot be resynchronised after either.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Writable tail for reading directly from a socket.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if let Some(&magic) = self.buf.first() {
            if magic != PROTOCOL_MAGIC {
                return Err(ProtocolError::BadMagic { found: magic }.into());
            }
        }
        if self.buf.len() < HEADER_LENGTH {
            return Ok(None);
        }

        let body_length = body_length(&self.buf);
        if body_length > MAX_BODY_LENGTH {
            return Err(ProtocolError::FrameTooLarge {
                size: body_length,
                max: MAX_BODY_LENGTH,
            }
            .into());
        }

        let frame_length = HEADER_LENGTH + body_length;
        if self.buf.len() < frame_length {
            self.buf.reserve(frame_length - self.buf.len());
            return Ok(None);
        }

        Ok(Some(self.buf.split_to(frame_length).freeze()))
    }

    /// Drains everything buffered, framed or not.
    ///
    /// Used after [`FrameBuffer::next_frame`] failed, to hand the unframeable
    /// bytes to whoever answers them.
    pub fn take_remaining(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
