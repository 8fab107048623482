pub mod error;
pub mod message;
pub mod requests;
pub mod responses;
pub mod value;


pub use error::{ProtocolError, Result, RpcError};
pub use message::{
    MessageBody, MessageHeader, MessageStatus, MessageType, SerializerKind, WireMessage,
    HEADER_LENGTH, MAX_BODY_LENGTH, PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
pub use requests::{
    next_request_id, service_key, CallRequest, RequestId, DEFAULT_SERVICE_GROUP,
    DEFAULT_SERVICE_VERSION,
};
pub use responses::CallResponse;
pub use value::Value;
