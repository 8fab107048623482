//! VeloRPC Common Types and Transport
//!
//! This crate provides the wire protocol, body serializers, strategy
//! resolution, configuration and transports shared by every VeloRPC
//! component.
//!
//! # Overview
//!
//! VeloRPC lets a process call a method on a remote provider picked from a
//! registry of live instances. This crate contains the pieces both sides of
//! a call agree on:
//!
//! - **Protocol Layer**: frame header, request/response bodies, dynamic values, errors
//! - **Serializers**: JSON and Postcard body encodings
//! - **Transport Layer**: frame codec, TCP and HTTP transports
//! - **Strategies**: key-based selection of pluggable implementations
//! - **Configuration**: defaults, properties and environment overrides
//!
//! # Wire Format
//!
//! - **Header**: 17 bytes, big-endian (magic, version, serializer, type,
//!   status, request id, body length)
//! - **Body**: request or response serialized with the serializer the header names
//! - **Max Body Size**: 100 MB
//!
//! # Example
//!
//! ```
//! use velorpc_common::{CallRequest, SerializerKind, WireMessage};
//! use velorpc_common::transport::codec;
//!
//! let request = CallRequest::new("Greeter", "greet").with_arg("String", "world");
//! let frame = codec::encode(&WireMessage::request(SerializerKind::Postcard, request)).unwrap();
//! let decoded = codec::decode(&frame).unwrap();
//! assert_eq!(decoded.into_request().unwrap().method_name, "greet");
//! ```

pub mod config;
pub mod protocol;
pub mod serializer;
pub mod strategy;
pub mod transport;

pub use config::{ReferenceConfig, RegistryConfig, RpcConfig, WorkerPoolConfig};
pub use protocol::*;
pub use serializer::Serializer;
pub use strategy::StrategyRegistry;
