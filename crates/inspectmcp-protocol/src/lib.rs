//! # inspectmcp protocol
//!
//! JSON-RPC 2.0 framing plus the Model Context Protocol message types the
//! inspector client core reads and writes.
//!
//! Schema validation is deliberately absent: the inspector shows servers'
//! payloads as they are, so untyped parts stay `serde_json::Value`.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod jsonrpc;
pub mod methods;
pub mod types;

pub use jsonrpc::{
    JsonRpcError, JsonRpcErrorCode, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, MessageId, RequestId,
};

/// Protocol version advertised during `initialize`
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol versions this client accepts from servers
pub const SUPPORTED_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];
