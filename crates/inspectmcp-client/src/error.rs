//! Error taxonomy for the inspector client core
//!
//! Every fallible operation in this crate returns [`InspectorError`]. The
//! variants mirror how the inspector UI reports failures: a connection
//! problem, a bad timeout option, one of the two timeout flavours, a
//! cancellation, or an error object returned by the server.

use std::sync::Arc;
use std::time::Duration;

use inspectmcp_protocol::{JsonRpcError, JsonRpcErrorCode};
use inspectmcp_transport_traits::TransportError;
use serde_json::Value;
use thiserror::Error;

/// Result alias used throughout the client core
pub type Result<T> = std::result::Result<T, InspectorError>;

/// Boxed underlying cause attached to connection failures
pub type ErrorSource = Arc<dyn std::error::Error + Send + Sync>;

/// Errors produced by sessions, the dispatcher and the resolver
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum InspectorError {
    /// The transport could not be opened, the handshake failed, or the
    /// channel closed underneath an operation
    #[error("Connection error: {message}")]
    Connection {
        /// What failed
        message: String,
        /// Underlying cause, if one was captured
        #[source]
        source: Option<ErrorSource>,
    },

    /// A timeout option could not be parsed or is out of range
    #[error("Invalid configuration for `{option}`: {reason} (got {value:?})")]
    InvalidConfiguration {
        /// Option name as the UI shows it
        option: String,
        /// Raw value that was refused
        value: String,
        /// Why it was refused
        reason: String,
    },

    /// The inactivity deadline elapsed before a response arrived
    #[error(
        "Request `{method}` timed out after {}ms ({progress_events} progress notifications received)",
        .timeout.as_millis()
    )]
    RequestTimeout {
        /// Method of the abandoned request
        method: String,
        /// Inactivity window that elapsed
        timeout: Duration,
        /// Progress notifications seen before giving up
        progress_events: u32,
    },

    /// The absolute ceiling elapsed, regardless of progress
    #[error(
        "Request `{method}` exceeded its maximum total timeout of {}ms ({progress_events} progress notifications received)",
        .ceiling.as_millis()
    )]
    MaxTotalTimeoutExceeded {
        /// Method of the abandoned request
        method: String,
        /// Ceiling measured from issue time
        ceiling: Duration,
        /// Progress notifications seen before giving up
        progress_events: u32,
    },

    /// The request was cancelled locally or its session went away
    #[error("Request cancelled: {reason}")]
    Cancelled {
        /// Why it was cancelled
        reason: String,
    },

    /// The server answered with a JSON-RPC error object
    #[error("Server error {code}: {message}")]
    Protocol {
        /// JSON-RPC error code
        code: i32,
        /// Server-supplied message
        message: String,
        /// Optional `data` member
        data: Option<Value>,
    },

    /// resolve/reject referenced a child request that is unknown or already settled
    #[error("No pending request `{id}`: {reason}")]
    ResolverMiss {
        /// Child id that was referenced
        id: String,
        /// Unknown, or the state it already settled into
        reason: String,
    },
}

/// Coarse classification of an [`InspectorError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`InspectorError::Connection`]
    Connection,
    /// See [`InspectorError::InvalidConfiguration`]
    InvalidConfiguration,
    /// See [`InspectorError::RequestTimeout`]
    RequestTimeout,
    /// See [`InspectorError::MaxTotalTimeoutExceeded`]
    MaxTotalTimeoutExceeded,
    /// See [`InspectorError::Cancelled`]
    Cancelled,
    /// See [`InspectorError::Protocol`]
    Protocol,
    /// See [`InspectorError::ResolverMiss`]
    ResolverMiss,
}

impl InspectorError {
    /// Connection failure without an underlying cause
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Connection failure wrapping its cause
    pub fn connection_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Connection {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Rejected configuration value
    pub fn invalid_configuration(
        option: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidConfiguration {
            option: option.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Cancellation with a reason
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Server-side "method not found", also used when a capability is missing
    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::Protocol {
            code: JsonRpcErrorCode::MethodNotFound.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Error kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::InvalidConfiguration { .. } => ErrorKind::InvalidConfiguration,
            Self::RequestTimeout { .. } => ErrorKind::RequestTimeout,
            Self::MaxTotalTimeoutExceeded { .. } => ErrorKind::MaxTotalTimeoutExceeded,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::ResolverMiss { .. } => ErrorKind::ResolverMiss,
        }
    }

    /// Whether this is either timeout flavour
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout { .. } | Self::MaxTotalTimeoutExceeded { .. }
        )
    }

    /// Whether repeating the same request could succeed
    ///
    /// Per-attempt timeouts and transport failures are transient. A ceiling
    /// breach, bad configuration or a server-reported error will recur.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout { .. } | Self::Connection { .. }
        )
    }

    /// Number of progress notifications observed before a timeout, if this is one
    pub fn progress_events(&self) -> Option<u32> {
        match self {
            Self::RequestTimeout {
                progress_events, ..
            }
            | Self::MaxTotalTimeoutExceeded {
                progress_events, ..
            } => Some(*progress_events),
            _ => None,
        }
    }

    /// JSON-RPC error object sent back to the server when a
    /// server-initiated request fails on this side
    pub fn to_jsonrpc_error(&self) -> JsonRpcError {
        match self {
            Self::Protocol {
                code,
                message,
                data,
            } => JsonRpcError {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            Self::Cancelled { reason } => {
                JsonRpcError::new(JsonRpcErrorCode::RequestCancelled.code(), reason.clone())
            }
            Self::InvalidConfiguration { .. } => {
                JsonRpcError::new(JsonRpcErrorCode::InvalidParams.code(), self.to_string())
            }
            other => JsonRpcError::internal_error(&other.to_string()),
        }
    }
}

impl From<JsonRpcError> for InspectorError {
    fn from(error: JsonRpcError) -> Self {
        Self::Protocol {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

impl From<TransportError> for InspectorError {
    fn from(error: TransportError) -> Self {
        Self::connection_with_source("transport failure", error)
    }
}
