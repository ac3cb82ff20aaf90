//! Core transport types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The transports an MCP inspector can connect through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportType {
    /// Standard Input/Output of a spawned server process.
    Stdio,
    /// Legacy HTTP + Server-Sent Events.
    Sse,
    /// Streamable HTTP.
    StreamableHttp,
    /// In-process channel, used by embedders and tests.
    InMemory,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Sse => write!(f, "sse"),
            Self::StreamableHttp => write!(f, "streamable-http"),
            Self::InMemory => write!(f, "in-memory"),
        }
    }
}

/// Represents the current state of a transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    /// The transport is not connected.
    Disconnected,
    /// The transport is in the process of connecting.
    Connecting,
    /// The transport is connected and ready to send/receive messages.
    Connected,
    /// The transport has encountered an unrecoverable error.
    Failed {
        /// A description of the failure reason.
        reason: String,
    },
}

impl TransportState {
    /// Whether no further traffic is possible in this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed { .. })
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}
