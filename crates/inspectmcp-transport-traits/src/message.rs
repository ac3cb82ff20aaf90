//! Transport message types.

use bytes::Bytes;
use inspectmcp_protocol::MessageId;
use serde::Serialize;

use crate::error::{TransportError, TransportResult};

/// A framed message sent or received over a transport.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    /// Identifier used for transport-level logging.
    pub id: MessageId,

    /// The serialized JSON-RPC payload.
    pub payload: Bytes,
}

impl TransportMessage {
    /// Creates a new `TransportMessage` with a given ID and payload.
    pub fn new(id: MessageId, payload: Bytes) -> Self {
        Self { id, payload }
    }

    /// Serializes a JSON-RPC value into a message.
    pub fn json<T: Serialize>(id: MessageId, value: &T) -> TransportResult<Self> {
        let payload = serde_json::to_vec(value).map_err(TransportError::from)?;
        Ok(Self::new(id, payload.into()))
    }

    /// Returns the size of the message payload in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
