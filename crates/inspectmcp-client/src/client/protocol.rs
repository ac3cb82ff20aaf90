//! Protocol client for JSON-RPC framing
//!
//! The [`ProtocolClient`] owns the transport and router for one connection
//! and turns typed JSON-RPC messages into transport frames. Timing and
//! correlation policy live in the dispatcher; this layer only frames, sends
//! and registers response waiters.
//!
//! ```text
//! RequestDispatcher::dispatch()
//!     ↓
//!   1. register_waiter(id)   → router holds the oneshot sender
//!   2. send_request(request) → transport.send()
//!   3. race the receiver against deadlines
//!     ↓
//! MessageRouter (background task)
//!   routes the response → oneshot
//! ```

use std::sync::Arc;

use inspectmcp_protocol::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, MessageId, RequestId,
};
use inspectmcp_transport_traits::{Transport, TransportMessage};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use super::router::MessageRouter;
use crate::error::{InspectorError, Result};

/// Frames and sends JSON-RPC messages over one connection
#[derive(Debug)]
pub(crate) struct ProtocolClient {
    transport: Arc<dyn Transport>,
    router: Arc<MessageRouter>,
}

impl ProtocolClient {
    pub(crate) fn new(transport: Arc<dyn Transport>, router: Arc<MessageRouter>) -> Self {
        Self { transport, router }
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Register for the response to `id`; call before [`send_request`](Self::send_request)
    pub(crate) fn register_waiter(&self, id: RequestId) -> oneshot::Receiver<JsonRpcResponse> {
        self.router.wait_for_response(id)
    }

    /// Give up on the response to `id`
    pub(crate) fn forget_waiter(&self, id: &RequestId) {
        self.router.forget(id);
    }

    pub(crate) async fn send_request(&self, request: &JsonRpcRequest) -> Result<()> {
        let frame_id = MessageId::from(format!("req-{}", request.id));
        self.send_frame(frame_id, request).await
    }

    pub(crate) async fn send_response(&self, response: &JsonRpcResponse) -> Result<()> {
        let frame_id = match &response.id {
            Some(id) => MessageId::from(format!("resp-{id}")),
            None => MessageId::from("resp-null"),
        };
        self.send_frame(frame_id, response).await
    }

    pub(crate) async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        self.send_frame(MessageId::from(format!("notif-{method}")), &notification)
            .await
    }

    async fn send_frame<T: Serialize>(&self, frame_id: MessageId, message: &T) -> Result<()> {
        let frame = TransportMessage::json(frame_id, message).map_err(|e| {
            InspectorError::connection_with_source("failed to serialize outbound frame", e)
        })?;
        tracing::trace!(frame = %frame.id, bytes = frame.size(), "Sending frame");
        self.transport
            .send(frame)
            .await
            .map_err(|e| InspectorError::connection_with_source("transport send failed", e))
    }
}
