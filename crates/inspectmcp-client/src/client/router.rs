//! Message router for inbound JSON-RPC traffic
//!
//! A background task is the only consumer of `transport.receive()` and
//! routes every frame:
//!
//! - **Responses** → the oneshot waiter registered by the dispatcher
//! - **Requests** → the request handler, which spawns per-request tasks
//! - **Notifications** → the notification handler, inline, so progress
//!   notifications for one request are observed in arrival order
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │          MessageRouter                       │
//! │                                              │
//! │  loop {                                      │
//! │    select! {                                 │
//! │      shutdown => break                       │
//! │      msg = transport.receive() => route(msg) │
//! │    }                                         │
//! │  }                                           │
//! │  drop waiters; signal `closed`               │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! When the transport reports end of stream or a fatal error the task drops
//! every outstanding waiter, so callers observe a closed channel instead of
//! hanging, and fires the `closed` token the session watches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use inspectmcp_protocol::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, MessageId,
};
use inspectmcp_transport_traits::{Transport, TransportMessage};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Callback for server-initiated requests; responsible for replying
pub(crate) type RequestHandler = Arc<dyn Fn(JsonRpcRequest) + Send + Sync>;

/// Callback for server notifications
pub(crate) type NotificationHandler = Arc<dyn Fn(JsonRpcNotification) + Send + Sync>;

/// Keyed by [`MessageId::normalized`] so a numeric id echoed as a string still matches
type Waiters = Arc<Mutex<HashMap<MessageId, oneshot::Sender<JsonRpcResponse>>>>;

/// Consecutive receive errors tolerated before backing off hard
const MAX_CONSECUTIVE_ERRORS: u32 = 20;

/// Routes frames read from one transport
pub(crate) struct MessageRouter {
    response_waiters: Waiters,
    request_handler: Arc<Mutex<Option<RequestHandler>>>,
    notification_handler: Arc<Mutex<Option<NotificationHandler>>>,
    /// Requested stop; the task exits without signalling `closed`
    shutdown: CancellationToken,
    /// The transport went away on its own
    closed: CancellationToken,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("waiters", &self.response_waiters.lock().len())
            .field("shutdown", &self.shutdown.is_cancelled())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl MessageRouter {
    /// Create a router and start its routing task
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        let router = Arc::new(Self {
            response_waiters: Arc::new(Mutex::new(HashMap::new())),
            request_handler: Arc::new(Mutex::new(None)),
            notification_handler: Arc::new(Mutex::new(None)),
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
        });
        router.spawn_routing_task(transport);
        router
    }

    pub(crate) fn set_request_handler(&self, handler: RequestHandler) {
        *self.request_handler.lock() = Some(handler);
        tracing::debug!("Request handler registered with router");
    }

    pub(crate) fn set_notification_handler(&self, handler: NotificationHandler) {
        *self.notification_handler.lock() = Some(handler);
        tracing::debug!("Notification handler registered with router");
    }

    /// Register interest in the response to `id`
    ///
    /// Must be called before the request is sent so a fast response cannot
    /// slip past.
    pub(crate) fn wait_for_response(&self, id: MessageId) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        tracing::trace!(request_id = %id, "Registered response waiter");
        self.response_waiters.lock().insert(id.normalized(), tx);
        rx
    }

    /// Drop the waiter for `id`, if the response never came
    pub(crate) fn forget(&self, id: &MessageId) {
        if self.response_waiters.lock().remove(&id.normalized()).is_some() {
            tracing::trace!(request_id = %id, "Dropped response waiter");
        }
    }

    /// Stop routing and release the handlers
    pub(crate) fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            tracing::info!("Message router shutdown initiated");
        }
        // Handlers capture the protocol client, which holds this router
        self.request_handler.lock().take();
        self.notification_handler.lock().take();
    }

    /// Token fired when the transport closes without a shutdown request
    pub(crate) fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn spawn_routing_task(&self, transport: Arc<dyn Transport>) {
        let response_waiters = Arc::clone(&self.response_waiters);
        let request_handler = Arc::clone(&self.request_handler);
        let notification_handler = Arc::clone(&self.notification_handler);
        let shutdown = self.shutdown.clone();
        let closed = self.closed.clone();

        tokio::spawn(async move {
            tracing::info!(transport = %transport.transport_type(), "Message router task started");
            let mut consecutive_errors = 0u32;

            loop {
                tokio::select! {
                    biased;

                    () = shutdown.cancelled() => {
                        tracing::info!("Message router task shutting down");
                        break;
                    }

                    result = transport.receive() => {
                        match result {
                            Ok(Some(msg)) => {
                                consecutive_errors = 0;
                                if let Err(e) = Self::route_message(
                                    &msg,
                                    &response_waiters,
                                    &request_handler,
                                    &notification_handler,
                                ) {
                                    tracing::error!(error = %e, "Dropping unroutable frame");
                                }
                            }
                            Ok(None) => {
                                tracing::info!("Transport reached end of stream");
                                break;
                            }
                            Err(e) => {
                                consecutive_errors += 1;
                                let state = transport.state().await;
                                if e.is_fatal() || state.is_terminal() {
                                    tracing::error!(error = %e, %state, "Transport failed");
                                    break;
                                }

                                if consecutive_errors == 1 {
                                    tracing::error!(error = %e, "Transport receive error");
                                } else if consecutive_errors <= MAX_CONSECUTIVE_ERRORS {
                                    tracing::warn!(
                                        attempt = consecutive_errors,
                                        error = %e,
                                        "Transport receive error"
                                    );
                                }

                                let delay_ms = 100u64
                                    .saturating_mul(2u64.saturating_pow(consecutive_errors.min(5)));
                                tokio::select! {
                                    () = shutdown.cancelled() => break,
                                    () = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                                }
                            }
                        }
                    }
                }
            }

            let abandoned = {
                let mut waiters = response_waiters.lock();
                let count = waiters.len();
                waiters.clear();
                count
            };
            request_handler.lock().take();
            notification_handler.lock().take();
            if !shutdown.is_cancelled() {
                closed.cancel();
            }
            tracing::info!(abandoned, "Message router task terminated");
        });
    }

    fn route_message(
        msg: &TransportMessage,
        response_waiters: &Waiters,
        request_handler: &Mutex<Option<RequestHandler>>,
        notification_handler: &Mutex<Option<NotificationHandler>>,
    ) -> Result<(), serde_json::Error> {
        match JsonRpcMessage::from_slice(&msg.payload)? {
            JsonRpcMessage::Response(response) => {
                let Some(request_id) = response.id.clone() else {
                    tracing::warn!("Received response with null id");
                    return Ok(());
                };
                // Bind the removal so the lock is released before sending
                let waiter = response_waiters.lock().remove(&request_id.normalized());
                match waiter {
                    Some(tx) => {
                        tracing::trace!(%request_id, "Routing response");
                        // Receiver may be gone if the request already timed out
                        let _ = tx.send(response);
                    }
                    None => tracing::warn!(
                        %request_id,
                        "Received response for unknown or expired request"
                    ),
                }
            }

            JsonRpcMessage::Request(request) => {
                tracing::debug!(method = %request.method, id = %request.id, "Routing server request");
                let handler = request_handler.lock().clone();
                match handler {
                    Some(handler) => handler(request),
                    None => tracing::warn!(
                        method = %request.method,
                        "Server request arrived with no handler registered"
                    ),
                }
            }

            JsonRpcMessage::Notification(notification) => {
                tracing::trace!(method = %notification.method, "Routing notification");
                let handler = notification_handler.lock().clone();
                if let Some(handler) = handler {
                    handler(notification);
                }
            }
        }
        Ok(())
    }
}
