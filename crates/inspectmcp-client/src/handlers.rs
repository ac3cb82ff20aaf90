//! Capability handler registry
//!
//! Inbound traffic from the server lands here. Server-initiated requests
//! (`ping`, `roots/list`, `sampling/createMessage`, `elicitation/create`)
//! are answered, either directly or after the resolver settles them.
//! Notifications are fanned out to observers:
//!
//! - `notifications/progress` goes to the dispatcher
//! - `notifications/message` goes to log observers and the logs repository
//! - `notifications/*/list_changed` goes to list-change observers
//! - `notifications/resources/updated` goes to resource observers
//! - `notifications/cancelled` withdraws a parked child request
//!
//! Sampling and elicitation are only answered when the session advertised
//! the capability; otherwise the server gets "method not found".

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use inspectmcp_protocol::types::{
    CancelledNotification, CreateMessageRequest, ElicitRequest, ListRootsResult,
    LoggingNotification, LogLevel, ProgressNotification, ResourceUpdatedNotification, Root,
};
use inspectmcp_protocol::{
    JsonRpcError, JsonRpcErrorCode, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, methods,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::dispatch::RequestDispatcher;
use crate::client::protocol::ProtocolClient;
use crate::config::ClientCapabilitiesConfig;
use crate::events::{ListChangedKind, Observers, Subscription};
use crate::history::{ChildTrace, TraceAssembler};
use crate::repository::{LogEntry, LogsRepository};
use crate::resolver::{ChildRequestKind, ChildStatus, PendingRequest, PendingRequestResolver, Settlement};

/// Supplies the roots returned for `roots/list`
pub trait RootsProvider: Send + Sync {
    /// Current roots
    fn roots(&self) -> Vec<Root>;
}

impl<F> RootsProvider for F
where
    F: Fn() -> Vec<Root> + Send + Sync,
{
    fn roots(&self) -> Vec<Root> {
        self()
    }
}

/// Registry of server-facing capability handlers and notification observers
pub struct CapabilityHandlerRegistry {
    capabilities: ClientCapabilitiesConfig,
    roots: RwLock<Option<Arc<dyn RootsProvider>>>,
    logs_repository: RwLock<Option<Arc<dyn LogsRepository>>>,
    logs: Observers<LoggingNotification>,
    list_changed: Observers<ListChangedKind>,
    resource_updates: Observers<ResourceUpdatedNotification>,
}

impl std::fmt::Debug for CapabilityHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityHandlerRegistry")
            .field("capabilities", &self.capabilities)
            .field("has_roots_provider", &self.roots.read().is_some())
            .field("log_observers", &self.logs.len())
            .field("list_changed_observers", &self.list_changed.len())
            .field("resource_observers", &self.resource_updates.len())
            .finish()
    }
}

impl Default for CapabilityHandlerRegistry {
    fn default() -> Self {
        Self::new(ClientCapabilitiesConfig::default())
    }
}

impl CapabilityHandlerRegistry {
    /// Registry answering the capabilities in `capabilities`
    pub fn new(capabilities: ClientCapabilitiesConfig) -> Self {
        Self {
            capabilities,
            roots: RwLock::new(None),
            logs_repository: RwLock::new(None),
            logs: Observers::new(),
            list_changed: Observers::new(),
            resource_updates: Observers::new(),
        }
    }

    /// Capabilities advertised during the handshake
    pub fn capabilities(&self) -> &ClientCapabilitiesConfig {
        &self.capabilities
    }

    /// Install or remove the roots provider
    pub fn set_roots_provider(&self, provider: Option<Arc<dyn RootsProvider>>) {
        *self.roots.write() = provider;
    }

    /// Roots the server would currently receive
    pub fn roots(&self) -> Vec<Root> {
        self.roots
            .read()
            .as_ref()
            .map(|provider| provider.roots())
            .unwrap_or_default()
    }

    /// Persist server logs into `repository`
    pub fn set_logs_repository(&self, repository: Option<Arc<dyn LogsRepository>>) {
        *self.logs_repository.write() = repository;
    }

    /// Called for each `notifications/message`
    pub fn on_log<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&LoggingNotification) + Send + Sync + 'static,
    {
        self.logs.subscribe(callback)
    }

    /// Called when the server's tool, resource or prompt list changes
    pub fn on_list_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ListChangedKind) + Send + Sync + 'static,
    {
        self.list_changed.subscribe(callback)
    }

    /// Called when a subscribed resource changes
    pub fn on_resource_updated<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ResourceUpdatedNotification) + Send + Sync + 'static,
    {
        self.resource_updates.subscribe(callback)
    }

    /// Answer one server-initiated request
    pub(crate) async fn handle_request(&self, ctx: &InboundContext, request: JsonRpcRequest) {
        let id = request.id.clone();
        debug!(id = %id, method = %request.method, "Server-initiated request");

        let reply = match request.method.as_str() {
            methods::PING => Some(Ok(json!({}))),
            methods::ROOTS_LIST if self.capabilities.roots.is_some() => {
                Some(self.answer_roots())
            }
            methods::SAMPLING_CREATE_MESSAGE if self.capabilities.sampling => {
                self.handle_child(ctx, request, ChildRequestKind::Sampling)
                    .await
            }
            methods::ELICITATION_CREATE if self.capabilities.elicitation => {
                self.handle_child(ctx, request, ChildRequestKind::Elicitation)
                    .await
            }
            other => {
                warn!(method = %other, "Server called a capability this client does not offer");
                Some(Err(JsonRpcError::method_not_found(other)))
            }
        };

        let Some(reply) = reply else {
            debug!(id = %id, "Request cancelled by the server; no reply sent");
            return;
        };
        let response = match reply {
            Ok(result) => JsonRpcResponse::success(result, id.clone()),
            Err(err) => JsonRpcResponse::error_response(err, id.clone()),
        };
        if let Err(e) = ctx.protocol.send_response(&response).await {
            warn!(id = %id, error = %e, "Failed to answer server request");
        }
    }

    fn answer_roots(&self) -> Result<Value, JsonRpcError> {
        let result = ListRootsResult { roots: self.roots() };
        debug!(count = result.roots.len(), "Answering roots/list");
        serde_json::to_value(&result).map_err(|e| JsonRpcError::internal_error(&e.to_string()))
    }

    /// Park a sampling or elicitation request until it settles
    ///
    /// `None` means the server withdrew the request and no reply is owed.
    async fn handle_child(
        &self,
        ctx: &InboundContext,
        request: JsonRpcRequest,
        kind: ChildRequestKind,
    ) -> Option<Result<Value, JsonRpcError>> {
        let payload = request.params.unwrap_or(Value::Null);
        let shape = match kind {
            ChildRequestKind::Sampling => {
                serde_json::from_value::<CreateMessageRequest>(payload.clone()).map(drop)
            }
            ChildRequestKind::Elicitation => {
                serde_json::from_value::<ElicitRequest>(payload.clone()).map(drop)
            }
            ChildRequestKind::Roots | ChildRequestKind::Logging => Ok(()),
        };
        if let Err(e) = shape {
            warn!(kind = ?kind, error = %e, "Malformed server request");
            return Some(Err(JsonRpcError::invalid_params(&e.to_string())));
        }

        let received = Instant::now();
        let parent = ctx.dispatcher.current_parent();
        let relative_time = parent
            .as_ref()
            .map_or(Duration::ZERO, |p| received.saturating_duration_since(p.issued_at));
        let child = PendingRequest {
            id: Uuid::new_v4().to_string(),
            kind,
            server_request_id: request.id,
            parent_request_id: parent.as_ref().map(|p| p.request_id.clone()),
            parent_trace_id: parent.as_ref().map(|p| p.trace_id.clone()),
            payload,
            relative_time_ms: relative_time.as_millis() as u64,
            created_at: Utc::now(),
            status: ChildStatus::Pending,
        };
        info!(
            child = %child.id,
            kind = ?kind,
            parent = ?child.parent_request_id,
            relative_time_ms = child.relative_time_ms,
            "Child request received"
        );

        let settlement = self.await_settlement(ctx, &child).await;

        ctx.assembler.record_child(ChildTrace {
            id: child.id.clone(),
            kind,
            parent_trace_id: child.parent_trace_id.clone(),
            relative_time,
            params: Some(child.payload.clone()),
            received_at: child.created_at,
            duration: received.elapsed(),
            settlement: settlement.clone(),
        });

        if !settlement.needs_reply() {
            return None;
        }
        match settlement {
            Settlement::Resolved(value) => Some(Ok(value)),
            Settlement::Rejected { reason } => Some(Err(JsonRpcError::new(
                JsonRpcErrorCode::UserRejected.code(),
                reason,
            ))),
            Settlement::Cancelled { reason, .. } => Some(Err(JsonRpcError::new(
                JsonRpcErrorCode::RequestCancelled.code(),
                reason,
            ))),
        }
    }

    /// Park `child` and wait for whoever settles it first
    ///
    /// Automated answers are parked too, so a parent's terminal cleanup or a
    /// session teardown still reaches a child whose provider is running.
    async fn await_settlement(&self, ctx: &InboundContext, child: &PendingRequest) -> Settlement {
        let automated = ctx.resolver.automates(child.kind);
        let registered = ctx
            .dispatcher
            .attach_child(child.parent_request_id.as_ref(), || {
                if automated {
                    ctx.resolver.register_automated(child.clone())
                } else {
                    ctx.resolver.register(child.clone())
                }
            });
        let Some(mut receiver) = registered else {
            let settlement = Settlement::cancelled("parent request already finished");
            ctx.resolver.record_settled(child.clone(), &settlement);
            return settlement;
        };

        if automated {
            tokio::select! {
                biased;
                settled = &mut receiver => {
                    return settled.unwrap_or_else(|_| Settlement::cancelled("resolver dropped the request"));
                }
                answer = ctx.resolver.automated_settlement(child, &ctx.session_id) => match answer {
                    Some(settlement) => {
                        if let Err(e) = ctx.resolver.settle(&child.id, settlement) {
                            debug!(child = %child.id, error = %e, "Automated answer lost the race");
                        }
                    }
                    None => {
                        debug!(child = %child.id, "Profile produced no answer; surfacing");
                        ctx.resolver.surface(&child.id);
                    }
                },
            }
        } else {
            ctx.resolver.announce(&child.id);
        }

        receiver
            .await
            .unwrap_or_else(|_| Settlement::cancelled("resolver dropped the request"))
    }

    /// Fan one notification out to its consumers
    pub(crate) fn handle_notification(&self, ctx: &InboundContext, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            methods::NOTIFICATION_PROGRESS => {
                if let Some(progress) = parse_params::<ProgressNotification>(&notification) {
                    ctx.dispatcher.handle_progress(progress);
                }
            }
            methods::NOTIFICATION_MESSAGE => {
                if let Some(log) = parse_params::<LoggingNotification>(&notification) {
                    self.logs.emit(&log);
                    self.persist_log(ctx, log);
                }
            }
            methods::NOTIFICATION_TOOLS_LIST_CHANGED => self.list_changed.emit(&ListChangedKind::Tools),
            methods::NOTIFICATION_RESOURCES_LIST_CHANGED => {
                self.list_changed.emit(&ListChangedKind::Resources);
            }
            methods::NOTIFICATION_PROMPTS_LIST_CHANGED => {
                self.list_changed.emit(&ListChangedKind::Prompts);
            }
            methods::NOTIFICATION_RESOURCE_UPDATED => {
                if let Some(update) = parse_params::<ResourceUpdatedNotification>(&notification) {
                    self.resource_updates.emit(&update);
                }
            }
            methods::NOTIFICATION_CANCELLED => {
                if let Some(cancelled) = parse_params::<CancelledNotification>(&notification) {
                    let reason = cancelled
                        .reason
                        .unwrap_or_else(|| "cancelled by server".to_string());
                    if !ctx.resolver.withdraw(&cancelled.request_id, &reason) {
                        debug!(id = %cancelled.request_id, "Server cancelled a request that is not parked");
                    }
                }
            }
            other => debug!(method = %other, "Unhandled notification"),
        }
    }

    fn persist_log(&self, ctx: &InboundContext, log: LoggingNotification) {
        let Some(repository) = self.logs_repository.read().clone() else {
            return;
        };
        let entry = LogEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            level: log.level,
            logger: log.logger,
            data: log.data,
            request_id: ctx.dispatcher.current_parent().map(|p| p.trace_id),
            session_id: Some(ctx.session_id.to_string()),
        };
        tokio::spawn(async move {
            if let Err(e) = repository.add(entry).await {
                warn!(error = %e, "Failed to persist server log");
            }
        });
    }
}

fn parse_params<T: DeserializeOwned>(notification: &JsonRpcNotification) -> Option<T> {
    let params = notification.params.clone().unwrap_or(Value::Null);
    match serde_json::from_value(params) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(method = %notification.method, error = %e, "Malformed notification");
            None
        }
    }
}

/// Forward server logs to `tracing` at a matching level
pub fn trace_server_log(log: &LoggingNotification) {
    let logger = log.logger.as_deref().unwrap_or("server");
    let message = match &log.data {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    match log.level {
        LogLevel::Debug => debug!(logger, "{message}"),
        LogLevel::Info | LogLevel::Notice => info!(logger, level = ?log.level, "{message}"),
        LogLevel::Warning => warn!(logger, "{message}"),
        LogLevel::Error | LogLevel::Critical | LogLevel::Alert | LogLevel::Emergency => {
            error!(logger, level = ?log.level, "{message}");
        }
    }
}

/// Everything an inbound handler needs from its session
#[derive(Clone)]
pub(crate) struct InboundContext {
    pub(crate) session_id: Arc<str>,
    pub(crate) protocol: Arc<ProtocolClient>,
    pub(crate) dispatcher: Arc<RequestDispatcher>,
    pub(crate) resolver: Arc<PendingRequestResolver>,
    pub(crate) assembler: TraceAssembler,
    pub(crate) handlers: Arc<CapabilityHandlerRegistry>,
}

impl InboundContext {
    /// Wire the router's callbacks to this context
    pub(crate) fn install(self) {
        let router = Arc::clone(self.protocol.router());
        let ctx = Arc::new(self);

        let requests = Arc::clone(&ctx);
        router.set_request_handler(Arc::new(move |request| {
            let ctx = Arc::clone(&requests);
            tokio::spawn(async move { ctx.handlers.handle_request(&ctx, request).await });
        }));

        let notifications = ctx;
        router.set_notification_handler(Arc::new(move |notification| {
            notifications
                .handlers
                .handle_notification(&notifications, notification);
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_roots_provider_closure() {
        let registry = CapabilityHandlerRegistry::default();
        assert!(registry.roots().is_empty());

        registry.set_roots_provider(Some(Arc::new(|| {
            vec![Root {
                uri: "file:///workspace".into(),
                name: Some("workspace".into()),
            }]
        })));
        assert_eq!(registry.roots()[0].uri, "file:///workspace");

        registry.set_roots_provider(None);
        assert!(registry.roots().is_empty());
    }

    #[test]
    fn test_observer_unsubscribe() {
        let registry = CapabilityHandlerRegistry::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let sub = {
            let seen = Arc::clone(&seen);
            registry.on_list_changed(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        };
        registry.list_changed.emit(&ListChangedKind::Tools);
        sub.unsubscribe();
        registry.list_changed.emit(&ListChangedKind::Tools);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_parse_params_rejects_malformed() {
        let good = JsonRpcNotification::new(
            methods::NOTIFICATION_RESOURCE_UPDATED,
            Some(json!({"uri": "file:///a"})),
        );
        let bad = JsonRpcNotification::new(methods::NOTIFICATION_RESOURCE_UPDATED, None);
        assert_eq!(
            parse_params::<ResourceUpdatedNotification>(&good).map(|u| u.uri),
            Some("file:///a".to_string())
        );
        assert!(parse_params::<ResourceUpdatedNotification>(&bad).is_none());
    }
}
