//! Request dispatcher: timeout, progress and cancellation policy
//!
//! Every outbound request goes through [`RequestDispatcher::dispatch`]. It
//! allocates a session-unique numeric id, attaches that id as the request's
//! progress token, and races five events until one of them ends the request:
//!
//! 1. an explicit cancellation (user or session teardown)
//! 2. the server's response
//! 3. the absolute ceiling (`max_total_timeout`), which ignores progress
//! 4. the inactivity deadline (`request_timeout`)
//! 5. a progress notification, which pushes the deadline out again when
//!    `reset_timeout_on_progress` is set, but never past the ceiling
//!
//! The race is `biased` in that order. At the terminal state the dispatcher
//! forgets the response waiter, tells the server about abandoned requests,
//! cancels any child requests still parked under this one and records the
//! request in history.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use inspectmcp_protocol::types::{CancelledNotification, ProgressNotification};
use inspectmcp_protocol::{JsonRpcRequest, JsonRpcResponse, RequestId, methods};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::protocol::ProtocolClient;
use crate::config::DispatchPolicy;
use crate::error::{InspectorError, Result};
use crate::events::{Observers, ProgressEvent, Subscription};
use crate::history::{PrimaryTrace, TraceAssembler};
use crate::resolver::PendingRequestResolver;

/// The in-flight request a server-initiated child is attributed to
#[derive(Debug, Clone)]
pub(crate) struct ParentLink {
    pub(crate) request_id: RequestId,
    pub(crate) trace_id: String,
    pub(crate) issued_at: Instant,
}

/// Public view of an in-flight request
#[derive(Debug, Clone, PartialEq)]
pub struct InFlightRequest {
    /// Request id
    pub request_id: RequestId,
    /// JSON-RPC method
    pub method: String,
    /// Time since the request was issued
    pub elapsed: Duration,
    /// Progress notifications received so far
    pub progress_events: u32,
}

#[derive(Debug, Clone, Default)]
struct CancelHandle {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancelHandle {
    /// First reason wins
    fn cancel(&self, reason: &str) {
        self.reason
            .lock()
            .get_or_insert_with(|| reason.to_string());
        self.token.cancel();
    }

    fn reason(&self) -> String {
        self.reason
            .lock()
            .clone()
            .unwrap_or_else(|| "cancelled".to_string())
    }
}

#[derive(Debug)]
struct InFlight {
    request_id: RequestId,
    trace_id: String,
    method: String,
    issued_at: Instant,
    progress_tx: mpsc::UnboundedSender<ProgressNotification>,
    progress_events: u32,
    cancel: CancelHandle,
}

/// Issues outbound requests and enforces their dispatch policy
#[derive(Debug)]
pub struct RequestDispatcher {
    next_id: AtomicI64,
    /// Keyed by numeric request id, so the last entry is the newest request
    in_flight: Mutex<BTreeMap<i64, InFlight>>,
    resolver: Arc<PendingRequestResolver>,
    assembler: TraceAssembler,
    progress: Observers<ProgressEvent>,
}

impl RequestDispatcher {
    pub(crate) fn new(resolver: Arc<PendingRequestResolver>, assembler: TraceAssembler) -> Self {
        Self {
            next_id: AtomicI64::new(1),
            in_flight: Mutex::new(BTreeMap::new()),
            resolver,
            assembler,
            progress: Observers::new(),
        }
    }

    /// Called for every progress notification matched to an in-flight request
    pub fn on_progress<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.progress.subscribe(callback)
    }

    /// Snapshot of in-flight requests, oldest first
    pub fn in_flight(&self) -> Vec<InFlightRequest> {
        self.in_flight
            .lock()
            .values()
            .map(|entry| InFlightRequest {
                request_id: entry.request_id.clone(),
                method: entry.method.clone(),
                elapsed: entry.issued_at.elapsed(),
                progress_events: entry.progress_events,
            })
            .collect()
    }

    /// Cancel one in-flight request
    ///
    /// Returns `false` if the request already reached a terminal state; its
    /// outcome is left unchanged.
    pub fn cancel(&self, request_id: &RequestId, reason: &str) -> bool {
        let handle = id_key(request_id).and_then(|key| {
            self.in_flight
                .lock()
                .get(&key)
                .map(|entry| entry.cancel.clone())
        });
        match handle {
            Some(handle) => {
                info!(%request_id, reason, "Cancelling request");
                handle.cancel(reason);
                true
            }
            None => {
                debug!(%request_id, "Cancel ignored; request not in flight");
                false
            }
        }
    }

    /// Cancel every in-flight request; returns how many were signalled
    pub(crate) fn cancel_all(&self, reason: &str) -> usize {
        let handles: Vec<CancelHandle> = self
            .in_flight
            .lock()
            .values()
            .map(|entry| entry.cancel.clone())
            .collect();
        for handle in &handles {
            handle.cancel(reason);
        }
        handles.len()
    }

    /// Most recently issued request still in flight
    pub(crate) fn current_parent(&self) -> Option<ParentLink> {
        self.in_flight
            .lock()
            .last_key_value()
            .map(|(_, entry)| ParentLink {
                request_id: entry.request_id.clone(),
                trace_id: entry.trace_id.clone(),
                issued_at: entry.issued_at,
            })
    }

    /// Run `register` while `parent` is guaranteed to still be in flight
    ///
    /// Returns `None` without calling `register` if the parent already
    /// finished. Holding the in-flight lock orders registration before the
    /// parent's terminal cleanup, so a registered child is always seen by it.
    pub(crate) fn attach_child<R>(
        &self,
        parent: Option<&RequestId>,
        register: impl FnOnce() -> R,
    ) -> Option<R> {
        let in_flight = self.in_flight.lock();
        if let Some(parent) = parent {
            let alive = id_key(parent).is_some_and(|key| in_flight.contains_key(&key));
            if !alive {
                return None;
            }
        }
        Some(register())
    }

    /// Feed a progress notification to the request that owns its token
    pub(crate) fn handle_progress(&self, notification: ProgressNotification) {
        let token = notification.progress_token.clone();
        let mut in_flight = self.in_flight.lock();
        match id_key(&token).and_then(|key| in_flight.get_mut(&key)) {
            Some(entry) => {
                entry.progress_events += 1;
                if entry.progress_tx.send(notification).is_err() {
                    trace!(%token, "Progress arrived as the request finished");
                }
            }
            None => debug!(%token, "Progress for a request that is not in flight"),
        }
    }

    /// Issue a request and wait for its terminal state
    pub(crate) async fn dispatch(
        &self,
        protocol: &ProtocolClient,
        method: &str,
        params: Option<Value>,
        policy: &DispatchPolicy,
    ) -> Result<Value> {
        policy.validate()?;

        let key = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request_id = RequestId::Number(key);
        let params = attach_progress_token(params, &request_id);
        let trace_id = Uuid::new_v4().to_string();
        let issued_at = Instant::now();
        let issued_wall = Utc::now();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let cancel = CancelHandle::default();

        self.in_flight.lock().insert(
            key,
            InFlight {
                request_id: request_id.clone(),
                trace_id: trace_id.clone(),
                method: method.to_string(),
                issued_at,
                progress_tx,
                progress_events: 0,
                cancel: cancel.clone(),
            },
        );

        debug!(
            request_id = key,
            method,
            timeout_ms = policy.request_timeout.as_millis() as u64,
            reset_on_progress = policy.reset_timeout_on_progress,
            max_total_ms = policy.max_total_timeout.map(|d| d.as_millis() as u64),
            "Dispatching request"
        );

        // Register before sending so a fast response cannot be missed
        let waiter = protocol.register_waiter(request_id.clone());
        let request = JsonRpcRequest::new(method, params.clone(), request_id.clone());
        let (outcome, progress_events, sent) = match protocol.send_request(&request).await {
            Ok(()) => {
                let race = Race {
                    method,
                    policy,
                    issued_at,
                    cancel: &cancel,
                };
                let (outcome, count) = self.race(race, waiter, &mut progress_rx).await;
                (outcome, count, true)
            }
            Err(err) => (Err(err), 0, false),
        };

        protocol.forget_waiter(&request_id);
        self.in_flight.lock().remove(&key);
        let duration = issued_at.elapsed();

        match &outcome {
            Ok(_) => debug!(
                request_id = key,
                method,
                duration_ms = duration.as_millis() as u64,
                progress_events,
                "Request completed"
            ),
            Err(err) => {
                warn!(
                    request_id = key,
                    method,
                    duration_ms = duration.as_millis() as u64,
                    progress_events,
                    error = %err,
                    "Request failed"
                );
                if sent && abandons_server_work(err) {
                    let notice = CancelledNotification {
                        request_id: request_id.clone(),
                        reason: Some(err.to_string()),
                    };
                    let params = serde_json::to_value(&notice).ok();
                    if let Err(e) = protocol.notify(methods::NOTIFICATION_CANCELLED, params).await {
                        debug!(request_id = key, error = %e, "Could not notify server of cancellation");
                    }
                }
            }
        }

        let reason = match &outcome {
            Ok(_) => format!("parent request {key} completed"),
            Err(err) => format!("parent request {key} ended: {err}"),
        };
        let cleared = self.resolver.clear_for_parent(&request_id, &reason);
        if cleared > 0 {
            info!(request_id = key, cleared, "Cancelled child requests of finished request");
        }

        self.assembler.record_primary(PrimaryTrace {
            trace_id,
            method: method.to_string(),
            params,
            issued_at: issued_wall,
            duration,
            progress_events,
            outcome: outcome.clone(),
        });

        outcome
    }

    async fn race(
        &self,
        race: Race<'_>,
        mut waiter: oneshot::Receiver<JsonRpcResponse>,
        progress_rx: &mut mpsc::UnboundedReceiver<ProgressNotification>,
    ) -> (Result<Value>, u32) {
        let Race {
            method,
            policy,
            issued_at,
            cancel,
        } = race;
        let ceiling = policy.max_total_timeout.map(|max| issued_at + max);
        let mut deadline = issued_at + policy.request_timeout;
        let mut progress_events = 0u32;

        let ceiling_timer = async move {
            match ceiling {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(ceiling_timer);

        loop {
            tokio::select! {
                biased;

                () = cancel.token.cancelled() => {
                    return (Err(InspectorError::cancelled(cancel.reason())), progress_events);
                }

                response = &mut waiter => {
                    // Progress routed ahead of the response still counts
                    while let Ok(progress) = progress_rx.try_recv() {
                        progress_events += 1;
                        self.publish_progress(method, progress, progress_events);
                    }
                    let outcome = match response {
                        Ok(response) => response.into_result().map_err(InspectorError::from),
                        Err(_) => Err(InspectorError::cancelled(
                            "connection closed before a response arrived",
                        )),
                    };
                    return (outcome, progress_events);
                }

                () = &mut ceiling_timer => {
                    return (
                        Err(InspectorError::MaxTotalTimeoutExceeded {
                            method: method.to_string(),
                            ceiling: policy.max_total_timeout.unwrap_or_default(),
                            progress_events,
                        }),
                        progress_events,
                    );
                }

                () = sleep_until(deadline) => {
                    return (
                        Err(InspectorError::RequestTimeout {
                            method: method.to_string(),
                            timeout: policy.request_timeout,
                            progress_events,
                        }),
                        progress_events,
                    );
                }

                Some(progress) = progress_rx.recv() => {
                    progress_events += 1;
                    if policy.reset_timeout_on_progress {
                        let mut next = Instant::now() + policy.request_timeout;
                        if let Some(at) = ceiling {
                            next = next.min(at);
                        }
                        deadline = next;
                    }
                    self.publish_progress(method, progress, progress_events);
                }
            }
        }
    }

    fn publish_progress(&self, method: &str, progress: ProgressNotification, sequence: u32) {
        trace!(
            method,
            progress = progress.progress,
            total = ?progress.total,
            sequence,
            "Progress received"
        );
        self.progress.emit(&ProgressEvent {
            request_id: progress.progress_token,
            method: method.to_string(),
            progress: progress.progress,
            total: progress.total,
            message: progress.message,
            sequence,
        });
    }
}

/// Borrowed inputs of one race
struct Race<'a> {
    method: &'a str,
    policy: &'a DispatchPolicy,
    issued_at: Instant,
    cancel: &'a CancelHandle,
}

/// Timeouts and cancellations leave the server working on a request nobody awaits
fn abandons_server_work(err: &InspectorError) -> bool {
    matches!(
        err,
        InspectorError::RequestTimeout { .. }
            | InspectorError::MaxTotalTimeoutExceeded { .. }
            | InspectorError::Cancelled { .. }
    )
}

/// Outbound ids are numeric; servers echo them back as numbers or strings
fn id_key(id: &RequestId) -> Option<i64> {
    id.as_number()
}

/// Put the request id into `params._meta.progressToken`
fn attach_progress_token(params: Option<Value>, id: &RequestId) -> Option<Value> {
    let token = match id {
        RequestId::Number(n) => json!(n),
        RequestId::String(s) => json!(s),
    };
    match params {
        None => Some(json!({ "_meta": { "progressToken": token } })),
        Some(Value::Object(mut map)) => {
            let meta = map.entry("_meta").or_insert_with(|| json!({}));
            if let Value::Object(meta) = meta {
                meta.entry("progressToken").or_insert(token);
            }
            Some(Value::Object(map))
        }
        Some(other) => Some(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryStore;
    use pretty_assertions::assert_eq;

    fn dispatcher() -> RequestDispatcher {
        RequestDispatcher::new(
            Arc::new(PendingRequestResolver::default()),
            TraceAssembler::new(Arc::new(HistoryStore::default())),
        )
    }

    #[test]
    fn test_progress_token_injection() {
        let id = RequestId::Number(4);
        assert_eq!(
            attach_progress_token(None, &id),
            Some(json!({"_meta": {"progressToken": 4}}))
        );
        assert_eq!(
            attach_progress_token(Some(json!({"name": "t", "_meta": {"x": 1}})), &id),
            Some(json!({"name": "t", "_meta": {"x": 1, "progressToken": 4}}))
        );
        // A caller-supplied token is kept
        assert_eq!(
            attach_progress_token(Some(json!({"_meta": {"progressToken": "mine"}})), &id),
            Some(json!({"_meta": {"progressToken": "mine"}}))
        );
    }

    #[test]
    fn test_id_key_accepts_stringified_numbers() {
        assert_eq!(id_key(&RequestId::Number(9)), Some(9));
        assert_eq!(id_key(&RequestId::String("9".into())), Some(9));
        assert_eq!(id_key(&RequestId::String("abc".into())), None);
    }

    #[test]
    fn test_cancel_unknown_request_is_noop() {
        let dispatcher = dispatcher();
        assert!(!dispatcher.cancel(&RequestId::Number(1), "user"));
        assert_eq!(dispatcher.cancel_all("teardown"), 0);
        assert!(dispatcher.current_parent().is_none());
    }

    #[test]
    fn test_attach_child_requires_live_parent() {
        let dispatcher = dispatcher();
        assert_eq!(dispatcher.attach_child(None, || 1), Some(1));
        assert_eq!(dispatcher.attach_child(Some(&RequestId::Number(3)), || 1), None);
    }

    #[test]
    fn test_cancel_handle_keeps_first_reason() {
        let handle = CancelHandle::default();
        handle.cancel("user");
        handle.cancel("teardown");
        assert_eq!(handle.reason(), "user");
        assert!(handle.token.is_cancelled());
    }
}
