//! Pending-request resolver
//!
//! Server-initiated sampling and elicitation requests wait here until the
//! user (or an automated testing profile) answers them. Each parked request
//! is identified by a locally generated child id and settles exactly once:
//! resolved with a payload, rejected with a reason, or cancelled. A
//! cancellation either comes from this side (parent finished, session
//! closed) or from the server through `notifications/cancelled`; only the
//! former is answered.
//!
//! Settling an unknown or already-settled id is a logged no-op, never a panic.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use inspectmcp_protocol::types::CreateMessageRequest;
use inspectmcp_protocol::{RequestId, methods};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{InspectorError, Result};
use crate::events::{Observers, Subscription};
use crate::profile::TestingProfile;
use crate::sampling::{RuntimeContext, SamplingProviderRegistry};

/// Settled entries remembered for status queries and duplicate detection
const SETTLED_RETENTION: usize = 1024;

/// What kind of server-initiated request a child is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildRequestKind {
    /// `sampling/createMessage`
    Sampling,
    /// `elicitation/create`
    Elicitation,
    /// `roots/list`
    Roots,
    /// `notifications/message`
    Logging,
}

impl ChildRequestKind {
    /// JSON-RPC method of this kind
    pub fn method(self) -> &'static str {
        match self {
            Self::Sampling => methods::SAMPLING_CREATE_MESSAGE,
            Self::Elicitation => methods::ELICITATION_CREATE,
            Self::Roots => methods::ROOTS_LIST,
            Self::Logging => methods::NOTIFICATION_MESSAGE,
        }
    }
}

/// Resolution state of a child request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildStatus {
    /// Waiting for an answer
    Pending,
    /// Answered with a payload
    Resolved,
    /// Rejected or cancelled
    Rejected,
}

/// Which side cancelled a child request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOrigin {
    /// Parent finished or the session closed; the server gets `-32800`
    Client,
    /// The server sent `notifications/cancelled`; no response is owed
    Server,
}

/// How a child request settled
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// Answered; the payload goes back to the server
    Resolved(Value),
    /// Declined by the user or a failing provider
    Rejected {
        /// Reason sent to the server
        reason: String,
    },
    /// Cancelled before an answer was chosen
    Cancelled {
        /// Why the child was cancelled
        reason: String,
        /// Side that triggered the cancellation
        origin: CancelOrigin,
    },
}

impl Settlement {
    /// Client-side cancellation with `reason`
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
            origin: CancelOrigin::Client,
        }
    }

    /// Whether the server still expects a response
    pub fn needs_reply(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled {
                origin: CancelOrigin::Server,
                ..
            }
        )
    }

    /// Status this settlement moves a child into
    pub fn status(&self) -> ChildStatus {
        match self {
            Self::Resolved(_) => ChildStatus::Resolved,
            _ => ChildStatus::Rejected,
        }
    }
}

/// A server-initiated request as the UI sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    /// Locally generated child id
    pub id: String,
    /// Request kind
    pub kind: ChildRequestKind,
    /// Id the server used for its request
    pub server_request_id: RequestId,
    /// Outbound request in flight when this one arrived
    pub parent_request_id: Option<RequestId>,
    /// History id of that outbound request
    pub parent_trace_id: Option<String>,
    /// Request parameters as received
    pub payload: Value,
    /// Milliseconds since the parent was issued
    pub relative_time_ms: u64,
    /// Arrival time
    pub created_at: DateTime<Utc>,
    /// Current status
    pub status: ChildStatus,
}

struct Entry {
    request: PendingRequest,
    sender: Option<oneshot::Sender<Settlement>>,
    seq: u64,
    automated: bool,
}

#[derive(Default)]
struct ResolverState {
    entries: HashMap<String, Entry>,
    settled_order: VecDeque<String>,
    next_seq: u64,
    closed: Option<String>,
}

impl ResolverState {
    fn mark_settled(&mut self, id: &str) {
        self.settled_order.push_back(id.to_string());
        while self.settled_order.len() > SETTLED_RETENTION {
            if let Some(old) = self.settled_order.pop_front() {
                self.entries.remove(&old);
            }
        }
    }
}

type Delivery = (Option<oneshot::Sender<Settlement>>, PendingRequest, Settlement);

/// Parks server-initiated requests until they are answered
pub struct PendingRequestResolver {
    state: Mutex<ResolverState>,
    profile: RwLock<Option<TestingProfile>>,
    providers: Arc<SamplingProviderRegistry>,
    surfaced: Observers<PendingRequest>,
    settled: Observers<PendingRequest>,
}

impl std::fmt::Debug for PendingRequestResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequestResolver")
            .field("pending", &self.pending_count())
            .field("auto_respond", &self.auto_responding())
            .finish()
    }
}

impl Default for PendingRequestResolver {
    fn default() -> Self {
        Self::new(Arc::new(SamplingProviderRegistry::new()))
    }
}

impl PendingRequestResolver {
    /// Resolver delegating automated sampling to `providers`
    pub fn new(providers: Arc<SamplingProviderRegistry>) -> Self {
        Self {
            state: Mutex::new(ResolverState::default()),
            profile: RwLock::new(None),
            providers,
            surfaced: Observers::new(),
            settled: Observers::new(),
        }
    }

    /// Install or remove the active testing profile
    pub fn set_profile(&self, profile: Option<TestingProfile>) {
        if let Some(profile) = &profile {
            info!(
                profile = %profile.id,
                auto_respond = profile.auto_respond,
                strategy = %profile.strategy_id,
                "Activated testing profile"
            );
        }
        *self.profile.write() = profile;
    }

    /// Active testing profile
    pub fn profile(&self) -> Option<TestingProfile> {
        self.profile.read().clone()
    }

    /// Whether the active profile answers automatically
    pub fn auto_responding(&self) -> bool {
        self.profile.read().as_ref().is_some_and(|p| p.auto_respond)
    }

    /// Called when a request is parked and needs an answer
    pub fn on_pending<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PendingRequest) + Send + Sync + 'static,
    {
        self.surfaced.subscribe(callback)
    }

    /// Called whenever a child settles, including automated ones
    pub fn on_settled<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PendingRequest) + Send + Sync + 'static,
    {
        self.settled.subscribe(callback)
    }

    /// Resolve a pending child with `payload`
    ///
    /// Returns `false`, with a warning, if the id is unknown or already settled.
    pub fn resolve(&self, id: &str, payload: Value) -> bool {
        self.settle_logged(id, Settlement::Resolved(payload))
    }

    /// Reject a pending child; the server receives a user-rejected error
    ///
    /// Returns `false`, with a warning, if the id is unknown or already settled.
    pub fn reject(&self, id: &str, reason: impl Into<String>) -> bool {
        self.settle_logged(
            id,
            Settlement::Rejected {
                reason: reason.into(),
            },
        )
    }

    /// Settle a pending child
    ///
    /// # Errors
    ///
    /// Returns [`InspectorError::ResolverMiss`] if the id is unknown or the
    /// child already settled. The child is left untouched in that case.
    pub fn settle(&self, id: &str, settlement: Settlement) -> Result<()> {
        let delivery = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(id) else {
                return Err(InspectorError::ResolverMiss {
                    id: id.to_string(),
                    reason: "unknown child request".into(),
                });
            };
            if entry.request.status != ChildStatus::Pending {
                return Err(InspectorError::ResolverMiss {
                    id: id.to_string(),
                    reason: format!("already {:?}", entry.request.status).to_lowercase(),
                });
            }
            entry.request.status = settlement.status();
            let delivery = (entry.sender.take(), entry.request.clone(), settlement);
            state.mark_settled(id);
            delivery
        };
        self.deliver(vec![delivery]);
        Ok(())
    }

    fn settle_logged(&self, id: &str, settlement: Settlement) -> bool {
        match self.settle(id, settlement) {
            Ok(()) => true,
            Err(err) => {
                warn!(child = %id, error = %err, "Ignoring settlement");
                false
            }
        }
    }

    /// Cancel every pending child; returns how many were cancelled
    pub fn clear_all(&self, reason: &str) -> usize {
        self.settle_matching(|_| true, |_| Settlement::cancelled(reason))
    }

    /// Cancel the pending children of one outbound request
    pub fn clear_for_parent(&self, parent: &RequestId, reason: &str) -> usize {
        self.settle_matching(
            |request| request.parent_request_id.as_ref() == Some(parent),
            |_| Settlement::cancelled(reason),
        )
    }

    /// The server cancelled its own request; settle it without a reply
    pub fn withdraw(&self, server_request_id: &RequestId, reason: &str) -> bool {
        self.settle_matching(
            |request| &request.server_request_id == server_request_id,
            |_| Settlement::Cancelled {
                reason: reason.to_string(),
                origin: CancelOrigin::Server,
            },
        ) > 0
    }

    /// Cancel everything and refuse new registrations until [`reopen`](Self::reopen)
    pub(crate) fn close(&self, reason: &str) -> usize {
        self.state.lock().closed = Some(reason.to_string());
        self.clear_all(reason)
    }

    /// Accept registrations again
    pub(crate) fn reopen(&self) {
        self.state.lock().closed = None;
    }

    fn settle_matching<P, S>(&self, predicate: P, settlement: S) -> usize
    where
        P: Fn(&PendingRequest) -> bool,
        S: Fn(&PendingRequest) -> Settlement,
    {
        let deliveries: Vec<Delivery> = {
            let mut state = self.state.lock();
            let mut matched: Vec<(u64, String)> = state
                .entries
                .iter()
                .filter(|(_, e)| e.request.status == ChildStatus::Pending && predicate(&e.request))
                .map(|(id, e)| (e.seq, id.clone()))
                .collect();
            matched.sort();

            let mut deliveries = Vec::with_capacity(matched.len());
            for (_, id) in matched {
                if let Some(entry) = state.entries.get_mut(&id) {
                    let outcome = settlement(&entry.request);
                    entry.request.status = outcome.status();
                    deliveries.push((entry.sender.take(), entry.request.clone(), outcome));
                }
                state.mark_settled(&id);
            }
            deliveries
        };
        let count = deliveries.len();
        if count > 0 {
            debug!(count, "Settled pending child requests in bulk");
        }
        self.deliver(deliveries);
        count
    }

    fn deliver(&self, deliveries: Vec<Delivery>) {
        for (sender, snapshot, settlement) in deliveries {
            if let Some(sender) = sender
                && sender.send(settlement).is_err()
            {
                debug!(child = %snapshot.id, "Child request handler already gone");
            }
            self.settled.emit(&snapshot);
        }
    }

    /// Park a request; the receiver yields its settlement
    ///
    /// A closed resolver cancels the request immediately.
    pub(crate) fn register(&self, request: PendingRequest) -> oneshot::Receiver<Settlement> {
        self.park(request, false)
    }

    /// Park a request the testing profile is answering
    ///
    /// It settles and cascades like any other child but is left out of
    /// [`pending`](Self::pending) and never announced.
    pub(crate) fn register_automated(
        &self,
        request: PendingRequest,
    ) -> oneshot::Receiver<Settlement> {
        self.park(request, true)
    }

    fn park(&self, mut request: PendingRequest, automated: bool) -> oneshot::Receiver<Settlement> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;

        if let Some(reason) = state.closed.clone() {
            request.status = ChildStatus::Rejected;
            let id = request.id.clone();
            state.entries.insert(
                id.clone(),
                Entry {
                    request,
                    sender: None,
                    seq,
                    automated,
                },
            );
            state.mark_settled(&id);
            let _ = tx.send(Settlement::cancelled(reason));
            return rx;
        }

        request.status = ChildStatus::Pending;
        state.entries.insert(
            request.id.clone(),
            Entry {
                request,
                sender: Some(tx),
                seq,
                automated,
            },
        );
        rx
    }

    /// Tell observers a registered request is waiting, if it still is
    pub(crate) fn announce(&self, id: &str) {
        let snapshot = self
            .state
            .lock()
            .entries
            .get(id)
            .filter(|e| e.request.status == ChildStatus::Pending && !e.automated)
            .map(|e| e.request.clone());
        if let Some(request) = snapshot {
            debug!(child = %id, kind = ?request.kind, "Surfacing child request");
            self.surfaced.emit(&request);
        }
    }

    /// Hand an automated child over to a human and announce it
    pub(crate) fn surface(&self, id: &str) {
        if let Some(entry) = self.state.lock().entries.get_mut(id) {
            entry.automated = false;
        }
        self.announce(id);
    }

    /// Record a child that settled without ever being parked
    pub(crate) fn record_settled(&self, mut request: PendingRequest, settlement: &Settlement) {
        request.status = settlement.status();
        {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            let id = request.id.clone();
            state.entries.insert(
                id.clone(),
                Entry {
                    request: request.clone(),
                    sender: None,
                    seq,
                    automated: false,
                },
            );
            state.mark_settled(&id);
        }
        self.settled.emit(&request);
    }

    /// Whether the active profile will try to answer `kind` itself
    pub(crate) fn automates(&self, kind: ChildRequestKind) -> bool {
        let profile = self.profile.read();
        let Some(profile) = profile.as_ref().filter(|p| p.auto_respond) else {
            return false;
        };
        match kind {
            ChildRequestKind::Sampling => true,
            ChildRequestKind::Elicitation => profile.elicitation.is_some(),
            ChildRequestKind::Roots | ChildRequestKind::Logging => false,
        }
    }

    /// Answer produced by the active testing profile, if it auto-responds
    pub(crate) async fn automated_settlement(
        &self,
        request: &PendingRequest,
        session_id: &str,
    ) -> Option<Settlement> {
        let profile = self.profile().filter(|p| p.auto_respond)?;
        match request.kind {
            ChildRequestKind::Sampling => {
                let sampling: CreateMessageRequest =
                    serde_json::from_value(request.payload.clone()).ok()?;
                let context = RuntimeContext {
                    session_id: session_id.to_string(),
                    child_request_id: request.id.clone(),
                    parent_request_id: request.parent_request_id.clone(),
                    profile,
                };
                let settlement = match self.providers.generate(&sampling, &context).await {
                    Ok(generated) => {
                        for warning in &generated.warnings {
                            warn!(child = %request.id, warning = %warning, "Sampling provider warning");
                        }
                        debug!(
                            child = %request.id,
                            strategy = %context.profile.strategy_id,
                            usage = ?generated.usage,
                            "Automated sampling response"
                        );
                        match serde_json::to_value(&generated.response) {
                            Ok(value) => Settlement::Resolved(value),
                            Err(e) => Settlement::Rejected {
                                reason: format!("unserializable sampling result: {e}"),
                            },
                        }
                    }
                    Err(e) => {
                        warn!(child = %request.id, error = %e, "Sampling provider failed");
                        Settlement::Rejected {
                            reason: e.to_string(),
                        }
                    }
                };
                Some(settlement)
            }
            ChildRequestKind::Elicitation => {
                let answer = profile.elicitation_response()?;
                Some(match serde_json::to_value(answer) {
                    Ok(value) => Settlement::Resolved(value),
                    Err(e) => Settlement::Rejected {
                        reason: format!("unserializable elicitation result: {e}"),
                    },
                })
            }
            ChildRequestKind::Roots | ChildRequestKind::Logging => None,
        }
    }

    /// Current status of a child
    pub fn status(&self, id: &str) -> Option<ChildStatus> {
        self.state.lock().entries.get(id).map(|e| e.request.status)
    }

    /// Snapshot of one child
    pub fn get(&self, id: &str) -> Option<PendingRequest> {
        self.state.lock().entries.get(id).map(|e| e.request.clone())
    }

    /// Pending children awaiting a human answer, in arrival order
    pub fn pending(&self) -> Vec<PendingRequest> {
        let state = self.state.lock();
        let mut pending: Vec<(u64, PendingRequest)> = state
            .entries
            .values()
            .filter(|e| e.request.status == ChildStatus::Pending && !e.automated)
            .map(|e| (e.seq, e.request.clone()))
            .collect();
        pending.sort_by_key(|(seq, _)| *seq);
        pending.into_iter().map(|(_, request)| request).collect()
    }

    /// Number of pending children, automated ones included
    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| e.request.status == ChildStatus::Pending)
            .count()
    }
}
