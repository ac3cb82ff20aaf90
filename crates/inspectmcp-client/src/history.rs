//! Request history and trace assembly
//!
//! Every terminal outbound request and every settled server-initiated child
//! request becomes a [`HistoryEntry`]. Children point at their parent through
//! `parent_request_id`, the parent lists its children in `child_request_ids`,
//! and `relative_time_ms` places each child on the parent's timeline.
//!
//! [`HistoryStore`] keeps at most `capacity` entries and evicts the oldest
//! unpinned entry first. Pinned entries are never evicted, so a store full of
//! pinned entries may temporarily exceed its capacity.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use inspectmcp_protocol::methods;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::DEFAULT_HISTORY_CAPACITY;
use crate::error::InspectorError;
use crate::resolver::{ChildRequestKind, Settlement};

/// Whether an entry was issued by the inspector or by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    /// Outbound request issued by the inspector
    Primary,
    /// Server-initiated request handled by the inspector
    Client,
}

/// One row of the request history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Unique entry id
    pub id: String,
    /// When the request was issued
    pub timestamp: DateTime<Utc>,
    /// JSON-RPC method
    pub method: String,
    /// Tool name, prompt name or resource URI, when the method has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Request parameters as sent or received
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Result payload, or the error object for failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// Wall time from issue to terminal state
    pub duration_ms: u64,
    /// Whether the request completed successfully
    pub success: bool,
    /// Human-readable failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Pinned entries survive eviction
    #[serde(default)]
    pub pinned: bool,
    /// Primary or client
    pub request_type: RequestType,
    /// Parent entry id, children only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_request_id: Option<String>,
    /// Child entry ids, primaries with children only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_request_ids: Option<Vec<String>>,
    /// Offset from the parent's issue time, children only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_time_ms: Option<u64>,
    /// Progress notifications received, primaries only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_events: Option<u32>,
}

impl HistoryEntry {
    /// Whether this entry has no parent
    pub fn is_root(&self) -> bool {
        self.parent_request_id.is_none()
    }
}

/// Criteria for [`HistoryStore::list`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistoryFilter {
    /// Only entries with this method
    pub method: Option<String>,
    /// Only entries of this type
    pub request_type: Option<RequestType>,
    /// Only entries without a parent
    pub root_only: bool,
    /// Only pinned entries
    pub pinned_only: bool,
}

impl HistoryFilter {
    /// Root entries only
    pub fn roots() -> Self {
        Self {
            root_only: true,
            ..Self::default()
        }
    }

    fn matches(&self, entry: &HistoryEntry) -> bool {
        self.method.as_deref().is_none_or(|m| entry.method == m)
            && self.request_type.is_none_or(|t| entry.request_type == t)
            && (!self.root_only || entry.is_root())
            && (!self.pinned_only || entry.pinned)
    }
}

/// Bounded, pin-aware history storage
#[derive(Debug)]
pub struct HistoryStore {
    capacity: usize,
    entries: RwLock<VecDeque<HistoryEntry>>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl HistoryStore {
    /// Create a store holding at most `capacity` unpinned entries
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Append an entry and evict as needed; returns the evicted entries
    pub fn add(&self, entry: HistoryEntry) -> Vec<HistoryEntry> {
        let mut entries = self.entries.write();
        self.push_evicting(&mut entries, entry)
    }

    fn push_evicting(
        &self,
        entries: &mut VecDeque<HistoryEntry>,
        entry: HistoryEntry,
    ) -> Vec<HistoryEntry> {
        entries.push_back(entry);

        let mut evicted = Vec::new();
        while entries.len() > self.capacity {
            let Some(position) = entries.iter().position(|e| !e.pinned) else {
                debug!(
                    len = entries.len(),
                    capacity = self.capacity,
                    "History full of pinned entries; nothing to evict"
                );
                break;
            };
            if let Some(old) = entries.remove(position) {
                trace!(id = %old.id, "Evicted history entry");
                evicted.push(old);
            }
        }
        evicted
    }

    /// Look an entry up by id
    pub fn get(&self, id: &str) -> Option<HistoryEntry> {
        self.entries.read().iter().find(|e| e.id == id).cloned()
    }

    /// Matching entries, newest first
    pub fn list(&self, filter: &HistoryFilter) -> Vec<HistoryEntry> {
        let mut matching: Vec<HistoryEntry> = self
            .entries
            .read()
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        // Stable sort: equal timestamps keep newest-inserted first
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching
    }

    /// All entries in insertion order
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.read().iter().cloned().collect()
    }

    /// Children of `parent_id` in timeline order
    pub fn children_of(&self, parent_id: &str) -> Vec<HistoryEntry> {
        let mut children: Vec<HistoryEntry> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.parent_request_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|e| e.relative_time_ms.unwrap_or_default());
        children
    }

    /// Set the pinned flag; returns `false` if the id is unknown
    pub fn set_pinned(&self, id: &str, pinned: bool) -> bool {
        match self.entries.write().iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.pinned = pinned;
                true
            }
            None => false,
        }
    }

    /// Flip the pinned flag; returns the new value
    pub fn toggle_pin(&self, id: &str) -> Option<bool> {
        let mut entries = self.entries.write();
        let entry = entries.iter_mut().find(|e| e.id == id)?;
        entry.pinned = !entry.pinned;
        Some(entry.pinned)
    }

    /// Append `child_id` to the parent's child list; returns `false` if the parent is unknown
    pub fn append_child(&self, parent_id: &str, child_id: &str) -> bool {
        let mut entries = self.entries.write();
        let Some(parent) = entries.iter_mut().find(|e| e.id == parent_id) else {
            return false;
        };
        let children = parent.child_request_ids.get_or_insert_with(Vec::new);
        if !children.iter().any(|c| c == child_id) {
            children.push(child_id.to_string());
        }
        true
    }

    /// Remove one entry
    pub fn remove(&self, id: &str) -> Option<HistoryEntry> {
        let mut entries = self.entries.write();
        let position = entries.iter().position(|e| e.id == id)?;
        entries.remove(position)
    }

    /// Remove every entry, pinned or not
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Insert a primary entry, adopting children recorded before it
    fn add_primary(&self, mut entry: HistoryEntry) -> HistoryEntry {
        let mut entries = self.entries.write();
        let mut children: Vec<(u64, String)> = entries
            .iter()
            .filter(|e| e.parent_request_id.as_deref() == Some(entry.id.as_str()))
            .map(|e| (e.relative_time_ms.unwrap_or_default(), e.id.clone()))
            .collect();
        children.sort_by_key(|(offset, _)| *offset);
        if !children.is_empty() {
            entry.child_request_ids = Some(children.into_iter().map(|(_, id)| id).collect());
        }
        self.push_evicting(&mut entries, entry.clone());
        entry
    }

    /// Insert a child entry and link it into its parent, if the parent is recorded
    fn add_child(&self, entry: HistoryEntry) -> HistoryEntry {
        let mut entries = self.entries.write();
        if let Some(parent_id) = entry.parent_request_id.as_deref()
            && let Some(parent) = entries.iter_mut().find(|e| e.id == parent_id)
        {
            parent
                .child_request_ids
                .get_or_insert_with(Vec::new)
                .push(entry.id.clone());
        }
        self.push_evicting(&mut entries, entry.clone());
        entry
    }
}

/// Everything known about a primary request at its terminal state
#[derive(Debug, Clone)]
pub struct PrimaryTrace {
    /// History id allocated when the request was issued
    pub trace_id: String,
    /// JSON-RPC method
    pub method: String,
    /// Parameters as sent
    pub params: Option<Value>,
    /// Issue time
    pub issued_at: DateTime<Utc>,
    /// Time to terminal state
    pub duration: Duration,
    /// Progress notifications received
    pub progress_events: u32,
    /// Final outcome
    pub outcome: std::result::Result<Value, InspectorError>,
}

/// Everything known about a settled child request
#[derive(Debug, Clone)]
pub struct ChildTrace {
    /// Child id assigned by the resolver
    pub id: String,
    /// Sampling, elicitation, roots or logging
    pub kind: ChildRequestKind,
    /// Parent's history id, `None` for unsolicited requests
    pub parent_trace_id: Option<String>,
    /// Offset from the parent's issue time
    pub relative_time: Duration,
    /// Parameters received from the server
    pub params: Option<Value>,
    /// When the server's request arrived
    pub received_at: DateTime<Utc>,
    /// Time until settlement
    pub duration: Duration,
    /// How it settled
    pub settlement: Settlement,
}

/// Turns terminal requests into linked history entries
#[derive(Debug, Clone)]
pub struct TraceAssembler {
    store: Arc<HistoryStore>,
}

impl TraceAssembler {
    /// Assemble into `store`
    pub fn new(store: Arc<HistoryStore>) -> Self {
        Self { store }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<HistoryStore> {
        &self.store
    }

    /// Record a primary request
    pub fn record_primary(&self, trace: PrimaryTrace) -> HistoryEntry {
        let (success, response, error) = match &trace.outcome {
            Ok(result) => (true, Some(result.clone()), None),
            Err(err) => (
                false,
                Some(serde_json::to_value(err.to_jsonrpc_error()).unwrap_or(Value::Null)),
                Some(err.to_string()),
            ),
        };
        let entry = HistoryEntry {
            id: trace.trace_id,
            timestamp: trace.issued_at,
            target: target_of(&trace.method, trace.params.as_ref()),
            method: trace.method,
            params: trace.params,
            response,
            duration_ms: trace.duration.as_millis() as u64,
            success,
            error,
            pinned: false,
            request_type: RequestType::Primary,
            parent_request_id: None,
            child_request_ids: None,
            relative_time_ms: None,
            progress_events: Some(trace.progress_events),
        };
        debug!(
            id = %entry.id,
            method = %entry.method,
            success = entry.success,
            duration_ms = entry.duration_ms,
            "Recorded request history"
        );
        self.store.add_primary(entry)
    }

    /// Record a child request
    pub fn record_child(&self, trace: ChildTrace) -> HistoryEntry {
        let (success, response, error) = match &trace.settlement {
            Settlement::Resolved(value) => (true, Some(value.clone()), None),
            Settlement::Rejected { reason } | Settlement::Cancelled { reason, .. } => {
                (false, None, Some(reason.clone()))
            }
        };
        let entry = HistoryEntry {
            id: trace.id,
            timestamp: trace.received_at,
            method: trace.kind.method().to_string(),
            target: None,
            params: trace.params,
            response,
            duration_ms: trace.duration.as_millis() as u64,
            success,
            error,
            pinned: false,
            request_type: RequestType::Client,
            parent_request_id: trace.parent_trace_id,
            child_request_ids: None,
            relative_time_ms: Some(trace.relative_time.as_millis() as u64),
            progress_events: None,
        };
        debug!(
            id = %entry.id,
            method = %entry.method,
            parent = ?entry.parent_request_id,
            relative_time_ms = ?entry.relative_time_ms,
            "Recorded child request history"
        );
        self.store.add_child(entry)
    }
}

/// Display target extracted from well-known request shapes
fn target_of(method: &str, params: Option<&Value>) -> Option<String> {
    let key = match method {
        methods::TOOLS_CALL | methods::PROMPTS_GET => "name",
        methods::RESOURCES_READ | methods::RESOURCES_SUBSCRIBE | methods::RESOURCES_UNSUBSCRIBE => {
            "uri"
        }
        _ => return None,
    };
    params?.get(key)?.as_str().map(str::to_string)
}
