//! Observer lists with unsubscribe handles
//!
//! Components that publish events (progress, pending child requests, server
//! logs, list changes) keep an [`Observers`] list. Registering a callback
//! returns a [`Subscription`]; dropping it or calling
//! [`Subscription::unsubscribe`] removes the callback.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use inspectmcp_protocol::RequestId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct ObserverList<E> {
    next_id: AtomicU64,
    callbacks: RwLock<Vec<(u64, Callback<E>)>>,
}

/// A list of callbacks interested in events of type `E`
pub struct Observers<E> {
    inner: Arc<ObserverList<E>>,
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(ObserverList {
                next_id: AtomicU64::new(1),
                callbacks: RwLock::new(Vec::new()),
            }),
        }
    }
}

impl<E: 'static> fmt::Debug for Observers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.len())
            .finish()
    }
}

impl<E: 'static> Observers<E> {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.write().push((id, Arc::new(callback)));

        let list: Weak<ObserverList<E>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(list) = list.upgrade() {
                    list.callbacks.write().retain(|(entry, _)| *entry != id);
                }
            })),
        }
    }

    /// Deliver an event to every registered callback
    ///
    /// Callbacks run on the caller's task, outside the list lock, so a
    /// callback may subscribe or unsubscribe without deadlocking.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .inner
            .callbacks
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in snapshot {
            callback(event);
        }
    }

    /// Number of registered callbacks
    pub fn len(&self) -> usize {
        self.inner.callbacks.read().len()
    }

    /// Whether no callback is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by [`Observers::subscribe`]
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Remove the callback now
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the callback registered for the lifetime of the observer list
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// A progress notification matched to an in-flight request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Request the progress belongs to
    pub request_id: RequestId,
    /// Method of that request
    pub method: String,
    /// Progress so far
    pub progress: f64,
    /// Total, when the server knows it
    pub total: Option<f64>,
    /// Human-readable status
    pub message: Option<String>,
    /// 1-based ordinal of this notification for its request
    pub sequence: u32,
}

/// Which server list changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListChangedKind {
    /// `notifications/tools/list_changed`
    Tools,
    /// `notifications/resources/list_changed`
    Resources,
    /// `notifications/prompts/list_changed`
    Prompts,
}
