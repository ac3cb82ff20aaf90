//! Persistence seams for history, logs, server configurations and profiles
//!
//! The inspector UI talks to these traits. In-memory backends ship here;
//! durable backends live with the application that embeds the core.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use inspectmcp_protocol::types::LogLevel;
use inspectmcp_transport_traits::TransportType;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::history::{HistoryEntry, HistoryFilter, HistoryStore};
use crate::profile::TestingProfile;

/// Default number of log entries kept by [`MemoryLogsRepository`]
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Result alias for repository operations
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

/// Errors reported by repositories
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RepositoryError {
    /// No record with this id
    #[error("{kind} `{id}` not found")]
    NotFound {
        /// Record type
        kind: &'static str,
        /// Missing id
        id: String,
    },

    /// A record with this id already exists
    #[error("{kind} `{id}` already exists")]
    Conflict {
        /// Record type
        kind: &'static str,
        /// Id already in use
        id: String,
    },

    /// Storage backend failure
    #[error("Repository backend error: {message}")]
    Backend {
        /// Backend-reported failure
        message: String,
    },
}

/// Request history persistence
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    /// Matching entries, newest first
    async fn list(&self, filter: &HistoryFilter) -> RepositoryResult<Vec<HistoryEntry>>;

    /// One entry
    async fn get(&self, id: &str) -> RepositoryResult<Option<HistoryEntry>>;

    /// Append an entry
    async fn add(&self, entry: HistoryEntry) -> RepositoryResult<()>;

    /// Apply the mutable fields (`pinned`, `child_request_ids`) of `entry`
    async fn update(&self, entry: HistoryEntry) -> RepositoryResult<()>;

    /// Delete one entry; returns whether it existed
    async fn delete(&self, id: &str) -> RepositoryResult<bool>;

    /// Delete everything
    async fn delete_all(&self) -> RepositoryResult<()>;

    /// Children of `parent_id` in timeline order
    async fn get_children(&self, parent_id: &str) -> RepositoryResult<Vec<HistoryEntry>>;
}

#[async_trait]
impl HistoryRepository for HistoryStore {
    async fn list(&self, filter: &HistoryFilter) -> RepositoryResult<Vec<HistoryEntry>> {
        Ok(HistoryStore::list(self, filter))
    }

    async fn get(&self, id: &str) -> RepositoryResult<Option<HistoryEntry>> {
        Ok(HistoryStore::get(self, id))
    }

    async fn add(&self, entry: HistoryEntry) -> RepositoryResult<()> {
        HistoryStore::add(self, entry);
        Ok(())
    }

    async fn update(&self, entry: HistoryEntry) -> RepositoryResult<()> {
        if !self.set_pinned(&entry.id, entry.pinned) {
            return Err(RepositoryError::NotFound {
                kind: "history entry",
                id: entry.id,
            });
        }
        for child in entry.child_request_ids.iter().flatten() {
            self.append_child(&entry.id, child);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> RepositoryResult<bool> {
        Ok(self.remove(id).is_some())
    }

    async fn delete_all(&self) -> RepositoryResult<()> {
        self.clear();
        Ok(())
    }

    async fn get_children(&self, parent_id: &str) -> RepositoryResult<Vec<HistoryEntry>> {
        Ok(self.children_of(parent_id))
    }
}

/// A server log line captured from `notifications/message`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Unique id
    pub id: String,
    /// Arrival time
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub level: LogLevel,
    /// Logger name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    /// Payload
    pub data: Value,
    /// History id of the request in flight when the log arrived
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Session the log arrived on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Server log persistence
#[async_trait]
pub trait LogsRepository: Send + Sync {
    /// Newest entries first, at most `limit`
    async fn list(&self, limit: Option<usize>) -> RepositoryResult<Vec<LogEntry>>;

    /// Append one entry
    async fn add(&self, entry: LogEntry) -> RepositoryResult<()>;

    /// Append several entries in order
    async fn add_batch(&self, entries: Vec<LogEntry>) -> RepositoryResult<()> {
        for entry in entries {
            self.add(entry).await?;
        }
        Ok(())
    }

    /// Entries correlated with one request, oldest first
    async fn for_request(&self, request_id: &str) -> RepositoryResult<Vec<LogEntry>>;

    /// Delete everything
    async fn delete_all(&self) -> RepositoryResult<()>;
}

/// Bounded in-memory log store
#[derive(Debug)]
pub struct MemoryLogsRepository {
    capacity: usize,
    entries: RwLock<VecDeque<LogEntry>>,
}

impl Default for MemoryLogsRepository {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl MemoryLogsRepository {
    /// Keep at most `capacity` entries, dropping the oldest
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(VecDeque::new()),
        }
    }
}

#[async_trait]
impl LogsRepository for MemoryLogsRepository {
    async fn list(&self, limit: Option<usize>) -> RepositoryResult<Vec<LogEntry>> {
        let entries = self.entries.read();
        Ok(entries
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn add(&self, entry: LogEntry) -> RepositoryResult<()> {
        let mut entries = self.entries.write();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        Ok(())
    }

    async fn for_request(&self, request_id: &str) -> RepositoryResult<Vec<LogEntry>> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|e| e.request_id.as_deref() == Some(request_id))
            .cloned()
            .collect())
    }

    async fn delete_all(&self) -> RepositoryResult<()> {
        self.entries.write().clear();
        Ok(())
    }
}

/// A saved server connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Unique id
    pub id: String,
    /// Display name
    pub name: String,
    /// Transport used to reach the server
    pub transport: TransportType,
    /// Executable for stdio servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Arguments for stdio servers
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment for stdio servers
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Endpoint for HTTP-based servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Extra HTTP headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

/// Saved server configurations
#[async_trait]
pub trait ServerConfigRepository: Send + Sync {
    /// All configurations in creation order
    async fn list(&self) -> RepositoryResult<Vec<ServerConfig>>;

    /// One configuration
    async fn get(&self, id: &str) -> RepositoryResult<Option<ServerConfig>>;

    /// Store a new configuration
    async fn create(&self, config: ServerConfig) -> RepositoryResult<()>;

    /// Replace an existing configuration
    async fn update(&self, config: ServerConfig) -> RepositoryResult<()>;

    /// Delete; returns whether it existed
    async fn delete(&self, id: &str) -> RepositoryResult<bool>;
}

/// Saved testing profiles
#[async_trait]
pub trait TestingProfileRepository: Send + Sync {
    /// All profiles in creation order
    async fn list(&self) -> RepositoryResult<Vec<TestingProfile>>;

    /// One profile
    async fn get(&self, id: &str) -> RepositoryResult<Option<TestingProfile>>;

    /// Insert or replace
    async fn save(&self, profile: TestingProfile) -> RepositoryResult<()>;

    /// Delete; returns whether it existed
    async fn delete(&self, id: &str) -> RepositoryResult<bool>;
}

/// Records addressable by a string id
pub trait Identified: Clone + Send + Sync {
    /// Kind name used in error messages
    const KIND: &'static str;

    /// Record id
    fn id(&self) -> &str;
}

impl Identified for ServerConfig {
    const KIND: &'static str = "server config";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Identified for TestingProfile {
    const KIND: &'static str = "testing profile";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Insertion-ordered in-memory record store
#[derive(Debug)]
pub struct MemoryRecordStore<T> {
    records: RwLock<Vec<T>>,
}

impl<T> Default for MemoryRecordStore<T> {
    fn default() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }
}

/// In-memory [`ServerConfigRepository`]
pub type MemoryServerConfigRepository = MemoryRecordStore<ServerConfig>;

/// In-memory [`TestingProfileRepository`]
pub type MemoryTestingProfileRepository = MemoryRecordStore<TestingProfile>;

impl<T: Identified> MemoryRecordStore<T> {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn all(&self) -> Vec<T> {
        self.records.read().clone()
    }

    fn find(&self, id: &str) -> Option<T> {
        self.records.read().iter().find(|r| r.id() == id).cloned()
    }

    fn insert(&self, record: T) -> RepositoryResult<()> {
        let mut records = self.records.write();
        if records.iter().any(|r| r.id() == record.id()) {
            return Err(RepositoryError::Conflict {
                kind: T::KIND,
                id: record.id().to_string(),
            });
        }
        records.push(record);
        Ok(())
    }

    fn replace(&self, record: T) -> RepositoryResult<()> {
        let mut records = self.records.write();
        match records.iter_mut().find(|r| r.id() == record.id()) {
            Some(slot) => {
                *slot = record;
                Ok(())
            }
            None => Err(RepositoryError::NotFound {
                kind: T::KIND,
                id: record.id().to_string(),
            }),
        }
    }

    fn upsert(&self, record: T) {
        let mut records = self.records.write();
        match records.iter_mut().find(|r| r.id() == record.id()) {
            Some(slot) => *slot = record,
            None => records.push(record),
        }
    }

    fn remove(&self, id: &str) -> bool {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.id() != id);
        records.len() != before
    }
}

#[async_trait]
impl ServerConfigRepository for MemoryRecordStore<ServerConfig> {
    async fn list(&self) -> RepositoryResult<Vec<ServerConfig>> {
        Ok(self.all())
    }

    async fn get(&self, id: &str) -> RepositoryResult<Option<ServerConfig>> {
        Ok(self.find(id))
    }

    async fn create(&self, config: ServerConfig) -> RepositoryResult<()> {
        self.insert(config)
    }

    async fn update(&self, mut config: ServerConfig) -> RepositoryResult<()> {
        config.updated_at = Utc::now();
        self.replace(config)
    }

    async fn delete(&self, id: &str) -> RepositoryResult<bool> {
        Ok(self.remove(id))
    }
}

#[async_trait]
impl TestingProfileRepository for MemoryRecordStore<TestingProfile> {
    async fn list(&self) -> RepositoryResult<Vec<TestingProfile>> {
        Ok(self.all())
    }

    async fn get(&self, id: &str) -> RepositoryResult<Option<TestingProfile>> {
        Ok(self.find(id))
    }

    async fn save(&self, profile: TestingProfile) -> RepositoryResult<()> {
        self.upsert(profile);
        Ok(())
    }

    async fn delete(&self, id: &str) -> RepositoryResult<bool> {
        Ok(self.remove(id))
    }
}
