//! Client session lifecycle
//!
//! A [`ClientSession`] owns at most one transport at a time together with
//! the router and protocol client built on top of it. Connecting runs the
//! MCP handshake; disconnecting (or losing the transport) tears the
//! connection down in a fixed order:
//!
//! 1. cancel every in-flight outbound request
//! 2. cancel every parked child request and refuse new ones
//! 3. stop the router
//! 4. close the transport
//!
//! The dispatcher, resolver and history outlive individual connections, so
//! history recorded before a reconnect stays queryable.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use inspectmcp_protocol::types::{InitializeRequest, InitializeResult};
use inspectmcp_protocol::{PROTOCOL_VERSION, RequestId, SUPPORTED_VERSIONS, methods};
use inspectmcp_transport_traits::Transport;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatch::{InFlightRequest, RequestDispatcher};
use super::protocol::ProtocolClient;
use super::router::MessageRouter;
use crate::config::{DispatchPolicy, PolicyOptions, SessionConfig};
use crate::error::{InspectorError, Result};
use crate::events::{Observers, ProgressEvent, Subscription};
use crate::handlers::{CapabilityHandlerRegistry, InboundContext, trace_server_log};
use crate::history::{HistoryStore, TraceAssembler};
use crate::profile::TestingProfile;
use crate::resolver::PendingRequestResolver;
use crate::sampling::SamplingProviderRegistry;

/// Connection status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No transport attached
    #[default]
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Handshake complete
    Connected,
    /// The last connection attempt failed or the transport dropped
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Server capabilities a session can be asked about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerCapability {
    /// `tools/*`
    Tools,
    /// `resources/*`
    Resources,
    /// `resources/subscribe`
    ResourceSubscriptions,
    /// `prompts/*`
    Prompts,
    /// `logging/setLevel`
    Logging,
    /// `completion/complete`
    Completions,
}

impl ServerCapability {
    /// Name as used in the capability object
    pub fn name(self) -> &'static str {
        match self {
            Self::Tools => "tools",
            Self::Resources => "resources",
            Self::ResourceSubscriptions => "resources.subscribe",
            Self::Prompts => "prompts",
            Self::Logging => "logging",
            Self::Completions => "completions",
        }
    }
}

impl FromStr for ServerCapability {
    type Err = InspectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tools" => Ok(Self::Tools),
            "resources" => Ok(Self::Resources),
            "resources.subscribe" | "resourceSubscriptions" => Ok(Self::ResourceSubscriptions),
            "prompts" => Ok(Self::Prompts),
            "logging" => Ok(Self::Logging),
            "completions" => Ok(Self::Completions),
            other => Err(InspectorError::invalid_configuration(
                "capability",
                other,
                "unknown server capability",
            )),
        }
    }
}

/// Per-connection options for [`ClientSession::connect`]
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Policy for the `initialize` request, overriding the session default
    pub handshake_policy: Option<DispatchPolicy>,
}

#[derive(Debug, Default)]
struct SessionState {
    status: ConnectionStatus,
    last_error: Option<InspectorError>,
    server: Option<InitializeResult>,
    connected_at: Option<DateTime<Utc>>,
}

struct Connection {
    generation: u64,
    protocol: Arc<ProtocolClient>,
    watcher: JoinHandle<()>,
}

pub(crate) struct SessionInner {
    id: Arc<str>,
    config: SessionConfig,
    state: RwLock<SessionState>,
    connection: Mutex<Option<Connection>>,
    generation: AtomicU64,
    /// Serialises connect, disconnect and transport-drop handling
    lifecycle: tokio::sync::Mutex<()>,
    dispatcher: Arc<RequestDispatcher>,
    resolver: Arc<PendingRequestResolver>,
    handlers: Arc<CapabilityHandlerRegistry>,
    assembler: TraceAssembler,
    providers: Arc<SamplingProviderRegistry>,
    status_observers: Observers<ConnectionStatus>,
    _server_log_tracing: Option<Subscription>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            debug!(session = %self.id, "Last session handle dropped; stopping router");
            connection.protocol.router().shutdown();
            connection.watcher.abort();
        }
    }
}

/// Shared parts a session is assembled from
pub(crate) struct SessionParts {
    pub(crate) history: Arc<HistoryStore>,
    pub(crate) providers: Arc<SamplingProviderRegistry>,
    pub(crate) handlers: Arc<CapabilityHandlerRegistry>,
}

/// An inspector's connection to one MCP server
///
/// Cloning is cheap; clones share the same connection, history and
/// pending-request state.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("in_flight", &self.inner.dispatcher.in_flight().len())
            .field("pending_children", &self.inner.resolver.pending_count())
            .finish()
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl ClientSession {
    /// Disconnected session with its own history and provider registry
    pub fn new(config: SessionConfig) -> Self {
        let parts = SessionParts {
            history: Arc::new(HistoryStore::new(config.history_capacity)),
            providers: Arc::new(SamplingProviderRegistry::new()),
            handlers: Arc::new(CapabilityHandlerRegistry::new(config.capabilities.clone())),
        };
        Self::from_parts(config, parts)
    }

    pub(crate) fn from_parts(config: SessionConfig, parts: SessionParts) -> Self {
        let resolver = Arc::new(PendingRequestResolver::new(Arc::clone(&parts.providers)));
        let assembler = TraceAssembler::new(parts.history);
        let dispatcher = Arc::new(RequestDispatcher::new(
            Arc::clone(&resolver),
            assembler.clone(),
        ));
        let server_log_tracing = config
            .trace_server_logs
            .then(|| parts.handlers.on_log(trace_server_log));

        Self {
            inner: Arc::new(SessionInner {
                id: Arc::from(Uuid::new_v4().to_string()),
                config,
                state: RwLock::new(SessionState::default()),
                connection: Mutex::new(None),
                generation: AtomicU64::new(0),
                lifecycle: tokio::sync::Mutex::new(()),
                dispatcher,
                resolver,
                handlers: parts.handlers,
                assembler,
                providers: parts.providers,
                status_observers: Observers::new(),
                _server_log_tracing: server_log_tracing,
            }),
        }
    }

    /// Attach `transport` and run the MCP handshake
    ///
    /// On success the server's identity, version, capabilities and
    /// instructions are returned and the status becomes `connected`.
    ///
    /// # Errors
    ///
    /// Returns [`InspectorError::Connection`] if the session already has an
    /// active transport, or if the transport or handshake fails. A failed
    /// attempt closes the transport, leaves the status at `error` and keeps
    /// the cause as the error's source.
    pub async fn connect(
        &self,
        transport: Arc<dyn Transport>,
        options: ConnectOptions,
    ) -> Result<InitializeResult> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let status = self.status();
        if matches!(
            status,
            ConnectionStatus::Connected | ConnectionStatus::Connecting
        ) {
            return Err(InspectorError::connection(format!(
                "session is {status}; disconnect before connecting again"
            )));
        }

        info!(
            session = %self.inner.id,
            transport = %transport.transport_type(),
            endpoint = ?transport.endpoint(),
            "Connecting"
        );
        self.set_status(ConnectionStatus::Connecting, None);

        match self.establish(Arc::clone(&transport), &options).await {
            Ok((protocol, server)) => {
                let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let watcher = self.spawn_close_watcher(&protocol, generation);
                *self.inner.connection.lock() = Some(Connection {
                    generation,
                    protocol,
                    watcher,
                });
                {
                    let mut state = self.inner.state.write();
                    state.server = Some(server.clone());
                    state.connected_at = Some(Utc::now());
                }
                info!(
                    session = %self.inner.id,
                    server = %server.server_info.name,
                    version = %server.server_info.version,
                    protocol = %server.protocol_version,
                    "Connected"
                );
                self.set_status(ConnectionStatus::Connected, None);
                Ok(server)
            }
            Err(cause) => {
                if let Err(e) = transport.disconnect().await {
                    debug!(session = %self.inner.id, error = %e, "Transport close after failed connect");
                }
                let err = match cause {
                    InspectorError::Connection { .. } => cause,
                    other => InspectorError::connection_with_source("handshake failed", other),
                };
                warn!(session = %self.inner.id, error = %err, "Connect failed");
                self.set_status(ConnectionStatus::Error, Some(err.clone()));
                Err(err)
            }
        }
    }

    async fn establish(
        &self,
        transport: Arc<dyn Transport>,
        options: &ConnectOptions,
    ) -> Result<(Arc<ProtocolClient>, InitializeResult)> {
        transport
            .connect()
            .await
            .map_err(|e| InspectorError::connection_with_source("transport connect failed", e))?;

        let router = MessageRouter::new(Arc::clone(&transport));
        let protocol = Arc::new(ProtocolClient::new(transport, router));
        InboundContext {
            session_id: Arc::clone(&self.inner.id),
            protocol: Arc::clone(&protocol),
            dispatcher: Arc::clone(&self.inner.dispatcher),
            resolver: Arc::clone(&self.inner.resolver),
            assembler: self.inner.assembler.clone(),
            handlers: Arc::clone(&self.inner.handlers),
        }
        .install();
        self.inner.resolver.reopen();

        match self.handshake(&protocol, options).await {
            Ok(server) => Ok((protocol, server)),
            Err(err) => {
                protocol.router().shutdown();
                Err(err)
            }
        }
    }

    async fn handshake(
        &self,
        protocol: &ProtocolClient,
        options: &ConnectOptions,
    ) -> Result<InitializeResult> {
        let policy = options
            .handshake_policy
            .unwrap_or(self.inner.config.handshake_policy);
        let request = InitializeRequest {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: self.inner.config.capabilities.to_protocol(),
            client_info: self.inner.config.client_info.clone(),
        };
        let params = serde_json::to_value(&request)
            .map_err(|e| InspectorError::connection_with_source("failed to encode initialize", e))?;

        let result = self
            .inner
            .dispatcher
            .dispatch(protocol, methods::INITIALIZE, Some(params), &policy)
            .await?;
        let server: InitializeResult = serde_json::from_value(result).map_err(|e| {
            InspectorError::connection_with_source("malformed initialize result", e)
        })?;
        if !SUPPORTED_VERSIONS.contains(&server.protocol_version.as_str()) {
            warn!(
                version = %server.protocol_version,
                "Server selected an unsupported protocol version"
            );
        }

        protocol.notify(methods::INITIALIZED, None).await?;
        Ok(server)
    }

    fn spawn_close_watcher(&self, protocol: &ProtocolClient, generation: u64) -> JoinHandle<()> {
        let closed = protocol.router().closed();
        let session = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            closed.cancelled().await;
            if let Some(inner) = session.upgrade() {
                ClientSession { inner }
                    .handle_transport_closed(generation)
                    .await;
            }
        })
    }

    async fn handle_transport_closed(&self, generation: u64) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let connection = {
            let mut slot = self.inner.connection.lock();
            match slot.as_ref() {
                Some(current) if current.generation == generation => slot.take(),
                _ => None,
            }
        };
        let Some(connection) = connection else {
            return;
        };

        warn!(session = %self.inner.id, "Transport closed unexpectedly");
        self.teardown(connection, "transport closed").await;
        self.set_status(
            ConnectionStatus::Error,
            Some(InspectorError::connection("transport closed unexpectedly")),
        );
    }

    /// Close the transport and settle everything still outstanding
    ///
    /// In-flight requests fail with [`InspectorError::Cancelled`] and parked
    /// child requests are rejected. A session left in `error` by a failed
    /// connect or a lost transport is reset to `disconnected`. Calling this
    /// on a disconnected session does nothing.
    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let Some(connection) = self.inner.connection.lock().take() else {
            let recovered = {
                let mut state = self.inner.state.write();
                let errored = state.status == ConnectionStatus::Error;
                if errored {
                    state.last_error = None;
                }
                errored
            };
            if recovered {
                self.set_status(ConnectionStatus::Disconnected, None);
                info!(session = %self.inner.id, "Cleared error state");
            } else {
                debug!(session = %self.inner.id, "Disconnect on a session without a transport");
            }
            return;
        };

        connection.watcher.abort();
        self.teardown(connection, "session disconnected").await;
        {
            let mut state = self.inner.state.write();
            state.server = None;
            state.connected_at = None;
        }
        self.set_status(ConnectionStatus::Disconnected, None);
        info!(session = %self.inner.id, "Disconnected");
    }

    async fn teardown(&self, connection: Connection, reason: &str) {
        let cancelled = self.inner.dispatcher.cancel_all(reason);
        let rejected = self.inner.resolver.close(reason);
        connection.protocol.router().shutdown();
        if let Err(e) = connection.protocol.transport().disconnect().await {
            debug!(session = %self.inner.id, error = %e, "Transport close failed");
        }
        debug!(
            session = %self.inner.id,
            cancelled_requests = cancelled,
            rejected_children = rejected,
            reason,
            "Connection torn down"
        );
    }

    fn set_status(&self, status: ConnectionStatus, error: Option<InspectorError>) {
        {
            let mut state = self.inner.state.write();
            state.status = status;
            if error.is_some() || status == ConnectionStatus::Connected {
                state.last_error = error;
            }
        }
        self.inner.status_observers.emit(&status);
    }

    fn protocol(&self) -> Result<Arc<ProtocolClient>> {
        self.inner
            .connection
            .lock()
            .as_ref()
            .map(|connection| Arc::clone(&connection.protocol))
            .ok_or_else(|| InspectorError::connection("session is not connected"))
    }

    /// Issue a request under `policy`, or the session default
    ///
    /// # Errors
    ///
    /// [`InspectorError::InvalidConfiguration`] for an invalid policy (checked
    /// before anything is sent), [`InspectorError::Connection`] when not
    /// connected, and otherwise whatever the dispatch ends with.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        policy: Option<&DispatchPolicy>,
    ) -> Result<Value> {
        let policy = policy.copied().unwrap_or(self.inner.config.default_policy);
        policy.validate()?;
        let protocol = self.protocol()?;
        self.inner
            .dispatcher
            .dispatch(&protocol, method, params, &policy)
            .await
    }

    /// Issue a request with string-typed policy options
    ///
    /// Options are parsed on top of the session default before anything is
    /// sent; a value that does not parse fails the call with
    /// [`InspectorError::InvalidConfiguration`].
    pub async fn request_with_options(
        &self,
        method: &str,
        params: Option<Value>,
        options: &PolicyOptions,
    ) -> Result<Value> {
        let policy = options.apply_to(self.inner.config.default_policy)?;
        self.request(method, params, Some(&policy)).await
    }

    /// Send a notification to the server
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.protocol()?.notify(method, params).await
    }

    /// Cancel an in-flight request; `false` if it already finished
    pub fn cancel_request(&self, request_id: &RequestId, reason: &str) -> bool {
        self.inner.dispatcher.cancel(request_id, reason)
    }

    /// Whether the connected server advertised `capability`
    pub fn server_supports(&self, capability: ServerCapability) -> bool {
        let state = self.inner.state.read();
        let Some(server) = &state.server else {
            return false;
        };
        let caps = &server.capabilities;
        match capability {
            ServerCapability::Tools => caps.tools.is_some(),
            ServerCapability::Resources => caps.resources.is_some(),
            ServerCapability::ResourceSubscriptions => caps
                .resources
                .as_ref()
                .and_then(|r| r.subscribe)
                .unwrap_or(false),
            ServerCapability::Prompts => caps.prompts.is_some(),
            ServerCapability::Logging => caps.logging.is_some(),
            ServerCapability::Completions => caps.completions.is_some(),
        }
    }

    /// Session id
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Settings the session was built with
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.read().status
    }

    /// Error that put the session into `error`, if any
    pub fn last_error(&self) -> Option<InspectorError> {
        self.inner.state.read().last_error.clone()
    }

    /// Handshake result of the current connection
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.inner.state.read().server.clone()
    }

    /// When the current connection completed its handshake
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.read().connected_at
    }

    /// Called on every status change
    pub fn on_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.inner.status_observers.subscribe(callback)
    }

    /// Called for every progress notification of an in-flight request
    pub fn on_progress<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on_progress(callback)
    }

    /// Requests currently awaiting a response
    pub fn in_flight(&self) -> Vec<InFlightRequest> {
        self.inner.dispatcher.in_flight()
    }

    /// Request history
    pub fn history(&self) -> &Arc<HistoryStore> {
        self.inner.assembler.store()
    }

    /// Parked server-initiated requests
    pub fn resolver(&self) -> &Arc<PendingRequestResolver> {
        &self.inner.resolver
    }

    /// Inbound capability handlers and notification observers
    pub fn handlers(&self) -> &Arc<CapabilityHandlerRegistry> {
        &self.inner.handlers
    }

    /// Sampling providers available to testing profiles
    pub fn sampling_providers(&self) -> &Arc<SamplingProviderRegistry> {
        &self.inner.providers
    }

    /// Install or remove the testing profile
    pub fn set_testing_profile(&self, profile: Option<TestingProfile>) {
        self.inner.resolver.set_profile(profile);
    }
}
