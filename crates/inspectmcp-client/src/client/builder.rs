//! Session builder
//!
//! Provides a fluent interface for configuring a session before creation.

use std::sync::Arc;
use std::time::Duration;

use super::session::{ClientSession, SessionParts};
use crate::config::{ClientCapabilitiesConfig, DispatchPolicy, SessionConfig};
use crate::error::{InspectorError, Result};
use crate::handlers::{CapabilityHandlerRegistry, RootsProvider};
use crate::history::HistoryStore;
use crate::profile::TestingProfile;
use crate::repository::LogsRepository;
use crate::sampling::{SamplingProvider, SamplingProviderRegistry};

/// Builder for configuring and creating sessions
///
/// # Examples
///
/// ```rust,no_run
/// use inspectmcp_client::{DispatchPolicy, SessionBuilder, TestingProfile};
/// use std::time::Duration;
///
/// # fn example() -> inspectmcp_client::Result<()> {
/// let session = SessionBuilder::new()
///     .with_default_policy(
///         DispatchPolicy::new(Duration::from_secs(10))
///             .reset_on_progress(true)
///             .max_total(Duration::from_secs(120)),
///     )
///     .with_history_capacity(200)
///     .with_testing_profile(TestingProfile::auto("ci", "canned answer"))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    roots_provider: Option<Arc<dyn RootsProvider>>,
    sampling_providers: Vec<(String, Arc<dyn SamplingProvider>)>,
    testing_profile: Option<TestingProfile>,
    history: Option<Arc<HistoryStore>>,
    logs: Option<Arc<dyn LogsRepository>>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("config", &self.config)
            .field("has_roots_provider", &self.roots_provider.is_some())
            .field(
                "sampling_providers",
                &self
                    .sampling_providers
                    .iter()
                    .map(|(id, _)| id.as_str())
                    .collect::<Vec<_>>(),
            )
            .field("testing_profile", &self.testing_profile.as_ref().map(|p| &p.id))
            .finish()
    }
}

impl SessionBuilder {
    /// Builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Capabilities advertised in `initialize`
    pub fn with_capabilities(mut self, capabilities: ClientCapabilitiesConfig) -> Self {
        self.config.capabilities = capabilities;
        self
    }

    /// Policy for requests that do not supply one
    pub fn with_default_policy(mut self, policy: DispatchPolicy) -> Self {
        self.config.default_policy = policy;
        self
    }

    /// Inactivity timeout of the default policy
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_policy.request_timeout = timeout;
        self
    }

    /// Policy for the `initialize` request
    pub fn with_handshake_policy(mut self, policy: DispatchPolicy) -> Self {
        self.config.handshake_policy = policy;
        self
    }

    /// Maximum number of unpinned history entries
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.config.history_capacity = capacity;
        self
    }

    /// Share an existing history store; overrides the configured capacity
    pub fn with_history_store(mut self, store: Arc<HistoryStore>) -> Self {
        self.history = Some(store);
        self
    }

    /// Re-emit server logs through `tracing`
    pub fn with_server_log_tracing(mut self, enabled: bool) -> Self {
        self.config.trace_server_logs = enabled;
        self
    }

    /// Answer `roots/list` from `provider`
    pub fn with_roots_provider(mut self, provider: Arc<dyn RootsProvider>) -> Self {
        self.roots_provider = Some(provider);
        self
    }

    /// Register a sampling provider under `id`
    pub fn with_sampling_provider(
        mut self,
        id: impl Into<String>,
        provider: Arc<dyn SamplingProvider>,
    ) -> Self {
        self.sampling_providers.push((id.into(), provider));
        self
    }

    /// Start with this testing profile active
    pub fn with_testing_profile(mut self, profile: TestingProfile) -> Self {
        self.testing_profile = Some(profile);
        self
    }

    /// Persist server logs into `repository`
    pub fn with_logs_repository(mut self, repository: Arc<dyn LogsRepository>) -> Self {
        self.logs = Some(repository);
        self
    }

    /// Build a disconnected session
    ///
    /// # Errors
    ///
    /// Returns [`InspectorError::InvalidConfiguration`] if a policy is invalid,
    /// the history capacity is zero, or two sampling providers share an id.
    pub fn build(self) -> Result<ClientSession> {
        self.config.default_policy.validate()?;
        self.config.handshake_policy.validate()?;
        if self.config.history_capacity == 0 && self.history.is_none() {
            return Err(InspectorError::invalid_configuration(
                "historyCapacity",
                "0",
                "history must keep at least one entry",
            ));
        }

        let providers = Arc::new(SamplingProviderRegistry::new());
        for (id, provider) in self.sampling_providers {
            providers.register(id.clone(), provider).map_err(|e| {
                InspectorError::invalid_configuration("samplingProvider", id, e.to_string())
            })?;
        }

        let handlers = Arc::new(CapabilityHandlerRegistry::new(
            self.config.capabilities.clone(),
        ));
        handlers.set_roots_provider(self.roots_provider);
        handlers.set_logs_repository(self.logs);

        let history = self
            .history
            .unwrap_or_else(|| Arc::new(HistoryStore::new(self.config.history_capacity)));

        let session = ClientSession::from_parts(
            self.config,
            SessionParts {
                history,
                providers,
                handlers,
            },
        );
        if self.testing_profile.is_some() {
            session.set_testing_profile(self.testing_profile);
        }
        Ok(session)
    }
}
