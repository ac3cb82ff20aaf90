//! Pluggable sampling providers
//!
//! A testing profile whose `strategy_id` names a registered
//! [`SamplingProvider`] delegates automatic sampling responses to that
//! provider instead of synthesizing them from the profile's static rules.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use inspectmcp_protocol::RequestId;
use inspectmcp_protocol::types::{CreateMessageRequest, CreateMessageResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::profile::{STATIC_STRATEGY, TestingProfile};

/// Errors reported by sampling providers and their registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProviderError {
    /// The provider rejected its configuration
    #[error("Provider configuration error: {message}")]
    Configuration {
        /// What is wrong with the configuration
        message: String,
    },

    /// Generation failed
    #[error("Generation failed: {message}")]
    Generation {
        /// Provider-reported failure
        message: String,
    },

    /// No provider registered under this id
    #[error("Sampling provider not found: {id}")]
    NotFound {
        /// Requested strategy id
        id: String,
    },

    /// A provider is already registered under this id
    #[error("Sampling provider already registered: {id}")]
    AlreadyRegistered {
        /// Strategy id already taken
        id: String,
    },
}

impl ProviderError {
    /// Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Generation error
    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation {
            message: message.into(),
        }
    }
}

/// Token accounting reported by a provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Prompt tokens
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
}

/// What a provider produced for one sampling request
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    /// Result returned to the server
    pub response: CreateMessageResult,
    /// Token accounting, if the provider tracks it
    pub usage: Option<TokenUsage>,
    /// Provider-measured generation time
    pub duration_ms: Option<u64>,
    /// Non-fatal issues worth showing to the user
    pub warnings: Vec<String>,
}

impl ProviderResponse {
    /// Response without usage data or warnings
    pub fn new(response: CreateMessageResult) -> Self {
        Self {
            response,
            usage: None,
            duration_ms: None,
            warnings: Vec::new(),
        }
    }
}

/// Context handed to a provider for one request
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    /// Session the request arrived on
    pub session_id: String,
    /// Child request id assigned by the resolver
    pub child_request_id: String,
    /// Outbound request that caused it, if any
    pub parent_request_id: Option<RequestId>,
    /// Active profile
    pub profile: TestingProfile,
}

impl RuntimeContext {
    /// Provider configuration carried by the profile
    pub fn provider_config(&self) -> &Value {
        &self.profile.provider_config
    }
}

/// Strategy that produces sampling responses automatically
#[async_trait]
pub trait SamplingProvider: Send + Sync + std::fmt::Debug {
    /// Produce a response for `request`
    async fn generate_response(
        &self,
        request: &CreateMessageRequest,
        context: &RuntimeContext,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Check a profile's provider configuration
    fn validate_config(&self, _config: &Value) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Model names this provider suggests for profile editors
    fn suggested_models(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Provider that answers from the profile's static rules
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProvider;

#[async_trait]
impl SamplingProvider for StaticProvider {
    async fn generate_response(
        &self,
        request: &CreateMessageRequest,
        context: &RuntimeContext,
    ) -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse::new(
            context.profile.synthesize_sampling(request),
        ))
    }

    fn suggested_models(&self) -> Vec<String> {
        vec!["inspector-mock".to_string()]
    }
}

/// Registry of sampling providers keyed by strategy id
#[derive(Debug)]
pub struct SamplingProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn SamplingProvider>>>,
}

impl Default for SamplingProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SamplingProviderRegistry {
    /// Registry with only the [`StaticProvider`] under [`STATIC_STRATEGY`]
    pub fn new() -> Self {
        let mut providers: HashMap<String, Arc<dyn SamplingProvider>> = HashMap::new();
        providers.insert(STATIC_STRATEGY.to_string(), Arc::new(StaticProvider));
        Self {
            providers: RwLock::new(providers),
        }
    }

    /// Register a provider
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::AlreadyRegistered`] if the id is taken.
    pub fn register(
        &self,
        id: impl Into<String>,
        provider: Arc<dyn SamplingProvider>,
    ) -> Result<(), ProviderError> {
        let id = id.into();
        let mut providers = self.providers.write();
        if providers.contains_key(&id) {
            return Err(ProviderError::AlreadyRegistered { id });
        }
        info!(provider = %id, "Registered sampling provider");
        providers.insert(id, provider);
        Ok(())
    }

    /// Remove a provider
    pub fn unregister(&self, id: &str) -> Option<Arc<dyn SamplingProvider>> {
        let removed = self.providers.write().remove(id);
        if removed.is_some() {
            debug!(provider = %id, "Unregistered sampling provider");
        }
        removed
    }

    /// Look a provider up
    pub fn get(&self, id: &str) -> Option<Arc<dyn SamplingProvider>> {
        self.providers.read().get(id).cloned()
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run the provider named by the context's profile
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::NotFound`] if the strategy is unknown, or
    /// whatever the provider reports.
    pub async fn generate(
        &self,
        request: &CreateMessageRequest,
        context: &RuntimeContext,
    ) -> Result<ProviderResponse, ProviderError> {
        let strategy = &context.profile.strategy_id;
        let provider = self.get(strategy).ok_or_else(|| ProviderError::NotFound {
            id: strategy.clone(),
        })?;
        provider.validate_config(context.provider_config())?;
        provider.generate_response(request, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inspectmcp_protocol::types::{Content, Role};
    use pretty_assertions::assert_eq;

    #[derive(Debug)]
    struct Echo;

    #[async_trait]
    impl SamplingProvider for Echo {
        async fn generate_response(
            &self,
            request: &CreateMessageRequest,
            _context: &RuntimeContext,
        ) -> Result<ProviderResponse, ProviderError> {
            let last = request
                .messages
                .last()
                .and_then(|m| m.content.as_text())
                .unwrap_or_default();
            Ok(ProviderResponse {
                response: CreateMessageResult {
                    role: Role::Assistant,
                    content: Content::text(format!("echo: {last}")),
                    model: "echo".into(),
                    stop_reason: None,
                },
                usage: Some(TokenUsage {
                    input_tokens: 1,
                    output_tokens: 2,
                }),
                duration_ms: Some(0),
                warnings: vec!["echo is not a model".into()],
            })
        }

        fn validate_config(&self, config: &Value) -> Result<(), ProviderError> {
            if config.get("forbidden").is_some() {
                return Err(ProviderError::configuration("forbidden key"));
            }
            Ok(())
        }
    }

    fn context(strategy: &str) -> RuntimeContext {
        let mut profile = TestingProfile::auto("p", "static text");
        profile.strategy_id = strategy.into();
        RuntimeContext {
            session_id: "s".into(),
            child_request_id: "c".into(),
            parent_request_id: None,
            profile,
        }
    }

    #[tokio::test]
    async fn test_static_provider_is_preregistered() {
        let registry = SamplingProviderRegistry::new();
        assert_eq!(registry.ids(), vec![STATIC_STRATEGY.to_string()]);
        let response = registry
            .generate(&CreateMessageRequest::default(), &context(STATIC_STRATEGY))
            .await
            .unwrap();
        assert_eq!(response.response.content.as_text(), Some("static text"));
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let registry = SamplingProviderRegistry::new();
        registry.register("echo", Arc::new(Echo)).unwrap();
        assert!(matches!(
            registry.register("echo", Arc::new(Echo)),
            Err(ProviderError::AlreadyRegistered { .. })
        ));

        let response = registry
            .generate(&CreateMessageRequest::default(), &context("echo"))
            .await
            .unwrap();
        assert_eq!(response.response.model, "echo");
        assert_eq!(response.warnings.len(), 1);

        assert!(registry.unregister("echo").is_some());
        let err = registry
            .generate(&CreateMessageRequest::default(), &context("echo"))
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::NotFound { id: "echo".into() });
    }

    #[tokio::test]
    async fn test_config_validated_before_generation() {
        let registry = SamplingProviderRegistry::new();
        registry.register("echo", Arc::new(Echo)).unwrap();
        let mut ctx = context("echo");
        ctx.profile.provider_config = serde_json::json!({"forbidden": true});
        let err = registry
            .generate(&CreateMessageRequest::default(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Configuration { .. }));
    }
}
