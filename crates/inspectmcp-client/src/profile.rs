//! Testing profiles for automated sampling and elicitation responses
//!
//! A [`TestingProfile`] lets the inspector answer `sampling/createMessage`
//! (and optionally `elicitation/create`) without a human in the loop. When
//! `auto_respond` is off, the profile is inert and every child request is
//! surfaced for manual resolution.

use std::collections::HashMap;

use inspectmcp_protocol::types::{
    Content, CreateMessageRequest, CreateMessageResult, ElicitResult, Role,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Strategy id that synthesizes responses from the profile itself
pub const STATIC_STRATEGY: &str = "static";

/// A model-hint override inside a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseOverride {
    /// Hint pattern; `*` matches any run of characters
    pub pattern: String,
    /// Text returned when the pattern matches
    pub response: String,
    /// Model reported instead of the profile default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Stop reason reported instead of the profile default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

/// Automatic answer to elicitation requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ElicitationDefault {
    /// Accept with fixed content
    Accept {
        /// Submitted field values
        #[serde(default)]
        content: HashMap<String, Value>,
    },
    /// Decline every elicitation
    Decline,
}

/// Named set of rules for answering server-initiated requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestingProfile {
    /// Unique profile id
    pub id: String,
    /// Display name
    pub name: String,
    /// [`STATIC_STRATEGY`] or the id of a registered sampling provider
    #[serde(default = "default_strategy")]
    pub strategy_id: String,
    /// Answer automatically instead of surfacing to the user
    #[serde(default)]
    pub auto_respond: bool,
    /// Text returned when no override matches
    pub default_response: String,
    /// Model reported when no override names one
    pub default_model: String,
    /// Stop reason reported when no override names one
    #[serde(default = "default_stop_reason")]
    pub default_stop_reason: String,
    /// Hint overrides, first match wins
    #[serde(default)]
    pub overrides: Vec<ResponseOverride>,
    /// Optional automatic elicitation answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<ElicitationDefault>,
    /// Opaque configuration handed to the sampling provider
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub provider_config: Value,
}

fn default_strategy() -> String {
    STATIC_STRATEGY.to_string()
}

fn default_stop_reason() -> String {
    "endTurn".to_string()
}

impl TestingProfile {
    /// Profile that answers every sampling request with `response`
    pub fn auto(id: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: "Automatic".into(),
            strategy_id: default_strategy(),
            auto_respond: true,
            default_response: response.into(),
            default_model: "inspector-mock".into(),
            default_stop_reason: default_stop_reason(),
            overrides: Vec::new(),
            elicitation: None,
            provider_config: Value::Null,
        }
    }

    /// Append an override
    pub fn with_override(mut self, pattern: impl Into<String>, response: impl Into<String>) -> Self {
        self.overrides.push(ResponseOverride {
            pattern: pattern.into(),
            response: response.into(),
            model: None,
            stop_reason: None,
        });
        self
    }

    /// First override whose pattern matches any of the request's hints
    ///
    /// Overrides are tried in profile order; for each override every hint is
    /// tried in request order. A request without hints matches nothing.
    pub fn matching_override(&self, request: &CreateMessageRequest) -> Option<&ResponseOverride> {
        self.overrides.iter().find(|candidate| {
            request
                .hint_names()
                .any(|hint| pattern_matches(&candidate.pattern, hint))
        })
    }

    /// Synthesize a sampling result from the profile's rules
    pub fn synthesize_sampling(&self, request: &CreateMessageRequest) -> CreateMessageResult {
        let matched = self.matching_override(request);
        let text = matched.map_or(&self.default_response, |o| &o.response);
        let model = matched
            .and_then(|o| o.model.as_ref())
            .unwrap_or(&self.default_model);
        let stop_reason = matched
            .and_then(|o| o.stop_reason.as_ref())
            .unwrap_or(&self.default_stop_reason);

        CreateMessageResult {
            role: Role::Assistant,
            content: Content::text(text.clone()),
            model: model.clone(),
            stop_reason: Some(stop_reason.clone()),
        }
    }

    /// Automatic elicitation answer, if configured
    pub fn elicitation_response(&self) -> Option<ElicitResult> {
        match self.elicitation.as_ref()? {
            ElicitationDefault::Accept { content } => Some(ElicitResult::accept(content.clone())),
            ElicitationDefault::Decline => Some(ElicitResult::decline()),
        }
    }
}

/// Glob match where `*` stands for any run of characters, including none
pub fn pattern_matches(pattern: &str, candidate: &str) -> bool {
    let Some((head, tail)) = pattern.split_once('*') else {
        return pattern == candidate;
    };
    let Some(mut rest) = candidate.strip_prefix(head) else {
        return false;
    };

    let segments: Vec<&str> = tail.split('*').collect();
    let Some((last, middle)) = segments.split_last() else {
        return true;
    };
    for segment in middle {
        match rest.find(segment) {
            Some(at) => rest = &rest[at + segment.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}
