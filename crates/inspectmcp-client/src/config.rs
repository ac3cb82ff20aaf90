//! Dispatch policy and session configuration
//!
//! A [`DispatchPolicy`] is the validated form of the three per-request
//! timeout options. Raw option strings, as typed into the inspector UI or
//! read from the environment, arrive as [`PolicyOptions`] and are parsed
//! with [`DispatchPolicy::from_options`]; invalid input is rejected with
//! [`InspectorError::InvalidConfiguration`] before anything is sent.

use std::collections::HashMap;
use std::time::Duration;

use inspectmcp_protocol::types::{ClientCapabilities, Implementation, RootsCapability};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{InspectorError, Result};

/// Default inactivity timeout applied to every request
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;

/// Largest accepted timeout or ceiling: seven days
pub const MAX_TIMEOUT_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Default number of history entries retained per store
pub const DEFAULT_HISTORY_CAPACITY: usize = 500;

/// Prefix shared by the policy environment variables
pub const ENV_PREFIX: &str = "INSPECTMCP";
/// Environment variable holding the request timeout in milliseconds
pub const ENV_REQUEST_TIMEOUT_MS: &str = "INSPECTMCP_REQUEST_TIMEOUT_MS";
/// Environment variable toggling deadline resets on progress
pub const ENV_RESET_TIMEOUT_ON_PROGRESS: &str = "INSPECTMCP_RESET_TIMEOUT_ON_PROGRESS";
/// Environment variable holding the absolute ceiling in milliseconds
pub const ENV_MAX_TOTAL_TIMEOUT_MS: &str = "INSPECTMCP_MAX_TOTAL_TIMEOUT_MS";

const OPT_REQUEST_TIMEOUT: &str = "requestTimeoutMs";
const OPT_RESET_ON_PROGRESS: &str = "resetTimeoutOnProgress";
const OPT_MAX_TOTAL_TIMEOUT: &str = "maxTotalTimeoutMs";

/// Timeout, progress and ceiling rules for one outbound request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PolicyRepr", into = "PolicyRepr")]
pub struct DispatchPolicy {
    /// Inactivity window before a request is abandoned
    pub request_timeout: Duration,
    /// Whether each progress notification pushes the deadline out again
    pub reset_timeout_on_progress: bool,
    /// Absolute ceiling measured from issue time, progress or not
    pub max_total_timeout: Option<Duration>,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            reset_timeout_on_progress: false,
            max_total_timeout: None,
        }
    }
}

impl DispatchPolicy {
    /// Policy with the given inactivity timeout and no reset or ceiling
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            ..Self::default()
        }
    }

    /// Toggle deadline resets on progress
    pub fn reset_on_progress(mut self, reset: bool) -> Self {
        self.reset_timeout_on_progress = reset;
        self
    }

    /// Set the absolute ceiling
    pub fn max_total(mut self, ceiling: Duration) -> Self {
        self.max_total_timeout = Some(ceiling);
        self
    }

    /// Check the policy's invariants
    ///
    /// # Errors
    ///
    /// Returns [`InspectorError::InvalidConfiguration`] if either timeout is
    /// zero or longer than [`MAX_TIMEOUT_MS`].
    pub fn validate(&self) -> Result<()> {
        check_window(OPT_REQUEST_TIMEOUT, self.request_timeout)?;
        if let Some(ceiling) = self.max_total_timeout {
            check_window(OPT_MAX_TOTAL_TIMEOUT, ceiling)?;
        }
        Ok(())
    }

    /// Parse raw options on top of the defaults
    ///
    /// # Errors
    ///
    /// Returns [`InspectorError::InvalidConfiguration`] naming the first option
    /// that fails to parse.
    pub fn from_options(options: &PolicyOptions) -> Result<Self> {
        options.apply_to(Self::default())
    }

    /// Read the policy from the `INSPECTMCP_*` environment variables
    ///
    /// Values are taken as raw strings and go through the same strict
    /// parsing as [`PolicyOptions`].
    ///
    /// # Errors
    ///
    /// Returns [`InspectorError::InvalidConfiguration`] if a variable is set
    /// to an unparseable value.
    pub fn from_env() -> Result<Self> {
        Self::from_environment(::config::Environment::with_prefix(ENV_PREFIX))
    }

    /// Read the policy from an explicit set of variables instead of the
    /// process environment
    ///
    /// # Errors
    ///
    /// Same as [`DispatchPolicy::from_env`].
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: ::config::Map<String, String> = vars
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();
        Self::from_environment(::config::Environment::with_prefix(ENV_PREFIX).source(Some(vars)))
    }

    fn from_environment(environment: ::config::Environment) -> Result<Self> {
        let overlay = ::config::Config::builder()
            .add_source(environment)
            .build()
            .and_then(|settings| settings.try_deserialize::<EnvOverlay>())
            .map_err(|e| {
                InspectorError::invalid_configuration(
                    ENV_PREFIX,
                    "",
                    format!("unreadable environment: {e}"),
                )
            })?;
        Self::from_options(&overlay.into())
    }
}

/// `INSPECTMCP_*` variables after the prefix is stripped and lowercased
#[derive(Debug, Default, Deserialize)]
struct EnvOverlay {
    request_timeout_ms: Option<String>,
    reset_timeout_on_progress: Option<String>,
    max_total_timeout_ms: Option<String>,
}

impl From<EnvOverlay> for PolicyOptions {
    fn from(overlay: EnvOverlay) -> Self {
        Self {
            request_timeout_ms: overlay.request_timeout_ms,
            reset_timeout_on_progress: overlay.reset_timeout_on_progress,
            max_total_timeout_ms: overlay.max_total_timeout_ms,
        }
    }
}

fn check_window(option: &str, window: Duration) -> Result<()> {
    if window.is_zero() {
        return Err(InspectorError::invalid_configuration(
            option,
            "0",
            "must be a positive number of milliseconds",
        ));
    }
    if window > Duration::from_millis(MAX_TIMEOUT_MS) {
        return Err(InspectorError::invalid_configuration(
            option,
            window.as_millis().to_string(),
            format!("must not exceed {MAX_TIMEOUT_MS}ms"),
        ));
    }
    Ok(())
}

/// Serialized shape of [`DispatchPolicy`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyRepr {
    request_timeout_ms: u64,
    #[serde(default)]
    reset_timeout_on_progress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_total_timeout_ms: Option<u64>,
}

impl TryFrom<PolicyRepr> for DispatchPolicy {
    type Error = InspectorError;

    fn try_from(repr: PolicyRepr) -> Result<Self> {
        let policy = Self {
            request_timeout: Duration::from_millis(repr.request_timeout_ms),
            reset_timeout_on_progress: repr.reset_timeout_on_progress,
            max_total_timeout: repr.max_total_timeout_ms.map(Duration::from_millis),
        };
        policy.validate()?;
        Ok(policy)
    }
}

impl From<DispatchPolicy> for PolicyRepr {
    fn from(policy: DispatchPolicy) -> Self {
        Self {
            request_timeout_ms: policy.request_timeout.as_millis() as u64,
            reset_timeout_on_progress: policy.reset_timeout_on_progress,
            max_total_timeout_ms: policy.max_total_timeout.map(|d| d.as_millis() as u64),
        }
    }
}

/// Unvalidated timeout options as strings
///
/// `None` leaves the corresponding field of the base policy untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyOptions {
    /// Milliseconds, positive integer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<String>,
    /// Boolean token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_timeout_on_progress: Option<String>,
    /// Milliseconds, positive integer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_timeout_ms: Option<String>,
}

impl PolicyOptions {
    /// Options that only set the request timeout
    pub fn with_request_timeout(raw: impl Into<String>) -> Self {
        Self {
            request_timeout_ms: Some(raw.into()),
            ..Self::default()
        }
    }

    /// Parse and apply these options on top of `base`
    ///
    /// # Errors
    ///
    /// Returns [`InspectorError::InvalidConfiguration`] naming the first option
    /// that fails to parse.
    pub fn apply_to(&self, base: DispatchPolicy) -> Result<DispatchPolicy> {
        let mut policy = base;
        if let Some(raw) = &self.request_timeout_ms {
            policy.request_timeout = parse_positive_millis(OPT_REQUEST_TIMEOUT, raw)?;
        }
        if let Some(raw) = &self.reset_timeout_on_progress {
            policy.reset_timeout_on_progress = parse_bool_token(OPT_RESET_ON_PROGRESS, raw)?;
        }
        if let Some(raw) = &self.max_total_timeout_ms {
            policy.max_total_timeout = Some(parse_positive_millis(OPT_MAX_TOTAL_TIMEOUT, raw)?);
        }
        Ok(policy)
    }
}

fn parse_positive_millis(option: &str, raw: &str) -> Result<Duration> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(InspectorError::invalid_configuration(
            option,
            raw,
            "expected a positive integer number of milliseconds",
        ));
    }
    let millis: u64 = trimmed.parse().map_err(|_| {
        InspectorError::invalid_configuration(option, raw, "value is out of range")
    })?;
    if millis == 0 {
        return Err(InspectorError::invalid_configuration(
            option,
            raw,
            "must be greater than zero",
        ));
    }
    if millis > MAX_TIMEOUT_MS {
        return Err(InspectorError::invalid_configuration(
            option,
            raw,
            format!("must not exceed {MAX_TIMEOUT_MS}ms"),
        ));
    }
    Ok(Duration::from_millis(millis))
}

fn parse_bool_token(option: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(InspectorError::invalid_configuration(
            option,
            raw,
            "expected one of true/false/1/0/yes/no/on/off",
        )),
    }
}

/// Roots section of [`ClientCapabilitiesConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootsConfig {
    /// Advertise `notifications/roots/list_changed`
    pub list_changed: bool,
}

/// Capabilities the inspector advertises during the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientCapabilitiesConfig {
    /// Roots support, `None` to omit
    pub roots: Option<RootsConfig>,
    /// Accept `sampling/createMessage`
    pub sampling: bool,
    /// Accept `elicitation/create`
    pub elicitation: bool,
    /// Extra experimental capabilities passed through verbatim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<HashMap<String, Value>>,
}

impl Default for ClientCapabilitiesConfig {
    fn default() -> Self {
        Self {
            roots: Some(RootsConfig { list_changed: true }),
            sampling: true,
            elicitation: true,
            experimental: None,
        }
    }
}

impl ClientCapabilitiesConfig {
    /// Wire form sent in `initialize`
    pub fn to_protocol(&self) -> ClientCapabilities {
        ClientCapabilities {
            roots: self.roots.map(|roots| RootsCapability {
                list_changed: Some(roots.list_changed),
            }),
            sampling: self.sampling.then(|| json!({})),
            elicitation: self.elicitation.then(|| json!({})),
            experimental: self.experimental.clone(),
        }
    }
}

/// Construction-time settings of a [`ClientSession`](crate::ClientSession)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Implementation info sent as `clientInfo`
    pub client_info: Implementation,
    /// Advertised capabilities
    pub capabilities: ClientCapabilitiesConfig,
    /// Policy used when a request does not supply its own
    pub default_policy: DispatchPolicy,
    /// Policy for the `initialize` request
    pub handshake_policy: DispatchPolicy,
    /// Maximum number of history entries kept
    pub history_capacity: usize,
    /// Re-emit server log notifications through `tracing`
    pub trace_server_logs: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_info: Implementation::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            capabilities: ClientCapabilitiesConfig::default(),
            default_policy: DispatchPolicy::default(),
            handshake_policy: DispatchPolicy::default(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            trace_server_logs: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let policy = DispatchPolicy::default();
        assert_eq!(policy.request_timeout, Duration::from_millis(60_000));
        assert!(!policy.reset_timeout_on_progress);
        assert_eq!(policy.max_total_timeout, None);
        assert_eq!(SessionConfig::default().history_capacity, 500);
    }

    #[test]
    fn test_rejects_malformed_timeouts() {
        for raw in ["invalid", "0", "-5", "1.5", "", "  "] {
            let err = DispatchPolicy::from_options(&PolicyOptions::with_request_timeout(raw))
                .unwrap_err();
            match err {
                InspectorError::InvalidConfiguration { option, .. } => {
                    assert_eq!(option, "requestTimeoutMs");
                }
                other => panic!("unexpected error for {raw:?}: {other}"),
            }
        }
    }

    #[test]
    fn test_parses_bool_tokens() {
        for (raw, expected) in [("TRUE", true), ("off", false), (" yes ", true), ("0", false)] {
            let options = PolicyOptions {
                reset_timeout_on_progress: Some(raw.to_string()),
                ..PolicyOptions::default()
            };
            let policy = DispatchPolicy::from_options(&options).unwrap();
            assert_eq!(policy.reset_timeout_on_progress, expected, "token {raw:?}");
        }

        let options = PolicyOptions {
            reset_timeout_on_progress: Some("maybe".into()),
            ..PolicyOptions::default()
        };
        assert!(DispatchPolicy::from_options(&options).is_err());
    }

    #[test]
    fn test_options_override_base() {
        let base = DispatchPolicy::new(Duration::from_secs(5)).reset_on_progress(true);
        let options = PolicyOptions {
            max_total_timeout_ms: Some("30000".into()),
            ..PolicyOptions::default()
        };
        let policy = options.apply_to(base).unwrap();
        assert_eq!(policy.request_timeout, Duration::from_secs(5));
        assert!(policy.reset_timeout_on_progress);
        assert_eq!(policy.max_total_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_from_vars_reads_prefixed_variables() {
        let policy = DispatchPolicy::from_vars([
            (ENV_REQUEST_TIMEOUT_MS, "2000"),
            (ENV_RESET_TIMEOUT_ON_PROGRESS, "on"),
            (ENV_MAX_TOTAL_TIMEOUT_MS, "30000"),
            ("OTHER_TOOL_TIMEOUT_MS", "1"),
        ])
        .unwrap();
        assert_eq!(
            policy,
            DispatchPolicy::new(Duration::from_millis(2000))
                .reset_on_progress(true)
                .max_total(Duration::from_millis(30_000))
        );

        let defaults = DispatchPolicy::from_vars(Vec::<(String, String)>::new()).unwrap();
        assert_eq!(defaults, DispatchPolicy::default());
    }

    #[test]
    fn test_from_vars_keeps_strict_parsing() {
        let err = DispatchPolicy::from_vars([(ENV_MAX_TOTAL_TIMEOUT_MS, "soon")]).unwrap_err();
        assert!(err.to_string().contains("maxTotalTimeoutMs"));

        // Numbers stay strings, so a fractional value is still refused
        let err = DispatchPolicy::from_vars([(ENV_REQUEST_TIMEOUT_MS, "1.5")]).unwrap_err();
        assert!(err.to_string().contains("requestTimeoutMs"));

        let err = DispatchPolicy::from_vars([(ENV_RESET_TIMEOUT_ON_PROGRESS, "maybe")]).unwrap_err();
        assert!(err.to_string().contains("resetTimeoutOnProgress"));
    }

    #[test]
    fn test_oversized_windows_rejected() {
        let err = DispatchPolicy::new(Duration::MAX).validate().unwrap_err();
        assert!(matches!(
            err,
            InspectorError::InvalidConfiguration { ref option, .. } if option == OPT_REQUEST_TIMEOUT
        ));

        let ceiling = DispatchPolicy::default().max_total(Duration::from_secs(u64::MAX));
        assert!(ceiling.validate().is_err());

        let at_limit = DispatchPolicy::new(Duration::from_millis(MAX_TIMEOUT_MS));
        assert!(at_limit.validate().is_ok());

        let over = (MAX_TIMEOUT_MS + 1).to_string();
        assert!(DispatchPolicy::from_options(&PolicyOptions::with_request_timeout(over)).is_err());
        let huge = PolicyOptions::with_request_timeout(u64::MAX.to_string());
        assert!(DispatchPolicy::from_options(&huge).is_err());
    }

    #[test]
    fn test_serde_shape_is_camel_case_millis() {
        let policy = DispatchPolicy::new(Duration::from_millis(1500)).reset_on_progress(true);
        let value = serde_json::to_value(policy).unwrap();
        assert_eq!(
            value,
            json!({"requestTimeoutMs": 1500, "resetTimeoutOnProgress": true})
        );

        let zero: std::result::Result<DispatchPolicy, _> =
            serde_json::from_value(json!({"requestTimeoutMs": 0}));
        assert!(zero.is_err());
    }

    #[test]
    fn test_capabilities_wire_form() {
        let caps = ClientCapabilitiesConfig {
            elicitation: false,
            ..ClientCapabilitiesConfig::default()
        }
        .to_protocol();
        assert!(caps.sampling.is_some());
        assert!(caps.elicitation.is_none());
        assert_eq!(
            caps.roots.and_then(|roots| roots.list_changed),
            Some(true)
        );
    }
}
