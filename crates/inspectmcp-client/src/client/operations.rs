//! Protocol operations on a connected session
//!
//! Each operation is a primary request recorded in history and returns the
//! server's raw JSON result. Capability-scoped operations check the
//! negotiated capabilities first and fail locally with "method not found"
//! when the server never advertised them. String-typed policy options are
//! parsed before that check, so a bad option is reported even against a
//! server lacking the capability.

use inspectmcp_protocol::methods;
use inspectmcp_protocol::types::LogLevel;
use serde_json::{Map, Value, json};

use super::session::{ClientSession, ServerCapability};
use crate::config::{DispatchPolicy, PolicyOptions};
use crate::error::{InspectorError, Result};

impl ClientSession {
    fn require(&self, capability: ServerCapability) -> Result<()> {
        if self.server_supports(capability) {
            Ok(())
        } else {
            Err(InspectorError::method_not_found(format!(
                "server does not support {}",
                capability.name()
            )))
        }
    }

    async fn scoped(
        &self,
        capability: ServerCapability,
        method: &str,
        params: Option<Value>,
        policy: Option<&DispatchPolicy>,
    ) -> Result<Value> {
        self.require(capability)?;
        self.request(method, params, policy).await
    }

    /// Check that the server is alive
    pub async fn ping(&self) -> Result<Value> {
        self.request(methods::PING, None, None).await
    }

    /// List the server's tools
    pub async fn list_tools(&self, cursor: Option<&str>) -> Result<Value> {
        self.scoped(ServerCapability::Tools, methods::TOOLS_LIST, cursor_params(cursor), None)
            .await
    }

    /// Call a tool under the session's default policy
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use inspectmcp_client::ClientSession;
    /// # async fn example(session: &ClientSession) -> inspectmcp_client::Result<()> {
    /// let result = session
    ///     .call_tool("echo", Some(serde_json::json!({"text": "hi"})), None)
    ///     .await?;
    /// println!("{result}");
    /// # Ok(())
    /// # }
    /// ```
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        policy: Option<&DispatchPolicy>,
    ) -> Result<Value> {
        self.scoped(
            ServerCapability::Tools,
            methods::TOOLS_CALL,
            Some(tool_params(name, arguments)),
            policy,
        )
        .await
    }

    /// Call a tool with string-typed policy options
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use inspectmcp_client::{ClientSession, PolicyOptions};
    /// # async fn example(session: &ClientSession) -> inspectmcp_client::Result<()> {
    /// let options = PolicyOptions {
    ///     request_timeout_ms: Some("2000".into()),
    ///     reset_timeout_on_progress: Some("true".into()),
    ///     max_total_timeout_ms: Some("30000".into()),
    /// };
    /// session
    ///     .call_tool_with_options("long_running", None, &options)
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn call_tool_with_options(
        &self,
        name: &str,
        arguments: Option<Value>,
        options: &PolicyOptions,
    ) -> Result<Value> {
        let policy = options.apply_to(self.config().default_policy)?;
        self.call_tool(name, arguments, Some(&policy)).await
    }

    /// List the server's resources
    pub async fn list_resources(&self, cursor: Option<&str>) -> Result<Value> {
        self.scoped(
            ServerCapability::Resources,
            methods::RESOURCES_LIST,
            cursor_params(cursor),
            None,
        )
        .await
    }

    /// List the server's resource templates
    pub async fn list_resource_templates(&self, cursor: Option<&str>) -> Result<Value> {
        self.scoped(
            ServerCapability::Resources,
            methods::RESOURCES_TEMPLATES_LIST,
            cursor_params(cursor),
            None,
        )
        .await
    }

    /// Read one resource
    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        self.scoped(
            ServerCapability::Resources,
            methods::RESOURCES_READ,
            Some(json!({ "uri": uri })),
            None,
        )
        .await
    }

    /// Subscribe to updates of one resource
    pub async fn subscribe_resource(&self, uri: &str) -> Result<Value> {
        self.scoped(
            ServerCapability::ResourceSubscriptions,
            methods::RESOURCES_SUBSCRIBE,
            Some(json!({ "uri": uri })),
            None,
        )
        .await
    }

    /// Stop receiving updates of one resource
    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<Value> {
        self.scoped(
            ServerCapability::ResourceSubscriptions,
            methods::RESOURCES_UNSUBSCRIBE,
            Some(json!({ "uri": uri })),
            None,
        )
        .await
    }

    /// List the server's prompts
    pub async fn list_prompts(&self, cursor: Option<&str>) -> Result<Value> {
        self.scoped(
            ServerCapability::Prompts,
            methods::PROMPTS_LIST,
            cursor_params(cursor),
            None,
        )
        .await
    }

    /// Render a prompt
    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<Value> {
        let mut params = Map::new();
        params.insert("name".into(), json!(name));
        if let Some(arguments) = arguments {
            params.insert("arguments".into(), arguments);
        }
        self.scoped(
            ServerCapability::Prompts,
            methods::PROMPTS_GET,
            Some(Value::Object(params)),
            None,
        )
        .await
    }

    /// Ask for argument completions
    ///
    /// `reference` is the `ref` object (`ref/prompt` or `ref/resource`).
    pub async fn complete(
        &self,
        reference: Value,
        argument_name: &str,
        argument_value: &str,
    ) -> Result<Value> {
        self.scoped(
            ServerCapability::Completions,
            methods::COMPLETION_COMPLETE,
            Some(json!({
                "ref": reference,
                "argument": { "name": argument_name, "value": argument_value },
            })),
            None,
        )
        .await
    }

    /// Change the server's log verbosity
    pub async fn set_logging_level(&self, level: LogLevel) -> Result<Value> {
        self.scoped(
            ServerCapability::Logging,
            methods::LOGGING_SET_LEVEL,
            Some(json!({ "level": level })),
            None,
        )
        .await
    }

    /// Tell the server the roots changed
    pub async fn send_roots_list_changed(&self) -> Result<()> {
        self.notify(methods::NOTIFICATION_ROOTS_LIST_CHANGED, None)
            .await
    }
}

fn cursor_params(cursor: Option<&str>) -> Option<Value> {
    cursor.map(|cursor| json!({ "cursor": cursor }))
}

fn tool_params(name: &str, arguments: Option<Value>) -> Value {
    json!({
        "name": name,
        "arguments": arguments.unwrap_or_else(|| json!({})),
    })
}
