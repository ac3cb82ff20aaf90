//! Common test utilities for integration tests
//!
//! A channel-backed [`Transport`] connects a session to a scripted
//! in-process MCP server. The server understands `initialize`, `ping` and a
//! handful of tools that exercise progress, timeouts and server-initiated
//! requests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use inspectmcp_client::{ClientSession, ConnectOptions, InspectorError};
use inspectmcp_protocol::MessageId;
use inspectmcp_transport_traits::{
    BoxFuture, Transport, TransportError, TransportMessage, TransportResult, TransportState,
    TransportType,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Client half of an in-process channel pair
#[derive(Debug)]
pub struct ChannelTransport {
    to_server: mpsc::UnboundedSender<Bytes>,
    from_server: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    state: Mutex<TransportState>,
    closed: CancellationToken,
    fail_connect: bool,
    pub disconnects: AtomicUsize,
}

impl ChannelTransport {
    /// Make the next `receive` report end of stream, as if the server died
    pub fn simulate_drop(&self) {
        *self.state.lock() = TransportState::Disconnected;
        self.closed.cancel();
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl Transport for ChannelTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::InMemory
    }

    fn state(&self) -> BoxFuture<'_, TransportState> {
        Box::pin(async move { self.state.lock().clone() })
    }

    fn connect(&self) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            if self.fail_connect {
                return Err(TransportError::ConnectionFailed("refused".into()));
            }
            *self.state.lock() = TransportState::Connected;
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            *self.state.lock() = TransportState::Disconnected;
            self.closed.cancel();
            Ok(())
        })
    }

    fn send(&self, message: TransportMessage) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return Err(TransportError::NotConnected);
            }
            self.to_server
                .send(message.payload)
                .map_err(|_| TransportError::ConnectionLost("server gone".into()))
        })
    }

    fn receive(&self) -> BoxFuture<'_, TransportResult<Option<TransportMessage>>> {
        Box::pin(async move {
            let mut from_server = self.from_server.lock().await;
            tokio::select! {
                biased;
                () = self.closed.cancelled() => Ok(None),
                frame = from_server.recv() => Ok(frame.map(|payload| {
                    TransportMessage::new(MessageId::from("mock"), payload)
                })),
            }
        })
    }

    fn endpoint(&self) -> Option<String> {
        Some("mock://server".into())
    }
}

/// How the mock answers `initialize`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitBehavior {
    Succeed,
    Fail,
    Silent,
}

#[derive(Debug, Clone)]
pub struct MockOptions {
    pub init: InitBehavior,
    pub capabilities: Value,
    pub fail_connect: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            init: InitBehavior::Succeed,
            capabilities: json!({
                "tools": {"listChanged": true},
                "resources": {"subscribe": true},
                "logging": {},
            }),
            fail_connect: false,
        }
    }
}

/// Server half: sends frames to the client and tracks what it received
#[derive(Debug)]
pub struct MockPeer {
    to_client: mpsc::UnboundedSender<Bytes>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    next_id: AtomicI64,
    /// Every frame the client sent, in order
    pub received: Mutex<Vec<Value>>,
}

impl MockPeer {
    fn send(&self, frame: Value) {
        let _ = self.to_client.send(Bytes::from(frame.to_string()));
    }

    pub fn respond(&self, id: &Value, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": id, "result": result}));
    }

    pub fn respond_error(&self, id: &Value, code: i64, message: &str) {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message},
        }));
    }

    pub fn notify(&self, method: &str, params: Value) {
        self.send(json!({"jsonrpc": "2.0", "method": method, "params": params}));
    }

    /// Send a request to the client under `id` and wait for its response frame
    pub async fn request_with_id(&self, id: &str, method: &str, params: Value) -> Value {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.to_string(), tx);
        self.send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}));
        rx.await.unwrap_or(Value::Null)
    }

    pub async fn request(&self, method: &str, params: Value) -> Value {
        let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.request_with_id(&id, method, params).await
    }

    /// Methods of every request and notification the client sent
    pub fn methods(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .filter_map(|frame| frame.get("method")?.as_str().map(str::to_string))
            .collect()
    }

    /// `notifications/cancelled` params the client sent
    pub fn cancellations(&self) -> Vec<Value> {
        self.received
            .lock()
            .iter()
            .filter(|frame| frame["method"] == "notifications/cancelled")
            .map(|frame| frame["params"].clone())
            .collect()
    }

    /// Responses the client sent for server request `id`
    pub fn responses_to(&self, id: &str) -> Vec<Value> {
        self.received
            .lock()
            .iter()
            .filter(|frame| frame.get("method").is_none() && frame["id"] == id)
            .cloned()
            .collect()
    }
}

pub struct MockServer {
    pub transport: Arc<ChannelTransport>,
    pub peer: Arc<MockPeer>,
}

impl MockServer {
    pub fn start() -> Self {
        Self::start_with(MockOptions::default())
    }

    pub fn start_with(options: MockOptions) -> Self {
        let (to_server, mut from_client) = mpsc::unbounded_channel::<Bytes>();
        let (to_client, from_server) = mpsc::unbounded_channel::<Bytes>();

        let transport = Arc::new(ChannelTransport {
            to_server,
            from_server: tokio::sync::Mutex::new(from_server),
            state: Mutex::new(TransportState::Disconnected),
            closed: CancellationToken::new(),
            fail_connect: options.fail_connect,
            disconnects: AtomicUsize::new(0),
        });
        let peer = Arc::new(MockPeer {
            to_client,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            received: Mutex::new(Vec::new()),
        });

        let server_peer = Arc::clone(&peer);
        tokio::spawn(async move {
            while let Some(bytes) = from_client.recv().await {
                let Ok(frame) = serde_json::from_slice::<Value>(&bytes) else {
                    continue;
                };
                server_peer.received.lock().push(frame.clone());

                let method = frame.get("method").and_then(Value::as_str).map(str::to_string);
                let id = frame.get("id").cloned();
                match (method, id) {
                    (Some(method), Some(id)) => {
                        let peer = Arc::clone(&server_peer);
                        let options = options.clone();
                        let params = frame.get("params").cloned().unwrap_or(Value::Null);
                        tokio::spawn(async move {
                            handle_request(&peer, &options, id, &method, params).await;
                        });
                    }
                    (None, Some(id)) => {
                        let key = match &id {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        if let Some(tx) = server_peer.pending.lock().remove(&key) {
                            let _ = tx.send(frame);
                        }
                    }
                    _ => {}
                }
            }
        });

        Self { transport, peer }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport) as Arc<dyn Transport>
    }

    /// Connect `session` to this server
    pub async fn connect(&self, session: &ClientSession) -> Result<Value, InspectorError> {
        let result = session
            .connect(self.transport(), ConnectOptions::default())
            .await?;
        Ok(serde_json::to_value(result).unwrap_or(Value::Null))
    }
}

fn text_result(text: impl Into<String>) -> Value {
    json!({"content": [{"type": "text", "text": text.into()}]})
}

fn sampling_params(args: &Value) -> Value {
    let mut params = json!({
        "messages": [{"role": "user", "content": {"type": "text", "text": "What is 2 + 2?"}}],
        "maxTokens": 64,
    });
    if let Some(hints) = args.get("hints").and_then(Value::as_array) {
        let hints: Vec<Value> = hints.iter().map(|name| json!({"name": name})).collect();
        params["modelPreferences"] = json!({"hints": hints});
    }
    params
}

async fn handle_request(peer: &MockPeer, options: &MockOptions, id: Value, method: &str, params: Value) {
    match method {
        "initialize" => match options.init {
            InitBehavior::Succeed => peer.respond(
                &id,
                json!({
                    "protocolVersion": "2025-06-18",
                    "capabilities": options.capabilities,
                    "serverInfo": {"name": "mock-server", "version": "1.0.0"},
                    "instructions": "Scripted server for tests",
                }),
            ),
            InitBehavior::Fail => peer.respond_error(&id, -32603, "initialization exploded"),
            InitBehavior::Silent => {}
        },
        "ping" | "logging/setLevel" => peer.respond(&id, json!({})),
        "resources/read" => peer.respond(
            &id,
            json!({"contents": [{"uri": params["uri"], "text": "contents"}]}),
        ),
        "tools/list" => peer.respond(&id, json!({"tools": [{"name": "echo"}]})),
        "tools/call" => call_tool(peer, id, params).await,
        _ => peer.respond_error(&id, -32601, "method not found"),
    }
}

async fn call_tool(peer: &MockPeer, id: Value, params: Value) {
    let name = params["name"].as_str().unwrap_or_default().to_string();
    let args = params.get("arguments").cloned().unwrap_or(Value::Null);
    let token = params["_meta"]["progressToken"].clone();

    match name.as_str() {
        "echo" => peer.respond(&id, text_result(args["text"].as_str().unwrap_or_default())),
        "fail" => peer.respond_error(&id, -32000, "tool exploded"),
        "slow" => {
            let ms = args["duration_ms"].as_u64().unwrap_or(1000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            peer.respond(&id, text_result("slow done"));
        }
        "long_running" => {
            let total_ms = args["duration_ms"].as_u64().unwrap_or(5000);
            let steps = args["steps"].as_u64().unwrap_or(5).max(1);
            let step = Duration::from_millis(total_ms / steps);
            for i in 1..=steps {
                tokio::time::sleep(step).await;
                peer.notify(
                    "notifications/progress",
                    json!({
                        "progressToken": token,
                        "progress": i,
                        "total": steps,
                        "message": format!("step {i}/{steps}"),
                    }),
                );
            }
            peer.respond(&id, text_result(format!("completed {steps} steps")));
        }
        "sample" => {
            let response = peer.request("sampling/createMessage", sampling_params(&args)).await;
            peer.respond(&id, json!({"content": [], "sampling": response}));
        }
        "sample_many" => {
            let count = args["count"].as_u64().unwrap_or(2);
            let requests = (0..count)
                .map(|_| peer.request("sampling/createMessage", sampling_params(&args)));
            let responses = join_all(requests).await;
            peer.respond(&id, json!({"content": [], "sampling": responses}));
        }
        "elicit" => {
            let response = peer
                .request(
                    "elicitation/create",
                    json!({
                        "message": "Pick a colour",
                        "requestedSchema": {
                            "type": "object",
                            "properties": {"colour": {"type": "string"}},
                        },
                    }),
                )
                .await;
            peer.respond(&id, json!({"content": [], "elicitation": response}));
        }
        "roots" => {
            let response = peer.request("roots/list", json!({})).await;
            peer.respond(&id, json!({"content": [], "roots": response}));
        }
        "ping_client" => {
            let response = peer.request("ping", json!({})).await;
            peer.respond(&id, json!({"content": [], "ping": response}));
        }
        "log" => {
            peer.notify(
                "notifications/message",
                json!({"level": "info", "logger": "mock", "data": args["message"]}),
            );
            peer.respond(&id, text_result("logged"));
        }
        "withdraw_sampling" => {
            let sampling_id = "srv-withdrawn";
            let request = peer.request_with_id(sampling_id, "sampling/createMessage", sampling_params(&args));
            tokio::select! {
                _ = request => {}
                () = tokio::time::sleep(Duration::from_millis(50)) => {
                    peer.notify(
                        "notifications/cancelled",
                        json!({"requestId": sampling_id, "reason": "server changed its mind"}),
                    );
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            peer.respond(&id, text_result("withdrew"));
        }
        other => peer.respond_error(&id, -32602, &format!("unknown tool {other}")),
    }
}

/// Poll `condition` every 10ms until it holds or `limit` elapses
pub async fn wait_until(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
