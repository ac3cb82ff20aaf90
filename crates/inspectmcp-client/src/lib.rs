//! # inspectmcp client core
//!
//! Connection and request-correlation core of an MCP inspector. A
//! [`ClientSession`] connects to one server over any
//! [`Transport`](inspectmcp_transport_traits::Transport), issues requests
//! under a [`DispatchPolicy`], and keeps a hierarchical trace of everything
//! that happened, including the sampling and elicitation requests the server
//! sends back while a request is in flight.
//!
//! ## Architecture
//!
//! ```text
//! ClientSession ── connect / disconnect / server_supports
//!     │
//!     ├── RequestDispatcher ── timeout, progress reset, ceiling, cancel
//!     │        └── ProtocolClient ── MessageRouter ── Transport
//!     │
//!     ├── CapabilityHandlerRegistry ── ping, roots, sampling, elicitation,
//!     │        │                        logs, list changes
//!     │        └── PendingRequestResolver ── UI or TestingProfile answers
//!     │
//!     └── TraceAssembler ── HistoryStore (primary + child entries)
//! ```
//!
//! ## Timeouts
//!
//! Every outbound request races an inactivity deadline (`request_timeout`),
//! an optional absolute ceiling (`max_total_timeout`) and explicit
//! cancellation. With `reset_timeout_on_progress`, each progress
//! notification pushes the deadline out again, never past the ceiling.
//!
//! ```rust,no_run
//! use inspectmcp_client::{ClientSession, ConnectOptions, PolicyOptions};
//! use inspectmcp_transport_traits::Transport;
//! use std::sync::Arc;
//!
//! # async fn example(transport: Arc<dyn Transport>) -> inspectmcp_client::Result<()> {
//! let session = ClientSession::default();
//! let server = session.connect(transport, ConnectOptions::default()).await?;
//! println!("connected to {}", server.server_info.name);
//!
//! let options = PolicyOptions {
//!     request_timeout_ms: Some("2000".into()),
//!     reset_timeout_on_progress: Some("true".into()),
//!     max_total_timeout_ms: Some("30000".into()),
//! };
//! match session.call_tool_with_options("long_running", None, &options).await {
//!     Ok(result) => println!("{result}"),
//!     Err(e) if e.is_timeout() => eprintln!("gave up: {e}"),
//!     Err(e) => eprintln!("failed: {e}"),
//! }
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Answering sampling requests
//!
//! ```rust,no_run
//! use inspectmcp_client::ClientSession;
//! use std::sync::Arc;
//!
//! # fn example(session: &ClientSession) {
//! let resolver = Arc::clone(session.resolver());
//! session
//!     .resolver()
//!     .on_pending(move |request| {
//!         let answer = serde_json::json!({
//!             "role": "assistant",
//!             "content": {"type": "text", "text": "approved"},
//!             "model": "manual",
//!         });
//!         resolver.resolve(&request.id, answer);
//!     })
//!     .detach();
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod history;
pub mod profile;
pub mod repository;
pub mod resolver;
pub mod sampling;

pub use client::{
    ClientSession, ConnectOptions, ConnectionStatus, InFlightRequest, RequestDispatcher,
    ServerCapability, SessionBuilder,
};
pub use config::{ClientCapabilitiesConfig, DispatchPolicy, PolicyOptions, SessionConfig};
pub use error::{ErrorKind, InspectorError, Result};
pub use events::{ListChangedKind, Observers, ProgressEvent, Subscription};
pub use handlers::{CapabilityHandlerRegistry, RootsProvider, trace_server_log};
pub use history::{HistoryEntry, HistoryFilter, HistoryStore, RequestType, TraceAssembler};
pub use profile::TestingProfile;
pub use repository::{
    HistoryRepository, LogEntry, LogsRepository, MemoryLogsRepository,
    MemoryServerConfigRepository, MemoryTestingProfileRepository, RepositoryError,
    ServerConfigRepository, TestingProfileRepository,
};
pub use resolver::{
    CancelOrigin, ChildRequestKind, ChildStatus, PendingRequest, PendingRequestResolver, Settlement,
};
pub use sampling::{SamplingProvider, SamplingProviderRegistry};
