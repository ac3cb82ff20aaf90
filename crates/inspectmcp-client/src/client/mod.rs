//! Session core
//!
//! - `session`: `ClientSession` lifecycle (connect, disconnect, transport drop)
//! - `operations`: MCP operations on a connected session
//! - `dispatch`: `RequestDispatcher`, the timeout/progress/cancellation race
//! - `protocol`: JSON-RPC framing over the transport
//! - `router`: the background task that owns `Transport::receive`
//! - `builder`: `SessionBuilder`

pub mod builder;
pub mod dispatch;
pub mod operations;
pub(crate) mod protocol;
pub(crate) mod router;
pub mod session;

pub use builder::SessionBuilder;
pub use dispatch::{InFlightRequest, RequestDispatcher};
pub use session::{ClientSession, ConnectOptions, ConnectionStatus, ServerCapability};
