//! # inspectmcp transport traits
//!
//! The transport contract the inspector core consumes. Concrete transports
//! (stdio child processes, SSE, streamable HTTP) live outside this workspace
//! and only need to implement [`Transport`].
//!
//! ## Contract
//!
//! - [`Transport::send`] writes one framed JSON-RPC message.
//! - [`Transport::receive`] waits for the next inbound frame. `Ok(None)` means
//!   the channel is closed for good.
//! - [`Transport::disconnect`] closes the channel.
//!
//! A transport must allow many requests to be in flight at once; the client
//! core correlates responses by JSON-RPC id.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

mod error;
mod message;
mod traits;
mod types;

pub use error::{TransportError, TransportResult};
pub use message::TransportMessage;
pub use traits::{BoxFuture, Transport};
pub use types::{TransportState, TransportType};
