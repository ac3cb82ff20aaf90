//! Core transport traits.

use std::future::Future;
use std::pin::Pin;

use crate::error::TransportResult;
use crate::message::TransportMessage;
use crate::types::{TransportState, TransportType};

/// Boxed future returned by [`Transport`] methods so the trait stays object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The contract every transport implementation satisfies.
///
/// The client core holds transports as `Arc<dyn Transport>`, so all methods
/// take `&self` and implementations use interior mutability.
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Returns the type of this transport.
    fn transport_type(&self) -> TransportType;

    /// Returns the current state of the transport.
    fn state(&self) -> BoxFuture<'_, TransportState>;

    /// Establishes a connection to the remote endpoint.
    fn connect(&self) -> BoxFuture<'_, TransportResult<()>>;

    /// Closes the connection. Closing an already closed transport is not an error.
    fn disconnect(&self) -> BoxFuture<'_, TransportResult<()>>;

    /// Sends a single message over the transport.
    fn send(&self, message: TransportMessage) -> BoxFuture<'_, TransportResult<()>>;

    /// Waits for the next inbound message; `Ok(None)` once the channel has closed.
    fn receive(&self) -> BoxFuture<'_, TransportResult<Option<TransportMessage>>>;

    /// Returns `true` if the transport is currently in the `Connected` state.
    fn is_connected(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { matches!(self.state().await, TransportState::Connected) })
    }

    /// Returns the endpoint address or identifier for this transport, if applicable.
    fn endpoint(&self) -> Option<String> {
        None
    }
}
