//! Backend trait.
//!
//! Implementations handle the transport layer for one endpoint while
//! presenting a uniform interface to the router. Agents never hold a
//! backend directly; they hold a routed client.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use super::{Completion, GenerateRequest, StreamEvent};
use crate::core::BackendId;
use crate::error::Result;

/// A pinned, sendable stream of generation events.
///
/// Deltas of one call arrive in FIFO order; the final element is always
/// [`StreamEvent::Done`] unless the stream errors or the receiver drops
/// (which cancels the underlying connection).
pub type BackendStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// An LLM endpoint.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Which endpoint this is.
    fn id(&self) -> BackendId;

    /// Whether the endpoint is currently reachable.
    async fn healthy(&self) -> bool;

    /// Executes a generation request to completion.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Backend`] on transport or provider
    /// failures.
    async fn generate(&self, request: &GenerateRequest) -> Result<Completion>;

    /// Executes a streaming generation request.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Backend`] when the connection
    /// cannot be established; mid-stream failures surface as stream
    /// items.
    async fn generate_stream(&self, request: &GenerateRequest) -> Result<BackendStream>;
}
