//! Capability contracts shared by every layer of the client stack
//!
//! - [`Service`]: one live connection, owned exclusively by whoever holds the
//!   box. Dispatching requires ownership, so a connection can never be handed
//!   to two callers at once. [`Service::release`] consumes the handle and gives
//!   control back to the pool layer.
//! - [`ServiceFactory`]: produces services asynchronously and can be closed.
//! - [`Dispatcher`]: a shared request path (many concurrent callers) produced
//!   by dispatch pooling and wrapped by the timeout, stats and load-balancing
//!   layers.
//! - [`Layer`]: one transformation step of the decorator chain.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::error::Result;

/// A boxed, exclusively owned connection
pub type BoxService = Box<dyn Service>;

/// A shared service factory
pub type SharedFactory = Arc<dyn ServiceFactory>;

/// A shared dispatcher
pub type SharedDispatcher = Arc<dyn Dispatcher>;

/// A live connection able to dispatch requests
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Send one request and wait for its reply
    async fn dispatch(&self, request: Bytes) -> Result<Bytes>;

    /// Whether the connection can still accept dispatches
    fn is_available(&self) -> bool;

    /// Hand the connection back. Depending on who produced it this either
    /// closes the underlying resource or returns it to an idle cache.
    fn release(self: Box<Self>);
}

/// Asynchronously produces [`Service`]s
#[async_trait]
pub trait ServiceFactory: Send + Sync + 'static {
    /// Obtain a live service. May involve network I/O.
    async fn make(&self) -> Result<BoxService>;

    /// Whether the factory is open
    fn is_available(&self) -> bool;

    /// Terminal: afterwards `make` always fails
    fn close(&self);
}

/// A request path shared by concurrent callers
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(&self, request: Bytes) -> Result<Bytes>;

    fn is_available(&self) -> bool;

    /// Stop accepting new dispatches and reclaim idle resources. In-flight
    /// dispatches are not aborted.
    fn close(&self);
}

/// Transforms one capability into the next one in the chain
pub trait Layer<In> {
    type Output;

    fn layer(&self, inner: In) -> Self::Output;
}

#[async_trait]
impl<D: Dispatcher + ?Sized> Dispatcher for Arc<D> {
    async fn dispatch(&self, request: Bytes) -> Result<Bytes> {
        (**self).dispatch(request).await
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    fn close(&self) {
        (**self).close()
    }
}

#[async_trait]
impl<F: ServiceFactory + ?Sized> ServiceFactory for Arc<F> {
    async fn make(&self) -> Result<BoxService> {
        (**self).make().await
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    fn close(&self) {
        (**self).close()
    }
}
