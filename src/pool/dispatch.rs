//! Dispatch pooling: turns a factory of connections into a shared request
//! dispatcher
//!
//! Each dispatch checks a connection out of the factory, sends the request on
//! it and releases it again. A connection is held by exactly one dispatch at
//! a time. The checkout is guarded, so a dispatch future dropped mid-flight
//! (for example by the timeout layer) still releases its connection; the
//! connection reports itself unavailable in that case and is discarded rather
//! than cached.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::trace;

use crate::error::{Error, Result};
use crate::service::{BoxService, Dispatcher, Layer, ServiceFactory};

/// Releases the checked-out connection when dropped
struct Checkout(Option<BoxService>);

impl Checkout {
    fn service(&self) -> Result<&BoxService> {
        self.0.as_ref().ok_or(Error::FactoryClosed)
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if let Some(service) = self.0.take() {
            service.release();
        }
    }
}

/// Shared dispatcher over a [`ServiceFactory`]
pub struct DispatchPool<F> {
    factory: F,
    limit: Option<Arc<Semaphore>>,
}

impl<F: ServiceFactory> DispatchPool<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            limit: None,
        }
    }

    /// Bound the number of connections checked out at once. Dispatches beyond
    /// the limit wait for a connection to be released.
    pub fn with_connection_limit(mut self, limit: usize) -> Self {
        self.limit = Some(Arc::new(Semaphore::new(limit)));
        self
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Connections that can still be checked out under the limit
    pub fn available_permits(&self) -> Option<usize> {
        self.limit.as_ref().map(|limit| limit.available_permits())
    }
}

#[async_trait]
impl<F: ServiceFactory> Dispatcher for DispatchPool<F> {
    async fn dispatch(&self, request: Bytes) -> Result<Bytes> {
        let _permit = match &self.limit {
            Some(limit) => Some(
                Arc::clone(limit)
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::FactoryClosed)?,
            ),
            None => None,
        };

        let checkout = Checkout(Some(self.factory.make().await?));
        trace!("Dispatching on checked-out connection");
        let reply = checkout.service()?.dispatch(request).await;
        reply
    }

    fn is_available(&self) -> bool {
        self.factory.is_available()
    }

    fn close(&self) {
        if let Some(limit) = &self.limit {
            limit.close();
        }
        self.factory.close();
    }
}

/// Layer turning a factory into a [`DispatchPool`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchPoolLayer {
    pub connection_limit: Option<usize>,
}

impl DispatchPoolLayer {
    pub fn new(connection_limit: Option<usize>) -> Self {
        Self { connection_limit }
    }
}

impl<F: ServiceFactory> Layer<F> for DispatchPoolLayer {
    type Output = DispatchPool<F>;

    fn layer(&self, inner: F) -> Self::Output {
        let pool = DispatchPool::new(inner);
        match self.connection_limit {
            Some(limit) => pool.with_connection_limit(limit),
            None => pool,
        }
    }
}
