//! Request timeout enforcement
//!
//! The dispatch races a timer; whichever finishes first decides the outcome.
//! What happens to the losing dispatch is configurable through
//! [`TimeoutAction`].

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};
use crate::service::{Dispatcher, Layer};

/// What to do with a dispatch whose deadline has passed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Drop the in-flight dispatch. Its connection is discarded.
    #[default]
    Cancel,
    /// Let the dispatch run to completion in the background so a healthy
    /// connection can still be returned to the pool; its reply is ignored.
    Abandon,
}

/// Dispatcher failing requests that outlive `timeout`
pub struct TimeoutFilter<D> {
    inner: Arc<D>,
    timeout: Option<Duration>,
    action: TimeoutAction,
}

impl<D: Dispatcher> TimeoutFilter<D> {
    /// `None` leaves requests unbounded
    pub fn new(inner: D, timeout: Option<Duration>, action: TimeoutAction) -> Self {
        Self {
            inner: Arc::new(inner),
            timeout,
            action,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }
}

#[async_trait]
impl<D: Dispatcher> Dispatcher for TimeoutFilter<D> {
    async fn dispatch(&self, request: Bytes) -> Result<Bytes> {
        let Some(timeout) = self.timeout else {
            return self.inner.dispatch(request).await;
        };

        let outcome = match self.action {
            TimeoutAction::Cancel => {
                tokio::time::timeout(timeout, self.inner.dispatch(request)).await
            }
            TimeoutAction::Abandon => {
                let inner = Arc::clone(&self.inner);
                let task = tokio::spawn(async move { inner.dispatch(request).await });
                match tokio::time::timeout(timeout, task).await {
                    Ok(Ok(result)) => Ok(result),
                    Ok(Err(join_error)) => Ok(Err(Error::Dispatch(join_error.to_string()))),
                    Err(elapsed) => Err(elapsed),
                }
            }
        };

        outcome.unwrap_or_else(|_| {
            warn!(timeout = ?timeout, action = ?self.action, "Request timed out");
            Err(Error::Timeout(timeout))
        })
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    fn close(&self) {
        self.inner.close()
    }
}

/// Layer adding request timeouts
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutLayer {
    pub timeout: Option<Duration>,
    pub action: TimeoutAction,
}

impl TimeoutLayer {
    pub fn new(timeout: Option<Duration>, action: TimeoutAction) -> Self {
        Self { timeout, action }
    }
}

impl<D: Dispatcher> Layer<D> for TimeoutLayer {
    type Output = TimeoutFilter<D>;

    fn layer(&self, inner: D) -> Self::Output {
        TimeoutFilter::new(inner, self.timeout, self.action)
    }
}
