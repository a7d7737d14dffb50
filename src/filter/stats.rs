//! Per-host latency and outcome recording

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::service::{Dispatcher, Layer};
use crate::stats::{HostStats, FAILURES, LATENCY_MS, REQUESTS, SUCCESS};

/// Keeps the in-flight count right even if the dispatch is dropped
struct InFlight<'a>(&'a HostStats);

impl<'a> InFlight<'a> {
    fn enter(host: &'a HostStats) -> Self {
        host.increment_in_flight();
        Self(host)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.decrement_in_flight();
    }
}

/// Dispatcher recording every dispatch into its host's stats
pub struct StatsFilter<D> {
    inner: D,
    host: Arc<HostStats>,
}

impl<D: Dispatcher> StatsFilter<D> {
    pub fn new(inner: D, host: Arc<HostStats>) -> Self {
        Self { inner, host }
    }

    pub fn host(&self) -> &Arc<HostStats> {
        &self.host
    }
}

#[async_trait]
impl<D: Dispatcher> Dispatcher for StatsFilter<D> {
    async fn dispatch(&self, request: Bytes) -> Result<Bytes> {
        let _in_flight = InFlight::enter(&self.host);
        let started = Instant::now();

        let result = self.inner.dispatch(request).await;

        let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        let repository = self.host.repository();
        repository.incr(REQUESTS);
        repository.add(LATENCY_MS, elapsed_ms);

        match &result {
            Ok(_) => {
                repository.incr(SUCCESS);
                let was_healthy = self.host.is_healthy();
                self.host.record_success();
                if !was_healthy {
                    info!(endpoint = %self.host.endpoint, health = self.host.get_health_score(), "Host recovered");
                }
            }
            Err(e) => {
                repository.incr(FAILURES);
                repository.incr(&format!("{}/{}", FAILURES, e.kind().as_str()));

                let was_healthy = self.host.is_healthy();
                if e.is_connect_failure() {
                    self.host.record_connect_failure();
                } else {
                    self.host.record_failure();
                }
                debug!(endpoint = %self.host.endpoint, error = %e, "Dispatch failed");

                if was_healthy && !self.host.is_healthy() {
                    warn!(
                        endpoint = %self.host.endpoint,
                        health = self.host.get_health_score(),
                        failures = self.host.get_failure_count(),
                        "Host unhealthy"
                    );
                }
            }
        }

        result
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    fn close(&self) {
        self.inner.close()
    }
}

/// Layer recording into one host's stats
#[derive(Debug, Clone)]
pub struct StatsLayer {
    host: Arc<HostStats>,
}

impl StatsLayer {
    pub fn new(host: Arc<HostStats>) -> Self {
        Self { host }
    }
}

impl<D: Dispatcher> Layer<D> for StatsLayer {
    type Output = StatsFilter<D>;

    fn layer(&self, inner: D) -> Self::Output {
        StatsFilter::new(inner, Arc::clone(&self.host))
    }
}
