use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::repository::StatsRepository;
use super::{FAILURES, HEALTH_SCORE, IN_FLIGHT, LATENCY_MS, REQUESTS};
use crate::transport::Endpoint;

/// Health score at or below which a host is considered unhealthy
pub const UNHEALTHY_THRESHOLD: u8 = 30;

/// How long an unhealthy host waits before it is offered a trial dispatch
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Score a host is lifted to when it succeeds while unhealthy
const RECOVERED_SCORE: u8 = UNHEALTHY_THRESHOLD + 10;

/// Per-host dispatch tracking: in-flight count, health and rolling samples
#[derive(Debug)]
pub struct HostStats {
    /// Host the stats describe
    pub endpoint: Endpoint,

    /// Number of dispatches currently in progress
    in_flight: AtomicU32,

    /// Number of consecutive failures (reset on success)
    failure_count: AtomicU32,

    /// Health score from 0-100 (100 = perfectly healthy)
    health_score: AtomicU8,

    /// Rolling samples
    repository: StatsRepository,

    /// When an unhealthy host may next take a trial dispatch
    retry_at: Mutex<Option<Instant>>,

    retry_interval: Duration,
}

/// Point-in-time view of one host
#[derive(Debug, Clone, PartialEq)]
pub struct HostSnapshot {
    pub endpoint: Endpoint,
    pub in_flight: u32,
    pub failure_count: u32,
    pub health_score: u8,
    pub healthy: bool,
    /// Requests inside the rolling window
    pub requests: u64,
    /// Failures inside the rolling window
    pub failures: u64,
    pub mean_latency_ms: Option<f64>,
}

impl HostStats {
    pub fn new(endpoint: Endpoint, repository: StatsRepository) -> Self {
        Self {
            endpoint,
            in_flight: AtomicU32::new(0),
            failure_count: AtomicU32::new(0),
            health_score: AtomicU8::new(100),
            repository,
            retry_at: Mutex::new(None),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    pub fn repository(&self) -> &StatsRepository {
        &self.repository
    }

    /// Publish the in-flight and health gauges through the repository
    pub fn register_gauges(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.repository.register_gauge(
            IN_FLIGHT,
            Box::new(move || {
                weak.upgrade()
                    .map(|host| f64::from(host.get_in_flight()))
                    .unwrap_or(0.0)
            }),
        );

        let weak = Arc::downgrade(self);
        self.repository.register_gauge(
            HEALTH_SCORE,
            Box::new(move || {
                weak.upgrade()
                    .map(|host| f64::from(host.get_health_score()))
                    .unwrap_or(0.0)
            }),
        );
    }

    pub fn increment_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_in_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get_in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Record a successful dispatch (resets failure count). A success while
    /// unhealthy makes the host healthy again.
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
        let _ = self
            .health_score
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |score| {
                let raised = score.saturating_add(10).min(100);
                if score <= UNHEALTHY_THRESHOLD {
                    Some(raised.max(RECOVERED_SCORE))
                } else {
                    Some(raised)
                }
            });
        self.update_retry();
    }

    /// Record a failed dispatch
    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .health_score
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |score| {
                Some(score.saturating_sub(20))
            });
        self.update_retry();
    }

    /// Record a connection failure, a strong signal the host is down. Drops
    /// the score to at most 30 from full health.
    pub fn record_connect_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .health_score
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |score| {
                Some(score.saturating_sub(70))
            });
        self.update_retry();
    }

    pub fn get_failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn get_health_score(&self) -> u8 {
        self.health_score.load(Ordering::Relaxed)
    }

    pub fn set_health_score(&self, score: u8) {
        self.health_score.store(score.min(100), Ordering::Relaxed);
        self.update_retry();
    }

    /// Claim the trial dispatch of an unhealthy host whose retry interval has
    /// passed. At most one caller wins per interval.
    pub fn try_claim_trial(&self) -> bool {
        if self.is_healthy() {
            return false;
        }

        let mut retry_at = self.retry_at.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match *retry_at {
            Some(at) if now >= at => {
                *retry_at = Some(now + self.retry_interval);
                true
            }
            _ => false,
        }
    }

    /// Schedule a retry when the host became unhealthy, clear it once healthy
    fn update_retry(&self) {
        let mut retry_at = self.retry_at.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_healthy() {
            *retry_at = None;
        } else if retry_at.is_none() {
            *retry_at = Some(Instant::now() + self.retry_interval);
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.get_health_score() > UNHEALTHY_THRESHOLD
    }

    pub fn snapshot(&self) -> HostSnapshot {
        HostSnapshot {
            endpoint: self.endpoint.clone(),
            in_flight: self.get_in_flight(),
            failure_count: self.get_failure_count(),
            health_score: self.get_health_score(),
            healthy: self.is_healthy(),
            requests: self.repository.snapshot(REQUESTS).count,
            failures: self.repository.snapshot(FAILURES).count,
            mean_latency_ms: self.repository.snapshot(LATENCY_MS).mean(),
        }
    }
}
