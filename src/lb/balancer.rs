use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::service::{Dispatcher, SharedDispatcher};
use crate::stats::{HostSnapshot, HostStats};

/// Load balancing strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Simple round-robin distribution
    #[default]
    RoundRobin,
    /// Always pick the host with the fewest dispatches in flight
    LeastLoaded,
    /// Pick 2 random hosts, choose the one with fewer dispatches in flight
    PowerOfTwo,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::RoundRobin => write!(f, "round_robin"),
            Strategy::LeastLoaded => write!(f, "least_loaded"),
            Strategy::PowerOfTwo => write!(f, "power_of_two"),
        }
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Strategy::RoundRobin),
            "least_loaded" => Ok(Strategy::LeastLoaded),
            "power_of_two" => Ok(Strategy::PowerOfTwo),
            other => Err(Error::config(format!("Unknown balancer strategy '{}'", other))),
        }
    }
}

/// One fully layered host as seen by the balancer
#[derive(Clone)]
pub struct HostHandle {
    pub dispatcher: SharedDispatcher,
    pub stats: Arc<HostStats>,
}

impl HostHandle {
    pub fn new(dispatcher: SharedDispatcher, stats: Arc<HostStats>) -> Self {
        Self { dispatcher, stats }
    }

    fn is_candidate(&self) -> bool {
        self.dispatcher.is_available() && self.stats.is_healthy()
    }

    fn claim_trial(&self) -> bool {
        self.dispatcher.is_available() && self.stats.try_claim_trial()
    }

    fn load(&self) -> u32 {
        self.stats.get_in_flight()
    }
}

/// Presents several hosts as one [`Dispatcher`]
///
/// Only available, healthy hosts are selected. When none is healthy the
/// available host with the highest health score is used instead. An
/// unhealthy host is handed one trial dispatch each time its retry interval
/// passes, so it can prove it is back.
pub struct LoadBalancer {
    hosts: Vec<HostHandle>,
    strategy: Strategy,
    /// Counter for round-robin strategy
    counter: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(hosts: Vec<HostHandle>, strategy: Strategy) -> Self {
        Self {
            hosts,
            strategy,
            counter: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn hosts(&self) -> &[HostHandle] {
        &self.hosts
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn snapshots(&self) -> Vec<HostSnapshot> {
        self.hosts.iter().map(|host| host.stats.snapshot()).collect()
    }

    /// Index of the host the next dispatch should go to
    pub fn select(&self) -> Option<usize> {
        if self.hosts.is_empty() {
            return None;
        }

        if let Some(index) = self.hosts.iter().position(HostHandle::claim_trial) {
            debug!(endpoint = %self.hosts[index].stats.endpoint, "Trial dispatch to unhealthy host");
            return Some(index);
        }

        match self.strategy {
            Strategy::RoundRobin => self.select_round_robin(),
            Strategy::LeastLoaded => self.select_least_loaded(),
            Strategy::PowerOfTwo => self.select_power_of_two(),
        }
    }

    /// Round-robin with health check: try up to N hosts
    fn select_round_robin(&self) -> Option<usize> {
        let len = self.hosts.len();
        let start_index = self.counter.fetch_add(1, Ordering::Relaxed) % len;

        (0..len)
            .map(|i| (start_index + i) % len)
            .find(|&index| self.hosts[index].is_candidate())
            .or_else(|| self.select_least_unhealthy())
    }

    /// Fewest in flight; ties go to the lowest index
    fn select_least_loaded(&self) -> Option<usize> {
        self.hosts
            .iter()
            .enumerate()
            .filter(|(_, host)| host.is_candidate())
            .min_by_key(|(idx, host)| (host.load(), *idx))
            .map(|(idx, _)| idx)
            .or_else(|| self.select_least_unhealthy())
    }

    fn select_power_of_two(&self) -> Option<usize> {
        let len = self.hosts.len();
        if len == 1 {
            return if self.hosts[0].dispatcher.is_available() {
                Some(0)
            } else {
                None
            };
        }

        let mut rng = rand::thread_rng();

        // Try up to 5 times to find two candidate hosts
        for _ in 0..5 {
            let a = rng.gen_range(0..len);
            let b = rng.gen_range(0..len);

            match (self.hosts[a].is_candidate(), self.hosts[b].is_candidate()) {
                (true, true) => {
                    return if self.hosts[a].load() <= self.hosts[b].load() {
                        Some(a)
                    } else {
                        Some(b)
                    };
                }
                (true, false) => return Some(a),
                (false, true) => return Some(b),
                (false, false) => continue,
            }
        }

        // Fallback to any candidate
        self.hosts
            .iter()
            .position(HostHandle::is_candidate)
            .or_else(|| self.select_least_unhealthy())
    }

    /// Fallback: the available host with the highest health score
    fn select_least_unhealthy(&self) -> Option<usize> {
        self.hosts
            .iter()
            .enumerate()
            .filter(|(_, host)| host.dispatcher.is_available())
            .max_by_key(|(idx, host)| (host.stats.get_health_score(), std::cmp::Reverse(*idx)))
            .map(|(idx, _)| idx)
    }
}

#[async_trait]
impl Dispatcher for LoadBalancer {
    async fn dispatch(&self, request: Bytes) -> Result<Bytes> {
        let index = self.select().ok_or(Error::NoHostsAvailable)?;
        let host = &self.hosts[index];
        trace!(endpoint = %host.stats.endpoint, strategy = %self.strategy, "Selected host");
        host.dispatcher.dispatch(request).await
    }

    fn is_available(&self) -> bool {
        self.hosts.iter().any(|host| host.dispatcher.is_available())
    }

    fn close(&self) {
        debug!(hosts = self.hosts.len(), "Closing load balancer");
        for host in &self.hosts {
            host.dispatcher.close();
        }
    }
}
