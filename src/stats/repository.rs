//! Named sample storage and the metrics-provider capability
//!
//! A [`StatsRepository`] always keeps its samples in memory, in rolling
//! windows, so the load balancer can consult them. When a [`StatsReceiver`] is
//! configured every sample is also forwarded to it under a qualified name and
//! gauges are registered with it; otherwise nothing leaves the process.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use super::window::{Aggregate, TimeWindowedSample};
use crate::transport::Endpoint;

/// A value read on demand by a metrics backend
pub type Gauge = Box<dyn Fn() -> f64 + Send + Sync>;

/// Metrics-provider capability: named gauges and timestamped samples
pub trait StatsReceiver: Send + Sync {
    fn add_gauge(&self, name: &str, gauge: Gauge);

    fn add_sample(&self, name: &str, value: i64, at: SystemTime);
}

/// Label for one host's published stats: `{name}_{host}:{port}`, or none
/// when the client is unnamed. Unlabelled hosts of one client publish under
/// the same names.
pub fn host_label(name: Option<&str>, endpoint: &Endpoint) -> Option<String> {
    name.map(|name| format!("{}_{}", name, endpoint))
}

/// Rolling samples for one host, optionally mirrored to a [`StatsReceiver`]
pub struct StatsRepository {
    label: Option<String>,
    bucket_count: usize,
    granularity: Duration,
    samples: Mutex<HashMap<String, Arc<TimeWindowedSample>>>,
    receiver: Option<Arc<dyn StatsReceiver>>,
}

impl StatsRepository {
    /// Internal-only repository; nothing is published
    pub fn in_memory(bucket_count: usize, granularity: Duration) -> Self {
        Self {
            label: None,
            bucket_count,
            granularity,
            samples: Mutex::new(HashMap::new()),
            receiver: None,
        }
    }

    /// Repository publishing to `receiver` under `label`
    pub fn with_receiver(
        bucket_count: usize,
        granularity: Duration,
        receiver: Arc<dyn StatsReceiver>,
        label: Option<String>,
    ) -> Self {
        Self {
            label,
            receiver: Some(receiver),
            ..Self::in_memory(bucket_count, granularity)
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn is_published(&self) -> bool {
        self.receiver.is_some()
    }

    /// Fully qualified metric name as published
    pub fn qualified(&self, metric: &str) -> String {
        match &self.label {
            Some(label) => format!("{}/{}", label, metric),
            None => metric.to_string(),
        }
    }

    /// The rolling sample for `metric`, created on first use
    pub fn sample(&self, metric: &str) -> Arc<TimeWindowedSample> {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(samples.entry(metric.to_string()).or_insert_with(|| {
            Arc::new(TimeWindowedSample::new(self.bucket_count, self.granularity))
        }))
    }

    pub fn add(&self, metric: &str, value: i64) {
        self.sample(metric).add(value);
        if let Some(receiver) = &self.receiver {
            receiver.add_sample(&self.qualified(metric), value, SystemTime::now());
        }
    }

    pub fn incr(&self, metric: &str) {
        self.add(metric, 1);
    }

    /// Windowed aggregate for `metric`; empty if never recorded
    pub fn snapshot(&self, metric: &str) -> Aggregate {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        samples
            .get(metric)
            .map(|sample| sample.snapshot())
            .unwrap_or_default()
    }

    /// Register a gauge with the receiver, if any
    pub fn register_gauge(&self, metric: &str, gauge: Gauge) {
        if let Some(receiver) = &self.receiver {
            receiver.add_gauge(&self.qualified(metric), gauge);
        }
    }
}

impl fmt::Debug for StatsRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsRepository")
            .field("label", &self.label)
            .field("bucket_count", &self.bucket_count)
            .field("granularity", &self.granularity)
            .field("published", &self.receiver.is_some())
            .finish()
    }
}

/// Totals received for one sample name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRecord {
    pub count: u64,
    pub sum: i64,
    pub last: i64,
    pub last_at: SystemTime,
}

/// [`StatsReceiver`] that keeps everything in memory
#[derive(Default)]
pub struct MemoryReceiver {
    gauges: Mutex<HashMap<String, Gauge>>,
    samples: Mutex<HashMap<String, SampleRecord>>,
}

impl MemoryReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a registered gauge
    pub fn gauge(&self, name: &str) -> Option<f64> {
        let gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
        gauges.get(name).map(|gauge| gauge())
    }

    pub fn gauge_names(&self) -> Vec<String> {
        let gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = gauges.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn sample(&self, name: &str) -> Option<SampleRecord> {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        samples.get(name).copied()
    }

    pub fn sample_names(&self) -> Vec<String> {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = samples.keys().cloned().collect();
        names.sort();
        names
    }
}

impl StatsReceiver for MemoryReceiver {
    fn add_gauge(&self, name: &str, gauge: Gauge) {
        let mut gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
        gauges.insert(name.to_string(), gauge);
    }

    fn add_sample(&self, name: &str, value: i64, at: SystemTime) {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        samples
            .entry(name.to_string())
            .and_modify(|record| {
                record.count += 1;
                record.sum = record.sum.saturating_add(value);
                record.last = value;
                record.last_at = at;
            })
            .or_insert(SampleRecord {
                count: 1,
                sum: value,
                last: value,
                last_at: at,
            });
    }
}

impl fmt::Debug for MemoryReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryReceiver")
            .field("gauges", &self.gauge_names())
            .field("samples", &self.sample_names())
            .finish()
    }
}
