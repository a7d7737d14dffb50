//! Per-host rolling statistics
//!
//! # Components
//!
//! - [`TimeWindowedSample`]: rolling buckets sized from a window and a
//!   granularity (`bucket_count = window / granularity`, at least one)
//! - [`StatsRepository`]: named samples for one host, optionally mirrored to a
//!   [`StatsReceiver`]
//! - [`HostStats`]: in-flight count, health score and the repository for one
//!   host, consulted by the load balancer
//!
//! # Published names
//!
//! With a receiver configured, metrics are published as `{label}/{metric}`
//! where the label is `{name}_{host}:{port}` for named clients. Unnamed
//! clients publish bare metric names.

pub mod host;
pub mod repository;
pub mod window;

pub use host::{HostSnapshot, HostStats, DEFAULT_RETRY_INTERVAL, UNHEALTHY_THRESHOLD};
pub use repository::{host_label, Gauge, MemoryReceiver, SampleRecord, StatsReceiver, StatsRepository};
pub use window::{bucket_count, Aggregate, TimeWindowedSample, DEFAULT_GRANULARITY, DEFAULT_WINDOW};

/// Dispatches attempted
pub const REQUESTS: &str = "requests";
/// Dispatches that succeeded
pub const SUCCESS: &str = "success";
/// Dispatches that failed, with `failures/{kind}` alongside
pub const FAILURES: &str = "failures";
/// Dispatch latency in milliseconds
pub const LATENCY_MS: &str = "request_latency_ms";
/// Gauge: idle connections cached for the host
pub const CACHE_SIZE: &str = "connection_cache_size";
/// Gauge: dispatches in progress
pub const IN_FLIGHT: &str = "in_flight";
/// Gauge: host health score
pub const HEALTH_SCORE: &str = "health_score";
