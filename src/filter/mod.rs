//! Dispatcher decorators applied on top of a pooled host
//!
//! - [`TimeoutFilter`]: fails requests that outlive the request timeout
//! - [`StatsFilter`]: records outcome, latency and health per host

pub mod stats;
pub mod timeout;

pub use stats::{StatsFilter, StatsLayer};
pub use timeout::{TimeoutAction, TimeoutFilter, TimeoutLayer};
