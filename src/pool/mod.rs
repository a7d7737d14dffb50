//! Connection pooling module
//!
//! This module provides:
//! - A bounded, time-to-live idle cache with a shared reaper timer
//! - A caching pool that reuses released connections instead of reconnecting
//! - Dispatch pooling that turns a connection factory into a shared dispatcher

pub mod cache;
pub mod caching;
pub mod dispatch;

pub use cache::TtlCache;
pub use caching::{
    CachingPool, CachingPoolLayer, CachingPoolStats, DEFAULT_CACHE_SIZE, DEFAULT_CACHE_TTL,
};
pub use dispatch::{DispatchPool, DispatchPoolLayer};
