//! Rolling time-windowed sample buckets
//!
//! A window is split into `bucket_count` slots of `granularity` each. Values
//! land in the slot for the current time; slots older than the window are
//! recycled as time moves forward. Every update happens under one mutex, so
//! concurrent increments are never lost even though bucket boundaries are
//! only as precise as the moment the lock is taken.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::timeout::Timeout;

/// Default span of retained statistics
pub const DEFAULT_WINDOW: Timeout = Timeout::minutes(10);

/// Default size of one bucket
pub const DEFAULT_GRANULARITY: Timeout = Timeout::seconds(10);

/// Number of buckets needed to cover `window` at `granularity`
///
/// Fails when the window cannot hold one full bucket.
pub fn bucket_count(window: Duration, granularity: Duration) -> Result<usize> {
    if granularity.is_zero() {
        return Err(Error::config("sample granularity must be greater than zero"));
    }
    if window < granularity {
        return Err(Error::config(format!(
            "sample window ({:?}) is smaller than sample granularity ({:?})",
            window, granularity
        )));
    }

    let count = window.as_nanos() / granularity.as_nanos();
    Ok(usize::try_from(count).unwrap_or(usize::MAX).max(1))
}

/// Aggregated values over some span
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aggregate {
    pub count: u64,
    pub sum: i64,
    pub min: i64,
    pub max: i64,
}

impl Aggregate {
    fn add(&mut self, value: i64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum = self.sum.saturating_add(value);
    }

    fn merge(&mut self, other: &Aggregate) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.count += other.count;
        self.sum = self.sum.saturating_add(other.sum);
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / self.count as f64)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    slot: u64,
    aggregate: Aggregate,
}

/// One named sample kept over a rolling window
#[derive(Debug)]
pub struct TimeWindowedSample {
    origin: Instant,
    granularity: Duration,
    buckets: Mutex<Vec<Bucket>>,
}

impl TimeWindowedSample {
    pub fn new(bucket_count: usize, granularity: Duration) -> Self {
        let bucket_count = bucket_count.max(1);
        Self {
            origin: Instant::now(),
            granularity: granularity.max(Duration::from_nanos(1)),
            buckets: Mutex::new(vec![Bucket::default(); bucket_count]),
        }
    }

    /// Build a sample covering `window` in `granularity` sized buckets
    pub fn with_window(window: Duration, granularity: Duration) -> Result<Self> {
        Ok(Self::new(bucket_count(window, granularity)?, granularity))
    }

    fn current_slot(&self) -> u64 {
        let elapsed = Instant::now().saturating_duration_since(self.origin);
        u64::try_from(elapsed.as_nanos() / self.granularity.as_nanos()).unwrap_or(u64::MAX)
    }

    pub fn add(&self, value: i64) {
        let slot = self.current_slot();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let len = buckets.len() as u64;
        let bucket = &mut buckets[(slot % len) as usize];
        if bucket.slot != slot {
            *bucket = Bucket {
                slot,
                aggregate: Aggregate::default(),
            };
        }
        bucket.aggregate.add(value);
    }

    pub fn incr(&self) {
        self.add(1);
    }

    /// Aggregate of every bucket still inside the window
    pub fn snapshot(&self) -> Aggregate {
        let slot = self.current_slot();
        let buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let oldest = slot.saturating_sub(buckets.len() as u64 - 1);

        let mut total = Aggregate::default();
        for bucket in buckets.iter() {
            if bucket.slot >= oldest && bucket.slot <= slot {
                total.merge(&bucket.aggregate);
            }
        }
        total
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn granularity(&self) -> Duration {
        self.granularity
    }
}
