//! Amount + unit time values used for connection timeouts, request timeouts,
//! cache TTLs and the stats window/granularity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Unit a [`Timeout`] amount is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Length of one unit
    pub fn unit_duration(&self) -> Duration {
        match self {
            TimeUnit::Nanoseconds => Duration::from_nanos(1),
            TimeUnit::Microseconds => Duration::from_micros(1),
            TimeUnit::Milliseconds => Duration::from_millis(1),
            TimeUnit::Seconds => Duration::from_secs(1),
            TimeUnit::Minutes => Duration::from_secs(60),
            TimeUnit::Hours => Duration::from_secs(60 * 60),
            TimeUnit::Days => Duration::from_secs(24 * 60 * 60),
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            TimeUnit::Nanoseconds => "ns",
            TimeUnit::Microseconds => "us",
            TimeUnit::Milliseconds => "ms",
            TimeUnit::Seconds => "s",
            TimeUnit::Minutes => "m",
            TimeUnit::Hours => "h",
            TimeUnit::Days => "d",
        }
    }
}

/// An immutable `amount` of `unit`s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timeout {
    pub amount: u64,
    pub unit: TimeUnit,
}

impl Timeout {
    pub const fn new(amount: u64, unit: TimeUnit) -> Self {
        Self { amount, unit }
    }

    pub const fn millis(amount: u64) -> Self {
        Self::new(amount, TimeUnit::Milliseconds)
    }

    pub const fn seconds(amount: u64) -> Self {
        Self::new(amount, TimeUnit::Seconds)
    }

    pub const fn minutes(amount: u64) -> Self {
        Self::new(amount, TimeUnit::Minutes)
    }

    /// Convert to a [`Duration`], saturating at `Duration::MAX`
    pub fn duration(&self) -> Duration {
        let unit = self.unit.unit_duration();
        u32::try_from(self.amount)
            .ok()
            .and_then(|amount| unit.checked_mul(amount))
            .unwrap_or_else(|| {
                // Amounts beyond u32 go through nanoseconds
                let nanos = unit.as_nanos().saturating_mul(u128::from(self.amount));
                u64::try_from(nanos)
                    .map(Duration::from_nanos)
                    .unwrap_or(Duration::MAX)
            })
    }
}

impl From<Timeout> for Duration {
    fn from(timeout: Timeout) -> Self {
        timeout.duration()
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.unit.suffix())
    }
}
