//! Quota-unit token bucket for the Gmail API
//!
//! Gmail meters each user in quota units per second (250 by default).
//! Reads such as `messages.get` or `labels.list` are charged as 5 units,
//! mutations (`labels.create`, `messages.modify`) as 50, and push
//! subscription calls as 100. Callers wait for units instead of being
//! rejected with 429s.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default refill rate in units per second
pub const DEFAULT_UNITS_PER_SECOND: f64 = 250.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCost {
    /// messages.list, messages.get, labels.list, history.list
    Read,
    /// labels.create, messages.modify
    Write,
    /// users.watch, users.stop
    Watch,
    Custom(u32),
}

impl QuotaCost {
    pub fn units(&self) -> u32 {
        match self {
            QuotaCost::Read => 5,
            QuotaCost::Write => 50,
            QuotaCost::Watch => 100,
            QuotaCost::Custom(units) => *units,
        }
    }
}

/// Shared token bucket; clones draw from the same bucket
#[derive(Debug, Clone)]
pub struct QuotaRateLimiter {
    inner: Arc<Mutex<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    available: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
    total_consumed: u64,
    total_operations: u64,
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.available = (self.available + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn take(&mut self, units: f64) -> bool {
        if self.available < units {
            return false;
        }
        self.available -= units;
        self.total_consumed += units as u64;
        self.total_operations += 1;
        true
    }
}

impl QuotaRateLimiter {
    /// Gmail defaults: 250 units/s with two seconds of burst
    pub fn new() -> Self {
        Self::with_rate(DEFAULT_UNITS_PER_SECOND)
    }

    /// Refill at `units_per_second` with two seconds of burst capacity
    pub fn with_rate(units_per_second: f64) -> Self {
        Self::with_config(units_per_second, units_per_second * 2.0)
    }

    pub fn with_config(refill_rate: f64, capacity: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Bucket {
                available: capacity,
                capacity,
                refill_rate,
                last_refill: Instant::now(),
                total_consumed: 0,
                total_operations: 0,
            })),
        }
    }

    /// Take units for an operation, sleeping until the bucket has them.
    /// A cost larger than the bucket capacity is clamped to the capacity.
    pub async fn acquire(&self, cost: QuotaCost) {
        loop {
            let wait = {
                let mut bucket = self.inner.lock().await;
                bucket.refill();
                let units = (cost.units() as f64).min(bucket.capacity);
                trace!(
                    "Quota: {:.1}/{:.1} units available, requesting {:.0}",
                    bucket.available,
                    bucket.capacity,
                    units
                );
                if bucket.take(units) {
                    return;
                }
                Duration::from_secs_f64((units - bucket.available) / bucket.refill_rate)
            };

            debug!("Quota exhausted, waiting {:.2}s", wait.as_secs_f64());
            tokio::time::sleep(wait).await;
        }
    }

    /// Current bucket level and lifetime totals
    pub async fn stats(&self) -> QuotaStats {
        let mut bucket = self.inner.lock().await;
        bucket.refill();
        QuotaStats {
            available_units: bucket.available as u32,
            capacity: bucket.capacity as u32,
            total_consumed: bucket.total_consumed,
            total_operations: bucket.total_operations,
        }
    }
}

impl Default for QuotaRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaStats {
    pub available_units: u32,
    pub capacity: u32,
    pub total_consumed: u64,
    pub total_operations: u64,
}
