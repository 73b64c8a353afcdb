use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::clock::{date_bucket, hour_bucket, Clock};
use crate::error::PersistenceError;

pub const DEFAULT_HOURLY_LIMIT: u32 = 25;
pub const DEFAULT_DAILY_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaLimits {
    pub hourly: u32,
    pub daily: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            hourly: DEFAULT_HOURLY_LIMIT,
            daily: DEFAULT_DAILY_LIMIT,
        }
    }
}

/// Stored counts for one (date, hour) pair. A bucket never written reads as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketCounts {
    pub hourly: u32,
    pub daily: u32,
}

pub trait CounterStore: Send + Sync {
    fn read_counts(&self, date: &str, hour: &str) -> Result<BucketCounts, PersistenceError>;

    /// Increments both counters iff both are below their limits, as one
    /// atomic step. Returns whether the increment happened.
    fn try_increment(
        &self,
        date: &str,
        hour: &str,
        limits: QuotaLimits,
    ) -> Result<bool, PersistenceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capacity {
    pub hourly_remaining: u32,
    pub daily_remaining: u32,
}

impl Capacity {
    pub fn is_exhausted(&self) -> bool {
        self.hourly_remaining == 0 || self.daily_remaining == 0
    }
}

/// Rolling hourly and daily send ceilings. Nothing is cached: every call
/// reads the counters for the clock's current buckets, so a rolled-over hour
/// or day simply starts from an empty bucket.
#[derive(Clone)]
pub struct QuotaTracker {
    counters: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    limits: QuotaLimits,
}

impl QuotaTracker {
    pub fn new(counters: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, limits: QuotaLimits) -> Self {
        Self {
            counters,
            clock,
            limits,
        }
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    pub fn check_capacity(&self) -> Result<Capacity, PersistenceError> {
        let now = self.clock.now();
        let counts = self
            .counters
            .read_counts(&date_bucket(now), &hour_bucket(now))?;
        Ok(Capacity {
            hourly_remaining: self.limits.hourly.saturating_sub(counts.hourly),
            daily_remaining: self.limits.daily.saturating_sub(counts.daily),
        })
    }

    pub fn try_reserve(&self) -> Result<bool, PersistenceError> {
        let now = self.clock.now();
        let (date, hour) = (date_bucket(now), hour_bucket(now));
        let reserved = self.counters.try_increment(&date, &hour, self.limits)?;
        debug!(date = %date, hour = %hour, reserved, "quota reservation");
        Ok(reserved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::SqliteStore;
    use time::macros::datetime;
    use time::Duration;

    fn tracker(limits: QuotaLimits) -> (QuotaTracker, Arc<ManualClock>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-02 14:10 UTC)));
        (QuotaTracker::new(store, clock.clone(), limits), clock)
    }

    #[test]
    fn reserve_never_overcommits() {
        let (quota, _) = tracker(QuotaLimits { hourly: 3, daily: 10 });
        let granted = (0..10).filter(|_| quota.try_reserve().unwrap()).count();
        assert_eq!(granted, 3);
        let cap = quota.check_capacity().unwrap();
        assert_eq!(cap.hourly_remaining, 0);
        assert_eq!(cap.daily_remaining, 7);
        assert!(cap.is_exhausted());
    }

    #[test]
    fn hour_rollover_resets_hourly_only() {
        let (quota, clock) = tracker(QuotaLimits::default());
        for _ in 0..25 {
            assert!(quota.try_reserve().unwrap());
        }
        assert!(!quota.try_reserve().unwrap());

        clock.advance(Duration::hours(1));
        let cap = quota.check_capacity().unwrap();
        assert_eq!(cap.hourly_remaining, 25);
        assert_eq!(cap.daily_remaining, 75);
    }

    #[test]
    fn daily_limit_holds_across_hours() {
        let (quota, clock) = tracker(QuotaLimits { hourly: 2, daily: 3 });
        assert!(quota.try_reserve().unwrap());
        assert!(quota.try_reserve().unwrap());
        clock.advance(Duration::hours(1));
        assert!(quota.try_reserve().unwrap());
        assert!(!quota.try_reserve().unwrap());

        clock.set(datetime!(2024-05-03 00:05 UTC));
        assert_eq!(
            quota.check_capacity().unwrap(),
            Capacity {
                hourly_remaining: 2,
                daily_remaining: 3
            }
        );
    }
}
