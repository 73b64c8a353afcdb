//! Wall-clock access and the time buckets that scope quota counters and
//! send records. Buckets are always derived in UTC.

use std::sync::Mutex;

use time::{Duration, OffsetDateTime};

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that only moves when told to. Used by tests and replays.
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: OffsetDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `YYYY-MM-DD` of the UTC date.
pub fn date_bucket(at: OffsetDateTime) -> String {
    let utc = at.to_offset(time::UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02}",
        utc.year(),
        u8::from(utc.month()),
        utc.day()
    )
}

/// UTC hour, unpadded: `"0"`..`"23"`.
pub fn hour_bucket(at: OffsetDateTime) -> String {
    at.to_offset(time::UtcOffset::UTC).hour().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn buckets_are_utc() {
        let t = datetime!(2024-03-09 23:30 -2);
        assert_eq!(date_bucket(t), "2024-03-10");
        assert_eq!(hour_bucket(t), "1");
    }

    #[test]
    fn hour_bucket_is_unpadded() {
        assert_eq!(hour_bucket(datetime!(2024-01-01 07:59 UTC)), "7");
        assert_eq!(hour_bucket(datetime!(2024-01-01 00:00 UTC)), "0");
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(datetime!(2024-01-01 14:59 UTC));
        clock.advance(Duration::minutes(1));
        assert_eq!(hour_bucket(clock.now()), "15");
    }
}
