use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, FixedOffset, NaiveDateTime};

/// Unix milliseconds. Hold timestamps use this; session times are wall-clock.
pub type Ms = i64;

pub const SECOND: Ms = 1_000;
pub const MINUTE: Ms = 60 * SECOND;
pub const HOUR: Ms = 60 * MINUTE;

/// Source of "now" for expiry and cancellation-notice checks.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as Ms)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Ms) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    /// Start at a UTC wall-clock instant.
    pub fn at(utc: NaiveDateTime) -> Self {
        Self::new(utc.and_utc().timestamp_millis())
    }

    pub fn advance(&self, by: Ms) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }

    pub fn set(&self, now: Ms) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}

/// Convert a Unix-ms instant into facility-local wall-clock time.
pub fn to_local(now: Ms, offset: FixedOffset) -> NaiveDateTime {
    DateTime::from_timestamp_millis(now)
        .unwrap_or_default()
        .with_timezone(&offset)
        .naive_local()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(5 * MINUTE);
        assert_eq!(clock.now_ms(), 1_000 + 300_000);
        clock.set(42);
        assert_eq!(clock.now_ms(), 42);
    }

    #[test]
    fn local_time_applies_offset() {
        let utc = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(20, 0, 0)
            .unwrap();
        let clock = ManualClock::at(utc);
        let pacific = FixedOffset::west_opt(8 * 3600).unwrap();
        let local = to_local(clock.now_ms(), pacific);
        assert_eq!(local, utc - chrono::TimeDelta::hours(8));
    }
}
