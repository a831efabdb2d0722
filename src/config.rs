use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

use crate::clock::{HOUR, Ms, SECOND};

/// Reservation rules the engine enforces.
#[derive(Debug, Clone)]
pub struct BookingPolicy {
    /// Lifetime of a hold from its latest acquire.
    pub hold_ttl_ms: Ms,
    /// Cancellations closer than this to the session start are refused.
    pub min_cancel_notice_ms: Ms,
    /// Facility-local offset used to interpret session wall-clock times.
    pub utc_offset: FixedOffset,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            hold_ttl_ms: 5 * 60 * SECOND,
            min_cancel_notice_ms: 24 * HOUR,
            utc_offset: Utc.fix(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub reaper_interval: Duration,
    pub policy: BookingPolicy,
}

impl Config {
    /// Read `SWIMBOOK_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = BookingPolicy::default();
        let offset_minutes: i32 = env_or("SWIMBOOK_UTC_OFFSET_MINUTES", 0);
        let utc_offset = FixedOffset::east_opt(offset_minutes * 60).unwrap_or_else(|| {
            tracing::warn!("SWIMBOOK_UTC_OFFSET_MINUTES={offset_minutes} out of range, using UTC");
            defaults.utc_offset
        });

        Self {
            bind: env_or("SWIMBOOK_BIND", "0.0.0.0".to_string()),
            port: env_or("SWIMBOOK_PORT", 5480),
            data_dir: PathBuf::from(env_or("SWIMBOOK_DATA_DIR", "./data".to_string())),
            metrics_port: std::env::var("SWIMBOOK_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            max_connections: env_or("SWIMBOOK_MAX_CONNECTIONS", 256),
            compact_threshold: env_or("SWIMBOOK_COMPACT_THRESHOLD", 1000),
            reaper_interval: Duration::from_secs(env_or("SWIMBOOK_REAPER_INTERVAL_SECS", 5)),
            policy: BookingPolicy {
                hold_ttl_ms: positive_or("SWIMBOOK_HOLD_TTL_SECS", defaults.hold_ttl_ms / SECOND)
                    * SECOND,
                min_cancel_notice_ms: env_or::<i64>("SWIMBOOK_CANCEL_NOTICE_HOURS", 24) * HOUR,
                utc_offset,
            },
        }
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("swimbook.wal")
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Like `env_or`, but zero or negative values are rejected.
fn positive_or(key: &str, default: i64) -> i64 {
    let value = env_or(key, default);
    if value > 0 {
        return value;
    }
    tracing::warn!("{key}={value} must be positive, using {default}");
    default
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_checkout_window() {
        let p = BookingPolicy::default();
        assert_eq!(p.hold_ttl_ms, 300_000);
        assert_eq!(p.min_cancel_notice_ms, 24 * 3_600_000);
        assert_eq!(p.utc_offset.local_minus_utc(), 0);
    }

    #[test]
    fn unparsable_values_fall_back() {
        // SAFETY: tests in this module are the only readers of this key.
        unsafe { std::env::set_var("SWIMBOOK_TEST_BAD_NUMBER", "five") };
        assert_eq!(env_or("SWIMBOOK_TEST_BAD_NUMBER", 7u32), 7);
        assert_eq!(env_or("SWIMBOOK_TEST_MISSING_KEY", 9u32), 9);
    }

    #[test]
    fn non_positive_ttl_falls_back() {
        // SAFETY: tests in this module are the only readers of these keys.
        unsafe {
            std::env::set_var("SWIMBOOK_TEST_TTL_ZERO", "0");
            std::env::set_var("SWIMBOOK_TEST_TTL_NEGATIVE", "-30");
            std::env::set_var("SWIMBOOK_TEST_TTL_OK", "90");
        }
        assert_eq!(positive_or("SWIMBOOK_TEST_TTL_ZERO", 300), 300);
        assert_eq!(positive_or("SWIMBOOK_TEST_TTL_NEGATIVE", 300), 300);
        assert_eq!(positive_or("SWIMBOOK_TEST_TTL_OK", 300), 90);
    }
}
