use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local, TimeZone, Utc};
use parking_lot::{const_mutex, Mutex};

use crate::hal::helper;

/* chrono's Local offset lookup goes through the C runtime's timezone state */
static LOCALTIME_LOCK: Mutex<()> = const_mutex(());

/// Converts Unix seconds to local calendar time.
///
/// Only the conversion itself is serialized; callers format outside the lock.
pub fn localtime(unix_s: i64) -> Option<DateTime<Local>> {
    let _guard = LOCALTIME_LOCK.lock();
    Local.timestamp_opt(unix_s, 0).single()
}

/// `%c` rendition of a Unix timestamp in local time, for console diagnostics.
pub fn ascii_time(unix_s: i64) -> String {
    match localtime(unix_s) {
        Some(t) => t.format("%c").to_string(),
        None => String::from("(invalid time)"),
    }
}

/// Wall clock in microseconds since the Unix epoch.
pub fn curr_timestamp_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Process-local monotonic counter in microseconds.
///
/// This is the "internal" clock reported as `tmst` and used to schedule
/// timestamped downlinks; it is unaffected by wall clock steps.
pub fn monotonic_us() -> u64 {
    helper::monotonic_us()
}

/// RFC 3339 UTC with microseconds, e.g. `2024-05-01T10:20:30.000042Z`.
pub fn iso8601_utc_extended(unix_us: u64) -> String {
    let secs = (unix_us / 1_000_000) as i64;
    let nanos = ((unix_us % 1_000_000) * 1000) as u32;
    match Utc.timestamp_opt(secs, nanos).single() {
        Some(t) => t.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
        None => String::from("1970-01-01T00:00:00.000000Z"),
    }
}

/// Timestamp format of the `stat` report, e.g. `2024-05-01 10:20:30 GMT`.
pub fn stat_time(unix_s: i64) -> String {
    match Utc.timestamp_opt(unix_s, 0).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S GMT").to_string(),
        None => String::from("1970-01-01 00:00:00 GMT"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn iso8601_keeps_microseconds() {
        assert_eq!(iso8601_utc_extended(1_714_558_830_000_042), "2024-05-01T10:20:30.000042Z");
        assert_eq!(iso8601_utc_extended(0), "1970-01-01T00:00:00.000000Z");
    }

    #[test]
    fn stat_time_is_utc() {
        assert_eq!(stat_time(1_714_558_830), "2024-05-01 10:20:30 GMT");
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_us();
        std::thread::sleep(Duration::from_millis(2));
        let b = monotonic_us();
        assert!(b >= a + 2000);
    }

    #[test]
    fn localtime_is_shared_between_threads() {
        let handles: Vec<_> = (0..4)
            .map(|i| std::thread::spawn(move || localtime(1_700_000_000 + i).map(|t| t.timestamp())))
            .collect();
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.join().unwrap(), Some(1_700_000_000 + i as i64));
        }
    }
}
