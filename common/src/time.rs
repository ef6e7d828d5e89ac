//! Time utilities for the ledger.
//!
//! Timestamps are stored as UTC microseconds since the Unix epoch.

use chrono::{DateTime, Utc};

/// A timestamp with timezone (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp, truncated to storage precision.
pub fn now() -> Timestamp {
    let micros = Utc::now().timestamp_micros();
    from_micros(micros).unwrap_or_else(Utc::now)
}

/// Storage form of a timestamp.
pub fn to_micros(ts: Timestamp) -> i64 {
    ts.timestamp_micros()
}

/// Read a stored timestamp back.
pub fn from_micros(micros: i64) -> Option<Timestamp> {
    DateTime::from_timestamp_micros(micros)
}

/// The current time, but never earlier than `floor`.
///
/// Keeps per-account entry timestamps non-decreasing even if the wall clock steps back.
pub fn now_not_before(floor: Option<Timestamp>) -> Timestamp {
    let current = now();
    match floor {
        Some(floor) if floor > current => floor,
        _ => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_micros_round_trip() {
        let ts = now();
        assert_eq!(from_micros(to_micros(ts)), Some(ts));
    }

    #[test]
    fn test_now_not_before_future_floor() {
        let future = now() + Duration::seconds(30);
        assert_eq!(now_not_before(Some(future)), future);
    }

    #[test]
    fn test_now_not_before_past_floor() {
        let past = now() - Duration::seconds(30);
        assert!(now_not_before(Some(past)) > past);
        assert!(now_not_before(None) <= now());
    }
}
