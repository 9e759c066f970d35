//! Timestamp helpers.
//!
//! Every persisted timestamp in the data model carries millisecond
//! precision; sub-millisecond digits are truncated at creation so a record
//! serialized to the wire and re-parsed compares bit-exact.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};

/// Current UTC time, truncated to millisecond precision.
pub fn now_ms() -> DateTime<Utc> {
    truncate_ms(Utc::now())
}

/// Truncate a timestamp to millisecond precision.
pub fn truncate_ms(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::milliseconds(1)).unwrap_or(ts)
}

/// Serde adapter storing a `std::time::Duration` as whole seconds.
///
/// Used by configuration structs so durations stay readable in config
/// files.
pub mod serde_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as integer seconds.
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    /// Deserialize from integer seconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_drops_sub_millisecond_digits() {
        let ts = now_ms();
        assert_eq!(ts.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn truncation_is_idempotent() {
        let ts = now_ms();
        assert_eq!(truncate_ms(ts), ts);
    }
}
