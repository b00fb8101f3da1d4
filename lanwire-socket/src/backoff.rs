//! Reconnect delays for client sessions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Linear backoff with a floor for the first retry and a hard cap.
///
/// Attempt `0` waits `first`, attempt `n` waits `interval * n` but never less
/// than `first`, and nothing ever waits longer than `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(with = "secs")]
    pub first: Duration,
    #[serde(with = "secs")]
    pub interval: Duration,
    #[serde(with = "secs")]
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(2),
            interval: Duration::from_secs(5),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let linear = self.interval.saturating_mul(attempt);
        linear.max(self.first).min(self.max)
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let b = Backoff::default();
        assert_eq!(b.delay(0), Duration::from_secs(2));
        assert_eq!(b.delay(1), Duration::from_secs(5));
        assert_eq!(b.delay(3), Duration::from_secs(15));
        assert_eq!(b.delay(100), Duration::from_secs(30));
    }

    #[test]
    fn test_monotonic_and_capped() {
        let b = Backoff::default();
        let mut prev = Duration::ZERO;
        for attempt in 0..1000 {
            let d = b.delay(attempt);
            assert!(d >= prev);
            assert!(d <= b.max);
            prev = d;
        }
        assert_eq!(b.delay(u32::MAX), b.max);
    }

    #[test]
    fn test_first_above_max_is_capped() {
        let b = Backoff {
            first: Duration::from_secs(60),
            interval: Duration::from_secs(1),
            max: Duration::from_secs(10),
        };
        assert_eq!(b.delay(0), Duration::from_secs(10));
    }

    #[test]
    fn test_json_seconds() {
        let b: Backoff = serde_json::from_str(r#"{"first":1,"interval":2,"max":8}"#).unwrap();
        assert_eq!(b.delay(2), Duration::from_secs(4));
    }
}
