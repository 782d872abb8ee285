//! Exponential backoff shared by the connection and per-session reconnects.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// `delay(n) = min(base * factor^(n-1), max)` for the n-th attempt (1-based),
/// giving up after `max_retries` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base: Duration,
    pub factor: f64,
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max: Duration,
    pub max_retries: u32,
}

impl BackoffPolicy {
    /// Fast policy for the physical connection: 100ms, x2, capped at 2s, 20 tries.
    pub const fn transport() -> Self {
        Self {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_millis(2000),
            max_retries: 20,
        }
    }

    /// Slower policy for re-issuing one session's connect: 500ms, x2, capped at 10s, 10 tries.
    pub const fn session() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_millis(10_000),
            max_retries: 10,
        }
    }

    /// Delay before attempt `attempt` (1-based). Attempt 0 is treated as 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.base.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;
        let raw = base_ms * self.factor.max(1.0).powi(exponent);
        // powi overflows to inf long before u64 does; min() handles both
        let ms = if raw.is_finite() { raw.min(max_ms) } else { max_ms };
        Duration::from_millis(ms.round() as u64)
    }

    /// Whether `attempts` already made exhaust the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_retries
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::transport()
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(d: Duration) -> u64 {
        d.as_millis() as u64
    }

    #[test]
    fn session_sequence() {
        let policy = BackoffPolicy::session();
        let delays: Vec<u64> = (1..=5).map(|n| ms(policy.delay(n))).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000]);
        assert_eq!(ms(policy.delay(10)), 10_000);
    }

    #[test]
    fn transport_sequence() {
        let policy = BackoffPolicy::transport();
        let delays: Vec<u64> = (1..=6).map(|n| ms(policy.delay(n))).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 2000]);
        assert_eq!(ms(policy.delay(20)), 2000);
    }

    #[test]
    fn zeroth_attempt_uses_base() {
        assert_eq!(ms(BackoffPolicy::session().delay(0)), 500);
    }

    #[test]
    fn huge_attempt_stays_capped() {
        assert_eq!(ms(BackoffPolicy::transport().delay(u32::MAX)), 2000);
    }

    #[test]
    fn fractional_factor() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            factor: 1.5,
            max: Duration::from_secs(5),
            max_retries: 3,
        };
        assert_eq!(ms(policy.delay(3)), 225);
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
    }

    #[test]
    fn serde_uses_millis() {
        let json = serde_json::to_value(BackoffPolicy::session()).unwrap();
        assert_eq!(json["base_delay_ms"], 500);
        assert_eq!(json["max_delay_ms"], 10_000);
        let back: BackoffPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, BackoffPolicy::session());
    }
}
