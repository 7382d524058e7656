use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Two-tier flat backoff: a short delay for the first few consecutive failures,
/// then a longer one for every attempt after that. Never exponential.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    #[serde(with = "millis")]
    pub fast_delay: Duration,
    pub fast_attempts: u32,
    #[serde(with = "millis")]
    pub slow_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            fast_delay: Duration::from_secs(2),
            fast_attempts: 5,
            slow_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after the `attempt`-th consecutive failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= self.fast_attempts {
            self.fast_delay
        } else {
            self.slow_delay
        }
    }
}

/// Serialize a `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
