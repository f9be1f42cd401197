use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded exponential backoff for transient model failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether another attempt is allowed after `attempt` failed (1-based)
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based).
    ///
    /// A server hint wins over the computed backoff; both are capped at
    /// `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32, hint_ms: Option<u64>) -> Duration {
        let ms = match hint_ms {
            Some(hint) => hint,
            None => {
                let exp = attempt.saturating_sub(1).min(32);
                self.base_delay_ms.saturating_mul(1u64 << exp)
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}
