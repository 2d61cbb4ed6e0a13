use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Recovery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectionConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectionConfig {
    /// Backoff before `attempt`.
    ///
    /// Attempt 0 and 1 both wait the base delay; after that the delay
    /// doubles per attempt up to `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(self.base_delay_ms);
        }
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 1_000)]
    #[case(1, 1_000)]
    #[case(2, 2_000)]
    #[case(3, 4_000)]
    #[case(4, 8_000)]
    #[case(5, 16_000)]
    #[case(6, 30_000)]
    #[case(64, 30_000)]
    #[case(u32::MAX, 30_000)]
    fn test_backoff_schedule(#[case] attempt: u32, #[case] expected_ms: u64) {
        let config = ReconnectionConfig::default();
        assert_eq!(config.delay_for_attempt(attempt), Duration::from_millis(expected_ms));
    }
}
