use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: u64,
}

impl RetryConfig {
    /// Un-jittered delay before attempt `attempts_made + 1`, capped at `max_delay_ms`.
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1);
        let delay_ms = self
            .backoff_multiplier
            .checked_pow(exponent)
            .and_then(|factor| self.initial_delay_ms.checked_mul(factor))
            .unwrap_or(self.max_delay_ms);

        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}
