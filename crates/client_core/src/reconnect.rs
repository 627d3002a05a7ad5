use std::time::Duration;

const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_MULTIPLIER: u32 = 2;
const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Backoff schedule used after the event channel drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Reload the active conversation once the channel is back.
    pub resync_on_reconnect: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            resync_on_reconnect: true,
        }
    }
}

impl ReconnectPolicy {
    /// Never reconnect; a dropped channel ends the session.
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(0),
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt `attempt` (zero-based), or `None` once
    /// the attempts are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        let delay = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}
