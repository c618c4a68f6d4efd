//! Reconnect backoff schedule.
//!
//! Pure timing math kept apart from the session worker: the worker owns
//! the actual deadlines so that `disable()` can cancel them, while this
//! type only answers "how long until the next attempt".

use std::cmp;
use std::time::Duration;

const BASE_DELAY_SECS: u64 = 5;
const MAX_DELAY_SECS: u64 = 60;

/// Bounds of the exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(BASE_DELAY_SECS),
            max_delay: Duration::from_secs(MAX_DELAY_SECS),
        }
    }
}

/// Doubling backoff with a cap. Resets to the base delay after a
/// successful connection so a later outage starts over from the bottom.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current: Duration,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current: cmp::min(config.base_delay, config.max_delay),
            config,
        }
    }

    /// Delay to wait after a failed connect cycle. Each call doubles the
    /// following delay, clamped to the configured maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = cmp::min(delay.saturating_mul(2), self.config.max_delay);
        delay
    }

    /// Restores the base delay. Called after a successful handshake.
    pub fn reset(&mut self) {
        self.current = cmp::min(self.config.base_delay, self.config.max_delay);
    }

    /// Delay the next failure would produce, without consuming it.
    pub fn current_delay(&self) -> Duration {
        self.current
    }
}
