use std::time::Duration;

use crate::config::Settings;

/// Fixed-delay retry policy applied after a transport loss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// Attempts per loss episode (0 disables reconnection)
    pub max_attempts: u32,
    /// Delay before every attempt
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.max_reconnect_attempts,
            delay: settings.reconnect_interval(),
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }
}
