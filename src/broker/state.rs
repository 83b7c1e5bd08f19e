//! Broker lifecycle
//!
//! `Starting -> Watching -> (Degraded <-> Watching) -> Stopped`. Degraded is
//! entered on a change feed error and left automatically when the feed
//! resumes. Stopped ends a run; only a fresh `ChangeBroker::start` leaves it.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{LiveError, LiveResult};

/// Broker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum BrokerState {
    /// Pipeline tasks spawned, feed not yet opened
    Starting,
    /// Following the change feed
    Watching,
    /// Feed failed; reconnecting with backoff
    Degraded {
        /// Consecutive failures so far
        attempt: u32,
    },
    /// Shut down or failed past the retry budget
    Stopped,
}

impl BrokerState {
    /// Move to `next`, rejecting transitions out of `Stopped`
    pub fn transition(self, next: BrokerState) -> LiveResult<BrokerState> {
        match (self, next) {
            (BrokerState::Stopped, BrokerState::Stopped) => Ok(next),
            (BrokerState::Stopped, _) => Err(LiveError::internal(format!(
                "illegal broker transition {} -> {}",
                self, next
            ))),
            (_, BrokerState::Starting) => Err(LiveError::internal(format!(
                "illegal broker transition {} -> {}",
                self, next
            ))),
            _ => Ok(next),
        }
    }

    pub fn is_watching(&self) -> bool {
        matches!(self, BrokerState::Watching)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, BrokerState::Degraded { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, BrokerState::Stopped)
    }
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerState::Starting => write!(f, "starting"),
            BrokerState::Watching => write!(f, "watching"),
            BrokerState::Degraded { attempt } => write!(f, "degraded (attempt {})", attempt),
            BrokerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Reconnect budget for the change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRetry {
    /// Consecutive failures tolerated before stopping
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    8
}

fn default_base_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    5000
}

impl Default for FeedRetry {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl FeedRetry {
    /// Pause after the `attempt`th consecutive failure (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(
            self.base_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }

    /// Whether the budget allows another reconnect after `attempt` failures
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let state = BrokerState::Starting;
        let state = state.transition(BrokerState::Watching).unwrap();
        let state = state.transition(BrokerState::Degraded { attempt: 1 }).unwrap();
        assert!(state.is_degraded());
        let state = state.transition(BrokerState::Watching).unwrap();
        let state = state.transition(BrokerState::Stopped).unwrap();
        assert!(state.is_stopped());

        assert!(state.transition(BrokerState::Watching).is_err());
        assert!(BrokerState::Watching.transition(BrokerState::Starting).is_err());
    }

    #[test]
    fn test_backoff_is_bounded() {
        let retry = FeedRetry {
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 250,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(9), Duration::from_millis(250));
        assert!(retry.allows(3));
        assert!(!retry.allows(4));
    }
}
