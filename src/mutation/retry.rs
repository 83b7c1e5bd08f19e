//! Caller-side retry for lock conflicts
//!
//! Only `Conflict` is retried; every other error is terminal for the call.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::LiveResult;

/// Bounded retry with exponential backoff and random jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    20
}

fn default_max_jitter_ms() -> u64 {
    20
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_jitter_ms: default_max_jitter_ms(),
        }
    }
}

impl RetryPolicy {
    /// Pause before the attempt following `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let jitter = if self.max_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.max_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_add(jitter))
    }
}

/// Run `op`, retrying `Conflict` failures per `policy`
pub async fn retry_on_conflict<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> LiveResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LiveResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < attempts => {
                let pause = policy.backoff(attempt);
                debug!(attempt, ?pause, "Retrying after conflict");
                tokio::time::sleep(pause).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
