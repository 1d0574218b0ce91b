//! Attempt-budgeted exponential back-off.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{PfsError, Result};

/// Back-off schedule for one operation.
///
/// The first wait is `init_wait`, each subsequent wait doubles up to
/// `max_wait`. `next_wait` returns `None` once `max_attempts` attempts have
/// been made.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max_wait: Duration,
    current_wait: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(init_wait: Duration, max_wait: Duration, max_attempts: u32) -> Self {
        Self {
            max_wait,
            current_wait: init_wait,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_initial_backoff_ms),
            Duration::from_millis(config.retry_max_backoff_ms),
            config.max_attempts,
        )
    }

    /// Record an attempt. Returns how long to wait before the next one, or
    /// `None` when the attempt budget is spent.
    pub fn next_wait(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return None;
        }
        let wait = self.current_wait;
        self.current_wait = (self.current_wait * 2).min(self.max_wait);
        Some(wait)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// back-off budget runs out. The last error is returned.
pub async fn with_retries<T, F, Fut>(mut backoff: ExponentialBackoff, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        let err: PfsError = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !err.is_retryable() {
            return Err(err);
        }
        match backoff.next_wait() {
            Some(wait) => {
                debug!(attempt = backoff.attempts(), ?wait, error = %err, "retrying");
                tokio::time::sleep(wait).await;
            }
            None => return Err(err),
        }
    }
}
