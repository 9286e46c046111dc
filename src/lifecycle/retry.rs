//! Bounded retries with exponential backoff for runtime calls.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::LifecycleConfig;
use crate::container::ContainerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LifecycleConfig) -> Self {
        Self {
            attempts: config.start_retries.max(1),
            initial_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ContainerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ContainerError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !is_transient(&e) || attempt >= self.attempts => return Err(e),
                Err(e) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what, attempt, self.attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&LifecycleConfig::default())
    }
}

/// Configuration mistakes and missing containers will not fix themselves.
fn is_transient(e: &ContainerError) -> bool {
    !matches!(
        e,
        ContainerError::ConfigError(_) | ContainerError::NotFound(_)
    )
}
