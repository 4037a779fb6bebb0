//! Bounded remote calls: per-attempt timeout plus exponential backoff

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Deadline for each individual attempt
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Single attempt with a deadline and no retries
    pub fn once(timeout: Duration) -> Self {
        Self {
            max_retries: 0,
            timeout,
            ..Self::default()
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of retries.
///
/// Only transient errors are retried. A rate-limit error waits at least its
/// `retry_after` before the next attempt.
pub async fn with_retry<T, F, Fut>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = policy.initial_delay;
    let mut attempts = 0;

    loop {
        attempts += 1;
        let outcome = match tokio::time::timeout(policy.timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(format!(
                "{} exceeded {:?}",
                operation_name, policy.timeout
            ))),
        };

        match outcome {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempts <= policy.max_retries => {
                let wait = match &e {
                    PipelineError::RateLimitExceeded { retry_after } => {
                        delay.max(Duration::from_secs(*retry_after))
                    }
                    _ => delay,
                };
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name,
                    attempts,
                    policy.max_retries + 1,
                    e,
                    wait
                );
                tokio::time::sleep(wait).await;
                delay = std::cmp::min(delay * 2, policy.max_delay);
            }
            Err(e) => return Err(e),
        }
    }
}
