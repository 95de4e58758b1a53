use std::future::Future;
use std::time::Duration;

use crate::EmbedError;

/// Retry schedule for calls to the embedding service.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before each retry. The last entry repeats if there are more
    /// retries than entries.
    pub backoff: Vec<Duration>,
    retryable: fn(&EmbedError) -> bool,
}

/// Only an unavailable service is worth retrying. Timeouts already spent
/// their budget, and bad input will not improve.
pub fn is_transient(err: &EmbedError) -> bool {
    matches!(err, EmbedError::ServiceUnavailable(_))
}

impl Default for RetryPolicy {
    /// One retry after 500 ms.
    fn default() -> Self {
        Self::new(2, vec![Duration::from_millis(500)])
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retryable: is_transient,
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Vec::new())
    }

    pub fn with_predicate(mut self, retryable: fn(&EmbedError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Whether a failure on attempt `attempt` (1-based) should be retried.
    pub fn should_retry(&self, err: &EmbedError, attempt: u32) -> bool {
        attempt < self.max_attempts && (self.retryable)(err)
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let idx = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(idx)
            .or(self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, EmbedError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, EmbedError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if self.should_retry(&err, attempt) => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(attempt, ?delay, error = %err, "embedding call failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
