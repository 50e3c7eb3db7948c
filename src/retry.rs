use std::future::Future;
use std::time::Duration;

use crate::config::RetryPolicy;
use crate::error::StoreError;

#[cfg(test)]
#[path = "retry_tests.rs"]
mod retry_tests;

/// Attempt counter for one step under a [`RetryPolicy`].
#[derive(Debug, Clone, Copy)]
pub struct Attempts {
    policy: RetryPolicy,
    attempt: u32,
}

impl Attempts {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 1 }
    }

    /// The attempt currently being made, starting at 1.
    pub fn current(&self) -> u32 {
        self.attempt
    }

    /// Backoff before the next attempt after a failure, or `None` once the
    /// failure is permanent or the attempts are used up.
    pub fn next_backoff(&mut self, transient: bool) -> Option<Duration> {
        if !transient || self.attempt >= self.policy.max_attempts {
            return None;
        }
        let backoff = self.policy.backoff(self.attempt);
        self.attempt += 1;
        Some(backoff)
    }

    pub fn reset(&mut self) {
        self.attempt = 1;
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are used up. `on_retry` sees each transient failure
/// before the backoff sleep.
pub async fn retry_store<T, F, Fut, R>(
    policy: &RetryPolicy,
    what: &'static str,
    mut op: F,
    mut on_retry: R,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
    R: FnMut(u32, &StoreError),
{
    let mut attempts = Attempts::new(*policy);
    loop {
        let e = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let attempt = attempts.current();
        match attempts.next_backoff(e.is_transient()) {
            Some(backoff) => {
                tracing::debug!(
                    operation = what,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Transient store error, retrying"
                );
                on_retry(attempt, &e);
                tokio::time::sleep(backoff).await;
            }
            None => {
                tracing::warn!(operation = what, attempt, error = %e, "Store operation failed");
                return Err(e);
            }
        }
    }
}
