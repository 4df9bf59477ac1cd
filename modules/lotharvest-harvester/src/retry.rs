use std::future::Future;
use std::time::Duration;

use lotharvest_common::HarvestError;
use tracing::warn;

/// Fixed-delay bounded retry. Expensive operations (login, detail fetches)
/// run with a single attempt so a flaky site doesn't compound them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// One attempt, no delay.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run until success or exhaustion. Exhaustion is a unit-level failure:
    /// the caller gets `None` and the run continues.
    pub async fn run<T, F, Fut>(&self, op: &str, mut f: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HarvestError>>,
    {
        match self.run_inner(op, &mut f).await {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(op, attempts = self.attempts, error = %err, "Operation exhausted retries");
                None
            }
        }
    }

    /// Like `run`, but exhaustion propagates the last error. Reserved for
    /// session establishment, where failure aborts the site run.
    pub async fn run_or_abort<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T, HarvestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HarvestError>>,
    {
        self.run_inner(op, &mut f).await
    }

    async fn run_inner<T, F, Fut>(&self, op: &str, f: &mut F) -> Result<T, HarvestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HarvestError>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.attempts => {
                    warn!(
                        op,
                        attempt,
                        delay_ms = self.delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::ZERO);

        let result = policy
            .run("fetch", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(HarvestError::Transport("connection reset".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_none() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::ZERO);

        let result: Option<()> = policy
            .run("fetch", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(HarvestError::Transport("timeout".to_string())) }
            })
            .await;

        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn single_attempt_never_retries() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::once();

        let result: Option<()> = policy
            .run("login", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(HarvestError::Transport("refused".to_string())) }
            })
            .await;

        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abort_variant_propagates_last_error() {
        let policy = RetryPolicy::new(2, Duration::ZERO);

        let result: Result<(), _> = policy
            .run_or_abort("login", || async {
                Err(HarvestError::session("verde", "bad credentials"))
            })
            .await;

        assert!(matches!(result, Err(HarvestError::Session { .. })));
    }
}
