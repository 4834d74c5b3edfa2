use std::future::Future;
use std::time::Duration;

use crate::error::GaleError;

/// Bounded retry with multiplicative backoff for transiently-failing
/// operations. Only errors where `GaleError::is_retryable()` holds are
/// retried; everything else propagates unchanged on the first attempt.
///
/// Never wrap an already-started stream in this: partial output must not
/// be silently duplicated. Streams surface failures as terminal events.
#[derive(Clone, Debug)]
pub struct RetryExecutor {
    max_attempts: u32,
    delay: Duration,
    backoff: f64,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            backoff: 2.0,
        }
    }
}

impl RetryExecutor {
    pub fn new(max_attempts: u32, delay: Duration, backoff: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff,
        }
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, GaleError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GaleError>>,
    {
        let mut current_delay = self.delay;

        for attempt in 1..=self.max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    tracing::warn!(
                        operation = label,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = current_delay.as_millis() as u64,
                        "retryable failure: {err}"
                    );
                    tokio::time::sleep(current_delay).await;
                    current_delay = current_delay.mul_f64(self.backoff);
                }
                Err(err) => {
                    if attempt == self.max_attempts && err.is_retryable() {
                        tracing::error!(
                            operation = label,
                            attempts = self.max_attempts,
                            "giving up: {err}"
                        );
                    }
                    return Err(err);
                }
            }
        }

        unreachable!("loop returns on every attempt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> GaleError {
        GaleError::Timeout(100)
    }

    #[tokio::test]
    async fn succeeds_after_two_transient_failures() {
        let executor = RetryExecutor::new(3, Duration::from_millis(100), 1.0);
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let start = std::time::Instant::now();
        let result = executor
            .run("test-op", move || {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn exhaustion_propagates_the_last_error() {
        let executor = RetryExecutor::new(3, Duration::from_millis(1), 1.0);
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<(), _> = executor
            .run("always-fails", move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                }
            })
            .await;

        assert!(matches!(result.unwrap_err(), GaleError::Timeout(100)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_on_first_attempt() {
        let executor = RetryExecutor::new(5, Duration::from_millis(1), 2.0);
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<(), _> = executor
            .run("auth-op", move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GaleError::Auth {
                        provider: "openai".into(),
                        message: "401".into(),
                    })
                }
            })
            .await;

        assert!(matches!(result.unwrap_err(), GaleError::Auth { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backoff_multiplies_the_delay() {
        // 2 retries at 10ms then 30ms (backoff 3.0) → at least 40ms total
        let executor = RetryExecutor::new(3, Duration::from_millis(10), 3.0);
        let start = std::time::Instant::now();

        let _: Result<(), _> = executor
            .run("backoff-op", || async { Err(transient()) })
            .await;

        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
