use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Indicates whether an error should be retried or treated as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retry,
    Stop,
}

/// Result of running an operation under the retry policy.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The error was considered fatal and should bubble up immediately.
    Fatal(E),
    /// The error was retryable, but the configured attempts were exhausted.
    AttemptsExceeded(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal(e) | RetryError::AttemptsExceeded(e) => e,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: if max_delay.is_zero() {
                base_delay
            } else {
                max_delay
            },
        }
    }

    /// Preset for bulk document writes. These dominate the run's cost, so they
    /// get a far higher ceiling than idempotent metadata calls.
    pub fn for_bulk() -> Self {
        Self {
            max_attempts: 15,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }

    /// Preset for small idempotent calls (version probe, index creation).
    pub fn for_metadata() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }

    /// Preset for lease store round-trips. Kept short: a renewal that keeps
    /// failing must give up well before the lease runs out.
    pub fn for_lease_store() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }

    /// Executes the operation with the configured retry policy.
    pub async fn run<F, Fut, T, E, Classifier>(
        &self,
        mut op: F,
        classify: Classifier,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Classifier: Fn(&E) -> RetryDisposition,
    {
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(result) => return Ok(result),
                Err(err) => match classify(&err) {
                    RetryDisposition::Stop => return Err(RetryError::Fatal(err)),
                    RetryDisposition::Retry => {
                        if attempt + 1 >= self.max_attempts {
                            return Err(RetryError::AttemptsExceeded(err));
                        }

                        let delay = self.delay_for(attempt);
                        debug!(attempt = attempt + 1, delay_ms = delay.as_millis(), "Retrying");
                        sleep(delay).await;
                        attempt += 1;
                    }
                },
            }
        }
    }

    /// Backoff before retry number `attempt + 1`: doubles per attempt, capped.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::from_millis(0);
        }

        let factor = 1u128 << attempt.min(6);
        let base_ms = self.base_delay.as_millis();
        let delay_ms = base_ms.saturating_mul(factor);
        let capped = delay_ms.min(self.max_delay.as_millis());
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy::for_bulk();
        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(32));
        assert_eq!(policy.delay_for(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn stops_on_fatal_and_counts_attempts() {
        let policy = RetryPolicy::new(4, Duration::ZERO, Duration::ZERO);
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = policy
            .run(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("transient") }
                },
                |_| RetryDisposition::Retry,
            )
            .await;
        assert!(matches!(result, Err(RetryError::AttemptsExceeded("transient"))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        calls.store(0, Ordering::SeqCst);
        let result: Result<(), _> = policy
            .run(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("fatal") }
                },
                |_| RetryDisposition::Stop,
            )
            .await;
        assert!(matches!(result, Err(RetryError::Fatal("fatal"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
