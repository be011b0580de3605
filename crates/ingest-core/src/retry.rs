use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

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
    /// The wait between attempts was interrupted by cancellation.
    Interrupted,
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    Fixed,
    Exponential { max_delay: Duration },
}

/// Shared retry policy for every component that talks to a state store or
/// an upstream harvesting endpoint.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff,
        }
    }

    /// Preset for state-store calls.
    pub fn for_store() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            backoff: Backoff::Exponential {
                max_delay: Duration::from_secs(10),
            },
        }
    }

    /// Executes the operation, retrying per the classifier's disposition.
    pub async fn run<F, Fut, T, E, C>(&self, op: F, classify: C) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryDisposition,
    {
        self.run_cancellable(op, classify, &CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), but the sleep between attempts aborts as
    /// soon as `cancel` fires. In-flight attempts are never interrupted.
    pub async fn run_cancellable<F, Fut, T, E, C>(
        &self,
        mut op: F,
        classify: C,
        cancel: &CancellationToken,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryDisposition,
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
                        tokio::select! {
                            _ = sleep(delay) => {}
                            _ = cancel.cancelled() => return Err(RetryError::Interrupted),
                        }
                        attempt += 1;
                    }
                },
            }
        }
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential { max_delay } => {
                if self.base_delay.is_zero() {
                    return Duration::ZERO;
                }
                let factor = 1u128 << attempt.min(6);
                let delay_ms = self.base_delay.as_millis().saturating_mul(factor);
                Duration::from_millis(delay_ms.min(max_delay.as_millis()) as u64)
            }
        }
    }
}
