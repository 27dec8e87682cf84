use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// Classifies a failure as safe to retry. Implemented by [`crate::error::NimbusError`]
/// and by any per-service error enum that wraps it.
pub trait Retriable {
    fn is_retriable(&self) -> bool;
}

impl Retriable for crate::error::NimbusError {
    fn is_retriable(&self) -> bool {
        crate::error::NimbusError::is_retriable(self)
    }
}

/// Bounded exponential backoff parameters shared by every retrying RPC.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub backoff_coefficient: f64,
    pub max_delay: Duration,
    pub max_retries: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            backoff_coefficient: 2.0,
            max_delay: Duration::from_secs(10),
            max_retries: Some(8),
        }
    }
}

/// Runs `f` with bounded exponential backoff. The initial attempt happens
/// immediately; on a retriable failure the call sleeps and tries again with
/// the delay multiplied by `backoff_coefficient`, capped at `max_delay`.
///
/// If `deadline` is set and the next sleep would cross it, the loop stops
/// and returns the last inner error wrapped as `DeadlineExceeded` instead of
/// sleeping past the caller's budget.
pub async fn call_with_retries<T, E, F, Fut>(
    operation: &str,
    retry_config: &RetryConfig,
    deadline: Option<Instant>,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retriable + fmt::Display + From<crate::error::NimbusError>,
{
    let mut delay = retry_config.initial_delay;
    let mut attempt: u32 = 0;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let retriable = error.is_retriable();
                let exhausted = retry_config
                    .max_retries
                    .is_some_and(|max| attempt >= max);

                if !retriable || exhausted {
                    return Err(error);
                }

                if let Some(deadline) = deadline {
                    if Instant::now() + delay >= deadline {
                        warn!(operation, %error, "deadline exceeded while retrying");
                        return Err(crate::error::NimbusError::DeadlineExceeded(error.to_string()).into());
                    }
                }

                debug!(operation, attempt, ?delay, %error, "retrying after transient failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
                delay = delay
                    .mul_f64(retry_config.backoff_coefficient)
                    .min(retry_config.max_delay);
            }
        }
    }
}

/// A free-running exponential backoff counter for long-lived polling loops
/// (log streams, exec output, heartbeats) that are not expressed as a single
/// retried future. `next_delay` advances the counter; `reset` restores it to
/// `initial` after any successful iteration.
#[derive(Debug, Clone)]
pub struct ExpBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ExpBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NimbusError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use test_r::test;

    #[test]
    async fn retries_until_success_then_resets_count() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            initial_delay: Duration::from_millis(1),
            backoff_coefficient: 2.0,
            max_delay: Duration::from_millis(100),
            max_retries: Some(5),
        };

        let result: Result<u32, NimbusError> = call_with_retries("test", &config, None, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(NimbusError::Unavailable("not yet".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    async fn non_retriable_error_stops_after_one_call() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::default();

        let result: Result<u32, NimbusError> = call_with_retries("test", &config, None, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(NimbusError::InvalidArgument("bad".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exp_backoff_doubles_and_caps() {
        let mut backoff = ExpBackoff::new(Duration::from_millis(10), Duration::from_millis(40));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }
}
