//! Bounded retry with exponential delay
//!
//! Snapshot saves, snapshot removals and remote artifact deletions all go
//! through [`retry`] or [`retry_if`]. Individual failures are logged as
//! warnings; only the last error is returned once every attempt has been
//! used or a permanent error is seen.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Retry schedule for an operation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after every failure
    pub factor: f64,
    /// Maximum number of attempts, including the first
    pub steps: u32,
}

impl Backoff {
    /// 5 attempts, 1s initial delay doubling each time, no jitter
    pub const fn exponential() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            factor: 2.0,
            steps: 5,
        }
    }

    /// Constant pause between attempts
    pub const fn flat(steps: u32, pause: Duration) -> Self {
        Self {
            initial_delay: pause,
            factor: 1.0,
            steps,
        }
    }

    /// Remote artifact deletion: 3 attempts, 5s apart
    pub const fn remote_delete() -> Self {
        Self::flat(3, Duration::from_secs(5))
    }

    /// Delays slept between consecutive attempts
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut delay = self.initial_delay;
        (1..self.steps.max(1)).map(move |_| {
            let current = delay;
            delay = Duration::from_secs_f64(delay.as_secs_f64() * self.factor);
            current
        })
    }

    /// Total time spent sleeping when every attempt fails
    pub fn total_delay(&self) -> Duration {
        self.delays().sum()
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential()
    }
}

/// Run `operation` until it succeeds or `backoff.steps` attempts are used.
///
/// No sleep follows the final attempt. A `steps` of zero still runs the
/// operation once.
pub async fn retry<F, Fut, T, E>(
    backoff: &Backoff,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(backoff, operation_name, operation, |_| true).await
}

/// Like [`retry`], but stops at the first error for which `should_retry`
/// returns false.
pub async fn retry_if<F, Fut, T, E, P>(
    backoff: &Backoff,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let steps = backoff.steps.max(1);
    let mut delays = backoff.delays();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        operation = %operation_name,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(e) if !should_retry(&e) => {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed with a permanent error"
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    max_attempts = steps,
                    error = %e,
                    "Operation attempt failed"
                );

                match delays.next() {
                    Some(delay) if attempt < steps => tokio::time::sleep(delay).await,
                    _ => {
                        error!(
                            operation = %operation_name,
                            attempts = attempt,
                            error = %e,
                            "Operation failed, giving up"
                        );
                        return Err(e);
                    }
                }
            }
        }
    }
}
