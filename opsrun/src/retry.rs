//! Retry executor: bounded attempts with exponential backoff.
//!
//! Only failures whose [`ErrorKind`] is in the policy's retryable set are
//! retried. Everything else propagates on the spot, without delay.

use std::error::Error;
use std::fmt;
use std::thread;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::core::backoff::RetryPolicy;
use crate::core::classifier::{Classify, ErrorKind};

/// Blocks the calling thread between attempts.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Real wall-clock sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

impl<F: Fn(Duration)> Sleeper for F {
    fn sleep(&self, duration: Duration) {
        self(duration);
    }
}

/// Failure surfaced by [`execute`].
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation failed with a non-retryable kind, or failed on its final attempt.
    Operation { attempts: u32, error: E },
    /// The attempt loop ended without a result. Unreachable for a valid policy.
    Exhausted,
}

impl<E> RetryError<E> {
    /// The operation's own error, if there is one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Operation { error, .. } => Some(error),
            RetryError::Exhausted => None,
        }
    }

    pub fn attempts(&self) -> Option<u32> {
        match self {
            RetryError::Operation { attempts, .. } => Some(*attempts),
            RetryError::Exhausted => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Operation { attempts: 1, error } => write!(f, "{error}"),
            RetryError::Operation { attempts, error } => {
                write!(f, "{error} (gave up after {attempts} attempts)")
            }
            RetryError::Exhausted => f.write_str("retry exhausted without result"),
        }
    }
}

impl<E: Error + 'static> Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RetryError::Operation { error, .. } => Some(error),
            RetryError::Exhausted => None,
        }
    }
}

impl<E: Classify> Classify for RetryError<E> {
    fn kind(&self) -> ErrorKind {
        match self {
            RetryError::Operation { error, .. } => error.kind(),
            RetryError::Exhausted => ErrorKind::Fatal,
        }
    }
}

/// Run `operation` under `policy`, sleeping on the calling thread between attempts.
pub fn execute<T, E, F>(operation: F, policy: &RetryPolicy) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Result<T, E>,
    E: Classify + fmt::Display,
{
    execute_with(operation, policy, &ThreadSleeper)
}

/// [`execute`] with an injectable [`Sleeper`].
#[instrument(skip_all, fields(max_attempts = policy.max_attempts()))]
pub fn execute_with<T, E, F, S>(
    mut operation: F,
    policy: &RetryPolicy,
    sleeper: &S,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Result<T, E>,
    E: Classify + fmt::Display,
    S: Sleeper + ?Sized,
{
    let max_attempts = policy.max_attempts();
    for attempt in 1..=max_attempts {
        let error = match operation() {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        let kind = error.kind();
        if !policy.is_retryable(kind) {
            debug!(attempt, %kind, err = %error, "non-retryable failure");
            return Err(RetryError::Operation {
                attempts: attempt,
                error,
            });
        }
        if attempt == max_attempts {
            warn!(attempt, %kind, err = %error, "retry budget spent");
            return Err(RetryError::Operation {
                attempts: attempt,
                error,
            });
        }

        let delay = policy.delay_after(attempt);
        warn!(
            attempt,
            max_attempts,
            %kind,
            delay_ms = delay.as_millis() as u64,
            err = %error,
            "transient failure, retrying"
        );
        sleeper.sleep(delay);
    }

    Err(RetryError::Exhausted)
}
