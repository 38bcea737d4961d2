//! Bounded, fixed-delay retry with transient/fatal classification.
//!
//! Operations classify their own failures: a [`RetryError::Retriable`] error
//! triggers another attempt after the policy delay, while
//! [`RetryError::Fatal`] stops immediately. The policy holds no state between
//! runs, so a single value can drive any number of independent loops.

use std::fmt;
use std::thread;
use std::time::Duration;

use tracing::debug;

/// Failure classification returned by a retried operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RetryError<E> {
    /// The operation may succeed if attempted again.
    Retriable(E),
    /// The operation must not be attempted again.
    Fatal(E),
}

impl<E> RetryError<E> {
    /// Returns `true` for [`RetryError::Retriable`].
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Retriable(_))
    }

    /// Unwraps the underlying error regardless of classification.
    #[must_use]
    pub fn into_inner(self) -> E {
        match self {
            Self::Retriable(err) | Self::Fatal(err) => err,
        }
    }
}

/// Source of delays between attempts.
pub trait Sleeper {
    /// Blocks the caller for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Sleeper backed by [`std::thread::sleep`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

impl<S: Sleeper + ?Sized> Sleeper for &S {
    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }
}

/// Fixed-delay retry policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy allowing up to `max_attempts` invocations.
    ///
    /// A value of zero is treated as one attempt.
    #[must_use]
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        let attempts = if max_attempts == 0 { 1 } else { max_attempts };
        Self {
            max_attempts: attempts,
            delay,
        }
    }

    /// Maximum number of invocations.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay slept between consecutive attempts.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Runs `op` until it succeeds, fails fatally, or the attempts run out,
    /// sleeping on the current thread between attempts.
    ///
    /// # Errors
    ///
    /// Returns the fatal error immediately, or the last retriable error once
    /// every attempt has been used.
    pub fn run<T, E, F>(&self, op: F) -> Result<T, E>
    where
        E: fmt::Display,
        F: FnMut() -> Result<T, RetryError<E>>,
    {
        self.run_with(&ThreadSleeper, op)
    }

    /// Same as [`RetryPolicy::run`] but sleeps through `sleeper`.
    ///
    /// # Errors
    ///
    /// Returns the fatal error immediately, or the last retriable error once
    /// every attempt has been used.
    pub fn run_with<T, E, F>(&self, sleeper: &dyn Sleeper, mut op: F) -> Result<T, E>
    where
        E: fmt::Display,
        F: FnMut() -> Result<T, RetryError<E>>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(RetryError::Fatal(err)) => return Err(err),
                Err(RetryError::Retriable(err)) => {
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    debug!(
                        attempt,
                        max_attempts = self.max_attempts,
                        "retrying after {err}"
                    );
                    sleeper.sleep(self.delay);
                    attempt += 1;
                }
            }
        }
    }
}

/// Convenience wrapper around [`RetryPolicy::run`].
///
/// # Errors
///
/// See [`RetryPolicy::run`].
pub fn retry_after<T, E, F>(attempts: u32, op: F, delay: Duration) -> Result<T, E>
where
    E: fmt::Display,
    F: FnMut() -> Result<T, RetryError<E>>,
{
    RetryPolicy::new(attempts, delay).run(op)
}

#[cfg(test)]
mod tests;
