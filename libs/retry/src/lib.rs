//! Bounded retry primitives.
//!
//! An operation is attempted up to a fixed number of times. Each failure is
//! classified by the caller: retryable failures consume the budget, anything
//! else ends the loop immediately.
//!
//! # Invariants
//!
//! - `max_retries = n` means exactly `n + 1` attempts, never more
//! - the operation learns whether it is on its final attempt, so work that
//!   only prepares the next attempt can be skipped
//! - the last retryable error is kept and returned on exhaustion

use std::future::Future;

use thiserror::Error;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Retry errors.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// An attempt failed with an error that must not be retried.
    #[error("{error}")]
    Fatal { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
            Self::Fatal { attempt, .. } => *attempt,
        }
    }

    /// The error that ended the loop.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Fatal { error, .. } => error,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

/// Position of the current attempt within the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    pub max_attempts: u32,
}

impl Attempt {
    pub fn is_first(&self) -> bool {
        self.number == 1
    }

    /// No further attempt follows a failure of this one.
    pub fn is_last(&self) -> bool {
        self.number >= self.max_attempts
    }

    /// Attempts left after this one.
    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.number)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up.
pub async fn retry<T, E, F, Fut, P>(
    policy: RetryPolicy,
    mut op: F,
    is_retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts();
    let mut number = 1;

    loop {
        let attempt = Attempt {
            number,
            max_attempts,
        };

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if !is_retryable(&error) => {
                return Err(RetryError::Fatal {
                    attempt: number,
                    error,
                })
            }
            Err(last) if attempt.is_last() => {
                return Err(RetryError::Exhausted {
                    attempts: number,
                    last,
                })
            }
            Err(_) => number += 1,
        }
    }
}
