//! Retry policy: how many dequeue attempts an entry gets before it counts as
//! stuck and becomes eligible for escalation.

use serde::{Deserialize, Serialize};

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed before the head entry is reported `Blocked`.
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
        }
    }

    pub fn unbounded() -> Self {
        Self { max_attempts: None }
    }

    /// Whether an entry dequeued `attempts` times has used up its budget.
    ///
    /// With a ceiling of 3, the fourth failed attempt exhausts the entry.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        matches!(self.max_attempts, Some(max) if attempts > max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_ATTEMPTS)
    }
}
