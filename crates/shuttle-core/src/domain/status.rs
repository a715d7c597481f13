//! Aggregate queue status and its derivation from the head entry.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::entry::QueueItemStatus;

/// Derived state of a whole queue. Never stored, always computed.
///
/// - Empty: no entries and nobody is draining the queue.
/// - Idle: no entries, processing enabled.
/// - Queued: head entry has not been attempted yet.
/// - Running: head entry attempted, still within the retry ceiling.
/// - Blocked: head entry attempted more often than the retry ceiling allows.
/// - Passive: queue is not meant to be processed; reported whatever it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    Empty,
    Idle,
    Queued,
    Running,
    Blocked,
    Passive,
}

impl QueueState {
    /// Whether an operator should look at this queue.
    pub fn is_stuck(self) -> bool {
        matches!(self, QueueState::Blocked)
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueState::Empty => "EMPTY",
            QueueState::Idle => "IDLE",
            QueueState::Queued => "QUEUED",
            QueueState::Running => "RUNNING",
            QueueState::Blocked => "BLOCKED",
            QueueState::Passive => "PASSIVE",
        };
        f.write_str(s)
    }
}

/// Inputs to the state derivation that do not come from the queue contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateContext {
    pub passive: bool,
    pub processing: bool,
    /// Retry ceiling; `None` never reports `Blocked`.
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub items_count: usize,
    pub state: QueueState,
}

impl QueueStatus {
    pub fn derive(items_count: usize, head: Option<&QueueItemStatus>, ctx: StateContext) -> Self {
        let state = if ctx.passive {
            QueueState::Passive
        } else {
            match head {
                None if ctx.processing => QueueState::Idle,
                None => QueueState::Empty,
                Some(status) if status.attempts == 0 => QueueState::Queued,
                Some(status) => match ctx.max_attempts {
                    Some(max) if status.attempts > max => QueueState::Blocked,
                    _ => QueueState::Running,
                },
            }
        };
        Self { items_count, state }
    }

    pub fn is_empty(&self) -> bool {
        self.items_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::rstest;

    fn head(attempts: u32) -> QueueItemStatus {
        let mut status = QueueItemStatus::queued("q", Utc::now());
        status.attempts = attempts;
        status
    }

    fn ctx(passive: bool, processing: bool, max_attempts: Option<u32>) -> StateContext {
        StateContext {
            passive,
            processing,
            max_attempts,
        }
    }

    #[rstest]
    #[case(None, ctx(false, false, Some(3)), QueueState::Empty)]
    #[case(None, ctx(false, true, Some(3)), QueueState::Idle)]
    #[case(Some(0), ctx(false, true, Some(3)), QueueState::Queued)]
    #[case(Some(1), ctx(false, true, Some(3)), QueueState::Running)]
    #[case(Some(3), ctx(false, true, Some(3)), QueueState::Running)]
    #[case(Some(4), ctx(false, true, Some(3)), QueueState::Blocked)]
    #[case(Some(400), ctx(false, true, None), QueueState::Running)]
    #[case(Some(4), ctx(true, true, Some(3)), QueueState::Passive)]
    #[case(None, ctx(true, false, None), QueueState::Passive)]
    fn state_is_derived_from_head(
        #[case] attempts: Option<u32>,
        #[case] context: StateContext,
        #[case] expected: QueueState,
    ) {
        let head = attempts.map(head);
        let count = usize::from(head.is_some());
        let status = QueueStatus::derive(count, head.as_ref(), context);
        assert_eq!(status.state, expected);
        assert_eq!(status.items_count, count);
    }

    #[test]
    fn only_blocked_is_stuck() {
        assert!(QueueState::Blocked.is_stuck());
        assert!(!QueueState::Running.is_stuck());
        assert!(!QueueState::Passive.is_stuck());
    }
}
