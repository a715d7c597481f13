//! Queue entries: an item plus its per-queue status.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::item::QueueItem;

/// Backend-assigned identifier of an entry, unique within one queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// State of an item within one queue.
///
/// Transitions:
/// - Queued -> Active (dequeued for processing)
/// - Active -> Succeeded (processor accepted it, entry removed)
/// - Queued -> Error (append to this queue failed during dispatch)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemState {
    Queued,
    Active,
    Error,
    Succeeded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItemStatus {
    pub entered: DateTime<Utc>,
    pub state: ItemState,
    /// Number of times the entry was dequeued for processing.
    pub attempts: u32,
    pub queue_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueueItemStatus {
    pub fn queued(queue_name: impl Into<String>, entered: DateTime<Utc>) -> Self {
        Self {
            entered,
            state: ItemState::Queued,
            attempts: 0,
            queue_name: queue_name.into(),
            error: None,
        }
    }

    /// Status reported by a dispatcher when appending to `queue_name` failed.
    pub fn failed(
        queue_name: impl Into<String>,
        error: impl Into<String>,
        entered: DateTime<Utc>,
    ) -> Self {
        Self {
            entered,
            state: ItemState::Error,
            attempts: 0,
            queue_name: queue_name.into(),
            error: Some(error.into()),
        }
    }

    /// Record one more dequeue-for-processing.
    pub fn start_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        self.state = ItemState::Active;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub item: QueueItem,
    pub status: QueueItemStatus,
}

impl QueueEntry {
    pub fn new(id: EntryId, item: QueueItem, status: QueueItemStatus) -> Self {
        Self { id, item, status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_attempt_moves_to_active() {
        let mut status = QueueItemStatus::queued("default", Utc::now());
        assert_eq!(status.state, ItemState::Queued);

        status.start_attempt();
        status.start_attempt();

        assert_eq!(status.attempts, 2);
        assert_eq!(status.state, ItemState::Active);
    }

    #[test]
    fn item_state_serializes_upper_case() {
        let s = serde_json::to_string(&ItemState::Succeeded).unwrap();
        assert_eq!(s, "\"SUCCEEDED\"");
    }
}
