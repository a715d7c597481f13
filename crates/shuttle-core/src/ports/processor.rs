//! QueueProcessor port - consumer of queue heads.

use async_trait::async_trait;

use crate::domain::QueueEntry;

#[async_trait]
pub trait QueueProcessor: Send + Sync {
    /// `true` removes the entry. `false` leaves it at the head; it is
    /// retried on the next tick with its attempt count already incremented.
    async fn process(&self, queue_name: &str, entry: &QueueEntry) -> bool;
}
