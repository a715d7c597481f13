//! Queue module: the queue contract, its backends and decorators.
//!
//! Backends:
//! - [`TransientQueue`]: in-memory, for tests and ephemeral agents.
//! - [`PersistedQueue`]: one job per item in a durable [`JobStore`](crate::ports::JobStore).
//! - [`TreeQueue`]: entries in a hierarchical store, bucketed by minute.
//!
//! Decorators ([`CachingQueue`], [`MonitoringQueue`]) wrap any backend
//! without changing its semantics.

mod caching;
mod monitoring;
mod persisted;
mod retry;
mod transient;
pub mod tree;

pub use caching::{CachingQueue, DEFAULT_STATUS_TTL, StatusCache};
pub use monitoring::MonitoringQueue;
pub use persisted::PersistedQueue;
pub use retry::{DEFAULT_RETRY_ATTEMPTS, RetryPolicy};
pub use transient::TransientQueue;
pub use tree::{TreeQueue, TreeQueueCleanup};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{EntryId, QueueEntry, QueueItem, QueueStatus, StateContext};
use crate::error::{Result, ShuttleError};
use crate::ports::PackageBuilder;

/// Name of the queue used when a strategy is not told otherwise.
pub const DEFAULT_QUEUE_NAME: &str = "default";

/// Optional operations a queue may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueCapability {
    Appendable,
    Removable,
    Clearable,
}

impl QueueCapability {
    pub const ALL: [QueueCapability; 3] = [
        QueueCapability::Appendable,
        QueueCapability::Removable,
        QueueCapability::Clearable,
    ];
}

impl fmt::Display for QueueCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueCapability::Appendable => "APPENDABLE",
            QueueCapability::Removable => "REMOVABLE",
            QueueCapability::Clearable => "CLEARABLE",
        };
        f.write_str(s)
    }
}

/// Shared switch telling a queue whether a processing loop drains it.
#[derive(Debug, Clone, Default)]
pub struct ProcessingFlag(Arc<AtomicBool>);

impl ProcessingFlag {
    pub fn set(&self, processing: bool) {
        self.0.store(processing, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub passive: bool,
    pub retry: RetryPolicy,
    pub capabilities: Vec<QueueCapability>,
    pub processing: ProcessingFlag,
}

impl QueueSettings {
    pub fn state_context(&self) -> StateContext {
        StateContext {
            passive: self.passive,
            processing: self.processing.is_set(),
            max_attempts: self.retry.max_attempts,
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[QueueCapability]) -> Self {
        self.capabilities = capabilities.to_vec();
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            passive: false,
            retry: RetryPolicy::default(),
            capabilities: QueueCapability::ALL.to_vec(),
            processing: ProcessingFlag::default(),
        }
    }
}

/// A named, ordered holding area for queue entries.
#[async_trait]
pub trait DistributionQueue: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[QueueCapability];

    fn has_capability(&self, capability: QueueCapability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Append `item`. Queues are unbounded; errors mean the backend failed.
    async fn add(&self, item: QueueItem) -> Result<QueueEntry>;

    /// Earliest entry not yet removed. Counts as a dequeue for processing:
    /// its attempt counter is incremented before it is returned.
    async fn get_head(&self) -> Result<Option<QueueEntry>>;

    /// Read-only listing in queue order. `limit = None` is unbounded.
    async fn get_entries(&self, skip: usize, limit: Option<usize>) -> Result<Vec<QueueEntry>>;

    async fn get_entry(&self, id: &EntryId) -> Result<Option<QueueEntry>>;

    /// Remove one entry. Removing an absent id returns `None`.
    async fn remove(&self, id: &EntryId) -> Result<Option<QueueEntry>>;

    async fn remove_all(&self, ids: &[EntryId]) -> Result<Vec<QueueEntry>>;

    /// Remove up to `limit` entries from the head; `None` clears everything.
    async fn clear(&self, limit: Option<usize>) -> Result<Vec<QueueEntry>>;

    async fn get_status(&self) -> Result<QueueStatus>;
}

/// Fail fast when `queue` lacks `capability`.
pub fn ensure_capability(queue: &dyn DistributionQueue, capability: QueueCapability) -> Result<()> {
    if queue.has_capability(capability) {
        Ok(())
    } else {
        Err(ShuttleError::capability(queue.name(), capability))
    }
}

/// Remove an entry and release its package from this queue.
///
/// The package is deleted only once every queue that acquired it has
/// released it.
pub async fn remove_and_release(
    queue: &dyn DistributionQueue,
    id: &EntryId,
    packages: &dyn PackageBuilder,
) -> Result<Option<QueueEntry>> {
    let Some(entry) = queue.remove(id).await? else {
        return Ok(None);
    };

    if let Some(package) = packages.get_package(entry.item.package_id()).await? {
        match package.as_shared() {
            Some(shared) => {
                let deleted = shared.release(&[queue.name()]).await?;
                debug!(
                    queue = queue.name(),
                    package_id = package.id(),
                    deleted,
                    "released package"
                );
            }
            None => package.delete().await?,
        }
    }
    Ok(Some(entry))
}
