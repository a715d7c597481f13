//! Dispatching strategies: which queue(s) a package is added to.
//!
//! Adding is two-phase. The package is first acquired for every target queue
//! name, then appended to each queue. A failed append releases only that
//! queue's hold and is reported as an `Error` status for it; queues that
//! accepted the item keep it.

mod async_delivery;
mod error_queue;
mod multiple;
mod priority;

pub use async_delivery::{AsyncDeliveryDispatchingStrategy, DEFAULT_BACKLOG_THRESHOLD};
pub use error_queue::ErrorQueueDispatchingStrategy;
pub use multiple::MultipleQueueDispatchingStrategy;
pub use priority::{PriorityQueueDispatchingStrategy, PriorityRule};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::app::QueueProvider;
use crate::domain::{QueueEntry, QueueItem, QueueItemStatus};
use crate::error::Result;
use crate::ports::{DistributionPackage, require_shared};

#[async_trait]
pub trait DispatchingStrategy: Send + Sync {
    /// One status per target queue, `Error` for queues that rejected the item.
    async fn add(
        &self,
        package: &dyn DistributionPackage,
        provider: &dyn QueueProvider,
    ) -> Result<Vec<QueueItemStatus>>;

    /// Every queue this strategy may add to.
    fn queue_names(&self) -> Vec<String>;
}

/// Acquire `package` for all `names`, then append `item` to each queue.
pub(crate) async fn fan_out(
    package: &dyn DistributionPackage,
    item: QueueItem,
    provider: &dyn QueueProvider,
    names: &[String],
) -> Result<Vec<QueueItemStatus>> {
    let shared = require_shared(package)?;
    let holders: Vec<&str> = names.iter().map(String::as_str).collect();
    shared.acquire(&holders).await?;

    let mut statuses = Vec::with_capacity(names.len());
    for name in names {
        match append(provider, name, item.clone()).await {
            Ok(entry) => {
                debug!(queue = %name, package_id = package.id(), entry_id = %entry.id, "item queued");
                statuses.push(entry.status);
            }
            Err(err) => {
                warn!(queue = %name, package_id = package.id(), error = %err, "could not queue item");
                if let Err(release_err) = shared.release(&[name.as_str()]).await {
                    warn!(queue = %name, package_id = package.id(), error = %release_err, "could not release package");
                }
                let at = provider.clock().now();
                statuses.push(QueueItemStatus::failed(name, err.to_string(), at));
            }
        }
    }
    Ok(statuses)
}

async fn append(provider: &dyn QueueProvider, name: &str, item: QueueItem) -> Result<QueueEntry> {
    provider.get_queue(name)?.add(item).await
}
