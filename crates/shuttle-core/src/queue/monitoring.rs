//! Observability decorator: counts operations and flags slow status reads.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{DistributionQueue, QueueCapability};
use crate::domain::{EntryId, QueueEntry, QueueItem, QueueStatus};
use crate::error::Result;
use crate::observability::{QueueCounts, QueueMetrics};

const SLOW_STATUS: Duration = Duration::from_millis(100);

pub struct MonitoringQueue {
    inner: Arc<dyn DistributionQueue>,
    metrics: QueueMetrics,
}

impl MonitoringQueue {
    pub fn new(inner: Arc<dyn DistributionQueue>) -> Self {
        Self {
            inner,
            metrics: QueueMetrics::default(),
        }
    }

    pub fn metrics(&self) -> QueueCounts {
        self.metrics.snapshot()
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.metrics.record_failure();
            debug!(queue = self.inner.name(), error = %err, "queue operation failed");
        }
        result
    }
}

#[async_trait]
impl DistributionQueue for MonitoringQueue {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> &[QueueCapability] {
        self.inner.capabilities()
    }

    async fn add(&self, item: QueueItem) -> Result<QueueEntry> {
        let entry = self.observe(self.inner.add(item).await)?;
        self.metrics.record_added();
        Ok(entry)
    }

    async fn get_head(&self) -> Result<Option<QueueEntry>> {
        self.metrics.record_head_read();
        self.observe(self.inner.get_head().await)
    }

    async fn get_entries(&self, skip: usize, limit: Option<usize>) -> Result<Vec<QueueEntry>> {
        self.observe(self.inner.get_entries(skip, limit).await)
    }

    async fn get_entry(&self, id: &EntryId) -> Result<Option<QueueEntry>> {
        self.observe(self.inner.get_entry(id).await)
    }

    async fn remove(&self, id: &EntryId) -> Result<Option<QueueEntry>> {
        let removed = self.observe(self.inner.remove(id).await)?;
        self.metrics.record_removed(usize::from(removed.is_some()));
        Ok(removed)
    }

    async fn remove_all(&self, ids: &[EntryId]) -> Result<Vec<QueueEntry>> {
        let removed = self.observe(self.inner.remove_all(ids).await)?;
        self.metrics.record_removed(removed.len());
        Ok(removed)
    }

    async fn clear(&self, limit: Option<usize>) -> Result<Vec<QueueEntry>> {
        let removed = self.observe(self.inner.clear(limit).await)?;
        self.metrics.record_removed(removed.len());
        Ok(removed)
    }

    async fn get_status(&self) -> Result<QueueStatus> {
        self.metrics.record_status_read();
        let started = Instant::now();
        let status = self.observe(self.inner.get_status().await)?;
        let elapsed = started.elapsed();
        if elapsed > SLOW_STATUS {
            warn!(
                queue = self.inner.name(),
                elapsed_ms = elapsed.as_millis() as u64,
                items = status.items_count,
                "slow queue status computation"
            );
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PackageInfo;
    use crate::queue::{QueueSettings, TransientQueue};

    #[tokio::test]
    async fn operations_are_counted() {
        let settings = QueueSettings::default().with_capabilities(&[
            QueueCapability::Appendable,
            QueueCapability::Removable,
        ]);
        let queue = MonitoringQueue::new(Arc::new(TransientQueue::new("default", settings)));

        queue
            .add(QueueItem::new("pkg-1", 1, PackageInfo::new()))
            .await
            .unwrap();
        queue.get_head().await.unwrap();
        queue.get_status().await.unwrap();
        queue.remove(&EntryId::from("pkg-1")).await.unwrap();
        queue.remove(&EntryId::from("pkg-1")).await.unwrap();
        assert!(queue.clear(None).await.is_err());

        let counts = queue.metrics();
        assert_eq!(
            counts,
            QueueCounts {
                added: 1,
                removed: 1,
                head_reads: 1,
                status_reads: 1,
                failures: 1,
            }
        );
    }
}
