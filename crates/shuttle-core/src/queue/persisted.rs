//! Queue backed by a durable [`JobStore`].
//!
//! One job per item, all under the topic `shuttle/queue/{agent}/{queue}`.
//! Ordering and attempt counting are delegated to the store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{DistributionQueue, QueueCapability, QueueSettings, ensure_capability};
use crate::domain::{
    EntryId, ItemState, JobId, QueueEntry, QueueItem, QueueItemStatus, QueueStatus,
};
use crate::error::Result;
use crate::ports::{Clock, Job, JobStore, SystemClock};

const TOPIC_PREFIX: &str = "shuttle/queue";

/// Job properties carrying one queue item.
#[derive(Debug, Serialize, Deserialize)]
struct ItemJob {
    item: QueueItem,
    entered: DateTime<Utc>,
}

pub struct PersistedQueue {
    name: String,
    topic: String,
    settings: QueueSettings,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl PersistedQueue {
    pub fn new(
        agent: &str,
        name: impl Into<String>,
        settings: QueueSettings,
        store: Arc<dyn JobStore>,
    ) -> Self {
        let name = name.into();
        Self {
            topic: format!("{TOPIC_PREFIX}/{agent}/{name}"),
            name,
            settings,
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for the entry time of new items.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn to_entry(&self, job: Job) -> Result<QueueEntry> {
        let ItemJob { item, entered } = serde_json::from_value(job.properties)?;
        let mut status = QueueItemStatus::queued(&self.name, entered);
        if job.retry_count > 0 {
            status.attempts = job.retry_count;
            status.state = ItemState::Active;
        }
        Ok(QueueEntry::new(EntryId::new(job.id.to_string()), item, status))
    }

    async fn cancel(&self, id: &EntryId) -> Result<Option<QueueEntry>> {
        let Some(job_id) = Self::job_id(id) else {
            return Ok(None);
        };
        match self.store.cancel(&self.topic, job_id).await? {
            Some(job) => self.to_entry(job).map(Some),
            None => Ok(None),
        }
    }

    /// Store ids come back as entry ids; anything else is simply absent.
    fn job_id(id: &EntryId) -> Option<JobId> {
        match id.as_str().parse() {
            Ok(job_id) => Some(job_id),
            Err(_) => {
                warn!(entry_id = %id, "entry id is not a job id");
                None
            }
        }
    }
}

#[async_trait]
impl DistributionQueue for PersistedQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[QueueCapability] {
        &self.settings.capabilities
    }

    async fn add(&self, item: QueueItem) -> Result<QueueEntry> {
        ensure_capability(self, QueueCapability::Appendable)?;
        let properties = serde_json::to_value(ItemJob {
            item,
            entered: self.clock.now(),
        })?;
        let job = self.store.submit(&self.topic, properties).await?;
        self.to_entry(job)
    }

    async fn get_head(&self) -> Result<Option<QueueEntry>> {
        let Some(head) = self.store.query(&self.topic, 0, Some(1)).await?.pop() else {
            return Ok(None);
        };
        match self.store.start(&self.topic, head.id).await? {
            Some(started) => self.to_entry(started).map(Some),
            // Removed between query and start.
            None => Ok(None),
        }
    }

    async fn get_entries(&self, skip: usize, limit: Option<usize>) -> Result<Vec<QueueEntry>> {
        self.store
            .query(&self.topic, skip, limit)
            .await?
            .into_iter()
            .map(|job| self.to_entry(job))
            .collect()
    }

    async fn get_entry(&self, id: &EntryId) -> Result<Option<QueueEntry>> {
        let Some(job_id) = Self::job_id(id) else {
            return Ok(None);
        };
        match self.store.get(&self.topic, job_id).await? {
            Some(job) => self.to_entry(job).map(Some),
            None => Ok(None),
        }
    }

    async fn remove(&self, id: &EntryId) -> Result<Option<QueueEntry>> {
        ensure_capability(self, QueueCapability::Removable)?;
        self.cancel(id).await
    }

    async fn remove_all(&self, ids: &[EntryId]) -> Result<Vec<QueueEntry>> {
        ensure_capability(self, QueueCapability::Removable)?;
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            removed.extend(self.cancel(id).await?);
        }
        Ok(removed)
    }

    async fn clear(&self, limit: Option<usize>) -> Result<Vec<QueueEntry>> {
        ensure_capability(self, QueueCapability::Clearable)?;
        let mut removed = Vec::new();
        for job in self.store.query(&self.topic, 0, limit).await? {
            if let Some(job) = self.store.cancel(&self.topic, job.id).await? {
                removed.push(self.to_entry(job)?);
            }
        }
        Ok(removed)
    }

    async fn get_status(&self) -> Result<QueueStatus> {
        let count = self.store.count(&self.topic).await?;
        let head = self.store.query(&self.topic, 0, Some(1)).await?.pop();
        let head = head.map(|job| self.to_entry(job)).transpose()?;
        Ok(QueueStatus::derive(
            count,
            head.as_ref().map(|entry| &entry.status),
            self.settings.state_context(),
        ))
    }
}
