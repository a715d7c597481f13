//! Status caching decorator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{DistributionQueue, QueueCapability};
use crate::domain::{EntryId, QueueEntry, QueueItem, QueueStatus};
use crate::error::Result;

pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(30);

/// Queue statuses keyed by `{agent}/{queue}`, owned by one provider.
#[derive(Debug)]
pub struct StatusCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, QueueStatus)>>,
}

impl StatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<QueueStatus> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|(stored, _)| stored.elapsed() < self.ttl)
            .map(|(_, status)| *status)
    }

    pub fn put(&self, key: &str, status: QueueStatus) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), (Instant::now(), status));
    }

    pub fn invalidate(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_TTL)
    }
}

/// Serves `get_status` from a [`StatusCache`]; writes invalidate it.
pub struct CachingQueue {
    inner: Arc<dyn DistributionQueue>,
    cache: Arc<StatusCache>,
    key: String,
}

impl CachingQueue {
    pub fn new(agent: &str, inner: Arc<dyn DistributionQueue>, cache: Arc<StatusCache>) -> Self {
        let key = format!("{agent}/{}", inner.name());
        Self { inner, cache, key }
    }
}

#[async_trait]
impl DistributionQueue for CachingQueue {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> &[QueueCapability] {
        self.inner.capabilities()
    }

    async fn add(&self, item: QueueItem) -> Result<QueueEntry> {
        let result = self.inner.add(item).await;
        self.cache.invalidate(&self.key);
        result
    }

    /// Dequeuing bumps the head's attempts, which the derived state reflects.
    async fn get_head(&self) -> Result<Option<QueueEntry>> {
        let head = self.inner.get_head().await?;
        if head.is_some() {
            self.cache.invalidate(&self.key);
        }
        Ok(head)
    }

    async fn get_entries(&self, skip: usize, limit: Option<usize>) -> Result<Vec<QueueEntry>> {
        self.inner.get_entries(skip, limit).await
    }

    async fn get_entry(&self, id: &EntryId) -> Result<Option<QueueEntry>> {
        self.inner.get_entry(id).await
    }

    async fn remove(&self, id: &EntryId) -> Result<Option<QueueEntry>> {
        let result = self.inner.remove(id).await;
        self.cache.invalidate(&self.key);
        result
    }

    async fn remove_all(&self, ids: &[EntryId]) -> Result<Vec<QueueEntry>> {
        let result = self.inner.remove_all(ids).await;
        self.cache.invalidate(&self.key);
        result
    }

    async fn clear(&self, limit: Option<usize>) -> Result<Vec<QueueEntry>> {
        let result = self.inner.clear(limit).await;
        self.cache.invalidate(&self.key);
        result
    }

    async fn get_status(&self) -> Result<QueueStatus> {
        if let Some(status) = self.cache.get(&self.key) {
            return Ok(status);
        }
        let status = self.inner.get_status().await?;
        self.cache.put(&self.key, status);
        Ok(status)
    }
}
