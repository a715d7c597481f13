//! In-memory queue. Not durable; for tests and ephemeral agents.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{DistributionQueue, QueueCapability, QueueSettings, ensure_capability};
use crate::domain::{EntryId, QueueEntry, QueueItem, QueueItemStatus, QueueStatus};
use crate::error::Result;
use crate::ports::{Clock, SystemClock};

#[derive(Default)]
struct TransientState {
    items: VecDeque<QueueItem>,
    /// Keyed by package id; entries are evicted together with their item.
    statuses: HashMap<String, QueueItemStatus>,
}

impl TransientState {
    fn remove(&mut self, package_id: &str) -> Option<QueueEntry> {
        let position = self
            .items
            .iter()
            .position(|item| item.package_id() == package_id)?;
        let entry = self.entry(&self.items[position]);
        self.items.remove(position);
        self.statuses.remove(package_id);
        entry
    }

    fn entry(&self, item: &QueueItem) -> Option<QueueEntry> {
        let status = self.statuses.get(item.package_id())?;
        Some(QueueEntry::new(
            EntryId::new(item.package_id()),
            item.clone(),
            status.clone(),
        ))
    }
}

/// Unbounded FIFO whose entry ids are the package ids of their items.
pub struct TransientQueue {
    name: String,
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
    state: Mutex<TransientState>,
}

impl TransientQueue {
    pub fn new(name: impl Into<String>, settings: QueueSettings) -> Self {
        Self::with_clock(name, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(name: impl Into<String>, settings: QueueSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            settings,
            clock,
            state: Mutex::new(TransientState::default()),
        }
    }
}

#[async_trait]
impl DistributionQueue for TransientQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[QueueCapability] {
        &self.settings.capabilities
    }

    /// Adding a package that is already queued returns its existing entry.
    async fn add(&self, item: QueueItem) -> Result<QueueEntry> {
        ensure_capability(self, QueueCapability::Appendable)?;
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .items
            .iter()
            .find(|queued| queued.package_id() == item.package_id())
            .and_then(|queued| state.entry(queued))
        {
            return Ok(existing);
        }

        let status = QueueItemStatus::queued(&self.name, self.clock.now());
        state
            .statuses
            .insert(item.package_id().to_string(), status.clone());
        state.items.push_back(item.clone());
        Ok(QueueEntry::new(EntryId::new(item.package_id()), item, status))
    }

    async fn get_head(&self) -> Result<Option<QueueEntry>> {
        let mut state = self.state.lock().await;
        let Some(item) = state.items.front().cloned() else {
            return Ok(None);
        };
        let status = state
            .statuses
            .entry(item.package_id().to_string())
            .or_insert_with(|| QueueItemStatus::queued(&self.name, self.clock.now()));
        status.start_attempt();
        let status = status.clone();
        Ok(Some(QueueEntry::new(
            EntryId::new(item.package_id()),
            item,
            status,
        )))
    }

    async fn get_entries(&self, skip: usize, limit: Option<usize>) -> Result<Vec<QueueEntry>> {
        let state = self.state.lock().await;
        let entries = state
            .items
            .iter()
            .skip(skip)
            .take(limit.unwrap_or(usize::MAX))
            .filter_map(|item| state.entry(item))
            .collect();
        Ok(entries)
    }

    async fn get_entry(&self, id: &EntryId) -> Result<Option<QueueEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .iter()
            .find(|item| item.package_id() == id.as_str())
            .and_then(|item| state.entry(item)))
    }

    async fn remove(&self, id: &EntryId) -> Result<Option<QueueEntry>> {
        ensure_capability(self, QueueCapability::Removable)?;
        Ok(self.state.lock().await.remove(id.as_str()))
    }

    async fn remove_all(&self, ids: &[EntryId]) -> Result<Vec<QueueEntry>> {
        ensure_capability(self, QueueCapability::Removable)?;
        let mut state = self.state.lock().await;
        Ok(ids.iter().filter_map(|id| state.remove(id.as_str())).collect())
    }

    async fn clear(&self, limit: Option<usize>) -> Result<Vec<QueueEntry>> {
        ensure_capability(self, QueueCapability::Clearable)?;
        let mut state = self.state.lock().await;
        let count = limit.unwrap_or(usize::MAX).min(state.items.len());
        let ids: Vec<String> = state
            .items
            .iter()
            .take(count)
            .map(|item| item.package_id().to_string())
            .collect();
        Ok(ids.iter().filter_map(|id| state.remove(id)).collect())
    }

    async fn get_status(&self) -> Result<QueueStatus> {
        let state = self.state.lock().await;
        let head = state
            .items
            .front()
            .and_then(|item| state.statuses.get(item.package_id()));
        Ok(QueueStatus::derive(
            state.items.len(),
            head,
            self.settings.state_context(),
        ))
    }
}
