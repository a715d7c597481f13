//! Queue persisted in a [`ResourceTree`], bucketed by minute.
//!
//! Appends land in the folder of the current minute so no single folder grows
//! without bound. Minute folders are created lazily; whoever creates one also
//! creates the next two, so writers crossing a minute boundary rarely race.
//!
//! Entries are enumerated depth-first in the store's child order. That is
//! FIFO because buckets are created chronologically and siblings keep their
//! insertion order; bucket times from different nodes are only a locality
//! hint.

mod cleanup;
pub mod layout;

pub use cleanup::{CLEANUP_SAFETY_MARGIN_MINUTES, TreeQueueCleanup};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{DistributionQueue, QueueCapability, QueueSettings, ensure_capability};
use crate::domain::{
    EntryId, ItemState, PackageInfo, QueueEntry, QueueItem, QueueItemStatus, QueueStatus,
};
use crate::error::{Result, ShuttleError};
use crate::ports::resource_tree::{join_path, parent_path};
use crate::ports::{
    Clock, IdGenerator, Node, Properties, ResourceTree, SystemClock, TreeChange, UlidGenerator,
};

/// Guarded attempts at resolving the minute folder before the final one.
const BUCKET_ATTEMPTS: usize = 3;
/// Minute folders pre-created after the current one.
const PRECREATED_MINUTES: i64 = 2;

/// Properties stored on an entry node.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryNode {
    package_id: String,
    size: u64,
    info: PackageInfo,
    entered: DateTime<Utc>,
    #[serde(default)]
    attempts: u32,
}

impl EntryNode {
    fn into_properties(self) -> Result<Properties> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(ShuttleError::fatal("entry node must serialize to an object")),
        }
    }

    fn from_properties(properties: Properties) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(properties))?)
    }
}

pub struct TreeQueue {
    name: String,
    root: String,
    settings: QueueSettings,
    tree: Arc<dyn ResourceTree>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl TreeQueue {
    pub fn new(
        name: impl Into<String>,
        root: impl Into<String>,
        settings: QueueSettings,
        tree: Arc<dyn ResourceTree>,
    ) -> Self {
        Self {
            name: name.into(),
            root: root.into().trim_end_matches('/').to_string(),
            settings,
            tree,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        }
    }

    /// Use `clock` for bucketing and entry names.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ids = Arc::new(UlidGenerator::new(clock.clone()));
        self.clock = clock;
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Cleanup task sweeping this queue's expired bucket folders.
    pub fn cleanup(&self) -> TreeQueueCleanup {
        TreeQueueCleanup::new(&self.root, self.tree.clone(), self.clock.clone())
    }

    async fn resolve_bucket(&self, now: DateTime<Utc>) -> Result<String> {
        for attempt in 1..=BUCKET_ATTEMPTS {
            match self.try_resolve_bucket(now).await {
                Ok(bucket) => return Ok(bucket),
                Err(err) => {
                    debug!(queue = %self.name, attempt, error = %err, "bucket creation failed, refreshing");
                    self.tree.refresh().await?;
                }
            }
        }
        self.try_resolve_bucket(now).await.map_err(|err| {
            ShuttleError::fatal(format!(
                "queue '{}' could not create its bucket folder: {err}",
                self.name
            ))
        })
    }

    async fn try_resolve_bucket(&self, now: DateTime<Utc>) -> Result<String> {
        let bucket = layout::minute_path(&self.root, now);
        if self.tree.get(&bucket).await?.is_some() {
            return Ok(bucket);
        }

        let mut missing = Vec::new();
        for offset in 0..=PRECREATED_MINUTES {
            let path = layout::minute_path(&self.root, now + Duration::minutes(offset));
            self.collect_missing(&path, &mut missing).await?;
        }
        let changes = missing
            .into_iter()
            .map(|path| TreeChange::Create {
                path,
                properties: Properties::new(),
            })
            .collect();
        self.tree.commit(changes).await?;
        debug!(queue = %self.name, bucket = %bucket, "created bucket folders");
        Ok(bucket)
    }

    /// Append `path` and its missing ancestors to `missing`, parents first.
    async fn collect_missing(&self, path: &str, missing: &mut Vec<String>) -> Result<()> {
        let mut chain = Vec::new();
        let mut current = Some(path.to_string());
        while let Some(path) = current {
            if missing.contains(&path) || self.tree.get(&path).await?.is_some() {
                break;
            }
            current = parent_path(&path).map(str::to_string);
            chain.push(path);
        }
        missing.extend(chain.into_iter().rev());
        Ok(())
    }

    /// Commit `changes`, retrying once after a refresh.
    async fn commit(&self, changes: Vec<TreeChange>) -> Result<()> {
        match self.tree.commit(changes.clone()).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(queue = %self.name, error = %first, "commit failed, retrying after refresh");
                self.tree.refresh().await?;
                self.tree.commit(changes).await.map_err(|err| {
                    ShuttleError::fatal(format!(
                        "queue '{}' could not persist change: {err}",
                        self.name
                    ))
                })
            }
        }
    }

    fn to_entry(&self, node: Node) -> Result<QueueEntry> {
        let id = layout::entry_id(&self.root, &node.path)
            .ok_or_else(|| ShuttleError::fatal(format!("'{}' is outside the queue", node.path)))?;
        let stored = EntryNode::from_properties(node.properties)?;
        let mut status = QueueItemStatus::queued(&self.name, stored.entered);
        status.attempts = stored.attempts;
        if stored.attempts > 0 {
            status.state = ItemState::Active;
        }
        let item = QueueItem::new(stored.package_id, stored.size, stored.info);
        Ok(QueueEntry::new(id, item, status))
    }

    /// Entry nodes in queue order.
    async fn entry_nodes(&self, skip: usize, limit: Option<usize>) -> Result<Vec<Node>> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut found = Vec::new();
        let mut skipped = 0;
        let mut stack = vec![(self.root.clone(), 0usize)];

        while let Some((path, depth)) = stack.pop() {
            if found.len() >= limit {
                break;
            }
            if depth == layout::ENTRY_DEPTH {
                if skipped < skip {
                    skipped += 1;
                } else if let Some(node) = self.tree.get(&path).await? {
                    found.push(node);
                }
                continue;
            }
            let children = self.tree.children(&path).await?;
            stack.extend(
                children
                    .into_iter()
                    .rev()
                    .map(|child| (join_path(&path, &child), depth + 1)),
            );
        }
        Ok(found)
    }

    async fn head_node(&self) -> Result<Option<Node>> {
        Ok(self.entry_nodes(0, Some(1)).await?.pop())
    }

    async fn node_for(&self, id: &EntryId) -> Result<Option<Node>> {
        match layout::entry_path(&self.root, id) {
            Some(path) => self.tree.get(&path).await,
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &EntryId) -> Result<Option<QueueEntry>> {
        let Some(node) = self.node_for(id).await? else {
            return Ok(None);
        };
        let path = node.path.clone();
        let entry = self.to_entry(node)?;
        self.commit(vec![TreeChange::Delete { path }]).await?;
        Ok(Some(entry))
    }
}

#[async_trait]
impl DistributionQueue for TreeQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[QueueCapability] {
        &self.settings.capabilities
    }

    async fn add(&self, item: QueueItem) -> Result<QueueEntry> {
        ensure_capability(self, QueueCapability::Appendable)?;
        let now = self.clock.now();
        let bucket = self.resolve_bucket(now).await?;
        let path = join_path(&bucket, &self.ids.generate_node_name());

        let properties = EntryNode {
            package_id: item.package_id().to_string(),
            size: item.size(),
            info: item.info().clone(),
            entered: now,
            attempts: 0,
        }
        .into_properties()?;
        self.commit(vec![TreeChange::Create {
            path: path.clone(),
            properties,
        }])
        .await?;

        let id = layout::entry_id(&self.root, &path)
            .ok_or_else(|| ShuttleError::fatal(format!("'{path}' is outside the queue")))?;
        Ok(QueueEntry::new(
            id,
            item,
            QueueItemStatus::queued(&self.name, now),
        ))
    }

    async fn get_head(&self) -> Result<Option<QueueEntry>> {
        let Some(node) = self.head_node().await? else {
            return Ok(None);
        };
        let path = node.path.clone();
        let mut entry = self.to_entry(node)?;
        entry.status.start_attempt();

        let properties = EntryNode {
            package_id: entry.item.package_id().to_string(),
            size: entry.item.size(),
            info: entry.item.info().clone(),
            entered: entry.status.entered,
            attempts: entry.status.attempts,
        }
        .into_properties()?;
        self.commit(vec![TreeChange::Update { path, properties }])
            .await?;
        Ok(Some(entry))
    }

    async fn get_entries(&self, skip: usize, limit: Option<usize>) -> Result<Vec<QueueEntry>> {
        self.entry_nodes(skip, limit)
            .await?
            .into_iter()
            .map(|node| self.to_entry(node))
            .collect()
    }

    async fn get_entry(&self, id: &EntryId) -> Result<Option<QueueEntry>> {
        self.node_for(id)
            .await?
            .map(|node| self.to_entry(node))
            .transpose()
    }

    async fn remove(&self, id: &EntryId) -> Result<Option<QueueEntry>> {
        ensure_capability(self, QueueCapability::Removable)?;
        self.delete(id).await
    }

    async fn remove_all(&self, ids: &[EntryId]) -> Result<Vec<QueueEntry>> {
        ensure_capability(self, QueueCapability::Removable)?;
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            removed.extend(self.delete(id).await?);
        }
        Ok(removed)
    }

    async fn clear(&self, limit: Option<usize>) -> Result<Vec<QueueEntry>> {
        ensure_capability(self, QueueCapability::Clearable)?;
        let entries = self.get_entries(0, limit).await?;
        let mut removed = Vec::with_capacity(entries.len());
        for entry in entries {
            removed.extend(self.delete(&entry.id).await?);
        }
        Ok(removed)
    }

    async fn get_status(&self) -> Result<QueueStatus> {
        let count = self
            .tree
            .count_at_depth(&self.root, layout::ENTRY_DEPTH)
            .await?;
        let head = match self.head_node().await? {
            Some(node) => Some(self.to_entry(node)?),
            None => None,
        };
        Ok(QueueStatus::derive(
            count,
            head.as_ref().map(|entry| &entry.status),
            self.settings.state_context(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryResourceTree;
    use crate::ports::FixedClock;
    use chrono::TimeZone;

    const ROOT: &str = "/var/shuttle/publish/default";

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, 30, 15).unwrap()
    }

    fn setup() -> (TreeQueue, Arc<InMemoryResourceTree>, Arc<FixedClock>) {
        let tree = Arc::new(InMemoryResourceTree::new());
        let clock = Arc::new(FixedClock::new(start()));
        let queue = TreeQueue::new("default", ROOT, QueueSettings::default(), tree.clone())
            .with_clock(clock.clone());
        (queue, tree, clock)
    }

    fn item(id: &str) -> QueueItem {
        QueueItem::new(id, 10, PackageInfo::new())
    }

    #[tokio::test]
    async fn add_creates_current_and_next_two_minute_folders() {
        let (queue, tree, _clock) = setup();
        let entry = queue.add(item("pkg-1")).await.unwrap();

        assert!(entry.id.as_str().starts_with("distrq-2024--06--01--10--30--"));
        for minute in ["30", "31", "32"] {
            let path = format!("{ROOT}/2024/06/01/10/{minute}");
            assert!(tree.get(&path).await.unwrap().is_some(), "{path} missing");
        }
        assert!(tree.get(&format!("{ROOT}/2024/06/01/10/33")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn entries_stay_fifo_across_minutes() {
        let (queue, _tree, clock) = setup();
        queue.add(item("pkg-1")).await.unwrap();
        queue.add(item("pkg-2")).await.unwrap();
        clock.advance(Duration::minutes(1));
        queue.add(item("pkg-3")).await.unwrap();
        clock.advance(Duration::minutes(5));
        queue.add(item("pkg-4")).await.unwrap();

        let order: Vec<_> = queue
            .get_entries(0, None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.item.package_id().to_string())
            .collect();
        assert_eq!(order, vec!["pkg-1", "pkg-2", "pkg-3", "pkg-4"]);

        let page = queue.get_entries(1, Some(2)).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].item.package_id(), "pkg-2");
        assert_eq!(queue.get_status().await.unwrap().items_count, 4);
    }

    #[tokio::test]
    async fn head_attempts_are_persisted() {
        let (queue, _tree, _clock) = setup();
        let added = queue.add(item("pkg-1")).await.unwrap();

        queue.get_head().await.unwrap();
        let head = queue.get_head().await.unwrap().unwrap();
        assert_eq!(head.id, added.id);
        assert_eq!(head.status.attempts, 2);

        let stored = queue.get_entry(&added.id).await.unwrap().unwrap();
        assert_eq!(stored.status.attempts, 2);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (queue, _tree, _clock) = setup();
        let added = queue.add(item("pkg-1")).await.unwrap();

        assert!(queue.remove(&added.id).await.unwrap().is_some());
        assert!(queue.remove(&added.id).await.unwrap().is_none());
        assert!(queue.get_head().await.unwrap().is_none());
        assert_eq!(queue.get_status().await.unwrap().items_count, 0);
    }

    #[tokio::test]
    async fn lost_folder_race_is_retried() {
        let (queue, tree, _clock) = setup();
        tree.fail_next_commits(1);

        let entry = queue.add(item("pkg-1")).await.unwrap();
        assert_eq!(
            queue.get_head().await.unwrap().unwrap().id,
            entry.id
        );
    }

    #[tokio::test]
    async fn persistent_commit_failure_is_fatal() {
        let (queue, tree, _clock) = setup();
        queue.add(item("pkg-1")).await.unwrap();
        tree.fail_next_commits(2);

        let err = queue.add(item("pkg-2")).await.unwrap_err();
        assert!(matches!(err, ShuttleError::Fatal { .. }));
        assert_eq!(queue.get_status().await.unwrap().items_count, 1);
    }

    #[tokio::test]
    async fn exhausted_bucket_creation_leaves_no_folders() {
        let (queue, tree, _clock) = setup();
        tree.fail_next_commits(4);

        let err = queue.add(item("pkg-1")).await.unwrap_err();
        assert!(matches!(err, ShuttleError::Fatal { .. }));
        assert_eq!(queue.get_status().await.unwrap().items_count, 0);
        assert!(queue.get_head().await.unwrap().is_none());
        assert!(tree.get(&format!("{ROOT}/2024")).await.unwrap().is_none());
        assert!(tree.children(ROOT).await.unwrap().is_empty());

        // The tree recovers once commits go through again.
        queue.add(item("pkg-2")).await.unwrap();
        assert_eq!(queue.get_status().await.unwrap().items_count, 1);
    }

    #[tokio::test]
    async fn ids_outside_the_entry_level_resolve_to_nothing() {
        let (queue, tree, _clock) = setup();
        let added = queue.add(item("pkg-1")).await.unwrap();

        for id in [
            "distrq-2024",
            "distrq-2024--06--01--10--30",
            "distrq-2024--06--01--10--30--..",
            "distrq-..--..--..--..--..--x",
            "distrq-2024--06--01--10--30--.",
        ] {
            let id = EntryId::from(id);
            assert!(queue.get_entry(&id).await.unwrap().is_none(), "{id:?}");
            assert!(queue.remove(&id).await.unwrap().is_none(), "{id:?}");
        }
        assert!(tree.get(&format!("{ROOT}/2024")).await.unwrap().is_some());
        assert!(queue.get_entry(&added.id).await.unwrap().is_some());
        assert_eq!(queue.get_status().await.unwrap().items_count, 1);
    }
}
