//! Periodic removal of drained bucket folders.

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info};

use super::layout;
use crate::error::Result;
use crate::ports::resource_tree::join_path;
use crate::ports::{Clock, ResourceTree, TreeChange};

/// Folders that may still receive writes are never older than this.
pub const CLEANUP_SAFETY_MARGIN_MINUTES: i64 = 5;

/// Deletes empty bucket folders of one tree-backed queue.
///
/// A folder goes once it has no children and the last minute it can hold
/// ends before `now - 5min`, truncated to the minute. Entry nodes and the
/// queue root are never touched.
pub struct TreeQueueCleanup {
    root: String,
    tree: Arc<dyn ResourceTree>,
    clock: Arc<dyn Clock>,
}

impl TreeQueueCleanup {
    pub fn new(root: &str, tree: Arc<dyn ResourceTree>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.trim_end_matches('/').to_string(),
            tree,
            clock,
        }
    }

    /// One sweep. Returns the number of folders deleted.
    pub async fn run_once(&self) -> Result<usize> {
        let cutoff = layout::truncate_to_minute(self.clock.now() - Duration::minutes(CLEANUP_SAFETY_MARGIN_MINUTES));

        // Pre-order listing; walking it backwards visits children first.
        let mut folders = Vec::new();
        let mut stack = vec![(self.root.clone(), 0usize)];
        while let Some((path, depth)) = stack.pop() {
            if depth > 0 {
                folders.push(path.clone());
            }
            if depth < layout::BUCKET_DEPTH {
                for child in self.tree.children(&path).await?.into_iter().rev() {
                    stack.push((join_path(&path, &child), depth + 1));
                }
            }
        }

        let mut deleted = 0;
        for folder in folders.into_iter().rev() {
            let expired = layout::bucket_segments(&self.root, &folder)
                .and_then(|segments| layout::bucket_end(&segments))
                .is_some_and(|end| end <= cutoff);
            if !expired || !self.tree.children(&folder).await?.is_empty() {
                continue;
            }
            self.tree
                .commit(vec![TreeChange::Delete {
                    path: folder.clone(),
                }])
                .await?;
            debug!(folder = %folder, "deleted expired bucket folder");
            deleted += 1;
        }

        if deleted > 0 {
            info!(root = %self.root, deleted, "tree queue cleanup finished");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PackageInfo, QueueItem};
    use crate::impls::InMemoryResourceTree;
    use crate::ports::FixedClock;
    use crate::queue::{DistributionQueue, QueueSettings, TreeQueue};
    use chrono::{TimeZone, Utc};

    const ROOT: &str = "/var/shuttle/publish/default";

    #[tokio::test]
    async fn only_empty_expired_folders_are_deleted() {
        let tree = Arc::new(InMemoryResourceTree::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 10, 30, 0).unwrap(),
        ));
        let queue = TreeQueue::new("default", ROOT, QueueSettings::default(), tree.clone())
            .with_clock(clock.clone());

        let drained = queue
            .add(QueueItem::new("pkg-1", 1, PackageInfo::new()))
            .await
            .unwrap();
        queue
            .add(QueueItem::new("pkg-2", 1, PackageInfo::new()))
            .await
            .unwrap();
        queue.remove(&drained.id).await.unwrap();
        // 10:30 holds pkg-2; 10:31 and 10:32 are empty.

        let cleanup = queue.cleanup();
        clock.set(Utc.with_ymd_and_hms(2024, 6, 1, 10, 36, 30).unwrap());
        // Cutoff 10:31: nothing has ended yet except 10:30, which is not empty.
        assert_eq!(cleanup.run_once().await.unwrap(), 0);

        clock.set(Utc.with_ymd_and_hms(2024, 6, 1, 10, 37, 0).unwrap());
        // Cutoff 10:32: 10:31 has ended and is empty.
        assert_eq!(cleanup.run_once().await.unwrap(), 1);
        assert!(tree.get(&format!("{ROOT}/2024/06/01/10/31")).await.unwrap().is_none());
        assert!(tree.get(&format!("{ROOT}/2024/06/01/10/32")).await.unwrap().is_some());
        assert!(tree.get(&format!("{ROOT}/2024/06/01/10/30")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn drained_tree_collapses_to_root() {
        let tree = Arc::new(InMemoryResourceTree::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 0).unwrap(),
        ));
        let queue = TreeQueue::new("default", ROOT, QueueSettings::default(), tree.clone())
            .with_clock(clock.clone());
        let entry = queue
            .add(QueueItem::new("pkg-1", 1, PackageInfo::new()))
            .await
            .unwrap();
        queue.remove(&entry.id).await.unwrap();

        clock.set(Utc.with_ymd_and_hms(2025, 1, 1, 0, 10, 0).unwrap());
        let deleted = queue.cleanup().run_once().await.unwrap();

        // Minutes 23:59, 00:00 and 00:01 plus two hours, two days, a month and a year.
        assert_eq!(deleted, 9);
        assert!(tree.children(ROOT).await.unwrap().is_empty());
        assert!(tree.get(ROOT).await.unwrap().is_some());
    }
}
