//! InMemoryResourceTree - process-local [`ResourceTree`].
//!
//! Change sets are applied to a copy of the tree and swapped in only when
//! every change succeeded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Result, ShuttleError};
use crate::ports::resource_tree::{join_path, node_name, parent_path};
use crate::ports::{Node, Properties, ResourceTree, TreeChange};

const ROOT: &str = "/";

#[derive(Debug, Clone, Default)]
struct Slot {
    properties: Properties,
    /// Child names in insertion order.
    children: Vec<String>,
}

#[derive(Debug, Clone)]
struct Nodes(HashMap<String, Slot>);

impl Nodes {
    fn new() -> Self {
        Self(HashMap::from([(ROOT.to_string(), Slot::default())]))
    }

    fn apply(&mut self, change: TreeChange) -> Result<()> {
        match change {
            TreeChange::Create { path, properties } => {
                if self.0.contains_key(&path) {
                    return Err(ShuttleError::conflict(path));
                }
                let parent = parent_path(&path)
                    .ok_or_else(|| ShuttleError::store(format!("cannot create '{path}'")))?;
                let slot = self
                    .0
                    .get_mut(parent)
                    .ok_or_else(|| ShuttleError::not_found(parent.to_string()))?;
                slot.children.push(node_name(&path).to_string());
                self.0.insert(
                    path,
                    Slot {
                        properties,
                        children: Vec::new(),
                    },
                );
            }
            TreeChange::Update { path, properties } => {
                let slot = self
                    .0
                    .get_mut(&path)
                    .ok_or_else(|| ShuttleError::not_found(path.clone()))?;
                slot.properties = properties;
            }
            TreeChange::Delete { path } => {
                if path == ROOT {
                    return Err(ShuttleError::store("cannot delete the tree root"));
                }
                if !self.0.contains_key(&path) {
                    return Err(ShuttleError::not_found(path));
                }
                if let Some(parent) = parent_path(&path).and_then(|p| self.0.get_mut(p)) {
                    let name = node_name(&path);
                    parent.children.retain(|child| child != name);
                }
                let mut doomed = vec![path];
                while let Some(path) = doomed.pop() {
                    if let Some(slot) = self.0.remove(&path) {
                        doomed.extend(slot.children.iter().map(|c| join_path(&path, c)));
                    }
                }
            }
        }
        Ok(())
    }
}

pub struct InMemoryResourceTree {
    nodes: RwLock<Nodes>,
    failing_commits: AtomicUsize,
}

impl InMemoryResourceTree {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(Nodes::new()),
            failing_commits: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` commits fail without applying anything.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryResourceTree {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceTree for InMemoryResourceTree {
    async fn get(&self, path: &str) -> Result<Option<Node>> {
        let nodes = self.nodes.read().await;
        Ok(nodes.0.get(path).map(|slot| Node {
            path: path.to_string(),
            properties: slot.properties.clone(),
        }))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let nodes = self.nodes.read().await;
        Ok(nodes
            .0
            .get(path)
            .map(|slot| slot.children.clone())
            .unwrap_or_default())
    }

    async fn count_at_depth(&self, root: &str, depth: usize) -> Result<usize> {
        let nodes = self.nodes.read().await;
        let mut level = vec![root.to_string()];
        for _ in 0..depth {
            level = level
                .iter()
                .filter_map(|path| nodes.0.get(path).map(|slot| (path, slot)))
                .flat_map(|(path, slot)| slot.children.iter().map(move |c| join_path(path, c)))
                .collect();
        }
        Ok(level.iter().filter(|path| nodes.0.contains_key(*path)).count())
    }

    async fn commit(&self, changes: Vec<TreeChange>) -> Result<()> {
        if self.take_failure() {
            return Err(ShuttleError::store("injected commit failure"));
        }
        let mut nodes = self.nodes.write().await;
        let mut staged = nodes.clone();
        for change in changes {
            staged.apply(change)?;
        }
        *nodes = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(path: &str) -> TreeChange {
        TreeChange::Create {
            path: path.to_string(),
            properties: Properties::new(),
        }
    }

    #[tokio::test]
    async fn commits_are_all_or_nothing() {
        let tree = InMemoryResourceTree::new();
        tree.commit(vec![create("/q"), create("/q/a")]).await.unwrap();

        let err = tree
            .commit(vec![create("/q/b"), create("/q/a")])
            .await
            .unwrap_err();
        assert!(matches!(err, ShuttleError::Conflict { .. }));
        assert!(tree.get("/q/b").await.unwrap().is_none());
        assert_eq!(tree.children("/q").await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn children_keep_insertion_order_and_delete_is_recursive() {
        let tree = InMemoryResourceTree::new();
        tree.commit(vec![create("/q"), create("/q/z"), create("/q/a"), create("/q/a/1")])
            .await
            .unwrap();
        assert_eq!(tree.children("/q").await.unwrap(), vec!["z", "a"]);
        assert_eq!(tree.count_at_depth("/q", 2).await.unwrap(), 1);

        tree.commit(vec![TreeChange::Delete {
            path: "/q/a".to_string(),
        }])
        .await
        .unwrap();
        assert!(tree.get("/q/a/1").await.unwrap().is_none());
        assert_eq!(tree.children("/q").await.unwrap(), vec!["z"]);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let tree = InMemoryResourceTree::new();
        tree.fail_next_commits(1);
        assert!(tree.commit(vec![create("/q")]).await.is_err());
        assert!(tree.commit(vec![create("/q")]).await.is_ok());
    }
}
