//! ResourceTree port - hierarchical store backing [`crate::queue::TreeQueue`].
//!
//! Paths are absolute, `/`-separated. Writes are grouped into change sets that
//! commit atomically: either every change applies or none does. A `Create`
//! on an existing path fails the whole commit with `Conflict`, which is how
//! concurrent writers racing for the same folder find out they lost.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;

pub type Properties = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub path: String,
    pub properties: Properties,
}

impl Node {
    pub fn name(&self) -> &str {
        node_name(&self.path)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TreeChange {
    /// Create a node; the parent must exist or be created earlier in the same set.
    Create { path: String, properties: Properties },
    /// Replace the properties of an existing node.
    Update { path: String, properties: Properties },
    /// Delete a node and everything below it.
    Delete { path: String },
}

impl TreeChange {
    pub fn path(&self) -> &str {
        match self {
            TreeChange::Create { path, .. }
            | TreeChange::Update { path, .. }
            | TreeChange::Delete { path } => path,
        }
    }
}

#[async_trait]
pub trait ResourceTree: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Node>>;

    /// Child names of `path` in the store's natural (insertion) order.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Number of nodes exactly `depth` levels below `root`, counted by the store.
    async fn count_at_depth(&self, root: &str, depth: usize) -> Result<usize>;

    async fn commit(&self, changes: Vec<TreeChange>) -> Result<()>;

    /// Drop any cached view so the next read sees other writers' commits.
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

pub fn join_path(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{child}")
    } else {
        format!("{parent}/{child}")
    }
}

pub fn parent_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) if trimmed.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&trimmed[..idx]),
    }
}

pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
