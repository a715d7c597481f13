//! JobStore port - durable job queue backing [`crate::queue::PersistedQueue`].
//!
//! The store owns durability, ordering and the retry counter. Any durable task
//! queue offering submit / query-by-topic / cancel and a native retry count can
//! implement it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::JobId;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub topic: String,
    pub created: DateTime<Utc>,
    /// Native retry counter, bumped by [`JobStore::start`].
    pub retry_count: u32,
    pub properties: serde_json::Value,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn submit(&self, topic: &str, properties: serde_json::Value) -> Result<Job>;

    /// Jobs of `topic` in submission order. `limit = None` is unbounded.
    async fn query(&self, topic: &str, skip: usize, limit: Option<usize>) -> Result<Vec<Job>>;

    async fn get(&self, topic: &str, id: JobId) -> Result<Option<Job>>;

    /// Mark the job as picked up, incrementing its retry counter.
    async fn start(&self, topic: &str, id: JobId) -> Result<Option<Job>>;

    /// Remove the job. Returns it if it was still present.
    async fn cancel(&self, topic: &str, id: JobId) -> Result<Option<Job>>;

    async fn count(&self, topic: &str) -> Result<usize>;
}
