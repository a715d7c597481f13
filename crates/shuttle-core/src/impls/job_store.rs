//! InMemoryJobStore - process-local [`JobStore`].
//!
//! Jobs are kept per topic in submission order. Good enough for tests and
//! single-node agents; production wiring plugs in a durable store instead.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::JobId;
use crate::error::Result;
use crate::ports::{Clock, IdGenerator, Job, JobStore, SystemClock, UlidGenerator};

pub struct InMemoryJobStore {
    topics: Mutex<HashMap<String, Vec<Job>>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            ids: Arc::new(UlidGenerator::new(clock.clone())),
            clock,
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn submit(&self, topic: &str, properties: serde_json::Value) -> Result<Job> {
        let job = Job {
            id: self.ids.generate_job_id(),
            topic: topic.to_string(),
            created: self.clock.now(),
            retry_count: 0,
            properties,
        };
        self.topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(job.clone());
        Ok(job)
    }

    async fn query(&self, topic: &str, skip: usize, limit: Option<usize>) -> Result<Vec<Job>> {
        let topics = self.topics.lock().await;
        Ok(topics
            .get(topic)
            .map(|jobs| {
                jobs.iter()
                    .skip(skip)
                    .take(limit.unwrap_or(usize::MAX))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, topic: &str, id: JobId) -> Result<Option<Job>> {
        let topics = self.topics.lock().await;
        Ok(topics
            .get(topic)
            .and_then(|jobs| jobs.iter().find(|job| job.id == id))
            .cloned())
    }

    async fn start(&self, topic: &str, id: JobId) -> Result<Option<Job>> {
        let mut topics = self.topics.lock().await;
        let job = topics
            .get_mut(topic)
            .and_then(|jobs| jobs.iter_mut().find(|job| job.id == id));
        Ok(job.map(|job| {
            job.retry_count = job.retry_count.saturating_add(1);
            job.clone()
        }))
    }

    async fn cancel(&self, topic: &str, id: JobId) -> Result<Option<Job>> {
        let mut topics = self.topics.lock().await;
        let Some(jobs) = topics.get_mut(topic) else {
            return Ok(None);
        };
        Ok(jobs
            .iter()
            .position(|job| job.id == id)
            .map(|position| jobs.remove(position)))
    }

    async fn count(&self, topic: &str) -> Result<usize> {
        Ok(self.topics.lock().await.get(topic).map_or(0, Vec::len))
    }
}
