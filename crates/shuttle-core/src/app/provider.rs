//! Queue provider: opens queues by name and runs their processing loops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::processing::{ErrorEscalation, ProcessingGroup, QueuePoller};
use crate::error::{Result, ShuttleError};
use crate::observability::QueueCounts;
use crate::ports::{Clock, JobStore, QueueProcessor, ResourceTree, SystemClock};
use crate::queue::{
    CachingQueue, DEFAULT_STATUS_TTL, DistributionQueue, MonitoringQueue, PersistedQueue,
    ProcessingFlag, QueueCapability, QueueSettings, RetryPolicy, StatusCache, TransientQueue,
    TreeQueue, TreeQueueCleanup,
};

#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Open (or create) the queue called `name`.
    fn get_queue(&self, name: &str) -> Result<Arc<dyn DistributionQueue>>;

    /// Start one poll task per queue in `names`, feeding heads to `processor`.
    async fn enable_queue_processing(
        &self,
        processor: Arc<dyn QueueProcessor>,
        names: &[String],
    ) -> Result<()>;

    /// Stop every poll task started by this provider.
    async fn disable_queue_processing(&self);

    /// Clock of the queues this provider opens.
    fn clock(&self) -> &dyn Clock {
        &SystemClock
    }
}

/// Creates backend queues for a provider.
pub trait QueueFactory: Send + Sync {
    fn create(
        &self,
        agent: &str,
        name: &str,
        settings: QueueSettings,
    ) -> Result<Arc<dyn DistributionQueue>>;

    /// Periodic maintenance for the queue, if the backend needs any.
    fn cleanup(&self, _agent: &str, _name: &str) -> Option<TreeQueueCleanup> {
        None
    }

    fn clock(&self) -> &dyn Clock {
        &SystemClock
    }
}

pub struct TransientQueueFactory {
    clock: Arc<dyn Clock>,
}

impl TransientQueueFactory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl Default for TransientQueueFactory {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl QueueFactory for TransientQueueFactory {
    fn create(
        &self,
        _agent: &str,
        name: &str,
        settings: QueueSettings,
    ) -> Result<Arc<dyn DistributionQueue>> {
        Ok(Arc::new(TransientQueue::with_clock(
            name,
            settings,
            self.clock.clone(),
        )))
    }

    fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }
}

pub struct PersistedQueueFactory {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl PersistedQueueFactory {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for the entry time of new items.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl QueueFactory for PersistedQueueFactory {
    fn create(
        &self,
        agent: &str,
        name: &str,
        settings: QueueSettings,
    ) -> Result<Arc<dyn DistributionQueue>> {
        let queue = PersistedQueue::new(agent, name, settings, self.store.clone())
            .with_clock(self.clock.clone());
        Ok(Arc::new(queue))
    }

    fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }
}

/// Tree queues live under `{root}/{agent}/{queue}`.
pub struct TreeQueueFactory {
    tree: Arc<dyn ResourceTree>,
    root: String,
    clock: Arc<dyn Clock>,
}

impl TreeQueueFactory {
    pub fn new(tree: Arc<dyn ResourceTree>, root: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            tree,
            root: root.into().trim_end_matches('/').to_string(),
            clock,
        }
    }

    pub fn queue_root(&self, agent: &str, name: &str) -> String {
        format!("{}/{agent}/{name}", self.root)
    }
}

impl QueueFactory for TreeQueueFactory {
    fn create(
        &self,
        agent: &str,
        name: &str,
        settings: QueueSettings,
    ) -> Result<Arc<dyn DistributionQueue>> {
        let queue = TreeQueue::new(name, self.queue_root(agent, name), settings, self.tree.clone())
            .with_clock(self.clock.clone());
        Ok(Arc::new(queue))
    }

    fn cleanup(&self, agent: &str, name: &str) -> Option<TreeQueueCleanup> {
        Some(TreeQueueCleanup::new(
            &self.queue_root(agent, name),
            self.tree.clone(),
            self.clock.clone(),
        ))
    }
    fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub retry: RetryPolicy,
    /// Queues reported as PASSIVE.
    pub passive_queues: Vec<String>,
    /// Zero disables status caching.
    pub status_ttl: Duration,
    pub poll_interval: Duration,
    pub cleanup_interval: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            passive_queues: Vec::new(),
            status_ttl: DEFAULT_STATUS_TTL,
            poll_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

struct OpenQueue {
    queue: Arc<dyn DistributionQueue>,
    monitor: Arc<MonitoringQueue>,
    processing: ProcessingFlag,
}

/// Provider for one agent. Queues are opened lazily and kept for the
/// provider's lifetime; each one is wrapped in a [`MonitoringQueue`] and,
/// unless the status TTL is zero, a [`CachingQueue`].
pub struct DefaultQueueProvider {
    agent: String,
    factory: Arc<dyn QueueFactory>,
    settings: ProviderSettings,
    cache: Arc<StatusCache>,
    queues: Mutex<HashMap<String, OpenQueue>>,
    processing: tokio::sync::Mutex<Option<ProcessingGroup>>,
    escalation: Option<ErrorEscalation>,
    this: Weak<DefaultQueueProvider>,
}

impl std::fmt::Debug for DefaultQueueProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultQueueProvider")
            .field("agent", &self.agent)
            .finish_non_exhaustive()
    }
}

impl DefaultQueueProvider {
    pub fn new(
        agent: impl Into<String>,
        factory: Arc<dyn QueueFactory>,
        settings: ProviderSettings,
    ) -> Arc<Self> {
        Self::build(agent.into(), factory, settings, None)
    }

    /// Like [`new`](Self::new), moving exhausted entries to error queues.
    pub fn with_escalation(
        agent: impl Into<String>,
        factory: Arc<dyn QueueFactory>,
        settings: ProviderSettings,
        escalation: ErrorEscalation,
    ) -> Arc<Self> {
        Self::build(agent.into(), factory, settings, Some(escalation))
    }

    /// In-memory provider with default settings.
    pub fn transient(agent: impl Into<String>) -> Arc<Self> {
        Self::new(
            agent,
            Arc::new(TransientQueueFactory::default()),
            ProviderSettings::default(),
        )
    }

    fn build(
        agent: String,
        factory: Arc<dyn QueueFactory>,
        settings: ProviderSettings,
        escalation: Option<ErrorEscalation>,
    ) -> Arc<Self> {
        let cache = Arc::new(StatusCache::new(settings.status_ttl));
        Arc::new_cyclic(|this| Self {
            agent,
            factory,
            settings,
            cache,
            queues: Mutex::new(HashMap::new()),
            processing: tokio::sync::Mutex::new(None),
            escalation,
            this: this.clone(),
        })
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    /// Operation counters of an opened queue.
    pub fn metrics(&self, name: &str) -> Option<QueueCounts> {
        self.lock_queues().get(name).map(|open| open.monitor.metrics())
    }

    /// Names of the queues opened so far, sorted.
    pub fn open_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_queues().keys().cloned().collect();
        names.sort();
        names
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, HashMap<String, OpenQueue>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open(&self, name: &str) -> Result<OpenQueue> {
        let processing = ProcessingFlag::default();
        let settings = QueueSettings {
            passive: self.settings.passive_queues.iter().any(|p| p == name),
            retry: self.settings.retry,
            capabilities: QueueCapability::ALL.to_vec(),
            processing: processing.clone(),
        };
        let backend = self.factory.create(&self.agent, name, settings)?;
        let monitor = Arc::new(MonitoringQueue::new(backend));
        let queue: Arc<dyn DistributionQueue> = if self.settings.status_ttl.is_zero() {
            monitor.clone()
        } else {
            Arc::new(CachingQueue::new(
                &self.agent,
                monitor.clone(),
                self.cache.clone(),
            ))
        };
        debug!(agent = %self.agent, queue = name, "queue opened");
        Ok(OpenQueue {
            queue,
            monitor,
            processing,
        })
    }

    fn set_processing(&self, names: Option<&[String]>, processing: bool) {
        for (name, open) in self.lock_queues().iter() {
            if names.is_none_or(|names| names.contains(name)) {
                open.processing.set(processing);
            }
        }
        // Cached states were derived with the old flag.
        self.cache.clear();
    }
}

#[async_trait]
impl QueueProvider for DefaultQueueProvider {
    fn get_queue(&self, name: &str) -> Result<Arc<dyn DistributionQueue>> {
        let mut queues = self.lock_queues();
        if let Some(open) = queues.get(name) {
            return Ok(open.queue.clone());
        }
        let open = self.open(name)?;
        let queue = open.queue.clone();
        queues.insert(name.to_string(), open);
        Ok(queue)
    }

    async fn enable_queue_processing(
        &self,
        processor: Arc<dyn QueueProcessor>,
        names: &[String],
    ) -> Result<()> {
        let this: Arc<dyn QueueProvider> = self
            .this
            .upgrade()
            .ok_or_else(|| ShuttleError::fatal("queue provider is shutting down"))?;

        let mut processing = self.processing.lock().await;
        if let Some(running) = processing.take() {
            debug!(agent = %self.agent, "restarting queue processing");
            running.shutdown_and_join().await;
        }

        for name in names {
            self.get_queue(name)?;
        }
        self.set_processing(Some(names), true);

        let mut group = ProcessingGroup::new();
        for name in names {
            let poller = QueuePoller::new(
                this.clone(),
                name.as_str(),
                processor.clone(),
                self.settings.retry,
                self.escalation.clone(),
            );
            group.spawn_poller(poller, self.settings.poll_interval);
            if let Some(cleanup) = self.factory.cleanup(&self.agent, name) {
                group.spawn_cleanup(cleanup, self.settings.cleanup_interval);
            }
        }
        info!(
            agent = %self.agent,
            queues = names.len(),
            tasks = group.len(),
            "queue processing enabled"
        );
        *processing = Some(group);
        Ok(())
    }

    async fn disable_queue_processing(&self) {
        let running = self.processing.lock().await.take();
        if let Some(group) = running {
            group.shutdown_and_join().await;
            info!(agent = %self.agent, "queue processing disabled");
        }
        self.set_processing(None, false);
    }

    fn clock(&self) -> &dyn Clock {
        self.factory.clock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PackageInfo, QueueEntry, QueueItem, QueueState};
    use crate::impls::{InMemoryJobStore, InMemoryResourceTree};
    use crate::ports::FixedClock;

    struct AcceptAll;

    #[async_trait]
    impl QueueProcessor for AcceptAll {
        async fn process(&self, _queue_name: &str, _entry: &QueueEntry) -> bool {
            true
        }
    }

    fn item(id: &str) -> QueueItem {
        QueueItem::new(id, 1, PackageInfo::new())
    }

    #[tokio::test]
    async fn queues_are_opened_once() {
        let provider = DefaultQueueProvider::transient("publish");
        let first = provider.get_queue("default").unwrap();
        first.add(item("pkg-1")).await.unwrap();

        let again = provider.get_queue("default").unwrap();
        assert_eq!(again.get_status().await.unwrap().items_count, 1);
        assert_eq!(provider.open_queues(), vec!["default"]);
        assert_eq!(provider.metrics("default").unwrap().added, 1);
        assert!(provider.metrics("other").is_none());
    }

    #[tokio::test]
    async fn passive_queues_report_passive() {
        let settings = ProviderSettings {
            passive_queues: vec!["paused".to_string()],
            ..ProviderSettings::default()
        };
        let provider =
            DefaultQueueProvider::new("publish", Arc::new(TransientQueueFactory::default()), settings);

        let paused = provider.get_queue("paused").unwrap();
        assert_eq!(paused.get_status().await.unwrap().state, QueueState::Passive);
        let active = provider.get_queue("active").unwrap();
        assert_eq!(active.get_status().await.unwrap().state, QueueState::Empty);
    }

    #[tokio::test]
    async fn processing_flag_turns_empty_into_idle() {
        let provider = DefaultQueueProvider::transient("publish");
        let queue = provider.get_queue("default").unwrap();
        assert_eq!(queue.get_status().await.unwrap().state, QueueState::Empty);

        provider
            .enable_queue_processing(Arc::new(AcceptAll), &["default".to_string()])
            .await
            .unwrap();
        assert_eq!(queue.get_status().await.unwrap().state, QueueState::Idle);

        provider.disable_queue_processing().await;
        assert_eq!(queue.get_status().await.unwrap().state, QueueState::Empty);
    }

    #[tokio::test]
    async fn persisted_factory_scopes_topics_by_agent() {
        let store = Arc::new(InMemoryJobStore::new());
        let factory: Arc<dyn QueueFactory> = Arc::new(PersistedQueueFactory::new(store.clone()));
        let publish = DefaultQueueProvider::new("publish", factory.clone(), ProviderSettings::default());
        let backup = DefaultQueueProvider::new("backup", factory, ProviderSettings::default());

        publish.get_queue("default").unwrap().add(item("pkg-1")).await.unwrap();
        let other = backup.get_queue("default").unwrap();
        assert!(other.get_status().await.unwrap().is_empty());
        assert_eq!(store.count("shuttle/queue/publish/default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tree_factory_roots_queues_per_agent() {
        let tree = Arc::new(InMemoryResourceTree::new());
        let clock = Arc::new(FixedClock::new(
            chrono::DateTime::parse_from_rfc3339("2024-03-01T10:15:30Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
        ));
        let factory = TreeQueueFactory::new(tree.clone(), "/var/shuttle/", clock);
        assert_eq!(
            factory.queue_root("publish", "default"),
            "/var/shuttle/publish/default"
        );
        assert!(factory.cleanup("publish", "default").is_some());
        assert!(TransientQueueFactory::default().cleanup("publish", "default").is_none());

        let provider = DefaultQueueProvider::new("publish", Arc::new(factory), ProviderSettings::default());
        provider.get_queue("default").unwrap().add(item("pkg-1")).await.unwrap();
        assert!(
            tree.get("/var/shuttle/publish/default/2024/03/01/10/15")
                .await
                .unwrap()
                .is_some()
        );
    }
}
