//! Distribution agent: packages in, queues through, transports out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::QueueProvider;
use crate::dispatch::{AsyncDeliveryDispatchingStrategy, DispatchingStrategy};
use crate::domain::{DistributionRequest, ItemState, QueueEntry, QueueItemStatus, QueueStatus};
use crate::error::Result;
use crate::ports::{DistributionPackage, PackageBuilder, QueueProcessor};
use crate::transport::Transport;

pub struct DistributionAgent {
    name: String,
    strategy: Arc<dyn DispatchingStrategy>,
    provider: Arc<dyn QueueProvider>,
    packages: Arc<dyn PackageBuilder>,
}

impl DistributionAgent {
    pub fn new(
        name: impl Into<String>,
        strategy: Arc<dyn DispatchingStrategy>,
        provider: Arc<dyn QueueProvider>,
        packages: Arc<dyn PackageBuilder>,
    ) -> Self {
        Self {
            name: name.into(),
            strategy,
            provider,
            packages,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.strategy.queue_names()
    }

    /// Build a package for `request` and dispatch it.
    pub async fn distribute(&self, request: &DistributionRequest) -> Result<Vec<QueueItemStatus>> {
        let package = self.packages.create_package(request).await?;
        info!(
            agent = %self.name,
            package_id = package.id(),
            request_type = %request.request_type,
            paths = request.paths.len(),
            "package created"
        );
        self.dispatch(package.as_ref()).await
    }

    pub async fn dispatch(&self, package: &dyn DistributionPackage) -> Result<Vec<QueueItemStatus>> {
        let statuses = self.strategy.add(package, self.provider.as_ref()).await?;
        let failed = statuses
            .iter()
            .filter(|status| status.state == ItemState::Error)
            .count();
        if failed > 0 {
            warn!(
                agent = %self.name,
                package_id = package.id(),
                failed,
                queues = statuses.len(),
                "package not queued everywhere"
            );
        }
        Ok(statuses)
    }

    /// Start draining every queue the strategy writes to.
    pub async fn start(&self, processor: Arc<dyn QueueProcessor>) -> Result<()> {
        self.provider
            .enable_queue_processing(processor, &self.strategy.queue_names())
            .await
    }

    pub async fn stop(&self) {
        self.provider.disable_queue_processing().await;
    }

    /// Pull up to `max` packages from `transport` and dispatch each one.
    pub async fn pull(
        &self,
        transport: &dyn Transport,
        request: &DistributionRequest,
        max: usize,
    ) -> Result<Vec<QueueItemStatus>> {
        let mut statuses = Vec::new();
        for _ in 0..max {
            let Some(package) = transport.retrieve_package(request).await? else {
                break;
            };
            self.packages.install_package(package.clone()).await?;
            statuses.extend(self.dispatch(package.as_ref()).await?);
        }
        debug!(
            agent = %self.name,
            endpoint = transport.endpoint(),
            queued = statuses.len(),
            "pull finished"
        );
        Ok(statuses)
    }

    pub async fn queue_status(&self, name: &str) -> Result<QueueStatus> {
        self.provider.get_queue(name)?.get_status().await
    }
}

/// Hands queue heads to the transport of their queue.
///
/// A delivered package is released for the queue it was taken from. With
/// async delivery configured, entries of the primary queue are split into the
/// delivery queues instead of being sent.
pub struct DeliveryProcessor {
    packages: Arc<dyn PackageBuilder>,
    transports: HashMap<String, Arc<dyn Transport>>,
    async_delivery: Option<(Arc<AsyncDeliveryDispatchingStrategy>, Arc<dyn QueueProvider>)>,
}

impl DeliveryProcessor {
    pub fn new(packages: Arc<dyn PackageBuilder>) -> Self {
        Self {
            packages,
            transports: HashMap::new(),
            async_delivery: None,
        }
    }

    pub fn with_transport(mut self, queue_name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(queue_name.into(), transport);
        self
    }

    pub fn with_async_delivery(
        mut self,
        strategy: Arc<AsyncDeliveryDispatchingStrategy>,
        provider: Arc<dyn QueueProvider>,
    ) -> Self {
        self.async_delivery = Some((strategy, provider));
        self
    }

    async fn deliver(&self, queue_name: &str, package: &dyn DistributionPackage) -> Result<bool> {
        if let Some((strategy, provider)) = &self.async_delivery
            && strategy.is_primary(queue_name)
        {
            strategy.split(package, provider.as_ref()).await?;
            return Ok(true);
        }

        let Some(transport) = self.transports.get(queue_name) else {
            warn!(queue = queue_name, "no transport for queue");
            return Ok(false);
        };
        transport.deliver_package(package).await?;
        // The endpoint has the package; a failed release must not redeliver it.
        let released = match package.as_shared() {
            Some(shared) => shared.release(&[queue_name]).await.map(|_| ()),
            None => package.delete().await,
        };
        if let Err(err) = released {
            warn!(
                queue = queue_name,
                package_id = package.id(),
                error = %err,
                "package delivered but not released"
            );
        }
        Ok(true)
    }
}

#[async_trait]
impl QueueProcessor for DeliveryProcessor {
    async fn process(&self, queue_name: &str, entry: &QueueEntry) -> bool {
        let package_id = entry.item.package_id();
        let package = match self.packages.get_package(package_id).await {
            Ok(Some(package)) => package,
            Ok(None) => {
                warn!(queue = queue_name, entry_id = %entry.id, package_id, "package is gone, dropping entry");
                return true;
            }
            Err(err) => {
                warn!(queue = queue_name, package_id, error = %err, "could not resolve package");
                return false;
            }
        };

        match self.deliver(queue_name, package.as_ref()).await {
            Ok(done) => done,
            Err(err) if err.is_recoverable() => {
                debug!(
                    queue = queue_name,
                    package_id,
                    attempts = entry.status.attempts,
                    error = %err,
                    "endpoint not ready, retrying later"
                );
                false
            }
            Err(err) => {
                warn!(
                    queue = queue_name,
                    package_id,
                    attempts = entry.status.attempts,
                    error = %err,
                    "delivery failed"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::app::DefaultQueueProvider;
    use crate::dispatch::MultipleQueueDispatchingStrategy;
    use crate::dispatch::testing::PartlyBrokenProvider;
    use crate::error::ShuttleError;
    use crate::impls::InMemoryPackageBuilder;

    /// Records deliveries; fails with `fail_with` when set.
    #[derive(Default)]
    struct RecordingTransport {
        delivered: Mutex<Vec<String>>,
        fail_with: Option<ShuttleError>,
        pending: Mutex<Vec<Arc<dyn DistributionPackage>>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn endpoint(&self) -> &str {
            "http://publish:4503/receive"
        }

        async fn deliver_package(&self, package: &dyn DistributionPackage) -> Result<()> {
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            self.delivered.lock().unwrap().push(package.id().to_string());
            Ok(())
        }

        async fn retrieve_package(
            &self,
            _request: &DistributionRequest,
        ) -> Result<Option<Arc<dyn DistributionPackage>>> {
            Ok(self.pending.lock().unwrap().pop())
        }
    }

    fn agent(
        strategy: Arc<dyn DispatchingStrategy>,
    ) -> (DistributionAgent, Arc<DefaultQueueProvider>, Arc<InMemoryPackageBuilder>) {
        let provider = DefaultQueueProvider::transient("publish");
        let builder = Arc::new(InMemoryPackageBuilder::new());
        let agent = DistributionAgent::new("publish", strategy, provider.clone(), builder.clone());
        (agent, provider, builder)
    }

    #[tokio::test]
    async fn distribute_queues_package_everywhere() {
        let (agent, _provider, _builder) =
            agent(Arc::new(MultipleQueueDispatchingStrategy::new(["q1", "q2"])));
        let statuses = agent
            .distribute(&DistributionRequest::add(["/content/a"]))
            .await
            .unwrap();

        assert_eq!(statuses.len(), 2);
        assert_eq!(agent.queue_status("q1").await.unwrap().items_count, 1);
        assert_eq!(agent.queue_status("q2").await.unwrap().items_count, 1);
    }

    #[tokio::test]
    async fn delivered_entry_releases_package_for_its_queue() {
        let (agent, provider, builder) =
            agent(Arc::new(MultipleQueueDispatchingStrategy::new(["q1", "q2"])));
        agent
            .distribute(&DistributionRequest::add(["/content/a"]))
            .await
            .unwrap();

        let transport = Arc::new(RecordingTransport::default());
        let processor = DeliveryProcessor::new(builder.clone()).with_transport("q1", transport.clone());
        let entry = provider.get_queue("q1").unwrap().get_head().await.unwrap().unwrap();

        assert!(processor.process("q1", &entry).await);
        assert_eq!(transport.delivered.lock().unwrap().len(), 1);
        let package = builder.get_package(entry.item.package_id()).await.unwrap().unwrap();
        assert_eq!(package.as_shared().unwrap().holders(), vec!["q2".to_string()]);

        // No transport for q2: the entry stays.
        let entry = provider.get_queue("q2").unwrap().get_head().await.unwrap().unwrap();
        assert!(!processor.process("q2", &entry).await);
        assert_eq!(builder.deletions(), 0);
    }

    #[tokio::test]
    async fn failed_delivery_keeps_entry() {
        let (agent, provider, builder) = agent(Arc::new(MultipleQueueDispatchingStrategy::single_default()));
        agent
            .distribute(&DistributionRequest::add(["/content/a"]))
            .await
            .unwrap();

        for err in [ShuttleError::recoverable("down"), ShuttleError::fatal("bad gateway")] {
            let transport = Arc::new(RecordingTransport {
                fail_with: Some(err),
                ..RecordingTransport::default()
            });
            let processor = DeliveryProcessor::new(builder.clone()).with_transport("default", transport);
            let entry = provider.get_queue("default").unwrap().get_head().await.unwrap().unwrap();
            assert!(!processor.process("default", &entry).await);
        }
        assert_eq!(builder.deletions(), 0);
    }

    #[tokio::test]
    async fn missing_package_drops_entry() {
        let (_agent, provider, builder) = agent(Arc::new(MultipleQueueDispatchingStrategy::single_default()));
        let queue = provider.get_queue("default").unwrap();
        queue
            .add(crate::domain::QueueItem::new("gone", 1, Default::default()))
            .await
            .unwrap();
        let entry = queue.get_head().await.unwrap().unwrap();

        let processor = DeliveryProcessor::new(builder);
        assert!(processor.process("default", &entry).await);
    }

    #[tokio::test]
    async fn primary_entries_are_split_for_async_delivery() {
        let strategy = Arc::new(AsyncDeliveryDispatchingStrategy::new("main", ["east"], 100));
        let (agent, provider, builder) = agent(strategy.clone());
        agent
            .distribute(&DistributionRequest::add(["/content/a"]))
            .await
            .unwrap();

        let transport = Arc::new(RecordingTransport::default());
        let processor = DeliveryProcessor::new(builder.clone())
            .with_transport("delivery-east", transport.clone())
            .with_async_delivery(strategy, provider.clone());

        let primary = provider.get_queue("main").unwrap().get_head().await.unwrap().unwrap();
        assert!(processor.process("main", &primary).await);
        assert!(transport.delivered.lock().unwrap().is_empty());

        let delivery = provider.get_queue("delivery-east").unwrap().get_head().await.unwrap().unwrap();
        assert!(processor.process("delivery-east", &delivery).await);
        assert_eq!(transport.delivered.lock().unwrap().len(), 1);
        assert_eq!(builder.deletions(), 1);
    }

    #[tokio::test]
    async fn rejected_split_keeps_primary_entry_and_package() {
        let strategy = Arc::new(AsyncDeliveryDispatchingStrategy::new("main", ["east"], 100));
        let provider = Arc::new(PartlyBrokenProvider::with_broken(&["delivery-east"]));
        let builder = Arc::new(InMemoryPackageBuilder::new());
        let agent = DistributionAgent::new("publish", strategy.clone(), provider.clone(), builder.clone());
        agent
            .distribute(&DistributionRequest::add(["/content/a"]))
            .await
            .unwrap();

        let processor = DeliveryProcessor::new(builder.clone()).with_async_delivery(strategy, provider.clone());
        let primary = provider.get_queue("main").unwrap().get_head().await.unwrap().unwrap();
        for _ in 0..2 {
            assert!(!processor.process("main", &primary).await);
        }

        let package = builder.get_package(primary.item.package_id()).await.unwrap().unwrap();
        assert_eq!(package.as_shared().unwrap().holders(), vec!["main".to_string()]);
        assert_eq!(builder.deletions(), 0);
    }

    #[tokio::test]
    async fn pull_installs_and_dispatches() {
        let (agent, _provider, builder) = agent(Arc::new(MultipleQueueDispatchingStrategy::single_default()));
        let source = InMemoryPackageBuilder::new();
        let transport = RecordingTransport::default();
        for path in ["/content/a", "/content/b"] {
            let package = source
                .create_package(&DistributionRequest::add([path]))
                .await
                .unwrap();
            transport.pending.lock().unwrap().push(package);
        }

        let statuses = agent
            .pull(&transport, &DistributionRequest::pull(), 5)
            .await
            .unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(agent.queue_status("default").await.unwrap().items_count, 2);

        let entry = default_head(&agent).await;
        assert!(builder.get_package(entry.item.package_id()).await.unwrap().is_some());
    }

    async fn default_head(agent: &DistributionAgent) -> QueueEntry {
        agent
            .provider
            .get_queue("default")
            .unwrap()
            .get_entries(0, Some(1))
            .await
            .unwrap()
            .remove(0)
    }
}
