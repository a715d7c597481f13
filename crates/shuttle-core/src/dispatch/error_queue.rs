//! Error queues: where packages go once their retries are exhausted.
//!
//! Never used for normal dispatch. Escalation creates a fresh entry in
//! `error-{origin}`; removing the original entry is up to the caller.

use async_trait::async_trait;
use tracing::info;

use super::{DispatchingStrategy, fan_out};
use crate::app::QueueProvider;
use crate::domain::{PackageInfo, QueueItem, QueueItemStatus};
use crate::error::{Result, ShuttleError};
use crate::ports::DistributionPackage;

const ERROR_PREFIX: &str = "error-";

#[derive(Debug, Clone)]
pub struct ErrorQueueDispatchingStrategy {
    origin_queues: Vec<String>,
}

impl ErrorQueueDispatchingStrategy {
    pub fn new<I, S>(origin_queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            origin_queues: origin_queues.into_iter().map(Into::into).collect(),
        }
    }

    pub fn error_queue_name(origin_queue: &str) -> String {
        format!("{ERROR_PREFIX}{origin_queue}")
    }

    /// Add `package` to the error queue of `origin_queue`.
    pub async fn escalate(
        &self,
        package: &dyn DistributionPackage,
        origin_queue: &str,
        provider: &dyn QueueProvider,
    ) -> Result<QueueItemStatus> {
        let target = Self::error_queue_name(origin_queue);
        let info = package
            .info()
            .clone()
            .with(PackageInfo::ORIGIN_QUEUE, origin_queue);
        let item = QueueItem::new(package.id(), package.size(), info);

        let status = fan_out(package, item, provider, std::slice::from_ref(&target))
            .await?
            .pop()
            .ok_or_else(|| ShuttleError::fatal(format!("no status for '{target}'")))?;
        info!(
            package_id = package.id(),
            origin_queue,
            error_queue = %target,
            "escalated package to error queue"
        );
        Ok(status)
    }
}

#[async_trait]
impl DispatchingStrategy for ErrorQueueDispatchingStrategy {
    /// Escalates to the error queue of the package's recorded origin queue.
    async fn add(
        &self,
        package: &dyn DistributionPackage,
        provider: &dyn QueueProvider,
    ) -> Result<Vec<QueueItemStatus>> {
        let origin = package.info().origin_queue().ok_or_else(|| {
            ShuttleError::fatal(format!("package '{}' has no origin queue", package.id()))
        })?;
        Ok(vec![self.escalate(package, origin, provider).await?])
    }

    fn queue_names(&self) -> Vec<String> {
        self.origin_queues
            .iter()
            .map(|name| Self::error_queue_name(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::DefaultQueueProvider;
    use crate::domain::DistributionRequest;
    use crate::impls::InMemoryPackageBuilder;
    use crate::ports::PackageBuilder;

    #[tokio::test]
    async fn escalation_records_origin_queue() {
        let provider = DefaultQueueProvider::transient("publish");
        let builder = InMemoryPackageBuilder::new();
        let package = builder
            .create_package(&DistributionRequest::add(["/content/a"]))
            .await
            .unwrap();
        let strategy = ErrorQueueDispatchingStrategy::new(["default"]);
        assert_eq!(strategy.queue_names(), vec!["error-default"]);

        let status = strategy
            .escalate(package.as_ref(), "default", provider.as_ref())
            .await
            .unwrap();
        assert_eq!(status.queue_name, "error-default");

        let entry = provider
            .get_queue("error-default")
            .unwrap()
            .get_entries(0, None)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(entry.item.info().origin_queue(), Some("default"));
        assert_eq!(
            package.as_shared().unwrap().holders(),
            vec!["error-default".to_string()]
        );
    }

    #[tokio::test]
    async fn add_without_origin_is_rejected() {
        let provider = DefaultQueueProvider::transient("publish");
        let builder = InMemoryPackageBuilder::new();
        let package = builder
            .create_package(&DistributionRequest::add(["/content/a"]))
            .await
            .unwrap();

        let err = ErrorQueueDispatchingStrategy::new(["default"])
            .add(package.as_ref(), provider.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, ShuttleError::Fatal { .. }));
    }
}
