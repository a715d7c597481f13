use async_trait::async_trait;

use super::{DispatchingStrategy, fan_out};
use crate::app::QueueProvider;
use crate::domain::QueueItemStatus;
use crate::error::Result;
use crate::ports::DistributionPackage;
use crate::queue::DEFAULT_QUEUE_NAME;

/// Adds every package to a fixed, ordered set of queues.
///
/// The single-queue strategy is this strategy with one name.
#[derive(Debug, Clone)]
pub struct MultipleQueueDispatchingStrategy {
    names: Vec<String>,
}

impl MultipleQueueDispatchingStrategy {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn single(name: impl Into<String>) -> Self {
        Self {
            names: vec![name.into()],
        }
    }

    pub fn single_default() -> Self {
        Self::single(DEFAULT_QUEUE_NAME)
    }
}

#[async_trait]
impl DispatchingStrategy for MultipleQueueDispatchingStrategy {
    async fn add(
        &self,
        package: &dyn DistributionPackage,
        provider: &dyn QueueProvider,
    ) -> Result<Vec<QueueItemStatus>> {
        fan_out(package, package.to_queue_item(), provider, &self.names).await
    }

    fn queue_names(&self) -> Vec<String> {
        self.names.clone()
    }
}
