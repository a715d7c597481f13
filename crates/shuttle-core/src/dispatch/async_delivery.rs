//! Asynchronous delivery: intake into one primary queue, transport from
//! per-endpoint `delivery-{endpoint}` queues.
//!
//! Export writes only to the primary queue so intake never waits on slow
//! endpoints. Processing the primary queue calls [`split`], which moves the
//! package into every delivery queue.
//!
//! [`split`]: AsyncDeliveryDispatchingStrategy::split

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{DispatchingStrategy, fan_out};
use crate::app::QueueProvider;
use crate::domain::{ItemState, QueueItemStatus};
use crate::error::{Result, ShuttleError};
use crate::ports::{DistributionPackage, require_shared};

pub const DEFAULT_BACKLOG_THRESHOLD: usize = 100;
const DELIVERY_PREFIX: &str = "delivery-";

pub struct AsyncDeliveryDispatchingStrategy {
    primary: String,
    delivery_queues: Vec<String>,
    backlog_threshold: usize,
}

impl AsyncDeliveryDispatchingStrategy {
    pub fn new<I, S>(primary: impl Into<String>, endpoint_names: I, backlog_threshold: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            primary: primary.into(),
            delivery_queues: endpoint_names
                .into_iter()
                .map(|endpoint| Self::delivery_queue_name(endpoint.as_ref()))
                .collect(),
            backlog_threshold,
        }
    }

    pub fn delivery_queue_name(endpoint: &str) -> String {
        format!("{DELIVERY_PREFIX}{endpoint}")
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn is_primary(&self, queue_name: &str) -> bool {
        queue_name == self.primary
    }

    pub fn delivery_queues(&self) -> &[String] {
        &self.delivery_queues
    }

    /// Move `package` from the primary queue's hold into every delivery queue.
    ///
    /// Delivery holds are taken before the primary hold is dropped, so the
    /// package survives the hand-over. Queues already holding the package are
    /// skipped, which makes a failed split safe to repeat: the primary hold is
    /// kept until every delivery queue has taken the package.
    ///
    /// # Errors
    /// `Fatal` when some delivery queue rejected the package.
    pub async fn split(
        &self,
        package: &dyn DistributionPackage,
        provider: &dyn QueueProvider,
    ) -> Result<Vec<QueueItemStatus>> {
        let shared = require_shared(package)?;
        let held = shared.holders();
        let pending: Vec<String> = self
            .delivery_queues
            .iter()
            .filter(|name| !held.contains(*name))
            .cloned()
            .collect();

        let statuses = fan_out(package, package.to_queue_item(), provider, &pending).await?;
        let rejected: Vec<&str> = statuses
            .iter()
            .filter(|status| status.state == ItemState::Error)
            .map(|status| status.queue_name.as_str())
            .collect();
        if !rejected.is_empty() {
            return Err(ShuttleError::fatal(format!(
                "package {} not taken by delivery queues {}",
                package.id(),
                rejected.join(", ")
            )));
        }

        shared.release(&[self.primary.as_str()]).await?;
        debug!(
            package_id = package.id(),
            queues = statuses.len(),
            skipped = self.delivery_queues.len() - pending.len(),
            "split package for delivery"
        );

        for name in &self.delivery_queues {
            let backlog = provider.get_queue(name)?.get_status().await?.items_count;
            if backlog > self.backlog_threshold {
                warn!(
                    queue = %name,
                    backlog,
                    threshold = self.backlog_threshold,
                    "delivery queue backlog above threshold"
                );
            }
        }
        Ok(statuses)
    }
}

#[async_trait]
impl DispatchingStrategy for AsyncDeliveryDispatchingStrategy {
    async fn add(
        &self,
        package: &dyn DistributionPackage,
        provider: &dyn QueueProvider,
    ) -> Result<Vec<QueueItemStatus>> {
        fan_out(
            package,
            package.to_queue_item(),
            provider,
            std::slice::from_ref(&self.primary),
        )
        .await
    }

    fn queue_names(&self) -> Vec<String> {
        let mut names = vec![self.primary.clone()];
        names.extend(self.delivery_queues.iter().cloned());
        names
    }
}
