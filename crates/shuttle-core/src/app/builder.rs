//! ProviderBuilder - wiring for [`DefaultQueueProvider`].
//!
//! Validation happens in `build()`, so a misconfigured agent fails at startup
//! instead of on its first dispatch.

use std::sync::Arc;
use std::time::Duration;

use super::processing::ErrorEscalation;
use super::provider::{
    DefaultQueueProvider, PersistedQueueFactory, ProviderSettings, QueueFactory,
    TransientQueueFactory, TreeQueueFactory,
};
use crate::dispatch::ErrorQueueDispatchingStrategy;
use crate::error::{Result, ShuttleError};
use crate::ports::{Clock, JobStore, PackageBuilder, ResourceTree};
use crate::queue::RetryPolicy;

/// ```ignore
/// let provider = ProviderBuilder::new("publish")
///     .transient()
///     .retry(RetryPolicy::new(3))
///     .error_queues(&["default"], packages)
///     .build()?;
/// ```
pub struct ProviderBuilder {
    agent: String,
    factory: Option<Arc<dyn QueueFactory>>,
    settings: ProviderSettings,
    escalation: Option<ErrorEscalation>,
}

impl ProviderBuilder {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            factory: None,
            settings: ProviderSettings::default(),
            escalation: None,
        }
    }

    pub fn factory(mut self, factory: Arc<dyn QueueFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn transient(self) -> Self {
        self.factory(Arc::new(TransientQueueFactory::default()))
    }

    pub fn persisted(self, store: Arc<dyn JobStore>) -> Self {
        self.factory(Arc::new(PersistedQueueFactory::new(store)))
    }

    pub fn tree(self, tree: Arc<dyn ResourceTree>, root: &str, clock: Arc<dyn Clock>) -> Self {
        self.factory(Arc::new(TreeQueueFactory::new(tree, root, clock)))
    }

    pub fn settings(mut self, settings: ProviderSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.settings.retry = retry;
        self
    }

    pub fn passive_queues(mut self, names: &[&str]) -> Self {
        self.settings.passive_queues = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn status_ttl(mut self, ttl: Duration) -> Self {
        self.settings.status_ttl = ttl;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.settings.poll_interval = interval;
        self
    }

    /// Escalate exhausted entries of `origin_queues` to their error queues.
    pub fn error_queues(self, origin_queues: &[&str], packages: Arc<dyn PackageBuilder>) -> Self {
        let strategy = ErrorQueueDispatchingStrategy::new(origin_queues.iter().copied());
        self.escalation(ErrorEscalation {
            strategy: Arc::new(strategy),
            packages,
        })
    }

    pub fn escalation(mut self, escalation: ErrorEscalation) -> Self {
        self.escalation = Some(escalation);
        self
    }

    /// # Errors
    /// `Configuration` when the agent name is empty, no queue backend was
    /// chosen, the poll interval is zero, or escalation is configured with
    /// an unbounded retry policy.
    pub fn build(self) -> Result<Arc<DefaultQueueProvider>> {
        if self.agent.trim().is_empty() {
            return Err(ShuttleError::configuration("agent name must not be empty"));
        }
        let Some(factory) = self.factory else {
            return Err(ShuttleError::configuration(format!(
                "agent '{}' has no queue backend",
                self.agent
            )));
        };
        if self.settings.poll_interval.is_zero() {
            return Err(ShuttleError::configuration("poll interval must be positive"));
        }
        let provider = match self.escalation {
            Some(escalation) => {
                if self.settings.retry.max_attempts.is_none() {
                    return Err(ShuttleError::configuration(format!(
                        "agent '{}' escalates to error queues but retries forever",
                        self.agent
                    )));
                }
                DefaultQueueProvider::with_escalation(self.agent, factory, self.settings, escalation)
            }
            None => DefaultQueueProvider::new(self.agent, factory, self.settings),
        };
        Ok(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::QueueProvider;
    use crate::impls::InMemoryPackageBuilder;

    #[test]
    fn build_transient_provider() {
        let provider = ProviderBuilder::new("publish")
            .transient()
            .retry(RetryPolicy::new(3))
            .passive_queues(&["paused"])
            .build()
            .unwrap();
        assert_eq!(provider.agent(), "publish");
        assert_eq!(provider.settings().retry, RetryPolicy::new(3));
        assert!(provider.get_queue("default").is_ok());
    }

    #[test]
    fn build_without_backend_fails() {
        let err = ProviderBuilder::new("publish").build().unwrap_err();
        assert!(matches!(err, ShuttleError::Configuration { .. }));
    }

    #[test]
    fn build_with_empty_agent_fails() {
        let err = ProviderBuilder::new(" ").transient().build().unwrap_err();
        assert!(matches!(err, ShuttleError::Configuration { .. }));
    }

    #[test]
    fn escalation_needs_a_retry_ceiling() {
        let packages = Arc::new(InMemoryPackageBuilder::new());
        let err = ProviderBuilder::new("publish")
            .transient()
            .retry(RetryPolicy::unbounded())
            .error_queues(&["default"], packages.clone())
            .build()
            .unwrap_err();
        assert!(matches!(err, ShuttleError::Configuration { .. }));

        let ok = ProviderBuilder::new("publish")
            .transient()
            .retry(RetryPolicy::new(3))
            .error_queues(&["default"], packages)
            .build();
        assert!(ok.is_ok());
    }
}
