//! Agent configuration (TOML).
//!
//! Every field has a default, so an empty file describes a transient agent
//! named `default` dispatching to the `default` queue.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::app::ProviderSettings;
use crate::dispatch::{
    AsyncDeliveryDispatchingStrategy, DispatchingStrategy, MultipleQueueDispatchingStrategy,
    PriorityQueueDispatchingStrategy, PriorityRule,
};
use crate::error::{Result, ShuttleError};
use crate::impls::StaticSecretProvider;
use crate::ports::secret_provider;
use crate::queue::{DEFAULT_QUEUE_NAME, DEFAULT_RETRY_ATTEMPTS, RetryPolicy};
use crate::transport::TransportConfig;

fn default_name() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub transport: TransportSettings,
    /// Endpoint name -> URI.
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    /// Endpoint URI -> credentials.
    #[serde(default)]
    pub secrets: BTreeMap<String, SecretConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            queue: QueueConfig::default(),
            retry: RetryConfig::default(),
            dispatch: DispatchConfig::default(),
            transport: TransportSettings::default(),
            endpoints: BTreeMap::new(),
            secrets: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Transient,
    Persisted,
    Tree,
}

fn default_root() -> String {
    "/var/shuttle/queues".to_string()
}

fn default_status_cache_ttl_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackend,
    /// Root of tree-backed queues.
    #[serde(default = "default_root")]
    pub root: String,
    /// `0` disables status caching.
    #[serde(default = "default_status_cache_ttl_secs")]
    pub status_cache_ttl_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Queues reported as PASSIVE.
    #[serde(default)]
    pub passive: Vec<String>,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            root: default_root(),
            status_cache_ttl_secs: default_status_cache_ttl_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            passive: Vec::new(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

fn default_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry ceiling. Entries are escalated (or reported BLOCKED) past it.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Move exhausted entries to `error-{queue}` queues.
    #[serde(default)]
    pub error_queue: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            error_queue: false,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.attempts)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchKind {
    #[default]
    Single,
    Multiple,
    Priority,
    Async,
}

fn default_backlog_threshold() -> usize {
    crate::dispatch::DEFAULT_BACKLOG_THRESHOLD
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub kind: DispatchKind,
    /// Target (or main) queues; empty means the default queue.
    #[serde(default)]
    pub queues: Vec<String>,
    /// `{prefix}[|{mainQueueMatcher}]={pathMatcher}` rules.
    #[serde(default)]
    pub priority_rules: Vec<String>,
    #[serde(default = "default_backlog_threshold")]
    pub backlog_threshold: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            kind: DispatchKind::default(),
            queues: Vec::new(),
            priority_rules: Vec::new(),
            backlog_threshold: default_backlog_threshold(),
        }
    }
}

impl DispatchConfig {
    pub fn queue_names(&self) -> Vec<String> {
        if self.queues.is_empty() {
            vec![DEFAULT_QUEUE_NAME.to_string()]
        } else {
            self.queues.clone()
        }
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub socket_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub expect_continue: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_timeout_ms(),
            socket_timeout_ms: default_timeout_ms(),
            expect_continue: true,
        }
    }
}

impl TransportSettings {
    pub fn to_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            socket_timeout: Duration::from_millis(self.socket_timeout_ms),
            expect_continue: self.expect_continue,
        }
    }
}

/// Either a username/password pair or a ready `Authorization` value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
}

impl SecretConfig {
    fn to_map(&self) -> HashMap<String, String> {
        [
            (secret_provider::USERNAME, &self.username),
            (secret_provider::PASSWORD, &self.password),
            (secret_provider::AUTHORIZATION, &self.authorization),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| (key.to_string(), v.clone())))
        .collect()
    }
}

/// Strategy and endpoint routing derived from the configuration.
pub struct DispatchPlan {
    pub strategy: Arc<dyn DispatchingStrategy>,
    /// Set for `async` dispatch; its primary queue is split, not delivered.
    pub async_delivery: Option<Arc<AsyncDeliveryDispatchingStrategy>>,
    /// Queue name -> endpoint URI.
    pub routes: BTreeMap<String, String>,
}

impl AgentConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Read, parse and validate the file at `path`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            ShuttleError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ShuttleError::configuration("agent name must not be empty"));
        }
        if self.queue.poll_interval_ms == 0 {
            return Err(ShuttleError::configuration("queue.poll_interval_ms must be positive"));
        }
        for (name, uri) in &self.endpoints {
            let parsed = Url::parse(uri).map_err(|e| {
                ShuttleError::configuration(format!("endpoint '{name}' has invalid URI '{uri}': {e}"))
            })?;
            if parsed.host_str().is_none() {
                return Err(ShuttleError::configuration(format!(
                    "endpoint '{name}' has no host: '{uri}'"
                )));
            }
        }
        for rule in &self.dispatch.priority_rules {
            rule.parse::<PriorityRule>()?;
        }
        match self.dispatch.kind {
            DispatchKind::Single if self.dispatch.queues.len() > 1 => {
                Err(ShuttleError::configuration(
                    "single dispatch takes at most one queue",
                ))
            }
            DispatchKind::Async if self.endpoints.is_empty() => Err(ShuttleError::configuration(
                "async dispatch needs at least one endpoint",
            )),
            _ => Ok(()),
        }
    }

    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            retry: self.retry.policy(),
            passive_queues: self.queue.passive.clone(),
            status_ttl: Duration::from_secs(self.queue.status_cache_ttl_secs),
            poll_interval: Duration::from_millis(self.queue.poll_interval_ms),
            cleanup_interval: Duration::from_secs(self.queue.cleanup_interval_secs),
        }
    }

    pub fn secret_provider(&self) -> StaticSecretProvider {
        self.secrets
            .iter()
            .fold(StaticSecretProvider::default(), |provider, (uri, secret)| {
                provider.with_secret(uri, secret.to_map())
            })
    }

    /// Build the dispatching strategy and the queue -> endpoint routes.
    ///
    /// Queues are routed to the endpoint of the same name. Priority aliases
    /// inherit their main queue's endpoint; async delivery queues are named
    /// after their endpoint.
    pub fn dispatch_plan(&self) -> Result<DispatchPlan> {
        let queues = self.dispatch.queue_names();
        let plan = match self.dispatch.kind {
            DispatchKind::Single | DispatchKind::Multiple => DispatchPlan {
                strategy: Arc::new(MultipleQueueDispatchingStrategy::new(queues)),
                async_delivery: None,
                routes: self.endpoints.clone(),
            },
            DispatchKind::Priority => {
                let strategy =
                    PriorityQueueDispatchingStrategy::new(&self.dispatch.priority_rules, queues)?;
                let routes = strategy.rewrite_endpoints(&self.endpoints);
                DispatchPlan {
                    strategy: Arc::new(strategy),
                    async_delivery: None,
                    routes,
                }
            }
            DispatchKind::Async => {
                let strategy = Arc::new(AsyncDeliveryDispatchingStrategy::new(
                    queues[0].clone(),
                    self.endpoints.keys(),
                    self.dispatch.backlog_threshold,
                ));
                let routes = self
                    .endpoints
                    .iter()
                    .map(|(name, uri)| {
                        (AsyncDeliveryDispatchingStrategy::delivery_queue_name(name), uri.clone())
                    })
                    .collect();
                DispatchPlan {
                    strategy: strategy.clone(),
                    async_delivery: Some(strategy),
                    routes,
                }
            }
        };
        Ok(plan)
    }
}
