//! shuttle: run a content distribution agent from a TOML configuration.
//!
//! Queues live in memory for the lifetime of the process, so `push` and
//! `pull` wait for the queues to drain before exiting.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shuttle_core::Result;
use shuttle_core::app::{DefaultQueueProvider, DeliveryProcessor, DistributionAgent, ProviderBuilder};
use shuttle_core::config::{AgentConfig, DispatchPlan, QueueBackend};
use shuttle_core::domain::{DistributionRequest, RequestType};
use shuttle_core::impls::{InMemoryJobStore, InMemoryPackageBuilder, InMemoryResourceTree};
use shuttle_core::ports::{PackageBuilder, SecretProvider, SystemClock};
use shuttle_core::transport::{ClientPool, HttpTransport};

const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "shuttle")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the agent configuration file.
    #[arg(short, long, global = true, default_value = "agent.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and print the queue routing.
    Check,
    /// Distribute paths and deliver them to the configured endpoints.
    Push {
        /// Content path to distribute; repeatable.
        #[arg(long = "path", required = true)]
        paths: Vec<String>,
        /// Paths distributed together with their subtree.
        #[arg(long)]
        deep: Vec<String>,
        /// Distribute a deletion instead of an addition.
        #[arg(long)]
        delete: bool,
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },
    /// Pull packages from an exporting endpoint and deliver them.
    Pull {
        /// Endpoint name from the configuration, or a URI.
        #[arg(long)]
        endpoint: String,
        #[arg(long, default_value_t = 100)]
        max: usize,
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = AgentConfig::load(&args.config).await?;
    let plan = config.dispatch_plan()?;
    info!(
        agent = %config.name,
        backend = ?config.queue.backend,
        dispatch = ?config.dispatch.kind,
        "configuration loaded"
    );

    match args.command {
        Command::Check => {
            print_plan(&plan);
            Ok(())
        }
        Command::Push {
            paths,
            deep,
            delete,
            wait_secs,
        } => {
            let request_type = if delete {
                RequestType::Delete
            } else {
                RequestType::Add
            };
            let request = deep
                .into_iter()
                .fold(DistributionRequest::new(request_type, paths), |request, path| {
                    request.with_deep_path(path)
                });

            let runtime = Runtime::start(&config, plan).await?;
            let statuses = runtime.agent.distribute(&request).await?;
            info!(queues = statuses.len(), "package dispatched");
            runtime.finish(Duration::from_secs(wait_secs)).await
        }
        Command::Pull {
            endpoint,
            max,
            wait_secs,
        } => {
            let uri = config.endpoints.get(&endpoint).cloned().unwrap_or(endpoint);
            let runtime = Runtime::start(&config, plan).await?;
            let exporter = runtime.transport(&uri)?;
            let statuses = runtime
                .agent
                .pull(&exporter, &DistributionRequest::pull(), max)
                .await?;
            info!(endpoint = %uri, queued = statuses.len(), "pull finished");
            runtime.finish(Duration::from_secs(wait_secs)).await
        }
    }
}

/// A running agent and the pieces its transports share.
struct Runtime {
    agent: DistributionAgent,
    provider: Arc<DefaultQueueProvider>,
    packages: Arc<InMemoryPackageBuilder>,
    pool: Arc<ClientPool>,
    secrets: Arc<dyn SecretProvider>,
}

impl Runtime {
    async fn start(config: &AgentConfig, plan: DispatchPlan) -> Result<Self> {
        let packages = Arc::new(InMemoryPackageBuilder::new());
        let provider = build_provider(config, &plan, packages.clone())?;
        let runtime = Self {
            agent: DistributionAgent::new(
                &config.name,
                plan.strategy.clone(),
                provider.clone(),
                packages.clone(),
            ),
            provider,
            packages,
            pool: Arc::new(ClientPool::new(config.transport.to_config())),
            secrets: Arc::new(config.secret_provider()),
        };

        let mut processor = DeliveryProcessor::new(runtime.packages.clone());
        for (queue, uri) in &plan.routes {
            processor = processor.with_transport(queue, Arc::new(runtime.transport(uri)?));
        }
        for queue in runtime.agent.queue_names() {
            let split = plan
                .async_delivery
                .as_ref()
                .is_some_and(|strategy| strategy.is_primary(&queue));
            if !split && !plan.routes.contains_key(&queue) {
                warn!(queue = %queue, "queue has no endpoint, its entries will not be delivered");
            }
        }
        if let Some(strategy) = plan.async_delivery {
            processor = processor.with_async_delivery(strategy, runtime.provider.clone());
        }

        runtime.agent.start(Arc::new(processor)).await?;
        Ok(runtime)
    }

    fn transport(&self, uri: &str) -> Result<HttpTransport> {
        HttpTransport::new(
            uri,
            self.pool.clone(),
            self.secrets.clone(),
            self.packages.clone(),
        )
    }

    /// Wait up to `wait` for every queue to drain, stop and report.
    async fn finish(self, wait: Duration) -> Result<()> {
        let deadline = Instant::now() + wait;
        loop {
            let mut pending = 0;
            for name in self.agent.queue_names() {
                pending += self.agent.queue_status(&name).await?.items_count;
            }
            if pending == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(pending, "queues not drained before the deadline");
                break;
            }
            tokio::time::sleep(DRAIN_CHECK_INTERVAL).await;
        }
        self.agent.stop().await;

        for name in self.provider.open_queues() {
            let status = self.agent.queue_status(&name).await?;
            let removed = self
                .provider
                .metrics(&name)
                .map(|counts| counts.removed)
                .unwrap_or_default();
            println!(
                "{name}\t{:?}\titems={}\tremoved={removed}",
                status.state, status.items_count
            );
        }
        Ok(())
    }
}

fn build_provider(
    config: &AgentConfig,
    plan: &DispatchPlan,
    packages: Arc<dyn PackageBuilder>,
) -> Result<Arc<DefaultQueueProvider>> {
    let builder = ProviderBuilder::new(&config.name).settings(config.provider_settings());
    let builder = match config.queue.backend {
        QueueBackend::Transient => builder.transient(),
        QueueBackend::Persisted => builder.persisted(Arc::new(InMemoryJobStore::new())),
        QueueBackend::Tree => builder.tree(
            Arc::new(InMemoryResourceTree::new()),
            &config.queue.root,
            Arc::new(SystemClock),
        ),
    };
    let builder = if config.retry.error_queue {
        let origins = plan.strategy.queue_names();
        let origins: Vec<&str> = origins.iter().map(String::as_str).collect();
        builder.error_queues(&origins, packages)
    } else {
        builder
    };
    builder.build()
}

fn print_plan(plan: &DispatchPlan) {
    for queue in plan.strategy.queue_names() {
        match plan.routes.get(&queue) {
            Some(uri) => println!("{queue}\t-> {uri}"),
            None => println!("{queue}\t(no endpoint)"),
        }
    }
}
