//! Background processing: one poll task per queue.
//!
//! Each tick drains the queue: `get_head` -> processor -> `remove`, until the
//! queue is empty or the processor declines an entry. A declined entry whose
//! attempts exceed the retry ceiling is escalated to its error queue when
//! escalation is configured; otherwise it stays at the head for the next
//! tick. Errors end the current tick only.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::QueueProvider;
use crate::dispatch::ErrorQueueDispatchingStrategy;
use crate::domain::{ItemState, QueueEntry};
use crate::error::{Result, ShuttleError};
use crate::ports::{PackageBuilder, QueueProcessor};
use crate::queue::{DistributionQueue, RetryPolicy, TreeQueueCleanup, remove_and_release};

/// Where exhausted entries go, and how their packages are resolved.
#[derive(Clone)]
pub struct ErrorEscalation {
    pub strategy: Arc<ErrorQueueDispatchingStrategy>,
    pub packages: Arc<dyn PackageBuilder>,
}

/// Drains one queue.
#[derive(Clone)]
pub struct QueuePoller {
    provider: Arc<dyn QueueProvider>,
    queue_name: String,
    processor: Arc<dyn QueueProcessor>,
    retry: RetryPolicy,
    escalation: Option<ErrorEscalation>,
}

impl QueuePoller {
    pub fn new(
        provider: Arc<dyn QueueProvider>,
        queue_name: impl Into<String>,
        processor: Arc<dyn QueueProcessor>,
        retry: RetryPolicy,
        escalation: Option<ErrorEscalation>,
    ) -> Self {
        Self {
            provider,
            queue_name: queue_name.into(),
            processor,
            retry,
            escalation,
        }
    }

    /// One drain pass. Returns the number of entries processed.
    pub async fn drain(&self) -> Result<usize> {
        let queue = self.provider.get_queue(&self.queue_name)?;
        let mut processed = 0;

        while let Some(entry) = queue.get_head().await? {
            if self.processor.process(&self.queue_name, &entry).await {
                queue.remove(&entry.id).await?;
                processed += 1;
                continue;
            }

            if self.retry.is_exhausted(entry.status.attempts)
                && self.escalate(queue.as_ref(), &entry).await?
            {
                continue;
            }

            debug!(
                queue = %self.queue_name,
                entry_id = %entry.id,
                attempts = entry.status.attempts,
                "entry not processed, retrying next tick"
            );
            break;
        }
        Ok(processed)
    }

    /// `false` when no escalation is configured.
    async fn escalate(&self, queue: &dyn DistributionQueue, entry: &QueueEntry) -> Result<bool> {
        let Some(escalation) = &self.escalation else {
            return Ok(false);
        };

        let Some(package) = escalation
            .packages
            .get_package(entry.item.package_id())
            .await?
        else {
            warn!(
                queue = %self.queue_name,
                entry_id = %entry.id,
                package_id = entry.item.package_id(),
                "package of exhausted entry is gone, dropping entry"
            );
            queue.remove(&entry.id).await?;
            return Ok(true);
        };

        let status = escalation
            .strategy
            .escalate(package.as_ref(), &self.queue_name, self.provider.as_ref())
            .await?;
        if status.state == ItemState::Error {
            return Err(ShuttleError::fatal(format!(
                "could not escalate entry {} of queue '{}': {}",
                entry.id,
                self.queue_name,
                status.error.unwrap_or_default()
            )));
        }

        remove_and_release(queue, &entry.id, escalation.packages.as_ref()).await?;
        info!(
            queue = %self.queue_name,
            entry_id = %entry.id,
            attempts = entry.status.attempts,
            "entry moved to error queue"
        );
        Ok(true)
    }
}

/// Handle on the running poll tasks.
/// - dropping it or calling [`shutdown_and_join`](Self::shutdown_and_join) stops every task
/// - in-flight drains finish; no new tick starts
pub struct ProcessingGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl ProcessingGroup {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            joins: Vec::new(),
        }
    }

    pub fn spawn_poller(&mut self, poller: QueuePoller, interval: Duration) {
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.joins
            .push(tokio::spawn(poll_loop(poller, interval, shutdown_rx)));
    }

    pub fn spawn_cleanup(&mut self, cleanup: TreeQueueCleanup, interval: Duration) {
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.joins
            .push(tokio::spawn(cleanup_loop(cleanup, interval, shutdown_rx)));
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub async fn shutdown_and_join(self) {
        // Receivers may already be gone.
        let _ = self.shutdown_tx.send(true);
        for join in self.joins {
            let _ = join.await;
        }
    }
}

impl Default for ProcessingGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Ticks until shutdown. Returns `false` once shutdown was requested.
async fn tick(ticker: &mut tokio::time::Interval, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        _ = shutdown_rx.changed() => false,
        _ = ticker.tick() => true,
    }
}

async fn poll_loop(poller: QueuePoller, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(queue = %poller.queue_name, "queue processing started");

    while tick(&mut ticker, &mut shutdown_rx).await {
        match poller.drain().await {
            Ok(0) => {}
            Ok(processed) => debug!(queue = %poller.queue_name, processed, "queue drained"),
            Err(err) => warn!(queue = %poller.queue_name, error = %err, "queue processing failed"),
        }
    }
    debug!(queue = %poller.queue_name, "queue processing stopped");
}

async fn cleanup_loop(
    cleanup: TreeQueueCleanup,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while tick(&mut ticker, &mut shutdown_rx).await {
        if let Err(err) = cleanup.run_once().await {
            warn!(error = %err, "tree queue cleanup failed");
        }
    }
}
