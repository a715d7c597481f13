use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time copy of a queue's [`QueueMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub added: u64,
    pub removed: u64,
    pub head_reads: u64,
    pub status_reads: u64,
    pub failures: u64,
}

#[derive(Debug, Default)]
pub struct QueueMetrics {
    added: AtomicU64,
    removed: AtomicU64,
    head_reads: AtomicU64,
    status_reads: AtomicU64,
    failures: AtomicU64,
}

impl QueueMetrics {
    pub fn record_added(&self) {
        self.added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_removed(&self, count: usize) {
        self.removed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_head_read(&self) {
        self.head_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_status_read(&self) {
        self.status_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueCounts {
        QueueCounts {
            added: self.added.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            head_reads: self.head_reads.load(Ordering::Relaxed),
            status_reads: self.status_reads.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
