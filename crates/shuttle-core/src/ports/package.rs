//! Package ports.
//!
//! Building and serializing packages happens elsewhere; the engine only needs
//! to read a package's bytes, look it up by id, and manage its lifecycle
//! across the queues holding it.
//!
//! Lifecycle: a package dispatched to several queues is *acquired* once per
//! queue name and *released* by each queue when done with it. It is deleted
//! physically when the last holder releases it, never earlier.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::{DistributionRequest, PackageInfo, QueueItem};
use crate::error::{Result, ShuttleError};

#[async_trait]
pub trait DistributionPackage: Send + Sync {
    fn id(&self) -> &str;

    fn package_type(&self) -> &str;

    fn size(&self) -> u64;

    fn info(&self) -> &PackageInfo;

    /// Precomputed content digest, e.g. `sha-256=...`.
    fn checksum(&self) -> Option<&str> {
        None
    }

    async fn read(&self) -> Result<Bytes>;

    /// Physically remove the package.
    async fn delete(&self) -> Result<()>;

    /// Reference-counted view, when the package supports one.
    fn as_shared(&self) -> Option<&dyn SharedPackage> {
        None
    }

    /// Queue item referencing this package.
    fn to_queue_item(&self) -> QueueItem {
        QueueItem::new(self.id(), self.size(), self.info().clone())
    }
}

#[async_trait]
pub trait SharedPackage: DistributionPackage {
    /// Register `holders` as users of this package.
    async fn acquire(&self, holders: &[&str]) -> Result<()>;

    /// Drop `holders`. Returns `true` when this released the last holder and
    /// the package was deleted.
    async fn release(&self, holders: &[&str]) -> Result<bool>;

    /// Current holders, for diagnostics.
    fn holders(&self) -> Vec<String>;
}

/// Shared view of `package`, or `NotShared` when it has none.
pub fn require_shared(package: &dyn DistributionPackage) -> Result<&dyn SharedPackage> {
    package
        .as_shared()
        .ok_or_else(|| ShuttleError::not_shared(package.id()))
}

#[async_trait]
pub trait PackageBuilder: Send + Sync {
    async fn create_package(
        &self,
        request: &DistributionRequest,
    ) -> Result<Arc<dyn DistributionPackage>>;

    /// Parse a package from its serialized form (e.g. an HTTP body).
    async fn read_package(&self, bytes: Bytes) -> Result<Arc<dyn DistributionPackage>>;

    async fn get_package(&self, id: &str) -> Result<Option<Arc<dyn DistributionPackage>>>;

    /// Make a package built elsewhere (e.g. pulled from a remote endpoint)
    /// resolvable through [`get_package`](Self::get_package).
    async fn install_package(&self, package: Arc<dyn DistributionPackage>) -> Result<()>;
}
