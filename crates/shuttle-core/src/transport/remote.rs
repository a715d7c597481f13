//! Packages pulled from a remote endpoint.
//!
//! Deleting a pulled package (or releasing its last holder) acknowledges it
//! on the endpoint it came from, so the exporter can drop its copy. A failed
//! acknowledgment keeps the package and is retried before the next pull from
//! that endpoint.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;
use tracing::{debug, warn};

use super::http::{Credentials, classify_send_error, classify_status};
use crate::domain::PackageInfo;
use crate::error::Result;
use crate::ports::{DistributionPackage, SharedPackage};

/// Acknowledgment call back to the exporting endpoint.
pub(crate) struct RemoteAck {
    client: reqwest::Client,
    endpoint: Url,
    uri: String,
    credentials: Option<Credentials>,
}

impl RemoteAck {
    pub(crate) fn new(
        client: reqwest::Client,
        endpoint: Url,
        uri: String,
        credentials: Option<Credentials>,
    ) -> Self {
        Self {
            client,
            endpoint,
            uri,
            credentials,
        }
    }

    async fn send(&self, remote_id: &str) -> Result<()> {
        let request = self
            .client
            .post(self.endpoint.clone())
            .query(&[("operation", "delete"), ("id", remote_id)]);
        let response = Credentials::apply(self.credentials.as_ref(), request)
            .send()
            .await
            .map_err(|err| classify_send_error(&self.uri, err))?;
        classify_status(&self.uri, response.status())
    }
}

/// Pulled packages whose acknowledgment failed.
#[derive(Default)]
pub(crate) struct PendingAcks {
    packages: Mutex<Vec<Arc<RemotePackage>>>,
}

impl PendingAcks {
    fn record(&self, package: Arc<RemotePackage>) {
        let mut packages = self.packages.lock().unwrap_or_else(|e| e.into_inner());
        if !packages.iter().any(|p| p.remote_id == package.remote_id) {
            packages.push(package);
        }
    }

    fn forget(&self, remote_id: &str) {
        self.packages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|p| p.remote_id != remote_id);
    }

    pub(crate) fn len(&self) -> usize {
        self.packages.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Acknowledge every pending package again. Returns how many are still
    /// pending afterwards.
    pub(crate) async fn retry(&self) -> usize {
        let packages = std::mem::take(&mut *self.packages.lock().unwrap_or_else(|e| e.into_inner()));
        for package in packages {
            // A failed delete records the package again.
            if package.delete().await.is_ok() {
                debug!(remote_id = %package.remote_id, "pending acknowledgment sent");
            }
        }
        self.len()
    }
}

pub struct RemotePackage {
    inner: Arc<dyn DistributionPackage>,
    info: PackageInfo,
    remote_id: String,
    ack: RemoteAck,
    holders: Mutex<BTreeSet<String>>,
    acknowledged: AtomicBool,
    pending: Arc<PendingAcks>,
    me: Weak<RemotePackage>,
}

impl RemotePackage {
    pub(crate) fn new(
        inner: Arc<dyn DistributionPackage>,
        origin_uri: &str,
        remote_id: String,
        ack: RemoteAck,
        pending: Arc<PendingAcks>,
    ) -> Arc<Self> {
        let info = inner
            .info()
            .clone()
            .with(PackageInfo::ORIGIN_URI, origin_uri);
        Arc::new_cyclic(|me| Self {
            inner,
            info,
            remote_id,
            ack,
            holders: Mutex::new(BTreeSet::new()),
            acknowledged: AtomicBool::new(false),
            pending,
            me: me.clone(),
        })
    }

    /// Id of the package on the exporting side.
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }
}

#[async_trait]
impl DistributionPackage for RemotePackage {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn package_type(&self) -> &str {
        self.inner.package_type()
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn info(&self) -> &PackageInfo {
        &self.info
    }

    fn checksum(&self) -> Option<&str> {
        self.inner.checksum()
    }

    async fn read(&self) -> Result<Bytes> {
        self.inner.read().await
    }

    async fn delete(&self) -> Result<()> {
        if self.acknowledged.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(err) = self.ack.send(&self.remote_id).await {
            // Allow the next delete to try again.
            self.acknowledged.store(false, Ordering::SeqCst);
            if let Some(me) = self.me.upgrade() {
                self.pending.record(me);
            }
            warn!(
                package_id = self.id(),
                remote_id = %self.remote_id,
                endpoint = %self.ack.uri,
                error = %err,
                "remote acknowledgment failed, retrying on next pull"
            );
            return Err(err);
        }
        self.pending.forget(&self.remote_id);
        debug!(package_id = self.id(), remote_id = %self.remote_id, "pulled package acknowledged");
        self.inner.delete().await
    }

    fn as_shared(&self) -> Option<&dyn SharedPackage> {
        Some(self)
    }
}

#[async_trait]
impl SharedPackage for RemotePackage {
    async fn acquire(&self, holders: &[&str]) -> Result<()> {
        let mut held = self.holders.lock().unwrap_or_else(|e| e.into_inner());
        held.extend(holders.iter().map(|h| h.to_string()));
        Ok(())
    }

    async fn release(&self, holders: &[&str]) -> Result<bool> {
        let last_released = {
            let mut held = self.holders.lock().unwrap_or_else(|e| e.into_inner());
            let before = held.len();
            for holder in holders {
                held.remove(*holder);
            }
            held.is_empty() && held.len() < before
        };
        if last_released {
            self.delete().await?;
        }
        Ok(last_released)
    }

    fn holders(&self) -> Vec<String> {
        self.holders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}
