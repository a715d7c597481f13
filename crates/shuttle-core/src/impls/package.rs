//! In-memory packages and their builder.
//!
//! Packages built from a request carry a one-line "simple" encoding:
//!
//! ```text
//! DSTRPCK:{TYPE}|{path},{path}[|{deep path},{deep path}]
//! ```
//!
//! Anything else read from bytes becomes an opaque `binary` package.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::domain::{DistributionRequest, PackageInfo, RequestType};
use crate::error::{Result, ShuttleError};
use crate::ports::{
    DistributionPackage, IdGenerator, PackageBuilder, SharedPackage, SystemClock, UlidGenerator,
};

pub const SIMPLE_PACKAGE_TYPE: &str = "simple";
pub const BINARY_PACKAGE_TYPE: &str = "binary";
const SIMPLE_HEADER: &str = "DSTRPCK:";

pub fn encode_simple(request: &DistributionRequest) -> Bytes {
    let mut encoded = format!(
        "{SIMPLE_HEADER}{}|{}",
        request.request_type,
        request.paths.join(",")
    );
    if !request.deep_paths.is_empty() {
        let deep: Vec<&str> = request.deep_paths.iter().map(String::as_str).collect();
        encoded.push('|');
        encoded.push_str(&deep.join(","));
    }
    Bytes::from(encoded)
}

/// `None` when `bytes` is not a simple package.
pub fn decode_simple(bytes: &[u8]) -> Option<DistributionRequest> {
    let text = std::str::from_utf8(bytes).ok()?;
    let body = text.trim_end().strip_prefix(SIMPLE_HEADER)?;
    let mut parts = body.split('|');
    let request_type: RequestType = parts.next()?.parse().ok()?;
    let split = |s: &str| -> Vec<String> {
        s.split(',')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    };
    let paths = parts.next().map(split).unwrap_or_default();
    let mut request = DistributionRequest::new(request_type, paths);
    for deep in parts.next().map(split).unwrap_or_default() {
        request = request.with_deep_path(deep);
    }
    Some(request)
}

#[derive(Default)]
struct PackageStore {
    packages: Mutex<HashMap<String, Arc<dyn DistributionPackage>>>,
    deletions: AtomicUsize,
}

impl PackageStore {
    fn insert(&self, package: Arc<dyn DistributionPackage>) {
        self.packages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(package.id().to_string(), package);
    }

    fn get(&self, id: &str) -> Option<Arc<dyn DistributionPackage>> {
        self.packages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn remove(&self, id: &str) {
        self.packages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        self.deletions.fetch_add(1, Ordering::SeqCst);
    }
}

/// Reference-counted package held in memory.
pub struct InMemoryPackage {
    id: String,
    package_type: String,
    info: PackageInfo,
    data: Bytes,
    checksum: Option<String>,
    holders: Mutex<BTreeSet<String>>,
    deleted: AtomicBool,
    store: Weak<PackageStore>,
}

impl InMemoryPackage {
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DistributionPackage for InMemoryPackage {
    fn id(&self) -> &str {
        &self.id
    }

    fn package_type(&self) -> &str {
        &self.package_type
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn info(&self) -> &PackageInfo {
        &self.info
    }

    fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    async fn read(&self) -> Result<Bytes> {
        if self.is_deleted() {
            return Err(ShuttleError::not_found(format!("package {}", self.id)));
        }
        Ok(self.data.clone())
    }

    async fn delete(&self) -> Result<()> {
        if self.deleted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(store) = self.store.upgrade() {
            store.remove(&self.id);
        }
        debug!(package_id = %self.id, "package deleted");
        Ok(())
    }

    fn as_shared(&self) -> Option<&dyn SharedPackage> {
        Some(self)
    }
}

#[async_trait]
impl SharedPackage for InMemoryPackage {
    async fn acquire(&self, holders: &[&str]) -> Result<()> {
        if self.is_deleted() {
            return Err(ShuttleError::not_found(format!("package {}", self.id)));
        }
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

/// Builds and tracks [`InMemoryPackage`]s.
pub struct InMemoryPackageBuilder {
    store: Arc<PackageStore>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryPackageBuilder {
    pub fn new() -> Self {
        Self {
            store: Arc::new(PackageStore::default()),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        }
    }

    /// Packages physically deleted so far.
    pub fn deletions(&self) -> usize {
        self.store.deletions.load(Ordering::SeqCst)
    }

    fn build(
        &self,
        package_type: &str,
        info: PackageInfo,
        data: Bytes,
        checksum: Option<String>,
    ) -> Arc<InMemoryPackage> {
        let package = Arc::new(InMemoryPackage {
            id: self.ids.generate_package_id().to_string(),
            package_type: package_type.to_string(),
            info,
            data,
            checksum,
            holders: Mutex::new(BTreeSet::new()),
            deleted: AtomicBool::new(false),
            store: Arc::downgrade(&self.store),
        });
        self.store.insert(package.clone());
        package
    }

    /// Build a package with explicit content and checksum.
    pub fn create_raw(
        &self,
        info: PackageInfo,
        data: Bytes,
        checksum: Option<String>,
    ) -> Arc<InMemoryPackage> {
        let info = info.with(PackageInfo::PACKAGE_TYPE, BINARY_PACKAGE_TYPE);
        self.build(BINARY_PACKAGE_TYPE, info, data, checksum)
    }
}

impl Default for InMemoryPackageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PackageBuilder for InMemoryPackageBuilder {
    async fn create_package(
        &self,
        request: &DistributionRequest,
    ) -> Result<Arc<dyn DistributionPackage>> {
        if request.paths.is_empty() && request.request_type != RequestType::Test {
            return Err(ShuttleError::fatal("request has no paths"));
        }
        let info = PackageInfo::for_request(SIMPLE_PACKAGE_TYPE, request);
        Ok(self.build(SIMPLE_PACKAGE_TYPE, info, encode_simple(request), None))
    }

    async fn read_package(&self, bytes: Bytes) -> Result<Arc<dyn DistributionPackage>> {
        let package = match decode_simple(&bytes) {
            Some(request) => {
                let info = PackageInfo::for_request(SIMPLE_PACKAGE_TYPE, &request);
                self.build(SIMPLE_PACKAGE_TYPE, info, bytes, None)
            }
            None => self.create_raw(PackageInfo::new(), bytes, None),
        };
        Ok(package)
    }

    async fn get_package(&self, id: &str) -> Result<Option<Arc<dyn DistributionPackage>>> {
        Ok(self.store.get(id))
    }

    async fn install_package(&self, package: Arc<dyn DistributionPackage>) -> Result<()> {
        self.store.insert(package);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_encoding_carries_type_and_paths() {
        let request = DistributionRequest::add(["/content/a", "/content/b"])
            .with_deep_path("/content/b");
        let bytes = encode_simple(&request);
        assert_eq!(&bytes[..], b"DSTRPCK:ADD|/content/a,/content/b|/content/b");

        let decoded = decode_simple(&bytes).unwrap();
        assert_eq!(decoded, request);
        assert!(decode_simple(b"\x00\x01binary").is_none());
    }

    #[tokio::test]
    async fn last_release_deletes_exactly_once() {
        let builder = InMemoryPackageBuilder::new();
        let package = builder
            .create_package(&DistributionRequest::add(["/content/a"]))
            .await
            .unwrap();
        let shared = package.as_shared().unwrap();
        shared.acquire(&["q1", "q2"]).await.unwrap();

        assert!(!shared.release(&["q1"]).await.unwrap());
        assert!(builder.get_package(package.id()).await.unwrap().is_some());

        assert!(shared.release(&["q2"]).await.unwrap());
        assert!(!shared.release(&["q2"]).await.unwrap());
        assert!(builder.get_package(package.id()).await.unwrap().is_none());
        assert_eq!(builder.deletions(), 1);
    }

    #[tokio::test]
    async fn unknown_bytes_become_binary_packages() {
        let builder = InMemoryPackageBuilder::new();
        let package = builder
            .read_package(Bytes::from_static(b"opaque"))
            .await
            .unwrap();
        assert_eq!(package.package_type(), BINARY_PACKAGE_TYPE);
        assert_eq!(package.size(), 6);
        assert!(package.id().starts_with("pkg-"));
    }
}
