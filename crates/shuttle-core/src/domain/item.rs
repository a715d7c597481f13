//! Queue items: the unit of distribution work flowing through queues.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::request::{DistributionRequest, RequestType};

/// Open property bag describing a package.
///
/// Well-known keys have typed accessors; anything else is carried through
/// queues untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageInfo(BTreeMap<String, Value>);

impl PackageInfo {
    pub const PACKAGE_TYPE: &'static str = "package.type";
    pub const REQUEST_TYPE: &'static str = "request.type";
    pub const PATHS: &'static str = "request.paths";
    pub const DEEP_PATHS: &'static str = "request.deepPaths";
    pub const ORIGIN_URI: &'static str = "origin.uri";
    pub const ORIGIN_QUEUE: &'static str = "origin.queue";

    pub fn new() -> Self {
        Self::default()
    }

    /// Info describing a package built for `request`.
    pub fn for_request(package_type: &str, request: &DistributionRequest) -> Self {
        Self::new()
            .with(Self::PACKAGE_TYPE, package_type)
            .with(Self::REQUEST_TYPE, request.request_type.as_str())
            .with(Self::PATHS, request.paths.clone())
            .with(
                Self::DEEP_PATHS,
                request.deep_paths.iter().cloned().collect::<Vec<_>>(),
            )
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn package_type(&self) -> Option<&str> {
        self.get_str(Self::PACKAGE_TYPE)
    }

    pub fn request_type(&self) -> Option<RequestType> {
        self.get_str(Self::REQUEST_TYPE)?.parse().ok()
    }

    pub fn paths(&self) -> Vec<String> {
        self.string_list(Self::PATHS)
    }

    pub fn deep_paths(&self) -> Vec<String> {
        self.string_list(Self::DEEP_PATHS)
    }

    /// URI of the endpoint this package was received from, if any.
    pub fn origin_uri(&self) -> Option<&str> {
        self.get_str(Self::ORIGIN_URI)
    }

    /// Queue the package was held in before being rerouted.
    pub fn origin_queue(&self) -> Option<&str> {
        self.get_str(Self::ORIGIN_QUEUE)
    }

    fn string_list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(Value::Array(values)) => values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(single)) => vec![single.clone()],
            _ => Vec::new(),
        }
    }
}

/// Reference to one package awaiting distribution.
///
/// Immutable once built. Two items are equal when they reference the same
/// package, whatever their size or info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    package_id: String,
    size: u64,
    info: PackageInfo,
}

impl QueueItem {
    pub fn new(package_id: impl Into<String>, size: u64, info: PackageInfo) -> Self {
        Self {
            package_id: package_id.into(),
            size,
            info,
        }
    }

    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn info(&self) -> &PackageInfo {
        &self.info
    }
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.package_id == other.package_id
    }
}

impl Eq for QueueItem {}

impl Hash for QueueItem {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.package_id.hash(state);
    }
}
