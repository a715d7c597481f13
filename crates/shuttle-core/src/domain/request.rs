//! Distribution requests: what to distribute and how.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ShuttleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    /// Add or update content at the request paths.
    Add,
    /// Delete content at the request paths.
    Delete,
    /// Ask a remote endpoint for pending packages.
    Pull,
    /// Connectivity probe carrying no content.
    Test,
}

impl RequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Add => "ADD",
            RequestType::Delete => "DELETE",
            RequestType::Pull => "PULL",
            RequestType::Test => "TEST",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestType {
    type Err = ShuttleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ADD" => Ok(RequestType::Add),
            "DELETE" => Ok(RequestType::Delete),
            "PULL" => Ok(RequestType::Pull),
            "TEST" => Ok(RequestType::Test),
            other => Err(ShuttleError::fatal(format!(
                "unsupported request type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionRequest {
    pub request_type: RequestType,
    pub paths: Vec<String>,
    /// Subset of `paths` that include their whole subtree.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deep_paths: BTreeSet<String>,
}

impl DistributionRequest {
    pub fn new<I, S>(request_type: RequestType, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            request_type,
            paths: paths.into_iter().map(Into::into).collect(),
            deep_paths: BTreeSet::new(),
        }
    }

    pub fn add<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(RequestType::Add, paths)
    }

    pub fn pull() -> Self {
        Self::new(RequestType::Pull, Vec::<String>::new())
    }

    /// Mark `path` as deep. The path is added to the request if missing.
    pub fn with_deep_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path.clone());
        }
        self.deep_paths.insert(path);
        self
    }

    pub fn is_deep(&self, path: &str) -> bool {
        self.deep_paths.contains(path)
    }
}
