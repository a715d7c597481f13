//! Transport: moving packages between agents over HTTP.
//!
//! Failures are classified at this boundary. Unreachable endpoints and
//! 401/404 responses are `Recoverable`; anything else that goes wrong is
//! `Fatal` for the attempt.

mod http;
mod remote;

pub use self::http::{ClientPool, HttpTransport, PACKAGE_ID_HEADER, TransportConfig, classify_status};
pub use self::remote::RemotePackage;

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::DistributionRequest;
use crate::error::Result;
use crate::ports::DistributionPackage;

#[async_trait]
pub trait Transport: Send + Sync {
    /// URI of the remote endpoint.
    fn endpoint(&self) -> &str;

    /// Push `package` to the endpoint.
    async fn deliver_package(&self, package: &dyn DistributionPackage) -> Result<()>;

    /// Pull one pending package, `None` when the endpoint has nothing.
    async fn retrieve_package(
        &self,
        request: &DistributionRequest,
    ) -> Result<Option<Arc<dyn DistributionPackage>>>;
}
