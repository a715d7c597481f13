//! SecretProvider port - per-endpoint credentials for the transport.

use std::collections::HashMap;

use async_trait::async_trait;

pub const USERNAME: &str = "username";
pub const PASSWORD: &str = "password";
/// Pre-built `Authorization` header value, used verbatim.
pub const AUTHORIZATION: &str = "authorization";

#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn get_secret(&self, endpoint_uri: &str) -> Option<HashMap<String, String>>;
}
