//! StaticSecretProvider - credentials from configuration.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::ports::SecretProvider;

/// Secrets keyed by endpoint URI.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretProvider {
    secrets: HashMap<String, HashMap<String, String>>,
}

impl StaticSecretProvider {
    pub fn new(secrets: HashMap<String, HashMap<String, String>>) -> Self {
        Self { secrets }
    }

    pub fn with_secret(
        mut self,
        endpoint_uri: impl Into<String>,
        secret: HashMap<String, String>,
    ) -> Self {
        self.secrets.insert(endpoint_uri.into(), secret);
        self
    }
}

#[async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn get_secret(&self, endpoint_uri: &str) -> Option<HashMap<String, String>> {
        self.secrets.get(endpoint_uri).cloned()
    }
}
