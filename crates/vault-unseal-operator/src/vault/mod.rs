pub mod http;
pub mod keys;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

#[cfg(test)]
use mockall::automock;

use crate::crds::unseal_config::VaultInstance;
use crate::error::VaultError;

/// Seal state reported by Vault after a status read or a key submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SealStatus {
    pub sealed: bool,
    /// Shares accepted so far in the current unseal process
    pub progress: u32,
    /// Shares Vault needs in total
    pub required: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct Health {
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub sealed: bool,
    #[serde(default)]
    pub standby: bool,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub cluster_name: Option<String>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait VaultClient: Send + Sync {
    async fn is_sealed(&self) -> Result<bool, VaultError>;

    /// Submits up to `threshold` of `keys`, stopping once Vault reports
    /// unsealed. Running out of shares is not an error: the returned status
    /// stays sealed and carries the progress.
    async fn unseal(&self, keys: &[String], threshold: usize) -> Result<SealStatus, VaultError>;

    async fn health_check(&self) -> Result<Health, VaultError>;

    fn close(&self) -> Result<(), VaultError>;
}

/// Builds backend clients for declared instances.
#[cfg_attr(test, automock)]
pub trait ClientFactory: Send + Sync {
    fn build(&self, instance: &VaultInstance) -> Result<Arc<dyn VaultClient>, VaultError>;
}

/// Produces [`http::HttpVaultClient`]s with a fixed per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    pub timeout: Duration,
}

impl ClientFactory for HttpClientFactory {
    fn build(&self, instance: &VaultInstance) -> Result<Arc<dyn VaultClient>, VaultError> {
        let client =
            http::HttpVaultClient::new(&instance.endpoint, instance.tls_skip_verify, self.timeout)?;
        Ok(Arc::new(client))
    }
}
