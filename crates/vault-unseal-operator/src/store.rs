use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;

use crate::crds::unseal_config::VaultUnsealConfig;
use crate::error::ReconcileError;

pub const FIELD_MANAGER: &str = "vault-unseal-operator";

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VaultUnsealConfig>, ReconcileError>;

    async fn list(&self) -> Result<Vec<VaultUnsealConfig>, ReconcileError>;

    /// Writes `config.status`, guarded by `config`'s resourceVersion. A
    /// concurrent writer yields [`ReconcileError::Conflict`].
    async fn update_status(&self, config: &VaultUnsealConfig) -> Result<(), ReconcileError>;
}

fn identity(config: &VaultUnsealConfig) -> Result<(String, String), ReconcileError> {
    let ns = config
        .namespace()
        .ok_or(ReconcileError::MissingObjectKey(".metadata.namespace"))?;
    Ok((ns, config.name_any()))
}

#[derive(Clone)]
pub struct KubeConfigStore {
    client: Client,
}

impl KubeConfigStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConfigStore for KubeConfigStore {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VaultUnsealConfig>, ReconcileError> {
        let api: Api<VaultUnsealConfig> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list(&self) -> Result<Vec<VaultUnsealConfig>, ReconcileError> {
        let api: Api<VaultUnsealConfig> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn update_status(&self, config: &VaultUnsealConfig) -> Result<(), ReconcileError> {
        let (ns, name) = identity(config)?;
        let rv = config
            .resource_version()
            .ok_or(ReconcileError::MissingObjectKey(".metadata.resourceVersion"))?;
        let api: Api<VaultUnsealConfig> = Api::namespaced(self.client.clone(), &ns);
        let patch = json!({
            "metadata": { "resourceVersion": rv },
            "status": config.status,
        });
        match api
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(ReconcileError::Conflict(format!("{ns}/{name}")))
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                Err(ReconcileError::NotFound(format!("{ns}/{name}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store with the same resourceVersion semantics as the API
/// server: every status write bumps the version and stale writes conflict.
#[derive(Default)]
pub struct MemoryConfigStore {
    objects: Mutex<BTreeMap<(String, String), VaultUnsealConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an object, assigning the next resourceVersion.
    pub fn put(&self, mut config: VaultUnsealConfig) -> Result<(), ReconcileError> {
        let key = identity(&config)?;
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let next = objects
            .get(&key)
            .map(|c| next_version(c.resource_version()))
            .unwrap_or_else(|| "1".to_string());
        config.metadata.resource_version = Some(next);
        objects.insert(key, config);
        Ok(())
    }

    pub fn remove(&self, namespace: &str, name: &str) -> Option<VaultUnsealConfig> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(namespace.to_string(), name.to_string()))
    }

    /// Current stored copy, without going through the async trait.
    pub fn snapshot(&self, namespace: &str, name: &str) -> Option<VaultUnsealConfig> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

fn next_version(current: Option<String>) -> String {
    let n: u64 = current.and_then(|v| v.parse().ok()).unwrap_or(0);
    (n + 1).to_string()
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VaultUnsealConfig>, ReconcileError> {
        Ok(self.snapshot(namespace, name))
    }

    async fn list(&self) -> Result<Vec<VaultUnsealConfig>, ReconcileError> {
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    async fn update_status(&self, config: &VaultUnsealConfig) -> Result<(), ReconcileError> {
        let key = identity(config)?;
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(stored) = objects.get_mut(&key) else {
            return Err(ReconcileError::NotFound(format!("{}/{}", key.0, key.1)));
        };
        if stored.resource_version() != config.resource_version() {
            return Err(ReconcileError::Conflict(format!("{}/{}", key.0, key.1)));
        }
        stored.status = config.status.clone();
        stored.metadata.resource_version = Some(next_version(stored.resource_version()));
        Ok(())
    }
}
