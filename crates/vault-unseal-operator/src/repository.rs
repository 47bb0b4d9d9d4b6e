use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::crds::unseal_config::VaultInstance;
use crate::error::VaultError;
use crate::vault::{ClientFactory, VaultClient};

struct CachedClient {
    client: Arc<dyn VaultClient>,
    endpoint: String,
    tls_skip_verify: bool,
}

impl CachedClient {
    fn built_for(&self, instance: &VaultInstance) -> bool {
        self.endpoint == instance.endpoint && self.tls_skip_verify == instance.tls_skip_verify
    }
}

pub struct ClientRepository {
    clients: RwLock<HashMap<String, CachedClient>>,
    factory: Arc<dyn ClientFactory>,
}

pub fn client_key(namespace: &str, instance_name: &str) -> String {
    format!("{}/{}", namespace, instance_name)
}

impl ClientRepository {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            factory,
        }
    }

    /// Returns the cached client for `key`, building it on first use.
    ///
    /// Construction happens under the write lock after a second lookup, so
    /// concurrent callers for the same key never build twice. A failed build
    /// is not cached. A cached client built for a different endpoint or TLS
    /// setting is replaced but not closed: callers may still hold it, and it
    /// is released when the last of them drops it.
    pub async fn get_client(
        &self,
        key: &str,
        instance: &VaultInstance,
    ) -> Result<Arc<dyn VaultClient>, VaultError> {
        {
            let clients = self.clients.read().await;
            if let Some(cached) = clients.get(key)
                && cached.built_for(instance)
            {
                return Ok(cached.client.clone());
            }
        }

        let mut clients = self.clients.write().await;
        if let Some(cached) = clients.get(key) {
            if cached.built_for(instance) {
                return Ok(cached.client.clone());
            }
            info!(%key, old = %cached.endpoint, new = %instance.endpoint, "vault endpoint changed, rebuilding client");
        }

        let client = self.factory.build(instance)?;
        debug!(%key, endpoint = %instance.endpoint, "created vault client");
        clients.insert(
            key.to_string(),
            CachedClient {
                client: client.clone(),
                endpoint: instance.endpoint.clone(),
                tls_skip_verify: instance.tls_skip_verify,
            },
        );
        Ok(client)
    }

    /// Closes and drops the client for `key`, if any.
    pub async fn evict(&self, key: &str) -> Result<(), VaultError> {
        let removed = self.clients.write().await.remove(key);
        match removed {
            Some(cached) => cached.client.close(),
            None => Ok(()),
        }
    }

    /// Closes every cached client. One failure does not stop the rest; the
    /// last error seen is returned. The cache is empty afterwards.
    pub async fn close(&self) -> Result<(), VaultError> {
        let mut clients = self.clients.write().await;
        let mut last_err = None;
        for (key, cached) in clients.drain() {
            if let Err(e) = cached.client.close() {
                warn!(%key, error = %e, "failed to close vault client");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}
