use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::crds::unseal_config::{VaultInstance, VaultInstanceStatus, rfc3339_now};
use crate::error::ProcessError;
use crate::repository::{ClientRepository, client_key};

/// Check / unseal / report for one declared instance. Holds no state of its
/// own beyond the shared client repository.
#[derive(Clone)]
pub struct InstanceProcessor {
    repository: Arc<ClientRepository>,
}

impl InstanceProcessor {
    pub fn new(repository: Arc<ClientRepository>) -> Self {
        Self { repository }
    }

    #[instrument(skip_all, fields(instance = %instance.name, endpoint = %instance.endpoint))]
    pub async fn process(
        &self,
        instance: &VaultInstance,
        namespace: &str,
    ) -> Result<VaultInstanceStatus, ProcessError> {
        let key = client_key(namespace, &instance.name);
        let client = self
            .repository
            .get_client(&key, instance)
            .await
            .map_err(ProcessError::Client)?;

        let sealed = client.is_sealed().await.map_err(ProcessError::SealStatus)?;
        debug!(sealed, "vault seal status checked");

        let mut status = VaultInstanceStatus {
            name: instance.name.clone(),
            sealed,
            ..Default::default()
        };

        if sealed {
            let threshold = instance.effective_threshold();
            if threshold < 1 {
                return Err(ProcessError::InvalidThreshold(threshold));
            }
            info!(
                threshold,
                key_count = instance.unseal_keys.len(),
                "attempting to unseal vault"
            );
            let seal = client
                .unseal(&instance.unseal_keys, threshold as usize)
                .await
                .map_err(ProcessError::Unseal)?;
            status.sealed = seal.sealed;
            if seal.sealed {
                info!(
                    progress = seal.progress,
                    required = seal.required,
                    "vault remains sealed after unseal attempt"
                );
            } else {
                info!("vault successfully unsealed");
            }
        }

        if !status.sealed {
            status.last_unsealed = Some(rfc3339_now());
        }
        Ok(status)
    }

    /// Like [`process`](Self::process), but folds a failure into a sealed
    /// status carrying the error text.
    pub async fn process_or_report(
        &self,
        instance: &VaultInstance,
        namespace: &str,
    ) -> VaultInstanceStatus {
        match self.process(instance, namespace).await {
            Ok(status) => status,
            Err(e) => {
                warn!(instance = %instance.name, error = %e, "failed to process vault instance");
                VaultInstanceStatus {
                    name: instance.name.clone(),
                    sealed: true,
                    last_unsealed: None,
                    error: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VaultError;
    use crate::vault::{MockClientFactory, MockVaultClient, SealStatus, VaultClient};

    fn instance(keys: &[&str], threshold: Option<i32>) -> VaultInstance {
        VaultInstance {
            name: "v1".into(),
            endpoint: "http://v1:8200".into(),
            unseal_keys: keys.iter().map(|k| k.to_string()).collect(),
            threshold,
            ..Default::default()
        }
    }

    fn processor_with(client: MockVaultClient) -> InstanceProcessor {
        let client: Arc<dyn VaultClient> = Arc::new(client);
        let mut factory = MockClientFactory::new();
        factory
            .expect_build()
            .returning(move |_| Ok(client.clone()));
        InstanceProcessor::new(Arc::new(ClientRepository::new(Arc::new(factory))))
    }

    fn seal(sealed: bool, progress: u32) -> SealStatus {
        SealStatus {
            sealed,
            progress,
            required: 3,
        }
    }

    #[tokio::test]
    async fn already_unsealed_skips_unseal() {
        let mut client = MockVaultClient::new();
        client.expect_is_sealed().returning(|| Ok(false));
        client.expect_unseal().never();

        let status = processor_with(client)
            .process(&instance(&["a", "b", "c"], Some(3)), "ns")
            .await
            .unwrap();
        assert!(!status.sealed);
        assert!(status.error.is_empty());
        assert!(status.last_unsealed.is_some());
    }

    #[tokio::test]
    async fn sealed_instance_is_unsealed_with_default_threshold() {
        let mut client = MockVaultClient::new();
        client.expect_is_sealed().returning(|| Ok(true));
        client
            .expect_unseal()
            .withf(|keys, threshold| keys.len() == 3 && *threshold == 3)
            .times(1)
            .returning(|_, _| Ok(seal(false, 0)));

        let status = processor_with(client)
            .process(&instance(&["a", "b", "c"], None), "ns")
            .await
            .unwrap();
        assert_eq!(status.name, "v1");
        assert!(!status.sealed);
        assert!(status.last_unsealed.is_some());
    }

    #[tokio::test]
    async fn partial_progress_is_sealed_without_error() {
        let mut client = MockVaultClient::new();
        client.expect_is_sealed().returning(|| Ok(true));
        client
            .expect_unseal()
            .returning(|_, _| Ok(seal(true, 2)));

        let status = processor_with(client)
            .process(&instance(&["a", "b"], Some(3)), "ns")
            .await
            .unwrap();
        assert!(status.sealed);
        assert!(status.error.is_empty());
        assert!(status.last_unsealed.is_none());
    }

    #[tokio::test]
    async fn more_keys_than_threshold_is_allowed() {
        let mut client = MockVaultClient::new();
        client.expect_is_sealed().returning(|| Ok(true));
        client
            .expect_unseal()
            .withf(|keys, threshold| keys.len() == 5 && *threshold == 2)
            .returning(|_, _| Ok(seal(false, 0)));

        let status = processor_with(client)
            .process(&instance(&["a", "b", "c", "d", "e"], Some(2)), "ns")
            .await
            .unwrap();
        assert!(!status.sealed);
    }

    #[tokio::test]
    async fn zero_keys_leave_instance_sealed() {
        let mut client = MockVaultClient::new();
        client.expect_is_sealed().returning(|| Ok(true));
        client
            .expect_unseal()
            .withf(|keys, _| keys.is_empty())
            .returning(|_, _| Ok(seal(true, 0)));

        let status = processor_with(client)
            .process(&instance(&[], Some(3)), "ns")
            .await
            .unwrap();
        assert!(status.sealed);
        assert!(status.error.is_empty());
    }

    #[tokio::test]
    async fn non_positive_threshold_is_invalid_input() {
        let mut client = MockVaultClient::new();
        client.expect_is_sealed().returning(|| Ok(true));
        client.expect_unseal().never();
        let processor = processor_with(client);

        let err = processor
            .process(&instance(&["a"], Some(0)), "ns")
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::InvalidThreshold(0)));

        let status = processor
            .process_or_report(&instance(&["a"], Some(-1)), "ns")
            .await;
        assert!(status.sealed);
        assert!(status.error.contains("threshold"));
    }

    #[tokio::test]
    async fn seal_check_failure_becomes_error_status() {
        let mut client = MockVaultClient::new();
        client
            .expect_is_sealed()
            .returning(|| Err(VaultError::Closed("http://v1:8200".into())));

        let status = processor_with(client)
            .process_or_report(&instance(&["a"], None), "ns")
            .await;
        assert!(status.sealed);
        assert!(status.error.starts_with("failed to check seal status"));
        assert!(status.last_unsealed.is_none());
    }

    #[tokio::test]
    async fn client_build_failure_becomes_error_status() {
        let mut factory = MockClientFactory::new();
        factory.expect_build().returning(|i| {
            Err(VaultError::InvalidEndpoint {
                endpoint: i.endpoint.clone(),
                reason: "endpoint must start with http:// or https://".into(),
            })
        });
        let processor =
            InstanceProcessor::new(Arc::new(ClientRepository::new(Arc::new(factory))));

        let status = processor
            .process_or_report(&instance(&["a"], None), "ns")
            .await;
        assert!(status.sealed);
        assert!(status.error.starts_with("failed to get vault client"));
    }

    #[tokio::test]
    async fn unseal_failure_becomes_error_status() {
        let mut client = MockVaultClient::new();
        client.expect_is_sealed().returning(|| Ok(true));
        client.expect_unseal().returning(|_, _| {
            Err(VaultError::Status {
                operation: "unseal",
                endpoint: "http://v1:8200".into(),
                status: 500,
            })
        });

        let status = processor_with(client)
            .process_or_report(&instance(&["a", "b", "c"], None), "ns")
            .await;
        assert!(status.sealed);
        assert!(status.error.contains("HTTP 500"));
    }
}
