use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument};

use crate::crds::unseal_config::{
    CONDITION_READY, Condition, REASON_ALL_UNSEALED, REASON_SOME_SEALED, VaultInstanceStatus,
    VaultUnsealConfig, rfc3339_now,
};
use crate::error::ReconcileError;
use crate::pool::{UnsealEvent, UnsealHandler};
use crate::processor::InstanceProcessor;
use crate::store::ConfigStore;

pub const POLLING_REQUEUE: Duration = Duration::from_secs(30);
pub const WATCHING_REQUEUE: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// Returned after every successful cycle
    pub requeue_after: Duration,
    /// Deadline for a whole cycle, shared by all instances
    pub timeout: Duration,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            requeue_after: POLLING_REQUEUE,
            timeout: DEFAULT_RECONCILE_TIMEOUT,
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn ConfigStore>,
    processor: InstanceProcessor,
    options: ReconcilerOptions,
    /// Serializes status read-modify-write per config
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        processor: InstanceProcessor,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            store,
            processor,
            options,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Runs one full cycle. `Ok(None)` means the object is gone and needs no
    /// further attention; otherwise the requeue interval is returned.
    #[instrument(skip(self))]
    pub async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Duration>, ReconcileError> {
        let key = format!("{namespace}/{name}");
        let guard = self.lock_config(&key).await;
        let res = self
            .with_deadline(namespace, name, self.full_cycle(namespace, name))
            .await;
        if matches!(res, Ok(None)) {
            self.forget_config(&key);
        }
        drop(guard);
        res
    }

    /// Refreshes a single instance's entry without touching its siblings,
    /// unless the stored list no longer lines up with the declared instances.
    #[instrument(skip(self))]
    pub async fn reconcile_instance(
        &self,
        namespace: &str,
        name: &str,
        instance_name: &str,
    ) -> Result<(), ReconcileError> {
        let _guard = self.lock_config(&format!("{namespace}/{name}")).await;
        self.with_deadline(
            namespace,
            name,
            self.instance_cycle(namespace, name, instance_name),
        )
        .await
    }

    /// Waits for exclusive use of the config. Waiting does not count against
    /// the cycle deadline.
    async fn lock_config(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Drops the lock of a config that no longer exists. Must be called while
    /// holding its guard; a lock someone else is waiting on is kept.
    fn forget_config(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // one reference in the map, one in the caller's guard
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) <= 2) {
            locks.remove(key);
        }
    }

    async fn with_deadline<T>(
        &self,
        namespace: &str,
        name: &str,
        cycle: impl Future<Output = Result<T, ReconcileError>>,
    ) -> Result<T, ReconcileError> {
        match tokio::time::timeout(self.options.timeout, cycle).await {
            Ok(res) => res,
            Err(_) => Err(ReconcileError::Timeout(
                format!("{namespace}/{name}"),
                self.options.timeout,
            )),
        }
    }

    async fn load(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VaultUnsealConfig>, ReconcileError> {
        match self.store.get(namespace, name).await? {
            Some(config) if config.metadata.deletion_timestamp.is_some() => {
                debug!("config is being deleted, nothing to do");
                Ok(None)
            }
            Some(config) => Ok(Some(config)),
            None => {
                debug!("config not found, nothing to do");
                Ok(None)
            }
        }
    }

    async fn full_cycle(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Duration>, ReconcileError> {
        let Some(mut config) = self.load(namespace, name).await? else {
            return Ok(None);
        };

        let mut statuses = Vec::with_capacity(config.spec.vault_instances.len());
        for instance in &config.spec.vault_instances {
            statuses.push(self.processor.process_or_report(instance, namespace).await);
        }

        let ready = apply_status(&mut config, statuses);
        self.store.update_status(&config).await?;
        info!(
            ready,
            instances = config.spec.vault_instances.len(),
            "reconciled vault unseal config"
        );
        Ok(Some(self.options.requeue_after))
    }

    async fn instance_cycle(
        &self,
        namespace: &str,
        name: &str,
        instance_name: &str,
    ) -> Result<(), ReconcileError> {
        let Some(mut config) = self.load(namespace, name).await? else {
            return Ok(());
        };
        let Some(instance) = config
            .spec
            .vault_instances
            .iter()
            .find(|i| i.name == instance_name)
        else {
            debug!("instance no longer declared, nothing to do");
            return Ok(());
        };
        let fresh = self.processor.process_or_report(instance, namespace).await;

        let previous = config
            .status
            .as_ref()
            .map(|s| s.vault_statuses.clone())
            .unwrap_or_default();
        let statuses = if lines_up(&config, &previous) {
            previous
                .into_iter()
                .map(|s| if s.name == instance_name { fresh.clone() } else { s })
                .collect()
        } else {
            debug!("stored status list is stale, rebuilding");
            let mut rebuilt = Vec::with_capacity(config.spec.vault_instances.len());
            for declared in &config.spec.vault_instances {
                let status = if declared.name == instance_name {
                    fresh.clone()
                } else if let Some(known) = previous.iter().find(|s| s.name == declared.name) {
                    known.clone()
                } else {
                    self.processor.process_or_report(declared, namespace).await
                };
                rebuilt.push(status);
            }
            rebuilt
        };

        let ready = apply_status(&mut config, statuses);
        self.store.update_status(&config).await?;
        info!(ready, sealed = fresh.sealed, "refreshed vault instance");
        Ok(())
    }
}

/// True when `statuses` has exactly one entry per declared instance, in
/// declaration order.
fn lines_up(config: &VaultUnsealConfig, statuses: &[VaultInstanceStatus]) -> bool {
    statuses.len() == config.spec.vault_instances.len()
        && statuses
            .iter()
            .zip(&config.spec.vault_instances)
            .all(|(s, i)| s.name == i.name)
}

/// The Ready condition for a set of instance statuses.
pub fn ready_condition(statuses: &[VaultInstanceStatus], generation: Option<i64>) -> Condition {
    let total = statuses.len();
    let not_ready = statuses.iter().filter(|s| !s.is_ready()).count();
    let (status, reason, message) = if not_ready == 0 {
        (
            "True",
            REASON_ALL_UNSEALED,
            format!("All {total} vault instances are unsealed"),
        )
    } else {
        (
            "False",
            REASON_SOME_SEALED,
            format!("{not_ready} of {total} vault instances are sealed"),
        )
    };
    Condition {
        type_: CONDITION_READY.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time: rfc3339_now(),
        observed_generation: generation,
    }
}

/// Stores `statuses` and the matching Ready condition on `config`. Returns
/// whether every instance is ready.
pub fn apply_status(config: &mut VaultUnsealConfig, statuses: Vec<VaultInstanceStatus>) -> bool {
    let condition = ready_condition(&statuses, config.metadata.generation);
    let ready = condition.status == "True";
    let status = config.status.get_or_insert_with(Default::default);
    status.vault_statuses = statuses;
    status.conditions.upsert(condition);
    ready
}

#[async_trait]
impl UnsealHandler for Reconciler {
    async fn handle(&self, event: &UnsealEvent) -> Result<(), ReconcileError> {
        self.reconcile_instance(
            &event.config_namespace,
            &event.config_name,
            &event.instance_name,
        )
        .await
    }
}

/// Identity string used in logs and errors.
pub fn config_id(config: &VaultUnsealConfig) -> String {
    format!("{}/{}", config.namespace().unwrap_or_default(), config.name_any())
}
