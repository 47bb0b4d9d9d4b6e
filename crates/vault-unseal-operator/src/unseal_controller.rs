use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::{
    Api, Client, ResourceExt,
    runtime::{
        controller::{Action, Controller},
        watcher,
    },
};
use tokio::time::Duration;
use tracing::{error, info};

use crate::{
    crds::unseal_config::VaultUnsealConfig,
    error::ReconcileError,
    pod_mapper::PodEventMapper,
    pool::UnsealSender,
    reconciler::{Reconciler, config_id},
};

const ERROR_REQUEUE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Ctx {
    pub reconciler: Arc<Reconciler>,
}

/// Controller over every `VaultUnsealConfig` in the cluster. With
/// `watch_pods`, Vault pod events also trigger reconciles and are offered to
/// the unseal pool through `unseal_tx`.
pub fn controller(
    client: Client,
    watch_pods: bool,
    unseal_tx: Option<UnsealSender>,
) -> Controller<VaultUnsealConfig> {
    let api: Api<VaultUnsealConfig> = Api::all(client.clone());
    let controller = Controller::new(api, watcher::Config::default()).shutdown_on_signal();
    if !watch_pods {
        return controller;
    }

    let mapper = PodEventMapper::new(controller.store(), unseal_tx);
    info!("watching pods for vault lifecycle events");
    controller.watches(
        Api::<Pod>::all(client),
        watcher::Config::default(),
        move |pod| mapper.on_pod_event(&pod),
    )
}

pub async fn reconcile(
    config: Arc<VaultUnsealConfig>,
    ctx: Arc<Ctx>,
) -> Result<Action, ReconcileError> {
    let ns = config
        .namespace()
        .ok_or(ReconcileError::MissingObjectKey(".metadata.namespace"))?;
    let name = config.name_any();

    match ctx.reconciler.reconcile(&ns, &name).await? {
        Some(after) => Ok(Action::requeue(after)),
        None => Ok(Action::await_change()),
    }
}

pub fn error_policy(config: Arc<VaultUnsealConfig>, err: &ReconcileError, _ctx: Arc<Ctx>) -> Action {
    error!(config = %config_id(&config), error = %err, "vault unseal reconcile failed");
    Action::requeue(ERROR_REQUEUE)
}
