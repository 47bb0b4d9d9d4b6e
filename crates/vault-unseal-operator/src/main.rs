use futures::StreamExt;
use kube::Client;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vault_unseal_operator::{
    config::OperatorConfig,
    pool::UnsealPool,
    processor::InstanceProcessor,
    reconciler::Reconciler,
    repository::ClientRepository,
    store::{ConfigStore, KubeConfigStore},
    unseal_controller as vuc,
    vault::HttpClientFactory,
};

const POOL_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = OperatorConfig::from_env()?;
    info!(?config, "vault-unseal-operator starting up");

    let client = Client::try_default().await?;

    let repository = Arc::new(ClientRepository::new(Arc::new(HttpClientFactory {
        timeout: config.client_timeout,
    })));
    let store = Arc::new(KubeConfigStore::new(client.clone()));
    match store.list().await {
        Ok(configs) => info!(count = configs.len(), "found existing vault unseal configs"),
        Err(e) => warn!(error = %e, "could not list vault unseal configs"),
    }
    let reconciler = Arc::new(Reconciler::new(
        store,
        InstanceProcessor::new(repository.clone()),
        config.reconciler_options(),
    ));

    let pool = config
        .watch_pods
        .then(|| UnsealPool::start(config.pool_options(), reconciler.clone()));

    let ctx = Arc::new(vuc::Ctx {
        reconciler: reconciler.clone(),
    });
    let controller = vuc::controller(
        client.clone(),
        config.watch_pods,
        pool.as_ref().map(UnsealPool::sender),
    )
    .run(vuc::reconcile, vuc::error_policy, ctx)
    .for_each(|res| async move {
        if let Err(e) = res {
            warn!(error=?e, "vault unseal reconcile error");
        }
    });

    tokio::select! {
        _ = controller => {},
        _ = tokio::signal::ctrl_c() => { info!("shutdown signal received"); }
    }

    if let Some(pool) = pool {
        pool.shutdown(POOL_SHUTDOWN_GRACE).await;
    }
    if let Err(e) = repository.close().await {
        warn!(error = %e, "failed to close vault clients");
    }
    Ok(())
}
