use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::runtime::reflector::{ObjectRef, Store};
use tracing::debug;

use crate::crds::unseal_config::{VaultInstance, VaultUnsealConfig};
use crate::pool::{Trigger, UnsealEvent, UnsealSender};

pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";

/// Cheap heuristic for pods that look like a Vault server.
pub fn is_vault_pod(pod: &Pod) -> bool {
    let labels = pod.labels();
    labels.get(NAME_LABEL).map(String::as_str) == Some("vault")
        || labels.get(COMPONENT_LABEL).map(String::as_str) == Some("server")
        || pod.name_any().contains("vault")
}

/// Every selector pair must be present with an equal value.
pub fn selector_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|l| l == v))
}

/// Running, has an IP, and no container reports not ready. Only such pods can
/// answer seal-status and unseal calls.
pub fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    status.phase.as_deref() == Some("Running")
        && status.pod_ip.as_deref().is_some_and(|ip| !ip.is_empty())
        && status
            .container_statuses
            .iter()
            .flatten()
            .all(|c| c.ready)
}

pub fn instance_matches_pod(instance: &VaultInstance, pod: &Pod) -> bool {
    if let Some(ns) = instance.namespace.as_deref().filter(|ns| !ns.is_empty())
        && pod.namespace().as_deref() != Some(ns)
    {
        return false;
    }
    if !instance.pod_selector.is_empty() {
        return selector_matches(&instance.pod_selector, pod.labels());
    }
    is_vault_pod(pod)
}

/// Configs with at least one instance matching `pod`, each listed once, in
/// the order given.
pub fn map_pod_event<'a>(
    pod: &Pod,
    configs: impl IntoIterator<Item = &'a VaultUnsealConfig>,
) -> Vec<ObjectRef<VaultUnsealConfig>> {
    unique_refs(&matching_instances(pod, configs))
}

fn unique_refs(
    matches: &[(&VaultUnsealConfig, &VaultInstance)],
) -> Vec<ObjectRef<VaultUnsealConfig>> {
    let mut refs = Vec::new();
    for (config, _) in matches {
        let r = ObjectRef::from_obj(*config);
        if !refs.contains(&r) {
            refs.push(r);
        }
    }
    refs
}

/// Every `(config, instance)` pair that `pod` belongs to.
pub fn matching_instances<'a>(
    pod: &Pod,
    configs: impl IntoIterator<Item = &'a VaultUnsealConfig>,
) -> Vec<(&'a VaultUnsealConfig, &'a VaultInstance)> {
    if !is_vault_pod(pod) {
        return Vec::new();
    }
    configs
        .into_iter()
        .flat_map(|config| {
            config
                .spec
                .vault_instances
                .iter()
                .filter(|instance| instance_matches_pod(instance, pod))
                .map(move |instance| (config, instance))
        })
        .collect()
}

/// Pod watch mapper wired into the controller. Reads configs from the
/// controller's reflector cache, so it never blocks on the API server.
#[derive(Clone)]
pub struct PodEventMapper {
    configs: Store<VaultUnsealConfig>,
    unseal_tx: Option<UnsealSender>,
}

impl PodEventMapper {
    pub fn new(configs: Store<VaultUnsealConfig>, unseal_tx: Option<UnsealSender>) -> Self {
        Self { configs, unseal_tx }
    }

    pub fn on_pod_event(&self, pod: &Pod) -> Vec<ObjectRef<VaultUnsealConfig>> {
        if !is_vault_pod(pod) {
            return Vec::new();
        }
        let configs = self.configs.state();
        let matches = matching_instances(pod, configs.iter().map(Arc::as_ref));

        if let Some(tx) = &self.unseal_tx
            && pod.metadata.deletion_timestamp.is_none()
            && is_pod_ready(pod)
        {
            let trigger = Trigger::Pod {
                namespace: pod.namespace().unwrap_or_default(),
                name: pod.name_any(),
            };
            for (config, instance) in &matches {
                tx.offer(UnsealEvent::new(
                    &config.namespace().unwrap_or_default(),
                    &config.name_any(),
                    &instance.name,
                    trigger.clone(),
                ));
            }
        }

        let refs = unique_refs(&matches);
        if !refs.is_empty() {
            debug!(pod = %pod.name_any(), configs = refs.len(), "pod event triggers reconciliation");
        }
        refs
    }
}
