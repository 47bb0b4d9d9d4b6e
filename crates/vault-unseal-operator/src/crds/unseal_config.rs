use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

pub const DEFAULT_THRESHOLD: i32 = 3;

pub const CONDITION_READY: &str = "Ready";
pub const REASON_ALL_UNSEALED: &str = "AllInstancesUnsealed";
pub const REASON_SOME_SEALED: &str = "SomeInstancesSealed";

#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[kube(
    group = "vault.io",
    version = "v1",
    kind = "VaultUnsealConfig",
    plural = "vaultunsealconfigs",
    namespaced,
    status = "VaultUnsealConfigStatus",
    shortname = "vuc"
)]
#[serde(rename_all = "camelCase")]
pub struct VaultUnsealConfigSpec {
    /// Vault instances to keep unsealed, reported in this order
    pub vault_instances: Vec<VaultInstance>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VaultInstance {
    /// Unique within the owning config
    pub name: String,
    /// Vault API address, e.g. "https://vault-0.vault:8200"
    pub endpoint: String,
    /// Base64 encoded Shamir key shares
    #[serde(default)]
    pub unseal_keys: Vec<String>,
    /// Number of shares required to unseal (default 3)
    pub threshold: Option<i32>,
    #[serde(default)]
    pub tls_skip_verify: bool,
    /// Informational only; HA members are declared as separate instances
    #[serde(default)]
    pub ha_enabled: bool,
    /// Labels that pods of this instance carry
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_selector: BTreeMap<String, String>,
    /// Namespace the pods live in, if not the config's own
    pub namespace: Option<String>,
}

impl VaultInstance {
    pub fn effective_threshold(&self) -> i32 {
        self.threshold.unwrap_or(DEFAULT_THRESHOLD)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VaultUnsealConfigStatus {
    #[serde(default)]
    #[schemars(with = "Vec<Condition>")]
    pub conditions: Conditions,
    #[serde(default)]
    pub vault_statuses: Vec<VaultInstanceStatus>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VaultInstanceStatus {
    pub name: String,
    pub sealed: bool,
    /// RFC3339 time of the last observation that found the instance unsealed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_unsealed: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl VaultInstanceStatus {
    pub fn is_ready(&self) -> bool {
        !self.sealed && self.error.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True" or "False"
    pub status: String,
    pub reason: String,
    pub message: String,
    pub last_transition_time: String,
    pub observed_generation: Option<i64>,
}

/// Conditions keyed by type. Serialized as a list ordered by type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Condition>", into = "Vec<Condition>")]
pub struct Conditions(BTreeMap<String, Condition>);

impl Conditions {
    /// Replaces any condition of the same type.
    pub fn upsert(&mut self, condition: Condition) {
        self.0.insert(condition.type_.clone(), condition);
    }

    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.get(type_)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Condition>> for Conditions {
    fn from(list: Vec<Condition>) -> Self {
        // later entries win, matching a server-side list with accidental duplicates
        Self(list.into_iter().map(|c| (c.type_.clone(), c)).collect())
    }
}

impl From<Conditions> for Vec<Condition> {
    fn from(conditions: Conditions) -> Self {
        conditions.0.into_values().collect()
    }
}

pub fn rfc3339_now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(status: &str) -> Condition {
        Condition {
            type_: CONDITION_READY.into(),
            status: status.into(),
            reason: REASON_SOME_SEALED.into(),
            message: String::new(),
            last_transition_time: rfc3339_now(),
            observed_generation: Some(1),
        }
    }

    #[test]
    fn spec_deserializes_from_camel_case() {
        let spec: VaultUnsealConfigSpec = serde_json::from_value(serde_json::json!({
            "vaultInstances": [{
                "name": "v1",
                "endpoint": "http://v1:8200",
                "unsealKeys": ["a", "b", "c"],
                "tlsSkipVerify": true,
                "podSelector": {"app": "vault"}
            }]
        }))
        .unwrap();
        let inst = &spec.vault_instances[0];
        assert_eq!(inst.unseal_keys.len(), 3);
        assert!(inst.tls_skip_verify);
        assert_eq!(inst.effective_threshold(), DEFAULT_THRESHOLD);
        assert_eq!(inst.pod_selector.get("app").map(String::as_str), Some("vault"));
        assert_eq!(inst.namespace, None);
    }

    #[test]
    fn conditions_collapse_duplicate_types() {
        let conditions = Conditions::from(vec![ready("False"), ready("True")]);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions.get(CONDITION_READY).unwrap().status, "True");
    }

    #[test]
    fn conditions_serialize_as_list() {
        let mut conditions = Conditions::default();
        conditions.upsert(ready("True"));
        let value = serde_json::to_value(&conditions).unwrap();
        assert!(value.is_array());
        assert_eq!(value[0]["type"], "Ready");
        assert!(value[0]["lastTransitionTime"].is_string());
    }

    #[test]
    fn empty_error_is_omitted_on_the_wire() {
        let status = VaultInstanceStatus {
            name: "v1".into(),
            sealed: false,
            last_unsealed: None,
            error: String::new(),
        };
        let value = serde_json::to_value(&status).unwrap();
        assert!(value.get("error").is_none());
        assert!(status.is_ready());
    }

    #[test]
    fn crd_carries_group_and_short_name() {
        use kube::CustomResourceExt;
        let crd = VaultUnsealConfig::crd();
        assert_eq!(crd.spec.group, "vault.io");
        assert_eq!(crd.spec.names.kind, "VaultUnsealConfig");
        assert_eq!(crd.spec.names.short_names, Some(vec!["vuc".to_string()]));
        assert_eq!(crd.spec.scope, "Namespaced");
    }
}
