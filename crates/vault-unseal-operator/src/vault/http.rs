use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{Health, SealStatus, VaultClient, keys};
use crate::error::VaultError;

const USER_AGENT: &str = concat!("vault-unseal-operator/", env!("CARGO_PKG_VERSION"));
const MAX_ENDPOINT_LEN: usize = 2048;

// Vault answers /sys/health with these codes for standby, DR/perf secondaries,
// uninitialized and sealed nodes; the body is still a valid health document.
const HEALTH_STATUS_CODES: [u16; 5] = [429, 472, 473, 501, 503];

#[derive(Debug, Deserialize)]
struct SealStatusResponse {
    sealed: bool,
    #[serde(default)]
    t: u32,
    #[serde(default)]
    progress: u32,
}

impl From<SealStatusResponse> for SealStatus {
    fn from(r: SealStatusResponse) -> Self {
        SealStatus {
            sealed: r.sealed,
            progress: r.progress,
            required: r.t,
        }
    }
}

/// Talks to the Vault `sys/` API over HTTP.
pub struct HttpVaultClient {
    http: reqwest::Client,
    endpoint: String,
    closed: AtomicBool,
}

impl HttpVaultClient {
    pub fn new(endpoint: &str, tls_skip_verify: bool, timeout: Duration) -> Result<Self, VaultError> {
        let endpoint = validate_endpoint(endpoint)?;
        if tls_skip_verify {
            warn!(%endpoint, "TLS certificate verification disabled");
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(tls_skip_verify)
            .build()
            .map_err(|source| VaultError::Transport {
                operation: "client-build",
                endpoint: endpoint.clone(),
                source,
            })?;
        Ok(Self {
            http,
            endpoint,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), VaultError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VaultError::Closed(self.endpoint.clone()));
        }
        Ok(())
    }

    fn transport(&self, operation: &'static str) -> impl FnOnce(reqwest::Error) -> VaultError + '_ {
        move |source| VaultError::Transport {
            operation,
            endpoint: self.endpoint.clone(),
            source,
        }
    }

    async fn seal_status(&self) -> Result<SealStatus, VaultError> {
        let resp = self
            .http
            .get(format!("{}/v1/sys/seal-status", self.endpoint))
            .send()
            .await
            .map_err(self.transport("seal-status"))?;
        if !resp.status().is_success() {
            return Err(VaultError::Status {
                operation: "seal-status",
                endpoint: self.endpoint.clone(),
                status: resp.status().as_u16(),
            });
        }
        let body = resp
            .json::<SealStatusResponse>()
            .await
            .map_err(self.transport("seal-status"))?;
        Ok(body.into())
    }

    async fn submit_share(&self, key: &str) -> Result<SealStatus, VaultError> {
        let resp = self
            .http
            .put(format!("{}/v1/sys/unseal", self.endpoint))
            .json(&serde_json::json!({ "key": key }))
            .send()
            .await
            .map_err(self.transport("unseal"))?;
        if !resp.status().is_success() {
            return Err(VaultError::Status {
                operation: "unseal",
                endpoint: self.endpoint.clone(),
                status: resp.status().as_u16(),
            });
        }
        let body = resp
            .json::<SealStatusResponse>()
            .await
            .map_err(self.transport("unseal"))?;
        Ok(body.into())
    }
}

#[async_trait]
impl VaultClient for HttpVaultClient {
    async fn is_sealed(&self) -> Result<bool, VaultError> {
        self.ensure_open()?;
        Ok(self.seal_status().await?.sealed)
    }

    async fn unseal(&self, keys: &[String], threshold: usize) -> Result<SealStatus, VaultError> {
        self.ensure_open()?;
        keys::validate_key_shares(keys)?;

        let mut status = self.seal_status().await?;
        if !status.sealed {
            debug!(endpoint = %self.endpoint, "vault already unsealed");
            return Ok(status);
        }

        for (submitted, key) in keys.iter().take(threshold).enumerate() {
            status = self.submit_share(key).await?;
            if !status.sealed {
                info!(endpoint = %self.endpoint, shares = submitted + 1, "vault unsealed");
                break;
            }
        }
        Ok(status)
    }

    async fn health_check(&self) -> Result<Health, VaultError> {
        self.ensure_open()?;
        let resp = self
            .http
            .get(format!("{}/v1/sys/health", self.endpoint))
            .send()
            .await
            .map_err(self.transport("health-check"))?;
        let code = resp.status();
        if !code.is_success() && !HEALTH_STATUS_CODES.contains(&code.as_u16()) {
            return Err(VaultError::Status {
                operation: "health-check",
                endpoint: self.endpoint.clone(),
                status: code.as_u16(),
            });
        }
        if code == StatusCode::NO_CONTENT {
            return Ok(Health::default());
        }
        resp.json::<Health>()
            .await
            .map_err(self.transport("health-check"))
    }

    fn close(&self) -> Result<(), VaultError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

fn validate_endpoint(endpoint: &str) -> Result<String, VaultError> {
    let invalid = |reason: &str| VaultError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    };
    if endpoint.is_empty() {
        return Err(invalid("endpoint cannot be empty"));
    }
    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        return Err(invalid("endpoint must start with http:// or https://"));
    }
    if endpoint.len() > MAX_ENDPOINT_LEN {
        return Err(invalid("endpoint exceeds 2048 characters"));
    }
    let url = reqwest::Url::parse(endpoint).map_err(|e| invalid(&e.to_string()))?;
    if url.host_str().is_none() {
        return Err(invalid("endpoint has no host"));
    }
    Ok(endpoint.trim_end_matches('/').to_string())
}
