use std::time::Duration;

use thiserror::Error;

/// Failures talking to, or building a client for, a single Vault instance.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid vault endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("invalid unseal key at index {index}: {reason}")]
    InvalidKey { index: usize, reason: String },
    #[error("vault {operation} failed for {endpoint}: {source}")]
    Transport {
        operation: &'static str,
        endpoint: String,
        source: reqwest::Error,
    },
    #[error("vault {operation} returned HTTP {status} from {endpoint}")]
    Status {
        operation: &'static str,
        endpoint: String,
        status: u16,
    },
    #[error("vault client for {0} is closed")]
    Closed(String),
}

/// Failures processing one declared instance. These end up in the instance's
/// status `error` field and never abort sibling instances.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to get vault client: {0}")]
    Client(VaultError),
    #[error("failed to check seal status: {0}")]
    SealStatus(VaultError),
    #[error("failed to unseal vault: {0}")]
    Unseal(VaultError),
    #[error("invalid threshold {0}: must be at least 1")]
    InvalidThreshold(i32),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0} no longer exists")]
    NotFound(String),
    #[error("status update for {0} conflicts with a newer resource version")]
    Conflict(String),
    #[error("reconcile of {0} did not finish within {1:?}")]
    Timeout(String, Duration),
    #[error("object is missing {0}")]
    MissingObjectKey(&'static str),
}
