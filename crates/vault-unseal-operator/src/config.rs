use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};

use crate::pool::{DEFAULT_CAPACITY, DEFAULT_COOLDOWN, DEFAULT_WORKERS, PoolOptions};
use crate::reconciler::{
    DEFAULT_RECONCILE_TIMEOUT, POLLING_REQUEUE, ReconcilerOptions, WATCHING_REQUEUE,
};

pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    pub watch_pods: bool,
    pub requeue_after: Duration,
    pub reconcile_timeout: Duration,
    pub client_timeout: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
    pub cooldown: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_pods: true,
            requeue_after: WATCHING_REQUEUE,
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_CAPACITY,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let watch_pods = parse_bool(&lookup, "WATCH_PODS")?.unwrap_or(true);
        let default_requeue = if watch_pods {
            WATCHING_REQUEUE
        } else {
            POLLING_REQUEUE
        };

        let workers = parse::<usize>(&lookup, "UNSEAL_WORKERS")?.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            bail!("UNSEAL_WORKERS must be at least 1");
        }
        let queue_capacity =
            parse::<usize>(&lookup, "UNSEAL_QUEUE_CAPACITY")?.unwrap_or(DEFAULT_CAPACITY);
        if queue_capacity == 0 {
            bail!("UNSEAL_QUEUE_CAPACITY must be at least 1");
        }

        Ok(Self {
            watch_pods,
            requeue_after: secs(&lookup, "REQUEUE_AFTER_SECS")?.unwrap_or(default_requeue),
            reconcile_timeout: secs(&lookup, "RECONCILE_TIMEOUT_SECS")?
                .unwrap_or(DEFAULT_RECONCILE_TIMEOUT),
            client_timeout: secs(&lookup, "VAULT_CLIENT_TIMEOUT_SECS")?
                .unwrap_or(DEFAULT_CLIENT_TIMEOUT),
            workers,
            queue_capacity,
            cooldown: secs(&lookup, "UNSEAL_COOLDOWN_SECS")?.unwrap_or(DEFAULT_COOLDOWN),
        })
    }

    pub fn reconciler_options(&self) -> ReconcilerOptions {
        ReconcilerOptions {
            requeue_after: self.requeue_after,
            timeout: self.reconcile_timeout,
        }
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            workers: self.workers,
            capacity: self.queue_capacity,
            cooldown: self.cooldown,
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value {raw:?} for {name}")),
        _ => Ok(None),
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> anyhow::Result<Option<Duration>> {
    Ok(parse::<u64>(lookup, name)?.map(Duration::from_secs))
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> anyhow::Result<Option<bool>> {
    match lookup(name).as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some("1" | "true" | "TRUE" | "True" | "yes") => Ok(Some(true)),
        Some("0" | "false" | "FALSE" | "False" | "no") => Ok(Some(false)),
        Some(other) => bail!("invalid value {other:?} for {name}, expected true or false"),
    }
}
