use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::repository::client_key;

pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_CAPACITY: usize = 64;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(120);

/// What caused an unseal event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Pod { namespace: String, name: String },
    Periodic,
}

#[derive(Debug, Clone)]
pub struct UnsealEvent {
    /// Cooldown key, same shape as the client cache key
    pub instance_key: String,
    pub config_namespace: String,
    pub config_name: String,
    pub instance_name: String,
    pub trigger: Trigger,
    pub observed_at: Instant,
}

impl UnsealEvent {
    pub fn new(
        config_namespace: &str,
        config_name: &str,
        instance_name: &str,
        trigger: Trigger,
    ) -> Self {
        Self {
            instance_key: client_key(config_namespace, instance_name),
            config_namespace: config_namespace.to_string(),
            config_name: config_name.to_string(),
            instance_name: instance_name.to_string(),
            trigger,
            observed_at: Instant::now(),
        }
    }
}

/// Producer side of the intake channel. Never blocks.
#[derive(Clone)]
pub struct UnsealSender {
    tx: mpsc::Sender<UnsealEvent>,
}

impl UnsealSender {
    /// Returns false if the event was dropped.
    pub fn offer(&self, event: UnsealEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                debug!(key = %event.instance_key, "unseal queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(event)) => {
                debug!(key = %event.instance_key, "unseal queue closed, dropping event");
                false
            }
        }
    }
}

/// Bounded intake channel. The receiver is normally owned by an
/// [`UnsealPool`].
pub fn unseal_channel(capacity: usize) -> (UnsealSender, mpsc::Receiver<UnsealEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (UnsealSender { tx }, rx)
}

/// Last attempt per instance key.
pub struct Cooldown {
    window: Duration,
    last_attempt: Mutex<HashMap<String, Instant>>,
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_attempt: Mutex::new(HashMap::new()),
        }
    }

    /// Records an attempt for `key` at `now` unless one was recorded within
    /// the window. Check and record happen under one lock.
    pub fn try_begin(&self, key: &str, now: Instant) -> bool {
        let mut last = self
            .last_attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = last.get(key)
            && now.saturating_duration_since(*prev) < self.window
        {
            return false;
        }
        last.insert(key.to_string(), now);
        true
    }
}

/// Unit of work run by a worker for each event that survives the cooldown.
#[async_trait]
pub trait UnsealHandler: Send + Sync {
    async fn handle(&self, event: &UnsealEvent) -> Result<(), ReconcileError>;
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub workers: usize,
    pub capacity: usize,
    pub cooldown: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            capacity: DEFAULT_CAPACITY,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

pub struct UnsealPool {
    sender: UnsealSender,
    workers: Vec<JoinHandle<()>>,
}

impl UnsealPool {
    pub fn start(options: PoolOptions, handler: Arc<dyn UnsealHandler>) -> Self {
        let (sender, rx) = unseal_channel(options.capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let cooldown = Arc::new(Cooldown::new(options.cooldown));

        let workers = (0..options.workers.max(1))
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    rx.clone(),
                    cooldown.clone(),
                    handler.clone(),
                ))
            })
            .collect();
        info!(
            workers = options.workers,
            capacity = options.capacity,
            cooldown = ?options.cooldown,
            "unseal worker pool started"
        );
        Self { sender, workers }
    }

    pub fn sender(&self) -> UnsealSender {
        self.sender.clone()
    }

    /// Closes intake and lets workers drain what is queued. Workers still
    /// running after `grace` are aborted. Senders handed out earlier must be
    /// dropped for the queue to close.
    pub async fn shutdown(self, grace: Duration) {
        let Self { sender, workers } = self;
        drop(sender);

        let aborts: Vec<_> = workers.iter().map(|w| w.abort_handle()).collect();
        let drained = tokio::time::timeout(grace, futures::future::join_all(workers)).await;
        if drained.is_err() {
            warn!(?grace, "unseal workers did not stop in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        } else {
            info!("unseal worker pool stopped");
        }
    }
}

async fn worker(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<UnsealEvent>>>,
    cooldown: Arc<Cooldown>,
    handler: Arc<dyn UnsealHandler>,
) {
    loop {
        // lock only for the receive so other workers can pick up the next event
        let event = { rx.lock().await.recv().await };
        let Some(event) = event else {
            debug!(worker = id, "unseal queue closed, worker exiting");
            return;
        };

        if !cooldown.try_begin(&event.instance_key, Instant::now()) {
            debug!(worker = id, key = %event.instance_key, trigger = ?event.trigger, "instance in cooldown, skipping");
            continue;
        }

        debug!(
            worker = id,
            key = %event.instance_key,
            config = %event.config_name,
            trigger = ?event.trigger,
            queued_for = ?event.observed_at.elapsed(),
            "processing unseal event"
        );
        if let Err(e) = handler.handle(&event).await {
            warn!(worker = id, key = %event.instance_key, error = %e, "unseal event failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl UnsealHandler for Recorder {
        async fn handle(&self, event: &UnsealEvent) -> Result<(), ReconcileError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(event.instance_key.clone());
            Ok(())
        }
    }

    fn event(instance: &str) -> UnsealEvent {
        UnsealEvent::new("ns", "cfg", instance, Trigger::Periodic)
    }

    #[test]
    fn event_key_matches_client_key() {
        let e = UnsealEvent::new(
            "ops",
            "cfg",
            "v1",
            Trigger::Pod {
                namespace: "vault".into(),
                name: "vault-0".into(),
            },
        );
        assert_eq!(e.instance_key, "ops/v1");
    }

    #[test]
    fn cooldown_suppresses_within_window() {
        let cooldown = Cooldown::new(Duration::from_secs(120));
        let t0 = Instant::now();
        assert!(cooldown.try_begin("ns/v1", t0));
        assert!(!cooldown.try_begin("ns/v1", t0 + Duration::from_secs(60)));
        assert!(cooldown.try_begin("ns/v2", t0 + Duration::from_secs(60)));
        assert!(cooldown.try_begin("ns/v1", t0 + Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn offer_drops_when_full() {
        let (sender, _rx) = unseal_channel(1);
        assert!(sender.offer(event("v1")));
        assert!(!sender.offer(event("v2")));
    }

    #[tokio::test]
    async fn offer_drops_when_closed() {
        let (sender, rx) = unseal_channel(4);
        drop(rx);
        assert!(!sender.offer(event("v1")));
    }

    #[tokio::test]
    async fn two_events_in_window_dispatch_once() {
        let recorder = Arc::new(Recorder::default());
        let pool = UnsealPool::start(PoolOptions::default(), recorder.clone());
        let sender = pool.sender();
        assert!(sender.offer(event("v1")));
        assert!(sender.offer(event("v1")));
        drop(sender);
        pool.shutdown(Duration::from_secs(5)).await;

        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn distinct_instances_are_not_throttled_together() {
        let recorder = Arc::new(Recorder::default());
        let pool = UnsealPool::start(
            PoolOptions {
                workers: 8,
                ..Default::default()
            },
            recorder.clone(),
        );
        let sender = pool.sender();
        for _ in 0..4 {
            for name in ["v1", "v2", "v3"] {
                assert!(sender.offer(event(name)));
            }
        }
        drop(sender);
        pool.shutdown(Duration::from_secs(5)).await;

        assert_eq!(recorder.calls.load(Ordering::SeqCst), 3);
        let mut seen = recorder.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["ns/v1", "ns/v2", "ns/v3"]);
    }

    #[tokio::test]
    async fn handler_errors_do_not_stop_workers() {
        struct Failing(AtomicUsize);

        #[async_trait]
        impl UnsealHandler for Failing {
            async fn handle(&self, _: &UnsealEvent) -> Result<(), ReconcileError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(ReconcileError::Conflict("ns/cfg".into()))
            }
        }

        let handler = Arc::new(Failing(AtomicUsize::new(0)));
        let pool = UnsealPool::start(
            PoolOptions {
                workers: 1,
                ..Default::default()
            },
            handler.clone(),
        );
        let sender = pool.sender();
        sender.offer(event("v1"));
        sender.offer(event("v2"));
        drop(sender);
        pool.shutdown(Duration::from_secs(5)).await;

        assert_eq!(handler.0.load(Ordering::SeqCst), 2);
    }
}
