//! Per-object controller loop
//!
//! Each managed object gets exactly one worker task, so two reconciles of
//! the same object never overlap while different objects proceed
//! independently. A resync loop lists objects periodically and starts
//! workers for any that lack a live one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use crate::errors::Severity;
use crate::reconcile::{Outcome, Reconciler};
use crate::resources::ObjectKey;
use crate::settings::OperatorSettings;

/// Hooks for metrics. Every method defaults to a no-op.
pub trait ReconcileObserver: Send + Sync {
    /// `outcome` is one of `requeue`, `done`, `deferred`, `transient`, `critical`.
    fn reconciled(&self, _kind: &str, _outcome: &str, _elapsed: Duration) {}

    fn workers_changed(&self, _kind: &str, _active: usize) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl ReconcileObserver for NoopObserver {}

pub struct Controller {
    reconciler: Arc<dyn Reconciler>,
    settings: OperatorSettings,
    observer: Arc<dyn ReconcileObserver>,
    workers: Arc<RwLock<HashMap<ObjectKey, JoinHandle<()>>>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    resync: Option<JoinHandle<()>>,
}

impl Controller {
    pub fn new(reconciler: Arc<dyn Reconciler>, settings: OperatorSettings) -> Self {
        Self {
            reconciler,
            settings,
            observer: Arc::new(NoopObserver),
            workers: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx: None,
            resync: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ReconcileObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn kind(&self) -> &'static str {
        self.reconciler.kind()
    }

    /// Start the resync loop. Calling it twice is a no-op.
    #[instrument(skip(self), fields(kind = self.reconciler.kind()))]
    pub fn start(&mut self) {
        if self.shutdown_tx.is_some() {
            return;
        }
        info!(namespace = %self.settings.namespace, "starting controller");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let reconciler = self.reconciler.clone();
        let settings = self.settings.clone();
        let observer = self.observer.clone();
        let workers = self.workers.clone();

        self.resync = Some(tokio::spawn(async move {
            let mut ticker = interval(settings.resync_interval());

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::resync(&reconciler, &settings, &observer, &workers, &shutdown_rx).await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("resync loop stopping");
                        break;
                    }
                }
            }
        }));
    }

    /// Workers that are still running.
    pub fn active_workers(&self) -> usize {
        self.workers
            .read()
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Stop the resync loop and every worker, waiting for them to exit.
    pub async fn shutdown(&mut self) {
        info!(kind = self.reconciler.kind(), "shutting down controller");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(resync) = self.resync.take() {
            let _ = resync.await;
        }
        let handles: Vec<JoinHandle<()>> = self.workers.write().drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn resync(
        reconciler: &Arc<dyn Reconciler>,
        settings: &OperatorSettings,
        observer: &Arc<dyn ReconcileObserver>,
        workers: &Arc<RwLock<HashMap<ObjectKey, JoinHandle<()>>>>,
        shutdown_rx: &watch::Receiver<bool>,
    ) {
        let keys = match reconciler.list_keys(&settings.namespace).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(kind = reconciler.kind(), error = %e, "failed to list objects");
                return;
            }
        };

        let mut workers = workers.write();
        workers.retain(|_, handle| !handle.is_finished());
        for key in keys {
            if workers.contains_key(&key) {
                continue;
            }
            debug!(object = %key, "starting worker");
            let handle = tokio::spawn(run_worker(
                reconciler.clone(),
                key.clone(),
                settings.clone(),
                observer.clone(),
                shutdown_rx.clone(),
            ));
            workers.insert(key, handle);
        }
        observer.workers_changed(reconciler.kind(), workers.len());
    }
}

/// Reconcile one object until it is gone or the controller stops.
pub async fn run_worker(
    reconciler: Arc<dyn Reconciler>,
    key: ObjectKey,
    settings: OperatorSettings,
    observer: Arc<dyn ReconcileObserver>,
    mut shutdown: watch::Receiver<bool>,
) {
    let kind = reconciler.kind();
    let mut backoff = settings.backoff();

    loop {
        let started = Instant::now();
        let result = reconciler.reconcile(&key).await;
        let elapsed = started.elapsed();

        let delay = match result {
            Ok(Outcome::Done) => {
                observer.reconciled(kind, "done", elapsed);
                debug!(object = %key, "object finished, stopping worker");
                break;
            }
            Ok(Outcome::RequeueAfter(delay)) => {
                observer.reconciled(kind, "requeue", elapsed);
                backoff.reset();
                delay
            }
            Err(e) => match e.severity() {
                Severity::Deferred => {
                    observer.reconciled(kind, "deferred", elapsed);
                    info!(object = %key, reason = %e, "non-critical condition, requeueing");
                    settings.deferred_delay()
                }
                Severity::Critical => {
                    observer.reconciled(kind, "critical", elapsed);
                    let delay = backoff.next_delay();
                    error!(object = %key, error = %e, retry_in = ?delay, "critical reconcile error");
                    delay
                }
                Severity::Transient => {
                    observer.reconciled(kind, "transient", elapsed);
                    let delay = backoff.next_delay();
                    warn!(object = %key, error = %e, retry_in = ?delay, "reconcile failed, retrying");
                    delay
                }
            },
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
}
