//! Scheduler module for running recurring probes into the result cache.

use crate::cache::ResultCache;
use crate::probe::{measure, MeasurementRunner, TargetKey, TargetSpec};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A running per-target probe loop.
struct TargetTask {
    stop_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Runs one independent probe loop per scheduled target.
pub struct Scheduler {
    cache: Arc<ResultCache>,
    runner: Arc<dyn MeasurementRunner>,
    tasks: RwLock<HashMap<TargetKey, TargetTask>>,
    stopped: AtomicBool,
}

impl Scheduler {
    /// Create a scheduler writing into `cache`.
    pub fn new(cache: Arc<ResultCache>, runner: Arc<dyn MeasurementRunner>) -> Self {
        Self {
            cache,
            runner,
            tasks: RwLock::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Start probing every target that has a non-zero interval.
    pub async fn start(&self, targets: Vec<TargetSpec>) {
        tracing::info!("Starting scheduler with {} targets", targets.len());

        for target in targets {
            self.add_target(target).await;
        }
    }

    /// Add a target to be probed. Returns false if it is unscheduled, already
    /// running, or the scheduler has shut down.
    pub async fn add_target(&self, target: TargetSpec) -> bool {
        let key = target.key();

        if !target.is_scheduled() {
            tracing::info!("Scheduler: {} has no interval, not scheduling", key);
            return false;
        }

        let mut tasks = self.tasks.write().await;
        if self.stopped.load(Ordering::SeqCst) || tasks.contains_key(&key) {
            return false;
        }

        tracing::info!(
            "Scheduler: Adding target {} every {:?} (period {:?}, timeout {:?})",
            key,
            target.interval,
            target.period,
            target.timeout
        );

        let (stop_tx, stop_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_probe_loop(
            target,
            self.runner.clone(),
            self.cache.clone(),
            stop_rx,
        ));

        tasks.insert(key, TargetTask { stop_tx, handle });
        true
    }

    /// Stop probing a target and wait for its loop to exit.
    pub async fn remove_target(&self, key: &TargetKey) -> bool {
        let task = match self.tasks.write().await.remove(key) {
            Some(task) => task,
            None => return false,
        };

        stop_task(key, task).await;
        tracing::info!("Scheduler: Removed target {}", key);
        true
    }

    /// Stop every target loop and refuse new ones. In-flight measurements are
    /// cancelled, which kills their iperf3 processes.
    pub async fn shutdown(&self) {
        let drained = {
            let mut tasks = self.tasks.write().await;
            self.stopped.store(true, Ordering::SeqCst);
            std::mem::take(&mut *tasks)
        };
        tracing::info!("Scheduler: Shutting down {} target loops", drained.len());

        for task in drained.values() {
            let _ = task.stop_tx.send(());
        }
        for (key, task) in drained {
            stop_task(&key, task).await;
        }
    }

    /// Number of targets currently being probed.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }
}

async fn stop_task(key: &TargetKey, task: TargetTask) {
    let _ = task.stop_tx.send(());
    if let Err(e) = task.handle.await {
        tracing::error!("Scheduler: Probe loop for {} ended abnormally: {}", key, e);
    }
}

/// Run the probe loop for a single target.
///
/// The measurement is awaited inline, so runs for one target never overlap.
/// The first run starts immediately; later runs start `interval` after the
/// previous start, or as soon as an overrunning run finishes.
async fn run_probe_loop(
    target: TargetSpec,
    runner: Arc<dyn MeasurementRunner>,
    cache: Arc<ResultCache>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let key = target.key();

    let mut interval = tokio::time::interval(target.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {}
        }

        let result = tokio::select! {
            _ = stop_rx.recv() => break,
            result = measure(runner.as_ref(), &target) => result,
        };

        if result.is_success() {
            tracing::debug!("Probe for {} finished in {:?}", key, result.duration);
        } else {
            tracing::warn!(
                "Probe failed for {}: {}",
                key,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }

        cache.update(key.clone(), result).await;
    }

    tracing::debug!("Probe loop for {} stopped", key);
}
