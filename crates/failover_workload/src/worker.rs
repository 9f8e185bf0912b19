//! Rate-paced worker loop.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::sync::watch;
use tracing::info;

use crate::driver::{Connector, WriteRow};
use crate::error::ErrorClass;
use crate::events::{EventLine, Tag, OPS_TARGET};
use crate::executor::Executor;
use crate::metrics::WorkloadMetrics;
use crate::retry::{AttemptContext, Resolution, RetryController, RetryPolicy, RetryResult};
use crate::stats::AggregateStats;
use crate::tracker::{HostTransitionTracker, TransitionEvent};

/// Immutable per-worker settings shared by every worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Logical writes per second per worker; `0` runs unpaced.
    pub target_rate: u32,
    pub retry: RetryPolicy,
    /// Writes target tables `1..=key_space`.
    pub key_space: u32,
    pub table_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            target_rate: 100,
            retry: RetryPolicy::default(),
            key_space: 12_000,
            table_prefix: "test_".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Delay inserted after each logical operation, if any.
    pub fn cadence(&self) -> Option<Duration> {
        (self.target_rate > 0).then(|| Duration::from_secs(1) / self.target_rate)
    }
}

/// Shared collaborators handed to every worker.
pub struct WorkerDeps<C: Connector> {
    pub executor: Executor<C>,
    pub stats: Arc<AggregateStats>,
    pub metrics: Option<Arc<WorkloadMetrics>>,
}

impl<C: Connector> Clone for WorkerDeps<C> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            stats: self.stats.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// What a worker hands back when it stops.
#[derive(Debug, Clone, Default)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub succeeded: u64,
    pub failed: u64,
    /// Retries spent across all logical operations (observability only).
    pub retries: u64,
    pub misrouted_writes: u64,
    pub transitions: Vec<TransitionEvent>,
}

/// One independent write loop. Owns its RNG, retry state and last-known host.
pub struct Worker<C: Connector> {
    id: usize,
    config: Arc<WorkerConfig>,
    deps: WorkerDeps<C>,
    retry: RetryController,
    tracker: HostTransitionTracker,
    rng: SmallRng,
    report: WorkerReport,
}

impl<C: Connector> Worker<C> {
    pub fn new(id: usize, config: Arc<WorkerConfig>, deps: WorkerDeps<C>, seed: u64) -> Self {
        let retry = RetryController::new(config.retry.clone());
        Self {
            id,
            config,
            deps,
            retry,
            tracker: HostTransitionTracker::new(id),
            rng: SmallRng::seed_from_u64(seed),
            report: WorkerReport {
                worker_id: id,
                ..WorkerReport::default()
            },
        }
    }

    /// Runs logical operations until shutdown. Failures never stop the loop;
    /// a completed operation is always recorded before the loop checks for
    /// shutdown again.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WorkerReport {
        let started = EventLine::new(Tag::Info, "started").worker(self.id);
        info!(target: OPS_TARGET, worker = self.id, "{started}");
        let cadence = self.config.cadence();

        loop {
            if *shutdown.borrow() {
                break;
            }
            let row = WriteRow::random(&mut self.rng, self.config.key_space);
            let target = row.table_name(&self.config.table_prefix);
            let ctx = AttemptContext {
                worker_id: self.id,
                target: &target,
            };
            let executor = &self.deps.executor;
            let row_ref = &row;
            let result = self
                .retry
                .run(ctx, &mut shutdown, move || executor.attempt(row_ref))
                .await;
            match result {
                RetryResult::Completed(resolution) => self.record(resolution, &target),
                RetryResult::Cancelled { .. } => break,
            }

            if let Some(delay) = cadence {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_for_shutdown(&mut shutdown) => break,
                }
            }
        }

        let stopped = EventLine::new(Tag::Info, "stopped").worker(self.id);
        info!(target: OPS_TARGET, worker = self.id, "{stopped}");
        self.report
    }

    fn record(&mut self, resolution: Resolution, target: &str) {
        self.report.retries += u64::from(resolution.retries());
        let outcome = resolution.outcome;
        if outcome.success {
            self.deps.stats.record_success();
            self.report.succeeded += 1;
            if let Some(metrics) = &self.deps.metrics {
                metrics.record_success(outcome.latency);
            }
            let observation = self.tracker.observe(&outcome.served_by, target);
            if observation.misrouted {
                self.report.misrouted_writes += 1;
            }
            if let Some(event) = observation.transition {
                if let Some(metrics) = &self.deps.metrics {
                    metrics.record_transition();
                }
                self.report.transitions.push(event);
            }
        } else {
            self.deps.stats.record_failure();
            self.report.failed += 1;
            if let Some(metrics) = &self.deps.metrics {
                metrics.record_failure(outcome.error_class().unwrap_or(ErrorClass::Other));
            }
        }
    }
}

/// Resolves once the shutdown flag is set or its sender is gone.
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
