//! Composition root: wires pool, workers, reporter and metrics, and owns
//! the shutdown sequence.
//!
//! Shutdown order is fixed: stop workers from starting new operations and
//! wait for them, close the pool, stop the background tasks, then log the
//! final snapshot.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::SimulatorConfig;
use crate::driver::Connector;
use crate::executor::Executor;
use crate::metrics::{serve_metrics, WorkloadMetrics};
use crate::pool::ConnectionPool;
use crate::postgres::PgConnector;
use crate::stats::{log_final, run_reporter, AggregateStats};
use crate::summary::{write_summary, RunSummary};
use crate::worker::{Worker, WorkerDeps};

/// Runs against PostgreSQL until Ctrl-C is received.
pub async fn run(config: SimulatorConfig) -> Result<RunSummary> {
    let connector = PgConnector::new(config.connection.clone());
    run_with_shutdown(config, connector, tokio::signal::ctrl_c()).await
}

/// Runs the workload with an externally supplied connector and shutdown
/// signal.
pub async fn run_with_shutdown<C, F>(
    config: SimulatorConfig,
    connector: C,
    shutdown: F,
) -> Result<RunSummary>
where
    C: Connector,
    F: Future<Output = Result<(), std::io::Error>> + Send,
{
    config.log_banner();
    if config.pool_undersized() {
        warn!(
            pool_size = config.pool.max_size,
            workers = config.workers,
            "Connection pool size ({}) is less than worker count ({}). This may cause connection contention.",
            config.pool.max_size,
            config.workers
        );
    }

    let metrics = match config.metrics_addr {
        Some(_) => Some(Arc::new(
            WorkloadMetrics::new().context("register workload metrics")?,
        )),
        None => None,
    };
    let metrics_listener = match config.metrics_addr {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("bind metrics server {addr}"))?,
        ),
        None => None,
    };

    info!("Initializing connection pool...");
    let pool = ConnectionPool::new(connector, config.pool.clone());
    let warmed = pool.warm_up().await;
    info!(
        warmed,
        max_size = config.pool.max_size,
        "Connection pool initialized"
    );

    let stats = Arc::new(AggregateStats::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics_task = match (metrics.clone(), metrics_listener) {
        (Some(metrics), Some(listener)) => {
            if let Ok(addr) = listener.local_addr() {
                info!(%addr, "metrics server listening");
            }
            Some(tokio::spawn(serve_metrics(
                listener,
                metrics,
                shutdown_rx.clone(),
            )))
        }
        _ => None,
    };
    let reporter_task = tokio::spawn(run_reporter(
        stats.clone(),
        config.stats_interval,
        shutdown_rx.clone(),
    ));

    // Use a random seed when the user provides zero.
    let seed = if config.seed == 0 {
        rand::thread_rng().gen()
    } else {
        config.seed
    };
    let worker_config = Arc::new(config.worker.clone());
    let deps = WorkerDeps {
        executor: Executor::new(pool.clone()),
        stats: stats.clone(),
        metrics,
    };

    info!("Starting {} write workers...", config.workers);
    let mut workers = Vec::with_capacity(config.workers);
    for worker_id in 1..=config.workers {
        // Mix the base seed with the worker id for deterministic per-worker RNG.
        let seed = seed ^ (worker_id as u64).wrapping_mul(0x9e3779b97f4a7c15);
        let worker = Worker::new(worker_id, worker_config.clone(), deps.clone(), seed);
        workers.push(tokio::spawn(worker.run(shutdown_rx.clone())));
    }
    drop(deps);

    let signal = shutdown.await;
    if let Err(err) = &signal {
        error!(error = %err, "shutdown signal failed; stopping");
    }
    info!("Shutting down workload generator...");
    let _ = shutdown_tx.send(true);

    let mut reports = Vec::with_capacity(workers.len());
    for handle in workers {
        match handle.await {
            Ok(report) => reports.push(report),
            Err(err) => error!(error = %err, "worker task failed"),
        }
    }

    pool.close();
    info!(
        opened = pool.opened_total(),
        "Connection pool closed ({} connections opened during run)",
        pool.opened_total()
    );
    let _ = reporter_task.await;
    if let Some(task) = metrics_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "metrics server stopped with error"),
            Err(err) => warn!(error = %err, "metrics server join failed"),
        }
    }

    let final_snapshot = stats.snapshot();
    log_final(&final_snapshot);

    let summary = RunSummary::new(&config, seed, final_snapshot, reports);
    if let Some(path) = &config.summary_out {
        write_summary(path, &summary).context("write run summary")?;
        info!(path = %path.display(), "wrote run summary");
    }
    info!("Workload generator stopped");

    signal.context("wait for shutdown signal")?;
    Ok(summary)
}
