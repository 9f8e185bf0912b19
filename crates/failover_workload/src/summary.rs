//! JSON run summary written on shutdown.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::SimulatorConfig;
use crate::stats::StatsSnapshot;
use crate::tracker::TransitionEvent;
use crate::worker::WorkerReport;

/// Run parameters embedded in the summary for reproducibility.
#[derive(Debug, Clone, Serialize)]
pub struct RunMeta {
    pub endpoint: String,
    pub port: u16,
    pub database: String,
    pub workers: usize,
    pub rate_per_worker: u32,
    pub key_space: u32,
    pub pool_size: usize,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub seed: u64,
}

/// Everything an operator needs to reconstruct a switchover after the fact.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub meta: RunMeta,
    pub stats: StatsSnapshot,
    pub retries: u64,
    pub misrouted_writes: u64,
    /// Transitions from every worker, ordered by timestamp then worker.
    pub transitions: Vec<TransitionEvent>,
}

impl RunSummary {
    pub fn new(
        config: &SimulatorConfig,
        seed: u64,
        stats: StatsSnapshot,
        reports: Vec<WorkerReport>,
    ) -> Self {
        let retries = reports.iter().map(|r| r.retries).sum();
        let misrouted_writes = reports.iter().map(|r| r.misrouted_writes).sum();
        let mut transitions = reports
            .into_iter()
            .flat_map(|r| r.transitions)
            .collect::<Vec<_>>();
        transitions.sort_by_key(|t| (t.timestamp, t.worker_id));

        Self {
            meta: RunMeta {
                endpoint: config.connection.host.clone(),
                port: config.connection.port,
                database: config.connection.database.clone(),
                workers: config.workers,
                rate_per_worker: config.worker.target_rate,
                key_space: config.worker.key_space,
                pool_size: config.pool.max_size,
                max_attempts: config.worker.retry.max_attempts,
                base_backoff_ms: config.worker.retry.base_backoff.as_millis() as u64,
                backoff_multiplier: config.worker.retry.multiplier,
                seed,
            },
            stats,
            retries,
            misrouted_writes,
            transitions,
        }
    }
}

/// Serialize and write the run summary JSON.
pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(summary).context("serialize run summary")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
