//! Command-line surface and validated runtime configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::pool::PoolConfig;
use crate::postgres::{ConnectionSettings, DEFAULT_IDENTITY_QUERY};
use crate::retry::RetryPolicy;
use crate::stats::DEFAULT_STATS_INTERVAL;
use crate::worker::WorkerConfig;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "failover-workload", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate write load until interrupted.
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Writer endpoint hostname of the database cluster.
    #[arg(long)]
    pub endpoint: String,

    #[arg(long, default_value_t = 5432)]
    pub port: u16,

    #[arg(long, default_value = "lab_db")]
    pub database: String,

    #[arg(long, default_value = "admin")]
    pub username: String,

    /// Database password.
    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Writes go to tables `{table_prefix}0001..={key_space}`.
    #[arg(long, default_value_t = 12_000)]
    pub key_space: u32,

    #[arg(long, default_value = "test_")]
    pub table_prefix: String,

    /// Number of concurrent write workers.
    #[arg(long, default_value_t = 10)]
    pub workers: usize,

    /// Writes per second per worker (0 = as fast as possible).
    #[arg(long, default_value_t = 100)]
    pub rate: u32,

    /// Maximum number of pooled connections.
    #[arg(long, default_value_t = 100)]
    pub pool_size: usize,

    /// Connections opened at startup. Defaults to min(10, pool size).
    #[arg(long)]
    pub min_idle: Option<usize>,

    /// Seconds between STATS lines.
    #[arg(long, default_value_t = DEFAULT_STATS_INTERVAL.as_secs())]
    pub stats_interval: u64,

    /// Physical attempts per logical write (1 disables retries).
    #[arg(long, default_value_t = 5)]
    pub max_retries: u32,

    #[arg(long, default_value = "500ms")]
    pub base_backoff: humantime::Duration,

    #[arg(long, default_value_t = 2.0)]
    pub backoff_multiplier: f64,

    /// Maximum wait for a pooled connection.
    #[arg(long, default_value = "30s")]
    pub acquire_timeout: humantime::Duration,

    #[arg(long, default_value = "10s")]
    pub connect_timeout: humantime::Duration,

    /// Client-side bound on each INSERT and identity query.
    #[arg(long, default_value = "10s")]
    pub statement_timeout: humantime::Duration,

    #[arg(long, default_value = "10m")]
    pub idle_timeout: humantime::Duration,

    #[arg(long, default_value = "30m")]
    pub max_lifetime: humantime::Duration,

    /// Query returning (hostname, read_only) for the serving node.
    #[arg(long, default_value = DEFAULT_IDENTITY_QUERY)]
    pub identity_query: String,

    /// Serve Prometheus metrics on --metrics-addr.
    #[arg(long)]
    pub enable_metrics: bool,

    #[arg(long, default_value = "0.0.0.0:8080")]
    pub metrics_addr: SocketAddr,

    /// Write a JSON run summary (final stats + host transitions) here on exit.
    #[arg(long)]
    pub summary_out: Option<PathBuf>,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

/// Fully validated configuration for one run.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub workers: usize,
    pub worker: WorkerConfig,
    pub pool: PoolConfig,
    pub connection: ConnectionSettings,
    pub stats_interval: Duration,
    /// `Some` when the metrics endpoint is enabled.
    pub metrics_addr: Option<SocketAddr>,
    pub summary_out: Option<PathBuf>,
    pub seed: u64,
}

impl RunArgs {
    /// Validates the options. Errors here are fatal at startup.
    pub fn into_config(self) -> Result<SimulatorConfig> {
        anyhow::ensure!(!self.endpoint.trim().is_empty(), "--endpoint must not be empty");
        anyhow::ensure!(
            self.workers >= 1,
            "minimum 1 write worker required, got {}",
            self.workers
        );
        anyhow::ensure!(self.key_space >= 1, "--key-space must be > 0");
        anyhow::ensure!(self.pool_size >= 1, "--pool-size must be > 0");
        anyhow::ensure!(self.max_retries >= 1, "--max-retries must be >= 1");
        anyhow::ensure!(self.stats_interval >= 1, "--stats-interval must be >= 1");
        anyhow::ensure!(
            self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0,
            "--backoff-multiplier must be >= 1"
        );
        let password = self.password.filter(|p| !p.is_empty()).ok_or_else(|| {
            anyhow::anyhow!(
                "database password not provided; use --password or set DB_PASSWORD"
            )
        })?;

        let min_idle = self
            .min_idle
            .unwrap_or(10)
            .min(self.pool_size);

        Ok(SimulatorConfig {
            workers: self.workers,
            worker: WorkerConfig {
                target_rate: self.rate,
                retry: RetryPolicy {
                    max_attempts: self.max_retries,
                    base_backoff: self.base_backoff.into(),
                    multiplier: self.backoff_multiplier,
                },
                key_space: self.key_space,
                table_prefix: self.table_prefix.clone(),
            },
            pool: PoolConfig {
                max_size: self.pool_size,
                min_idle,
                acquire_timeout: self.acquire_timeout.into(),
                idle_timeout: self.idle_timeout.into(),
                max_lifetime: self.max_lifetime.into(),
            },
            connection: ConnectionSettings {
                host: self.endpoint,
                port: self.port,
                database: self.database,
                username: self.username,
                password,
                connect_timeout: self.connect_timeout.into(),
                statement_timeout: self.statement_timeout.into(),
                table_prefix: self.table_prefix,
                identity_query: self.identity_query,
            },
            stats_interval: Duration::from_secs(self.stats_interval),
            metrics_addr: self.enable_metrics.then_some(self.metrics_addr),
            summary_out: self.summary_out,
            seed: self.seed,
        })
    }
}

impl SimulatorConfig {
    /// Fewer pooled connections than workers causes checkout contention.
    pub fn pool_undersized(&self) -> bool {
        self.pool.max_size < self.workers
    }

    /// Logs the startup banner and the effective configuration.
    pub fn log_banner(&self) {
        let rule = "=".repeat(80);
        info!("{rule}");
        info!("Database Failover Write Workload Generator");
        info!("Version: {}", env!("CARGO_PKG_VERSION"));
        info!("{rule}");
        info!("Configuration:");
        info!(
            "  Endpoint: {}:{}",
            self.connection.host, self.connection.port
        );
        info!("  Database Name: {}", self.connection.database);
        info!("  Write Workers: {}", self.workers);
        info!("  Write Rate: {} writes/sec/worker", self.worker.target_rate);
        info!("  Key Space: {} tables", self.worker.key_space);
        info!("  Connection Pool Size: {}", self.pool.max_size);
        info!(
            "  Retry Policy: {} attempts, {:?} base backoff x{}",
            self.worker.retry.max_attempts,
            self.worker.retry.base_backoff,
            self.worker.retry.multiplier
        );
        info!("  Log Interval: {} seconds", self.stats_interval.as_secs());
        info!("  Metrics Enabled: {}", self.metrics_addr.is_some());
        info!("{rule}");
    }
}
