//! Continuous write workload generator for observing database failovers.
//!
//! Workers issue paced single-row writes through a bounded connection pool,
//! retry connection-level failures with exponential backoff, and attribute
//! every successful write to the node that served it so a switchover can be
//! reconstructed from the log afterwards.

pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod executor;
pub mod identity;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod postgres;
pub mod retry;
pub mod stats;
pub mod summary;
pub mod tracker;
pub mod worker;

pub use config::{Args, Command, RunArgs, SimulatorConfig};
pub use driver::{Connector, WriteConnection, WriteRow};
pub use error::{ErrorClass, WorkloadError};
pub use executor::{execute_once, Executor, OperationOutcome};
pub use identity::{NodeIdentity, Role, SessionIdentity};
pub use orchestrator::{run, run_with_shutdown};
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
pub use postgres::{ConnectionSettings, PgConnector};
pub use retry::{RetryController, RetryPolicy, RetryResult, RetryState};
pub use stats::{AggregateStats, StatsSnapshot};
pub use summary::RunSummary;
pub use tracker::{HostTransitionTracker, TransitionEvent};
pub use worker::{Worker, WorkerConfig, WorkerReport};
