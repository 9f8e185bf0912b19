//! Scripted in-memory cluster used to drive the workload without a database.

#![allow(dead_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing_subscriber::fmt::MakeWriter;
use failover_workload::pool::PoolConfig;
use failover_workload::postgres::{ConnectionSettings, DEFAULT_IDENTITY_QUERY};
use failover_workload::retry::RetryPolicy;
use failover_workload::{
    Connector, ErrorClass, SessionIdentity, SimulatorConfig, WorkerConfig, WorkloadError,
    WriteConnection, WriteRow,
};

struct PendingFailover {
    after_successes: u64,
    failures_left: u32,
    new_host: String,
}

struct ClusterState {
    host: String,
    read_only: bool,
    successes: u64,
    insert_calls: u64,
    connects: u64,
    open: i64,
    fail_all: Option<ErrorClass>,
    identity_fails: bool,
    failover: Option<PendingFailover>,
}

/// Shared handle to the fake cluster; clones observe the same state.
#[derive(Clone)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn new(host: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                host: host.to_string(),
                read_only: false,
                successes: 0,
                insert_calls: 0,
                connects: 0,
                open: 0,
                fail_all: None,
                identity_fails: false,
                failover: None,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            cluster: self.clone(),
        }
    }

    /// After `after_successes` successful inserts, fail the next `failures`
    /// inserts with `ConnectionLost`, then serve from `new_host`.
    pub fn failover_after(&self, after_successes: u64, failures: u32, new_host: &str) {
        self.lock().failover = Some(PendingFailover {
            after_successes,
            failures_left: failures,
            new_host: new_host.to_string(),
        });
    }

    pub fn fail_all(&self, class: ErrorClass) {
        self.lock().fail_all = Some(class);
    }

    pub fn fail_identity(&self, fail: bool) {
        self.lock().identity_fails = fail;
    }

    pub fn switch_to(&self, host: &str) {
        self.lock().host = host.to_string();
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.lock().read_only = read_only;
    }

    pub fn insert_calls(&self) -> u64 {
        self.lock().insert_calls
    }

    pub fn successes(&self) -> u64 {
        self.lock().successes
    }

    pub fn connects(&self) -> u64 {
        self.lock().connects
    }

    pub fn open_connections(&self) -> i64 {
        self.lock().open
    }
}

pub struct FakeConnector {
    cluster: FakeCluster,
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = FakeConnection;

    async fn connect(&self) -> Result<FakeConnection, WorkloadError> {
        let mut state = self.cluster.lock();
        state.connects += 1;
        state.open += 1;
        Ok(FakeConnection {
            cluster: self.cluster.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

pub struct FakeConnection {
    cluster: FakeCluster,
    closed: AtomicBool,
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.cluster.lock().open -= 1;
    }
}

#[async_trait]
impl WriteConnection for FakeConnection {
    async fn insert(&mut self, _row: &WriteRow) -> Result<u64, WorkloadError> {
        let mut state = self.cluster.lock();
        state.insert_calls += 1;
        if let Some(class) = state.fail_all {
            if class == ErrorClass::ConnectionLost {
                self.closed.store(true, Ordering::SeqCst);
            }
            return Err(WorkloadError::from_class(class, "injected failure"));
        }
        let successes = state.successes;
        let mut switch_to = None;
        if let Some(failover) = state.failover.as_mut() {
            if successes >= failover.after_successes {
                if failover.failures_left > 0 {
                    failover.failures_left -= 1;
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(WorkloadError::ConnectionLost(
                        "server closed the connection unexpectedly".into(),
                    ));
                }
                switch_to = Some(failover.new_host.clone());
            }
        }
        if let Some(host) = switch_to {
            state.host = host;
            state.failover = None;
        }
        state.successes += 1;
        Ok(1)
    }

    async fn session_identity(&mut self) -> Result<SessionIdentity, WorkloadError> {
        let state = self.cluster.lock();
        if state.identity_fails {
            return Err(WorkloadError::IdentityLookupFailed("injected".into()));
        }
        Ok(SessionIdentity {
            hostname: Some(format!("{}.cluster.internal", state.host)),
            read_only: state.read_only,
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Simulator configuration suited to the fake cluster.
pub fn test_config(workers: usize, rate: u32, max_attempts: u32) -> SimulatorConfig {
    SimulatorConfig {
        workers,
        worker: WorkerConfig {
            target_rate: rate,
            retry: RetryPolicy {
                max_attempts,
                base_backoff: Duration::from_millis(500),
                multiplier: 2.0,
            },
            key_space: 100,
            table_prefix: "test_".to_string(),
        },
        pool: PoolConfig {
            max_size: workers.max(1) * 2,
            min_idle: 1,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        },
        connection: ConnectionSettings {
            host: "fake".to_string(),
            port: 5432,
            database: "lab_db".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            connect_timeout: Duration::from_secs(1),
            statement_timeout: Duration::from_secs(1),
            table_prefix: "test_".to_string(),
            identity_query: DEFAULT_IDENTITY_QUERY.to_string(),
        },
        stats_interval: Duration::from_secs(1),
        metrics_addr: None,
        summary_out: None,
        seed: 42,
    }
}

/// Shutdown future firing after `after` on the (possibly paused) tokio clock.
pub async fn shutdown_after(after: Duration) -> Result<(), std::io::Error> {
    tokio::time::sleep(after).await;
    Ok(())
}

pub fn temp_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

/// In-memory sink for formatted log output.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    /// Routes this thread's tracing output into the buffer until the guard drops.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(|p| p.into_inner());
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
