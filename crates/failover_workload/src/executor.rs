//! One physical write attempt and its attribution to a serving node.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::driver::{Connector, WriteConnection, WriteRow};
use crate::error::{ErrorClass, WorkloadError};
use crate::identity::NodeIdentity;
use crate::pool::ConnectionPool;

/// Result of a single physical attempt.
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub success: bool,
    /// Time spent in the write call only.
    pub latency: Duration,
    pub served_by: NodeIdentity,
    pub error: Option<WorkloadError>,
}

impl OperationOutcome {
    pub fn succeeded(latency: Duration, served_by: NodeIdentity) -> Self {
        Self {
            success: true,
            latency,
            served_by,
            error: None,
        }
    }

    pub fn failed(latency: Duration, error: WorkloadError) -> Self {
        Self {
            success: false,
            latency,
            served_by: NodeIdentity::unknown(),
            error: Some(error),
        }
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        self.error.as_ref().map(WorkloadError::class)
    }
}

/// Writes `row` on `conn`, then reads the session identity on the same
/// connection. Latency covers the write call alone. An identity lookup
/// failure degrades attribution to `unknown` but keeps the write successful.
pub async fn execute_once<W: WriteConnection + ?Sized>(
    conn: &mut W,
    row: &WriteRow,
) -> OperationOutcome {
    let started = Instant::now();
    let written = conn.insert(row).await;
    let latency = started.elapsed();

    if let Err(err) = written {
        return OperationOutcome::failed(latency, err);
    }

    let served_by = match conn.session_identity().await {
        Ok(session) => NodeIdentity::from(session),
        Err(err) => {
            debug!(error = %err, "identity lookup failed");
            NodeIdentity::unknown()
        }
    };
    OperationOutcome::succeeded(latency, served_by)
}

/// Pool-backed executor: leases a connection per attempt and returns it
/// (or discards it when the attempt broke it) before handing back the outcome.
pub struct Executor<C: Connector> {
    pool: ConnectionPool<C>,
}

impl<C: Connector> Clone for Executor<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<C: Connector> Executor<C> {
    pub fn new(pool: ConnectionPool<C>) -> Self {
        Self { pool }
    }

    /// Acquires a connection and performs one attempt. Pool failures become
    /// failed outcomes with zero latency so the retry controller can classify
    /// them like any other error.
    pub async fn attempt(&self, row: &WriteRow) -> OperationOutcome {
        let mut lease = match self.pool.acquire().await {
            Ok(lease) => lease,
            Err(err) => return OperationOutcome::failed(Duration::ZERO, err),
        };
        let outcome = execute_once(&mut *lease, row).await;
        if outcome
            .error
            .as_ref()
            .is_some_and(WorkloadError::poisons_connection)
        {
            lease.mark_broken();
        }
        outcome
    }
}
