//! Bounded connection pool with scoped leases.
//!
//! The pool is the only structure shared for mutation between workers. A
//! semaphore bounds the number of physical connections (idle + leased); the
//! idle set sits behind a short-lived mutex. A [`PooledConnection`] hands its
//! connection back on drop, so release happens on every exit path including
//! `?` propagation, panics and task cancellation.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::driver::{Connector, WriteConnection};
use crate::error::WorkloadError;

/// Pool sizing and connection lifecycle limits.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of physical connections, idle and leased together.
    pub max_size: usize,
    /// Connections opened eagerly by [`ConnectionPool::warm_up`].
    pub min_idle: usize,
    /// Default wait for a free slot in [`ConnectionPool::acquire`].
    pub acquire_timeout: Duration,
    /// Idle connections unused for longer than this are discarded.
    pub idle_timeout: Duration,
    /// Connections older than this are discarded instead of reused.
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            min_idle: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

struct IdleConnection<T> {
    conn: T,
    created_at: Instant,
    last_used: Instant,
}

struct PoolInner<C: Connector> {
    connector: C,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection<C::Connection>>>,
    closed: AtomicBool,
    opened: AtomicU64,
}

impl<C: Connector> PoolInner<C> {
    fn lock_idle(&self) -> std::sync::MutexGuard<'_, VecDeque<IdleConnection<C::Connection>>> {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expired(&self, created_at: Instant, last_used: Instant, now: Instant) -> bool {
        now.saturating_duration_since(created_at) >= self.config.max_lifetime
            || now.saturating_duration_since(last_used) >= self.config.idle_timeout
    }

    /// Pops the most recently used healthy idle connection.
    fn take_idle(&self) -> Option<IdleConnection<C::Connection>> {
        let now = Instant::now();
        let mut stale = Vec::new();
        let found = {
            let mut idle = self.lock_idle();
            loop {
                match idle.pop_back() {
                    Some(entry)
                        if entry.conn.is_closed()
                            || self.expired(entry.created_at, entry.last_used, now) =>
                    {
                        stale.push(entry);
                    }
                    other => break other,
                }
            }
        };
        if !stale.is_empty() {
            debug!(discarded = stale.len(), "dropped stale idle connections");
        }
        found
    }

    async fn open(&self) -> Result<C::Connection, WorkloadError> {
        let conn = self.connector.connect().await.map_err(|err| match err {
            WorkloadError::ConnectFailed(_) => err,
            other => WorkloadError::ConnectFailed(other.to_string()),
        })?;
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }
}

/// Cloneable handle to a shared connection pool.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        let max_size = config.max_size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                connector,
                config: PoolConfig { max_size, ..config },
                permits: Arc::new(Semaphore::new(max_size)),
                idle: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
                opened: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Opens up to `min_idle` connections ahead of the first checkout.
    /// Failures are logged and otherwise ignored; workers will retry.
    pub async fn warm_up(&self) -> usize {
        let target = self.inner.config.min_idle.min(self.inner.config.max_size);
        let mut opened = 0;
        for _ in 0..target {
            let Ok(permit) = self.inner.permits.clone().try_acquire_owned() else {
                break;
            };
            match self.inner.open().await {
                Ok(conn) => {
                    let now = Instant::now();
                    self.inner.lock_idle().push_back(IdleConnection {
                        conn,
                        created_at: now,
                        last_used: now,
                    });
                    opened += 1;
                }
                Err(err) => {
                    warn!(error = %err, "pool warm-up connection failed");
                    break;
                }
            }
            drop(permit);
        }
        opened
    }

    /// Leases a connection, waiting at most the configured acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConnection<C>, WorkloadError> {
        self.acquire_within(self.inner.config.acquire_timeout).await
    }

    /// Leases a connection, waiting at most `timeout` for a free slot.
    ///
    /// Reuses an idle connection when one is healthy, otherwise opens a new
    /// physical connection in the reserved slot.
    pub async fn acquire_within(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<C>, WorkloadError> {
        if self.is_closed() {
            return Err(WorkloadError::PoolClosed);
        }
        let permit =
            match tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(WorkloadError::PoolClosed),
                Err(_) => return Err(WorkloadError::PoolExhausted(timeout)),
            };

        if let Some(idle) = self.inner.take_idle() {
            return Ok(PooledConnection {
                conn: Some(idle.conn),
                created_at: idle.created_at,
                broken: false,
                pool: self.inner.clone(),
                _permit: permit,
            });
        }

        let conn = self.inner.open().await?;
        Ok(PooledConnection {
            conn: Some(conn),
            created_at: Instant::now(),
            broken: false,
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Stops handing out connections and drops every idle one. Leases still
    /// outstanding are closed when they are released.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.permits.close();
        let drained = std::mem::take(&mut *self.inner.lock_idle());
        debug!(idle = drained.len(), "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock_idle().len()
    }

    /// Number of connections currently leased out.
    pub fn leased_count(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.inner
            .config
            .max_size
            .saturating_sub(self.inner.permits.available_permits())
    }

    /// Total physical connections opened over the pool's lifetime.
    pub fn opened_total(&self) -> u64 {
        self.inner.opened.load(Ordering::Relaxed)
    }
}

/// Exclusive lease on one pooled connection.
pub struct PooledConnection<C: Connector> {
    conn: Option<C::Connection>,
    created_at: Instant,
    broken: bool,
    pool: Arc<PoolInner<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> PooledConnection<C> {
    /// Marks the connection as unusable so it is dropped instead of reused.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection is only taken on drop"),
        }
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection is only taken on drop"),
        }
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let now = Instant::now();
        if self.broken
            || conn.is_closed()
            || self.pool.closed.load(Ordering::SeqCst)
            || self.pool.expired(self.created_at, now, now)
        {
            return;
        }
        self.pool.lock_idle().push_back(IdleConnection {
            conn,
            created_at: self.created_at,
            last_used: now,
        });
        // The permit field drops after this, freeing the slot.
    }
}
