//! Process-wide success/failure counters and the periodic STATS reporter.
//!
//! Counters are lock-free so workers can update them on every operation.
//! A snapshot reads each counter independently; it may race one in-flight
//! increment but `total` is derived from the other two so it never drifts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::events::{EventLine, Tag, STATS_TARGET};

/// Default reporting interval.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Monotonic counters shared by every worker.
#[derive(Debug, Default)]
pub struct AggregateStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time view of [`AggregateStats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub success_rate_percent: f64,
}

impl AggregateStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one logical operation that ended in success.
    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one logical operation that ended in terminal failure.
    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let success = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let total = success + failed;
        let success_rate_percent = if total > 0 {
            success as f64 * 100.0 / total as f64
        } else {
            0.0
        };
        StatsSnapshot {
            total,
            success,
            failed,
            success_rate_percent,
        }
    }
}

impl StatsSnapshot {
    /// The STATS event line for this snapshot.
    pub fn event_line(&self) -> EventLine {
        EventLine::new(
            Tag::Stats,
            format!(
                "Total: {} | Success: {} | Failed: {} | Success Rate: {:.2}%",
                self.total, self.success, self.failed, self.success_rate_percent
            ),
        )
    }
}

/// Emits one STATS line.
pub fn log_snapshot(snapshot: &StatsSnapshot) {
    let line = snapshot.event_line();
    info!(
        target: STATS_TARGET,
        total = snapshot.total,
        success = snapshot.success,
        failed = snapshot.failed,
        "{line}"
    );
}

/// Emits the framed final statistics block.
pub fn log_final(snapshot: &StatsSnapshot) {
    let rule = "=".repeat(80);
    info!(target: STATS_TARGET, "{rule}");
    info!(target: STATS_TARGET, "FINAL STATISTICS");
    info!(target: STATS_TARGET, "{rule}");
    log_snapshot(snapshot);
    info!(target: STATS_TARGET, "{rule}");
}

/// Logs a snapshot every `interval` until shutdown. Read-only: it never
/// touches worker state beyond the atomic counters.
pub async fn run_reporter(
    stats: Arc<AggregateStats>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + interval,
        interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                log_snapshot(&stats.snapshot());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_has_zero_rate() {
        let stats = AggregateStats::new();
        let snap = stats.snapshot();
        assert_eq!(snap.total, 0);
        assert_eq!(snap.success_rate_percent, 0.0);
    }

    #[test]
    fn total_is_success_plus_failed() {
        let stats = AggregateStats::new();
        for _ in 0..3 {
            stats.record_success();
        }
        stats.record_failure();
        let snap = stats.snapshot();
        assert_eq!(snap.total, 4);
        assert_eq!(snap.success, 3);
        assert_eq!(snap.failed, 1);
        assert!((snap.success_rate_percent - 75.0).abs() < f64::EPSILON);
        assert!(snap
            .event_line()
            .to_string()
            .ends_with("STATS: Total: 4 | Success: 3 | Failed: 1 | Success Rate: 75.00%"));
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let stats = Arc::new(AggregateStats::new());
        let handles = (0..8)
            .map(|i| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        if i % 2 == 0 {
                            stats.record_success();
                        } else {
                            stats.record_failure();
                        }
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("thread");
        }
        let snap = stats.snapshot();
        assert_eq!(snap.total, 8_000);
        assert_eq!(snap.success, 4_000);
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_stops_on_shutdown() {
        let stats = Arc::new(AggregateStats::new());
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run_reporter(stats, Duration::from_secs(1), rx));
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        tx.send(true).expect("send");
        task.await.expect("reporter join");
    }
}
