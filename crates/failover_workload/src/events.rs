//! Operator-facing event lines.
//!
//! Every line has the same field order so downtime windows can be computed
//! with grep/awk:
//!
//! `[timestamp] TAG: Worker-N | Table: name | detail | Latency: x.xxms`
//!
//! Fields that do not apply to an event (worker and table for STATS,
//! latency for failures) are omitted, never reordered.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local};

/// Tracing target for per-attempt lines.
pub const OPS_TARGET: &str = "failover_workload::ops";
/// Tracing target for host transitions and misrouted writes.
pub const EVENTS_TARGET: &str = "failover_workload::events";
/// Tracing target for periodic and final statistics.
pub const STATS_TARGET: &str = "failover_workload::stats";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Severity tag of an event line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Success,
    Error,
    Info,
    Stats,
}

impl Tag {
    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Success => "SUCCESS",
            Tag::Error => "ERROR",
            Tag::Info => "INFO",
            Tag::Stats => "STATS",
        }
    }
}

/// One machine-greppable log line.
#[derive(Debug, Clone)]
pub struct EventLine {
    pub timestamp: DateTime<Local>,
    pub tag: Tag,
    pub worker: Option<usize>,
    pub target: Option<String>,
    pub detail: String,
    pub latency: Option<Duration>,
}

impl EventLine {
    pub fn new(tag: Tag, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            tag,
            worker: None,
            target: None,
            detail: detail.into(),
            latency: None,
        }
    }

    pub fn worker(mut self, worker: usize) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Local>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Formats a timestamp the way event lines do.
pub fn format_timestamp(timestamp: &DateTime<Local>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

/// Milliseconds with two decimals.
pub fn format_millis(duration: Duration) -> String {
    format!("{:.2}ms", duration.as_secs_f64() * 1000.0)
}

impl fmt::Display for EventLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}:",
            format_timestamp(&self.timestamp),
            self.tag.as_str()
        )?;
        let mut sep = " ";
        if let Some(worker) = self.worker {
            write!(f, "{sep}Worker-{worker}")?;
            sep = " | ";
        }
        if let Some(target) = &self.target {
            write!(f, "{sep}Table: {target}")?;
            sep = " | ";
        }
        write!(f, "{sep}{}", self.detail)?;
        if let Some(latency) = self.latency {
            write!(f, " | Latency: {}", format_millis(latency))?;
        }
        Ok(())
    }
}
