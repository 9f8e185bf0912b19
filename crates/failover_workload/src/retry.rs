//! Bounded exponential-backoff retry around single write attempts.
//!
//! The controller is an explicit state machine:
//!
//! ```text
//! ATTEMPTING -> SUCCESS
//!            -> RETRYABLE_FAILURE -> BACKOFF -> ATTEMPTING
//!            -> TERMINAL_FAILURE
//! ```
//!
//! [`RetryState`] holds the pure transition logic; [`RetryController::run`]
//! drives it with real attempts, backoff sleeps and per-attempt log lines.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::ErrorClass;
use crate::events::{EventLine, Tag, OPS_TARGET};
use crate::executor::OperationOutcome;
use crate::worker::wait_for_shutdown;

/// Upper bound on a single backoff sleep, unless the base delay is larger.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Attempt budget and backoff schedule for one logical write.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Physical attempts per logical operation; `1` disables retries.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }
}

/// Phase of the retry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    Attempting,
    Backoff,
    Success,
    TerminalFailure,
}

/// What the driver loop must do after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The operation succeeded.
    Done,
    /// Sleep for the given delay, then attempt again.
    Backoff(Duration),
    /// Stop and report the last failure.
    GiveUp,
}

/// Per-operation retry state. Lives for one logical write only.
#[derive(Debug, Clone)]
pub struct RetryState {
    attempt: u32,
    next_backoff: Duration,
    phase: RetryPhase,
}

impl RetryState {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 1,
            next_backoff: policy.base_backoff,
            phase: RetryPhase::Attempting,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_backoff(&self) -> Duration {
        self.next_backoff
    }

    pub fn phase(&self) -> RetryPhase {
        self.phase
    }

    /// Applies the outcome of the current attempt.
    pub fn on_outcome(&mut self, policy: &RetryPolicy, outcome: &OperationOutcome) -> Step {
        debug_assert_eq!(self.phase, RetryPhase::Attempting);
        if outcome.success {
            self.phase = RetryPhase::Success;
            return Step::Done;
        }
        let retryable = outcome
            .error_class()
            .is_some_and(ErrorClass::is_retryable);
        if retryable && self.attempt < policy.max_attempts {
            self.phase = RetryPhase::Backoff;
            Step::Backoff(self.next_backoff)
        } else {
            self.phase = RetryPhase::TerminalFailure;
            Step::GiveUp
        }
    }

    /// Leaves `BACKOFF` for the next attempt and grows the delay.
    pub fn resume(&mut self, policy: &RetryPolicy) {
        debug_assert_eq!(self.phase, RetryPhase::Backoff);
        self.attempt += 1;
        let cap = MAX_BACKOFF.max(policy.base_backoff);
        let scaled = self.next_backoff.as_secs_f64() * policy.multiplier.max(1.0);
        self.next_backoff = Duration::try_from_secs_f64(scaled)
            .unwrap_or(cap)
            .min(cap);
        self.phase = RetryPhase::Attempting;
    }
}

/// Terminal result of one logical operation.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Outcome of the last physical attempt.
    pub outcome: OperationOutcome,
    /// Physical attempts performed.
    pub attempts: u32,
    /// Sum of backoff sleeps taken.
    pub backoff_total: Duration,
}

impl Resolution {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Either a terminal resolution or an abandonment during backoff.
#[derive(Debug, Clone)]
pub enum RetryResult {
    Completed(Resolution),
    /// Shutdown arrived while waiting to retry. Not counted in statistics.
    Cancelled { attempts: u32 },
}

/// Identifies the operation in log lines.
#[derive(Debug, Clone, Copy)]
pub struct AttemptContext<'a> {
    pub worker_id: usize,
    pub target: &'a str,
}

/// Drives [`RetryState`] with real attempts.
#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Runs attempts until success, budget exhaustion or a non-retryable
    /// error. Physical attempts are never interrupted; only backoff sleeps
    /// observe `shutdown`.
    pub async fn run<F, Fut>(
        &self,
        ctx: AttemptContext<'_>,
        shutdown: &mut watch::Receiver<bool>,
        mut attempt: F,
    ) -> RetryResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OperationOutcome>,
    {
        let mut state = RetryState::new(&self.policy);
        let mut backoff_total = Duration::ZERO;
        loop {
            let outcome = attempt().await;
            match state.on_outcome(&self.policy, &outcome) {
                Step::Done => {
                    self.log_success(ctx, &state, &outcome);
                    return RetryResult::Completed(Resolution {
                        outcome,
                        attempts: state.attempt(),
                        backoff_total,
                    });
                }
                Step::Backoff(delay) => {
                    self.log_retry(ctx, &state, &outcome, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wait_for_shutdown(shutdown) => {
                            debug!(
                                target: OPS_TARGET,
                                worker = ctx.worker_id,
                                attempts = state.attempt(),
                                "operation abandoned during backoff"
                            );
                            return RetryResult::Cancelled {
                                attempts: state.attempt(),
                            };
                        }
                    }
                    backoff_total += delay;
                    state.resume(&self.policy);
                }
                Step::GiveUp => {
                    self.log_terminal(ctx, &state, &outcome);
                    return RetryResult::Completed(Resolution {
                        outcome,
                        attempts: state.attempt(),
                        backoff_total,
                    });
                }
            }
        }
    }

    fn log_success(&self, ctx: AttemptContext<'_>, state: &RetryState, outcome: &OperationOutcome) {
        let retries = state.attempt() - 1;
        let suffix = if retries > 0 {
            format!(" (retry {retries})")
        } else {
            String::new()
        };
        let line = EventLine::new(
            Tag::Success,
            format!("Host: {} | INSERT completed{suffix}", outcome.served_by),
        )
        .worker(ctx.worker_id)
        .target(ctx.target)
        .latency(outcome.latency);
        // Retried successes mark the end of an outage and stay visible.
        if retries > 0 {
            info!(target: OPS_TARGET, worker = ctx.worker_id, attempt = state.attempt(), "{line}");
        } else {
            debug!(target: OPS_TARGET, worker = ctx.worker_id, attempt = state.attempt(), "{line}");
        }
    }

    fn log_retry(
        &self,
        ctx: AttemptContext<'_>,
        state: &RetryState,
        outcome: &OperationOutcome,
        delay: Duration,
    ) {
        let (class, message) = describe(outcome);
        let line = EventLine::new(
            Tag::Error,
            format!(
                "{class} | Retry {}/{} in {}ms | Error: {message}",
                state.attempt(),
                self.policy.max_attempts,
                delay.as_millis()
            ),
        )
        .worker(ctx.worker_id)
        .target(ctx.target);
        warn!(target: OPS_TARGET, worker = ctx.worker_id, attempt = state.attempt(), class = %class, "{line}");
    }

    fn log_terminal(&self, ctx: AttemptContext<'_>, state: &RetryState, outcome: &OperationOutcome) {
        let (class, message) = describe(outcome);
        let retries = state.attempt() - 1;
        let suffix = if retries > 0 {
            format!(" (after {retries} retries)")
        } else {
            String::new()
        };
        let line = EventLine::new(Tag::Error, format!("{class} | Error: {message}{suffix}"))
            .worker(ctx.worker_id)
            .target(ctx.target);
        error!(target: OPS_TARGET, worker = ctx.worker_id, attempt = state.attempt(), class = %class, "{line}");
        if class == ErrorClass::ConnectionLost {
            let line = EventLine::new(Tag::Info, "Will retry on next operation...")
                .worker(ctx.worker_id);
            info!(target: OPS_TARGET, worker = ctx.worker_id, "{line}");
        }
    }
}

fn describe(outcome: &OperationOutcome) -> (ErrorClass, String) {
    match &outcome.error {
        Some(err) => (err.class(), err.to_string()),
        None => (ErrorClass::Other, "unknown failure".to_string()),
    }
}
