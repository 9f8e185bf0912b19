//! Per-worker detection of serving-node changes.

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{error, info};

use crate::events::{EventLine, Tag, EVENTS_TARGET};
use crate::identity::{NodeIdentity, Role};

/// A worker observed its successful writes move to a different node.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionEvent {
    pub worker_id: usize,
    pub previous: NodeIdentity,
    pub current: NodeIdentity,
    pub timestamp: DateTime<Local>,
}

/// What the tracker concluded from one successful write.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub transition: Option<TransitionEvent>,
    /// The write was served by a node reporting itself read-only.
    pub misrouted: bool,
}

/// Remembers the last node that served this worker. Owned by one worker;
/// never shared.
#[derive(Debug)]
pub struct HostTransitionTracker {
    worker_id: usize,
    last_known: Option<NodeIdentity>,
}

impl HostTransitionTracker {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            last_known: None,
        }
    }

    pub fn last_known(&self) -> Option<&NodeIdentity> {
        self.last_known.as_ref()
    }

    /// Feeds the serving identity of a successful write. Unknown identities
    /// are ignored entirely; the first known identity only seeds the state.
    pub fn observe(&mut self, served_by: &NodeIdentity, target: &str) -> Observation {
        if !served_by.is_known() {
            return Observation::default();
        }

        let mut observation = Observation::default();
        match &self.last_known {
            Some(previous) if previous != served_by => {
                let event = TransitionEvent {
                    worker_id: self.worker_id,
                    previous: previous.clone(),
                    current: served_by.clone(),
                    timestamp: Local::now(),
                };
                let line = EventLine::new(
                    Tag::Info,
                    format!(
                        "Switched to new host: {} (from: {})",
                        event.current, event.previous
                    ),
                )
                .at(event.timestamp)
                .worker(self.worker_id)
                .target(target);
                info!(
                    target: EVENTS_TARGET,
                    worker = self.worker_id,
                    previous = %event.previous,
                    current = %event.current,
                    "{line}"
                );
                observation.transition = Some(event);
            }
            _ => {}
        }
        self.last_known = Some(served_by.clone());

        if served_by.role == Role::Reader {
            let line = misrouted_line(self.worker_id, served_by, target);
            error!(target: EVENTS_TARGET, worker = self.worker_id, host = %served_by, "{line}");
            observation.misrouted = true;
        }
        observation
    }
}

/// A write served by a reader is a routing defect and is reported as an error.
fn misrouted_line(worker_id: usize, served_by: &NodeIdentity, target: &str) -> EventLine {
    EventLine::new(
        Tag::Error,
        format!("Misrouted write: served by {served_by}"),
    )
    .worker(worker_id)
    .target(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(host: &str, read_only: bool) -> NodeIdentity {
        NodeIdentity::from_session(Some(host), read_only)
    }

    #[test]
    fn first_observation_seeds_without_transition() {
        let mut tracker = HostTransitionTracker::new(1);
        let obs = tracker.observe(&node("db-a", false), "test_0001");
        assert!(obs.transition.is_none());
        assert_eq!(tracker.last_known(), Some(&node("db-a", false)));
    }

    #[test]
    fn change_emits_exactly_one_transition() {
        let mut tracker = HostTransitionTracker::new(4);
        tracker.observe(&node("db-a", false), "t");
        tracker.observe(&node("db-a", false), "t");
        let obs = tracker.observe(&node("db-b", false), "t");
        let event = obs.transition.expect("transition");
        assert_eq!(event.worker_id, 4);
        assert_eq!(event.previous, node("db-a", false));
        assert_eq!(event.current, node("db-b", false));
        assert!(tracker.observe(&node("db-b", false), "t").transition.is_none());
    }

    #[test]
    fn unknown_identity_is_ignored() {
        let mut tracker = HostTransitionTracker::new(1);
        tracker.observe(&node("db-a", false), "t");
        let obs = tracker.observe(&NodeIdentity::unknown(), "t");
        assert!(obs.transition.is_none());
        assert_eq!(tracker.last_known(), Some(&node("db-a", false)));
        assert!(tracker.observe(&node("db-a", false), "t").transition.is_none());
    }

    #[test]
    fn reader_role_flags_misrouted_write() {
        let mut tracker = HostTransitionTracker::new(1);
        let obs = tracker.observe(&node("db-r", true), "t");
        assert!(obs.misrouted);
        assert!(obs.transition.is_none());
        // Role changes on the same host are not transitions.
        assert!(tracker.observe(&node("db-r", false), "t").transition.is_none());
    }

    #[test]
    fn misrouted_write_is_tagged_as_error() {
        let line = misrouted_line(3, &node("db-r", true), "test_0042");
        assert_eq!(line.tag, Tag::Error);
        let rendered = line.to_string();
        assert!(
            rendered.ends_with("] ERROR: Worker-3 | Table: test_0042 | Misrouted write: served by db-r (reader)"),
            "{rendered}"
        );
    }
}
