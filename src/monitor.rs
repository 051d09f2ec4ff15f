//! Monitor telemetry events.
//!
//! Every component can emit a [`MonitorEvent`]: a timestamped record of
//! something that happened during a testrun (a task was dispatched, a worker
//! claimed it, a results document arrived, ...). Events stream back over the
//! broker alongside results and are forwarded to the monitor sink when the
//! testrun ends.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of occurrence a monitor event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorKind {
    /// A testrun was accepted for orchestration.
    TestrunRequested,
    /// A task was published to a worker queue.
    TaskDispatched,
    /// A worker claimed a task.
    TaskStarted,
    /// A worker reported a task complete.
    TaskFinished,
    /// A results document arrived.
    ResultsReceived,
    /// A worker streamed an error report.
    WorkerError,
    /// The testrun reached its terminal status.
    TestrunEnded,
}

impl fmt::Display for MonitorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MonitorKind::TestrunRequested => "testrun_requested",
            MonitorKind::TaskDispatched => "task_dispatched",
            MonitorKind::TaskStarted => "task_started",
            MonitorKind::TaskFinished => "task_finished",
            MonitorKind::ResultsReceived => "results_received",
            MonitorKind::WorkerError => "worker_error",
            MonitorKind::TestrunEnded => "testrun_ended",
        };
        f.write_str(s)
    }
}

/// A timestamped telemetry event.
///
/// `emitted` is stamped at construction and never mutated. `received` is
/// stamped at most once, by the consuming side, via
/// [`mark_received`](Self::mark_received); a second call is a no-op.
///
/// # Example
///
/// ```
/// use farmout::monitor::{MonitorEvent, MonitorKind};
///
/// let mut event = MonitorEvent::new(MonitorKind::TaskStarted, "worker-3", "claimed task t1");
/// assert!(event.received().is_none());
///
/// event.mark_received();
/// let first = event.received();
/// event.mark_received();
/// assert_eq!(event.received(), first);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEvent {
    kind: MonitorKind,
    sender: String,
    description: String,
    emitted: DateTime<Utc>,
    received: Option<DateTime<Utc>>,
}

impl MonitorEvent {
    /// Creates an event stamped with the current time.
    pub fn new(
        kind: MonitorKind,
        sender: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            sender: sender.into(),
            description: description.into(),
            emitted: Utc::now(),
            received: None,
        }
    }

    /// The kind of occurrence recorded.
    pub fn kind(&self) -> MonitorKind {
        self.kind
    }

    /// The component that emitted the event.
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Human-readable detail.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// When the event was emitted.
    pub fn emitted(&self) -> DateTime<Utc> {
        self.emitted
    }

    /// When the event was received, if it has been.
    pub fn received(&self) -> Option<DateTime<Utc>> {
        self.received
    }

    /// Stamps the receive time. Only the first call has an effect.
    pub fn mark_received(&mut self) {
        if self.received.is_none() {
            self.received = Some(Utc::now());
        }
    }
}

impl fmt::Display for MonitorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.sender, self.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitted_set_at_construction() {
        let before = Utc::now();
        let event = MonitorEvent::new(MonitorKind::TaskDispatched, "distributor", "t1");
        let after = Utc::now();

        assert!(event.emitted() >= before && event.emitted() <= after);
        assert!(event.received().is_none());
    }

    #[test]
    fn test_received_set_at_most_once() {
        let mut event = MonitorEvent::new(MonitorKind::ResultsReceived, "distributor", "doc");
        event.mark_received();
        let first = event.received().expect("stamped");

        event.mark_received();
        assert_eq!(event.received(), Some(first));
    }
}
