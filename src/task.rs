//! The per-task state machine.
//!
//! A [`Task`] is one dispatched unit of work: an ordered list of test
//! packages bound for one environment on one worker pool. Its lifecycle is
//! strictly one-way:
//!
//! ```text
//! WAITING ──START──► STARTED ──FINISH──► FINISHED
//! ```
//!
//! Remote workers report the transitions as state-change messages; the
//! distributor applies them here and uses the aggregate to decide when a
//! testrun is complete.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::environment::Environment;

/// Lifecycle states of a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Published, no worker has claimed it yet.
    Waiting,
    /// A worker claimed the task and is executing it.
    Started,
    /// The worker reported completion. Terminal.
    Finished,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Waiting => "WAITING",
            TaskState::Started => "STARTED",
            TaskState::Finished => "FINISHED",
        };
        f.write_str(s)
    }
}

/// Transition conditions accepted by [`Task::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCondition {
    /// A worker claimed the task.
    Start,
    /// The claiming worker completed the task.
    Finish,
}

impl fmt::Display for TaskCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskCondition::Start => "START",
            TaskCondition::Finish => "FINISH",
        };
        f.write_str(s)
    }
}

/// Error raised on an illegal state transition.
///
/// The task's state is unchanged when this is returned.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("illegal transition {condition} from state {state}")]
pub struct TaskStateError {
    /// State the task was in when the transition was attempted.
    pub state: TaskState,
    /// The rejected condition.
    pub condition: TaskCondition,
}

/// One dispatched (packages, environment) unit of work.
///
/// The package list, environment and priority are fixed at construction;
/// only the state advances, and only through [`transition`](Self::transition).
///
/// # Example
///
/// ```
/// use farmout::task::{Task, TaskCondition, TaskState};
///
/// let mut task = Task::new("t1", vec!["sanity-tests".into()], "hardware".into(), 0);
/// assert_eq!(task.state(), TaskState::Waiting);
///
/// task.transition(TaskCondition::Start).unwrap();
/// task.transition(TaskCondition::Finish).unwrap();
/// assert!(task.is_finished());
///
/// // FINISHED is terminal
/// assert!(task.transition(TaskCondition::Finish).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: String,
    packages: Vec<String>,
    environment: Environment,
    priority: u32,
    state: TaskState,
}

impl Task {
    /// Creates a task in the `WAITING` state.
    pub fn new(
        id: impl Into<String>,
        packages: Vec<String>,
        environment: Environment,
        priority: u32,
    ) -> Self {
        Self {
            id: id.into(),
            packages,
            environment,
            priority,
            state: TaskState::Waiting,
        }
    }

    /// The task id, unique within its testrun.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The ordered test packages this task executes.
    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    /// The environment the packages run in.
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// The dispatch priority assigned at creation.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// The current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Returns `true` iff the task reached its terminal state.
    pub fn is_finished(&self) -> bool {
        self.state == TaskState::Finished
    }

    /// Advances the state machine.
    ///
    /// `Start` is legal only from `WAITING`, `Finish` only from `STARTED`.
    ///
    /// # Errors
    ///
    /// [`TaskStateError`] for any other combination; the state is left
    /// unchanged.
    pub fn transition(&mut self, condition: TaskCondition) -> Result<(), TaskStateError> {
        let next = match (self.state, condition) {
            (TaskState::Waiting, TaskCondition::Start) => TaskState::Started,
            (TaskState::Started, TaskCondition::Finish) => TaskState::Finished,
            (state, condition) => return Err(TaskStateError { state, condition }),
        };
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("t1", vec!["pkg-a".into(), "pkg-b".into()], "hardware".into(), 0)
    }

    #[test]
    fn test_happy_path() {
        let mut t = task();
        assert_eq!(t.state(), TaskState::Waiting);
        assert!(!t.is_finished());

        t.transition(TaskCondition::Start).unwrap();
        assert_eq!(t.state(), TaskState::Started);

        t.transition(TaskCondition::Finish).unwrap();
        assert_eq!(t.state(), TaskState::Finished);
        assert!(t.is_finished());
    }

    #[test]
    fn test_finish_before_start_rejected() {
        let mut t = task();
        let err = t.transition(TaskCondition::Finish).unwrap_err();
        assert_eq!(err.state, TaskState::Waiting);
        assert_eq!(err.condition, TaskCondition::Finish);
        assert_eq!(t.state(), TaskState::Waiting);
    }

    #[test]
    fn test_double_start_rejected() {
        let mut t = task();
        t.transition(TaskCondition::Start).unwrap();
        assert!(t.transition(TaskCondition::Start).is_err());
        // State unchanged by the failed transition
        assert_eq!(t.state(), TaskState::Started);
    }

    #[test]
    fn test_finished_is_terminal() {
        let mut t = task();
        t.transition(TaskCondition::Start).unwrap();
        t.transition(TaskCondition::Finish).unwrap();
        assert!(t.transition(TaskCondition::Start).is_err());
        assert!(t.transition(TaskCondition::Finish).is_err());
        assert_eq!(t.state(), TaskState::Finished);
    }

    #[test]
    fn test_immutable_payload() {
        let t = task();
        assert_eq!(t.packages(), ["pkg-a", "pkg-b"]);
        assert_eq!(t.environment().name(), "hardware");
        assert_eq!(t.priority(), 0);
    }
}
