//! Core types and data structures for the edgehelm runtime.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;
pub mod task;

pub use error::*;
pub use task::*;

/// Unique identifier for tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for run records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for metrics stream subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub Uuid);

impl StreamId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for StreamId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Monotonically increasing version assigned to each activated policy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PolicyVersion(pub u64);

impl PolicyVersion {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for PolicyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Task lifecycle states.
///
/// Transitions form a total order: `Queued → Admitted → Running` followed by
/// exactly one terminal state, with the shortcut `Queued/Admitted → Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Admitted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self → next` is a legal lifecycle transition.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Queued, Admitted)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Admitted, Running)
                | (Admitted, Cancelled)
                | (Admitted, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Admitted => "admitted",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "admitted" => Ok(Self::Admitted),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// Final outcome recorded on a closed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    /// Cancelled cooperatively, or forcibly after the grace period elapsed.
    Cancelled {
        forced: bool,
    },
    /// The process hosting the scheduler died while the run was open.
    Interrupted,
}

impl RunOutcome {
    /// Stable label used for persistence and aggregation keys.
    pub fn label(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled { forced: false } => "cancelled",
            Self::Cancelled { forced: true } => "cancelled_forced",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled { forced: false }),
            "cancelled_forced" => Some(Self::Cancelled { forced: true }),
            "interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }

    /// The terminal task state implied by this outcome.
    pub fn terminal_state(self) -> TaskState {
        match self {
            Self::Succeeded => TaskState::Completed,
            Self::Failed | Self::Interrupted => TaskState::Failed,
            Self::Cancelled { .. } => TaskState::Cancelled,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [TaskState::Completed, TaskState::Failed, TaskState::Cancelled] {
            for next in [
                TaskState::Queued,
                TaskState::Admitted,
                TaskState::Running,
                TaskState::Completed,
                TaskState::Failed,
                TaskState::Cancelled,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal} must not transition to {next}"
                );
            }
        }
    }

    #[test]
    fn lifecycle_path_is_total() {
        assert!(TaskState::Queued.can_transition_to(TaskState::Admitted));
        assert!(TaskState::Admitted.can_transition_to(TaskState::Running));
        assert!(TaskState::Running.can_transition_to(TaskState::Completed));
        // No skipping Admitted.
        assert!(!TaskState::Queued.can_transition_to(TaskState::Running));
        // Cancel-before-admission shortcut.
        assert!(TaskState::Queued.can_transition_to(TaskState::Cancelled));
    }

    #[test]
    fn outcome_labels_roundtrip() {
        for outcome in [
            RunOutcome::Succeeded,
            RunOutcome::Failed,
            RunOutcome::Cancelled { forced: false },
            RunOutcome::Cancelled { forced: true },
            RunOutcome::Interrupted,
        ] {
            assert_eq!(RunOutcome::from_label(outcome.label()), Some(outcome));
        }
        assert_eq!(RunOutcome::from_label("bogus"), None);
    }
}
