//! Task, run, and usage record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::{RunId, RunOutcome, SchedulerError, TaskId, TaskState};

/// Declared or estimated resource needs of a task, attached at submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    /// Fraction of total CPU capacity the task expects to use (0, 1].
    pub cpu_share: f64,
    /// Expected peak resident memory in MiB.
    pub memory_mb: u64,
    /// Estimated wall-clock duration; must be positive.
    #[serde(with = "humantime_serde")]
    pub est_duration: Duration,
    /// Whether the task prefers low-cost energy windows over immediate start.
    #[serde(default)]
    pub energy_sensitive: bool,
}

impl ResourceProfile {
    /// Validate the profile before any state is touched.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if !self.cpu_share.is_finite() || self.cpu_share <= 0.0 || self.cpu_share > 1.0 {
            return Err(SchedulerError::InvalidProfile {
                reason: format!("cpu_share must be in (0, 1], got {}", self.cpu_share),
            });
        }
        if self.est_duration.is_zero() {
            return Err(SchedulerError::InvalidProfile {
                reason: "est_duration must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Optional run-time bounds on a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConstraints {
    /// Do not start before this instant.
    pub not_before: Option<DateTime<Utc>>,
    /// If not admitted by this instant the task fails with `DeadlineMissed`.
    pub deadline: Option<DateTime<Utc>>,
}

impl TaskConstraints {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if let (Some(not_before), Some(deadline)) = (self.not_before, self.deadline) {
            if not_before > deadline {
                return Err(SchedulerError::InvalidProfile {
                    reason: format!(
                        "not_before ({not_before}) is after deadline ({deadline})"
                    ),
                });
            }
        }
        Ok(())
    }
}

/// A unit of schedulable work. State transitions are owned by the scheduler;
/// tasks are never deleted, only terminalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub profile: ResourceProfile,
    #[serde(default)]
    pub constraints: TaskConstraints,
    /// Command handed to the executor when present; advisory-only otherwise.
    pub command: Option<String>,
    pub state: TaskState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Reason recorded when the task terminalizes as `Failed` or `Cancelled`.
    pub failure_reason: Option<String>,
}

impl Task {
    pub fn new(
        name: String,
        profile: ResourceProfile,
        constraints: TaskConstraints,
        command: Option<String>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            name,
            profile,
            constraints,
            command,
            state: TaskState::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            ended_at: None,
            failure_reason: None,
        }
    }
}

/// Compact task view returned by `scheduler.list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub cpu_share: f64,
    pub energy_sensitive: bool,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            name: task.name.clone(),
            state: task.state,
            cpu_share: task.profile.cpu_share,
            energy_sensitive: task.profile.energy_sensitive,
            submitted_at: task.submitted_at,
            started_at: task.started_at,
            ended_at: task.ended_at,
            failure_reason: task.failure_reason.clone(),
        }
    }
}

/// Filter for `scheduler.list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub submitted_after: Option<DateTime<Utc>>,
    pub submitted_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(state) = self.state {
            if task.state != state {
                return false;
            }
        }
        if let Some(after) = self.submitted_after {
            if task.submitted_at < after {
                return false;
            }
        }
        if let Some(before) = self.submitted_before {
            if task.submitted_at > before {
                return false;
            }
        }
        true
    }
}

/// A record of one execution attempt tied to a task. Append-only: created on
/// start, closed exactly once on end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub task_id: TaskId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
}

impl Run {
    pub fn open(task_id: TaskId) -> Self {
        Self {
            id: RunId::new(),
            task_id,
            started_at: Utc::now(),
            ended_at: None,
            outcome: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Aggregates for one outcome bucket in `usage.stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeStats {
    pub runs: u64,
    pub total_duration_secs: f64,
    pub avg_duration_secs: f64,
}

/// Aggregate run statistics over a time range, keyed by outcome label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStats {
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub total_runs: u64,
    pub by_outcome: HashMap<String, OutcomeStats>,
}
