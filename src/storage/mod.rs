//! Durable storage for tasks, runs, and policies.
//!
//! Everything the scheduler holds in memory is re-derivable from this store
//! on startup; no scheduling state exists only in memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::policy::Policy;
use crate::types::{PolicyVersion, Run, RunId, StorageError, Task, UsageStats};

pub mod sqlite;

pub use sqlite::SqliteStore;

/// Abstract transactional record store for scheduler state.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a task (insert or update by id).
    async fn save_task(&self, task: &Task) -> Result<(), StorageError>;

    /// Load every task, in submission order.
    async fn load_tasks(&self) -> Result<Vec<Task>, StorageError>;

    /// Persist a run record (insert or update by id).
    async fn save_run(&self, run: &Run) -> Result<(), StorageError>;

    /// Retrieve one run by id.
    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, StorageError>;

    /// Runs with no recorded end, i.e. left open by a crash or still active.
    async fn load_open_runs(&self) -> Result<Vec<Run>, StorageError>;

    /// Atomically activate a policy: deactivates the previous version and
    /// stores the new one under the next version number. Returns the
    /// assigned version.
    async fn save_policy(&self, policy: &Policy) -> Result<PolicyVersion, StorageError>;

    /// The currently active policy, if one has ever been set.
    async fn load_active_policy(&self) -> Result<Option<Policy>, StorageError>;

    /// Aggregate closed-run statistics by outcome over a time range on
    /// `started_at`.
    async fn usage_stats(
        &self,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<UsageStats, StorageError>;
}
