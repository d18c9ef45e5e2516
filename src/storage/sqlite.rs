//! SQLite-backed task store.
//!
//! One connection behind an async mutex, WAL journaling, and a schema
//! version table for forward migrations. Busy/locked errors are retried
//! with bounded backoff before surfacing.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::TaskStore;
use crate::policy::Policy;
use crate::types::{
    OutcomeStats, PolicyVersion, Run, RunId, RunOutcome, StorageError, Task, TaskId, TaskState,
    UsageStats,
};

const SCHEMA_VERSION: i64 = 1;
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(20);

/// SQLite persistence for tasks, runs, and policies.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file, applying pragmas and migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Unavailable(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StorageError::Unavailable(format!("open {}: {e}", path.display())))?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Self::init(conn)
    }

    /// Default on-disk location under the user data directory.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("edgehelm")
            .join("edgehelm.db")
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(sqlite_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(sqlite_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(sqlite_err)?;
        conn.busy_timeout(Duration::from_millis(500))
            .map_err(sqlite_err)?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> Result<(), StorageError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                task_id        TEXT PRIMARY KEY,
                name           TEXT NOT NULL,
                profile        TEXT NOT NULL,
                constraints    TEXT NOT NULL,
                command        TEXT,
                state          TEXT NOT NULL,
                submitted_at   TEXT NOT NULL,
                started_at     TEXT,
                ended_at       TEXT,
                failure_reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);
            CREATE INDEX IF NOT EXISTS idx_tasks_submitted ON tasks(submitted_at);

            CREATE TABLE IF NOT EXISTS runs (
                run_id     TEXT PRIMARY KEY,
                task_id    TEXT NOT NULL REFERENCES tasks(task_id),
                started_at TEXT NOT NULL,
                ended_at   TEXT,
                outcome    TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_runs_task ON runs(task_id);
            CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);
            CREATE INDEX IF NOT EXISTS idx_runs_open ON runs(ended_at) WHERE ended_at IS NULL;

            CREATE TABLE IF NOT EXISTS policies (
                version      INTEGER PRIMARY KEY,
                name         TEXT NOT NULL,
                body         TEXT NOT NULL,
                active       INTEGER NOT NULL DEFAULT 0,
                activated_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(sqlite_err)?;

        let current: Option<i64> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(sqlite_err)?;
        match current {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )
                .map_err(sqlite_err)?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(StorageError::Unavailable(format!(
                    "unsupported schema version {v} (expected {SCHEMA_VERSION})"
                )));
            }
        }
        Ok(())
    }

    /// Run `op` against the connection, retrying busy/locked results with
    /// bounded backoff.
    async fn with_conn<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        F: Fn(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut conn = self.conn.lock().await;
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0;
        loop {
            match op(&mut conn) {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) && attempt < MAX_RETRIES => {
                    attempt += 1;
                    tracing::debug!(attempt, "sqlite busy, backing off {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff *= 4;
                }
                Err(e) => return Err(sqlite_err(e)),
            }
        }
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::DatabaseBusy
                || err.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn sqlite_err(e: rusqlite::Error) -> StorageError {
    StorageError::Sqlite(e.to_string())
}

/// Uniform RFC 3339 UTC rendering so stored timestamps compare
/// lexicographically in chronological order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_opt_ts(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn invalid_text(context: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        context.to_string().into(),
    )
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get("task_id")?;
    let profile_json: String = row.get("profile")?;
    let constraints_json: String = row.get("constraints")?;
    let state: String = row.get("state")?;
    let submitted_at: String = row.get("submitted_at")?;
    Ok(Task {
        id: TaskId::from_str(&id).map_err(|_| invalid_text("task_id"))?,
        name: row.get("name")?,
        profile: serde_json::from_str(&profile_json)
            .map_err(|_| invalid_text("profile"))?,
        constraints: serde_json::from_str(&constraints_json)
            .map_err(|_| invalid_text("constraints"))?,
        command: row.get("command")?,
        state: TaskState::from_str(&state).map_err(|_| invalid_text("state"))?,
        submitted_at: parse_ts(&submitted_at)?,
        started_at: parse_opt_ts(row.get("started_at")?)?,
        ended_at: parse_opt_ts(row.get("ended_at")?)?,
        failure_reason: row.get("failure_reason")?,
    })
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let id: String = row.get("run_id")?;
    let task_id: String = row.get("task_id")?;
    let started_at: String = row.get("started_at")?;
    let outcome: Option<String> = row.get("outcome")?;
    Ok(Run {
        id: RunId::from_str(&id).map_err(|_| invalid_text("run_id"))?,
        task_id: TaskId::from_str(&task_id).map_err(|_| invalid_text("task_id"))?,
        started_at: parse_ts(&started_at)?,
        ended_at: parse_opt_ts(row.get("ended_at")?)?,
        outcome: outcome
            .map(|s| RunOutcome::from_label(&s).ok_or_else(|| invalid_text("outcome")))
            .transpose()?,
    })
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn save_task(&self, task: &Task) -> Result<(), StorageError> {
        let profile = serde_json::to_string(&task.profile)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let constraints = serde_json::to_string(&task.constraints)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let task = task.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO tasks
                    (task_id, name, profile, constraints, command, state,
                     submitted_at, started_at, ended_at, failure_reason)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(task_id) DO UPDATE SET
                    state = excluded.state,
                    started_at = excluded.started_at,
                    ended_at = excluded.ended_at,
                    failure_reason = excluded.failure_reason
                "#,
                params![
                    task.id.to_string(),
                    task.name,
                    profile,
                    constraints,
                    task.command,
                    task.state.to_string(),
                    ts(task.submitted_at),
                    task.started_at.map(ts),
                    task.ended_at.map(ts),
                    task.failure_reason,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_tasks(&self) -> Result<Vec<Task>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, name, profile, constraints, command, state,
                        submitted_at, started_at, ended_at, failure_reason
                 FROM tasks ORDER BY submitted_at ASC",
            )?;
            let rows = stmt.query_map([], row_to_task)?;
            rows.collect()
        })
        .await
    }

    async fn save_run(&self, run: &Run) -> Result<(), StorageError> {
        let run = run.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO runs (run_id, task_id, started_at, ended_at, outcome)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(run_id) DO UPDATE SET
                    ended_at = excluded.ended_at,
                    outcome = excluded.outcome
                "#,
                params![
                    run.id.to_string(),
                    run.task_id.to_string(),
                    ts(run.started_at),
                    run.ended_at.map(ts),
                    run.outcome.map(|o| o.label()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, StorageError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT run_id, task_id, started_at, ended_at, outcome
                 FROM runs WHERE run_id = ?1",
                params![run_id.to_string()],
                row_to_run,
            )
            .optional()
        })
        .await
    }

    async fn load_open_runs(&self) -> Result<Vec<Run>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, task_id, started_at, ended_at, outcome
                 FROM runs WHERE ended_at IS NULL ORDER BY started_at ASC",
            )?;
            let rows = stmt.query_map([], row_to_run)?;
            rows.collect()
        })
        .await
    }

    async fn save_policy(&self, policy: &Policy) -> Result<PolicyVersion, StorageError> {
        let policy = policy.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let current: Option<i64> = tx
                .query_row("SELECT MAX(version) FROM policies", [], |row| row.get(0))
                .optional()?
                .flatten();
            let version = PolicyVersion(current.unwrap_or(0) as u64).next();

            let mut body = policy.clone();
            body.version = version;
            let json = serde_json::to_string(&body).map_err(|e| {
                rusqlite::Error::ToSqlConversionFailure(Box::new(e))
            })?;

            tx.execute("UPDATE policies SET active = 0 WHERE active = 1", [])?;
            tx.execute(
                "INSERT INTO policies (version, name, body, active, activated_at)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                params![version.0 as i64, body.name, json, ts(Utc::now())],
            )?;
            tx.commit()?;
            Ok(version)
        })
        .await
    }

    async fn load_active_policy(&self) -> Result<Option<Policy>, StorageError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT body FROM policies WHERE active = 1 ORDER BY version DESC LIMIT 1",
                [],
                |row| {
                    let body: String = row.get(0)?;
                    serde_json::from_str(&body).map_err(|_| invalid_text("policy body"))
                },
            )
            .optional()
        })
        .await
    }

    async fn usage_stats(
        &self,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<UsageStats, StorageError> {
        // Lexicographic bounds are valid because all stored timestamps share
        // one format; durations are aggregated here rather than in SQL.
        let lo = from.map(ts).unwrap_or_default();
        let hi = until.map(ts).unwrap_or_else(|| "9999".to_string());
        let rows: Vec<(String, f64)> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT outcome, started_at, ended_at FROM runs
                     WHERE ended_at IS NOT NULL
                       AND started_at >= ?1 AND started_at <= ?2",
                )?;
                let mapped = stmt.query_map(params![lo, hi], |row| {
                    let outcome: String = row.get(0)?;
                    let started: String = row.get(1)?;
                    let ended: String = row.get(2)?;
                    let duration = (parse_ts(&ended)? - parse_ts(&started)?)
                        .num_milliseconds() as f64
                        / 1000.0;
                    Ok((outcome, duration.max(0.0)))
                })?;
                mapped.collect()
            })
            .await?;

        let mut stats = UsageStats {
            from,
            until,
            total_runs: 0,
            by_outcome: Default::default(),
        };
        for (outcome, duration) in rows {
            stats.total_runs += 1;
            let bucket = stats.by_outcome.entry(outcome).or_insert_with(OutcomeStats::default);
            bucket.runs += 1;
            bucket.total_duration_secs += duration;
        }
        for bucket in stats.by_outcome.values_mut() {
            bucket.avg_duration_secs = bucket.total_duration_secs / bucket.runs as f64;
        }
        Ok(stats)
    }
}
