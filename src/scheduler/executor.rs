//! Task execution backends.
//!
//! The scheduler launches command-bearing tasks through a `TaskExecutor` and
//! learns about natural completion via a shared event channel. Cancellation
//! goes the other way, through the per-task `ExecutionHandle`: cooperative
//! stop first, forced kill once the grace period elapses.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::types::{RunOutcome, SchedulerError, Task, TaskId};

/// Emitted exactly once per launched task when it stops on its own.
/// Cancellation does not produce an event; the canceller records the outcome.
#[derive(Debug)]
pub struct CompletionEvent {
    pub task_id: TaskId,
    pub outcome: RunOutcome,
    pub detail: Option<String>,
}

enum ControlMsg {
    Cancel {
        grace: Duration,
        ack: oneshot::Sender<bool>,
    },
}

/// Control side of one launched task.
pub struct ExecutionHandle {
    control: mpsc::Sender<ControlMsg>,
}

impl ExecutionHandle {
    /// Ask the task to stop, escalating to a kill after `grace`. Returns
    /// whether the stop had to be forced.
    pub async fn cancel(&self, grace: Duration) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .control
            .send(ControlMsg::Cancel {
                grace,
                ack: ack_tx,
            })
            .await
            .is_err()
        {
            // Watcher already gone; the task stopped on its own.
            return false;
        }
        ack_rx.await.unwrap_or(false)
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Start the task's command. The returned handle is the only way to
    /// cancel it; natural completion arrives on `events`.
    async fn launch(
        &self,
        task: &Task,
        events: mpsc::Sender<CompletionEvent>,
    ) -> Result<ExecutionHandle, SchedulerError>;
}

/// Runs commands as host processes with per-task log files.
pub struct ProcessExecutor {
    log_dir: PathBuf,
}

impl ProcessExecutor {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }
}

#[async_trait]
impl TaskExecutor for ProcessExecutor {
    async fn launch(
        &self,
        task: &Task,
        events: mpsc::Sender<CompletionEvent>,
    ) -> Result<ExecutionHandle, SchedulerError> {
        let command = task.command.clone().ok_or_else(|| SchedulerError::LaunchFailed {
            task_id: task.id,
            reason: "task has no command".to_string(),
        })?;
        let launch_err = |reason: String| SchedulerError::LaunchFailed {
            task_id: task.id,
            reason,
        };

        std::fs::create_dir_all(&self.log_dir)
            .map_err(|e| launch_err(format!("create log dir: {e}")))?;
        let log_path = self.log_dir.join(format!("{}.log", task.id));
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| launch_err(format!("open {}: {e}", log_path.display())))?;
        let log_err = log
            .try_clone()
            .map_err(|e| launch_err(format!("clone log handle: {e}")))?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| launch_err(format!("spawn: {e}")))?;

        let task_id = task.id;
        let (control_tx, mut control_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let (outcome, detail) = match status {
                        Ok(status) if status.success() => (RunOutcome::Succeeded, None),
                        Ok(status) => (
                            RunOutcome::Failed,
                            Some(format!("exited with {status}")),
                        ),
                        Err(e) => (RunOutcome::Failed, Some(format!("wait failed: {e}"))),
                    };
                    let _ = events
                        .send(CompletionEvent { task_id, outcome, detail })
                        .await;
                }
                Some(ControlMsg::Cancel { grace, ack }) = control_rx.recv() => {
                    #[cfg(unix)]
                    if let Some(pid) = child.id() {
                        unsafe {
                            libc::kill(pid as i32, libc::SIGTERM);
                        }
                    }
                    let forced = match tokio::time::timeout(grace, child.wait()).await {
                        Ok(_) => false,
                        Err(_) => {
                            let _ = child.kill().await;
                            true
                        }
                    };
                    tracing::debug!(task = %task_id, forced, "process cancelled");
                    let _ = ack.send(forced);
                }
            }
        });

        Ok(ExecutionHandle {
            control: control_tx,
        })
    }
}

/// Executor whose completions are driven by the caller. Used in tests and
/// for dry wiring without touching the host.
#[derive(Default)]
pub struct ManualExecutor {
    launched: Mutex<Vec<TaskId>>,
    senders: DashMap<TaskId, mpsc::Sender<CompletionEvent>>,
}

impl ManualExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Task ids launched so far, in launch order.
    pub fn launched(&self) -> Vec<TaskId> {
        self.launched.lock().clone()
    }

    /// Report a launched task as finished.
    pub async fn complete(&self, task_id: TaskId, outcome: RunOutcome, detail: Option<String>) {
        if let Some(sender) = self.senders.get(&task_id) {
            let _ = sender
                .send(CompletionEvent {
                    task_id,
                    outcome,
                    detail,
                })
                .await;
        }
    }
}

#[async_trait]
impl TaskExecutor for ManualExecutor {
    async fn launch(
        &self,
        task: &Task,
        events: mpsc::Sender<CompletionEvent>,
    ) -> Result<ExecutionHandle, SchedulerError> {
        self.launched.lock().push(task.id);
        self.senders.insert(task.id, events);
        // Cancels ack immediately as cooperative; the control receiver is
        // dropped, so the handle's send fails and reports unforced.
        let (control_tx, _) = mpsc::channel(1);
        Ok(ExecutionHandle {
            control: control_tx,
        })
    }
}
