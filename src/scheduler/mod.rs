//! Task scheduler: admission control, lifecycle transitions, and run
//! bookkeeping.
//!
//! All task state lives in an in-memory registry backed by the store; every
//! transition is validated against the lifecycle state machine and persisted
//! before the call returns. Admission decisions are made by the pure policy
//! evaluator against a metrics snapshot, one policy version per pass.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::metrics::MetricsGateway;
use crate::policy::{Decision, Policy};
use crate::storage::TaskStore;
use crate::types::{
    PolicyVersion, ResourceProfile, Run, RunId, RunOutcome, RuntimeError, SchedulerError, Task,
    TaskConstraints, TaskFilter, TaskId, TaskState, TaskSummary, UsageStats,
};

pub mod executor;
pub mod queue;

pub use executor::{CompletionEvent, ExecutionHandle, ManualExecutor, ProcessExecutor, TaskExecutor};
use queue::TaskQueue;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Stable terminal reason recorded when a deadline expires before admission.
pub const DEADLINE_MISSED: &str = "deadline_missed";

pub struct TaskScheduler {
    config: SchedulerConfig,
    store: Arc<dyn TaskStore>,
    metrics: Arc<MetricsGateway>,
    executor: Arc<dyn TaskExecutor>,
    tasks: DashMap<TaskId, Task>,
    queue: parking_lot::Mutex<TaskQueue>,
    /// Open runs and the task → run index for the single active run per task.
    open_runs: DashMap<RunId, Run>,
    run_by_task: DashMap<TaskId, RunId>,
    handles: DashMap<TaskId, ExecutionHandle>,
    policy: ArcSwap<Policy>,
    events_tx: mpsc::Sender<CompletionEvent>,
    events_rx: parking_lot::Mutex<Option<mpsc::Receiver<CompletionEvent>>>,
    queue_changed: Notify,
    shutdown: Notify,
    loop_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Build a scheduler over the given store, recovering any state left by
    /// a previous process. Does not start the admission loop; see [`start`].
    ///
    /// [`start`]: TaskScheduler::start
    pub async fn new(
        config: SchedulerConfig,
        store: Arc<dyn TaskStore>,
        metrics: Arc<MetricsGateway>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<Arc<Self>, RuntimeError> {
        let policy = match store.load_active_policy().await? {
            Some(policy) => policy,
            None => {
                let mut policy = Policy::preset(&config.default_policy)?;
                policy.version = store.save_policy(&policy).await?;
                tracing::info!(policy = %policy.name, "activated default policy");
                policy
            }
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let scheduler = Arc::new(Self {
            config,
            store,
            metrics,
            executor,
            tasks: DashMap::new(),
            queue: parking_lot::Mutex::new(TaskQueue::new()),
            open_runs: DashMap::new(),
            run_by_task: DashMap::new(),
            handles: DashMap::new(),
            policy: ArcSwap::from_pointee(policy),
            events_tx,
            events_rx: parking_lot::Mutex::new(Some(events_rx)),
            queue_changed: Notify::new(),
            shutdown: Notify::new(),
            loop_handle: parking_lot::Mutex::new(None),
        });
        scheduler.recover().await?;
        Ok(scheduler)
    }

    /// Reload persisted state. Queued tasks are re-queued; tasks that were
    /// admitted or running when the previous process died are failed and
    /// their open runs closed as interrupted.
    async fn recover(&self) -> Result<(), RuntimeError> {
        for mut run in self.store.load_open_runs().await? {
            run.ended_at = Some(Utc::now());
            run.outcome = Some(RunOutcome::Interrupted);
            self.store.save_run(&run).await?;
            tracing::warn!(run = %run.id, task = %run.task_id, "closed run interrupted by restart");
        }

        let mut requeued = 0usize;
        let mut interrupted = 0usize;
        for mut task in self.store.load_tasks().await? {
            match task.state {
                TaskState::Queued => {
                    self.queue.lock().push(task.id);
                    requeued += 1;
                }
                TaskState::Admitted | TaskState::Running => {
                    task.state = TaskState::Failed;
                    task.ended_at = Some(Utc::now());
                    task.failure_reason = Some("interrupted by restart".to_string());
                    self.store.save_task(&task).await?;
                    interrupted += 1;
                }
                _ => {}
            }
            self.tasks.insert(task.id, task);
        }
        if requeued > 0 || interrupted > 0 {
            tracing::info!(requeued, interrupted, "recovered persisted tasks");
        }
        Ok(())
    }

    /// Spawn the admission loop. Idempotent; the second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(mut events_rx) = self.events_rx.lock().take() else {
            return;
        };
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(scheduler.config.tick_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => scheduler.admission_pass().await,
                    _ = scheduler.queue_changed.notified() => scheduler.admission_pass().await,
                    Some(event) = events_rx.recv() => scheduler.handle_completion(event).await,
                    _ = scheduler.shutdown.notified() => break,
                }
            }
            tracing::info!("scheduler loop stopped");
        });
        *self.loop_handle.lock() = Some(handle);
    }

    /// Stop the admission loop. In-flight processes keep running; their
    /// state is reconciled as interrupted on the next start.
    pub async fn stop(&self) {
        self.shutdown.notify_one();
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Submit a task. Validation failures leave no trace.
    pub async fn enqueue(
        &self,
        name: String,
        profile: ResourceProfile,
        constraints: TaskConstraints,
        command: Option<String>,
    ) -> Result<TaskId, SchedulerError> {
        profile.validate()?;
        constraints.validate()?;
        if let Some(deadline) = constraints.deadline {
            if deadline <= Utc::now() {
                return Err(SchedulerError::InvalidProfile {
                    reason: format!("deadline {deadline} is already in the past"),
                });
            }
        }

        let task = Task::new(name, profile, constraints, command);
        let id = task.id;
        self.store.save_task(&task).await?;
        self.tasks.insert(id, task);
        self.queue.lock().push(id);
        self.queue_changed.notify_one();
        tracing::info!(task = %id, "task enqueued");
        Ok(id)
    }

    /// Tasks matching the filter, oldest first.
    pub fn list(&self, filter: &TaskFilter) -> Vec<TaskSummary> {
        let mut summaries: Vec<TaskSummary> = self
            .tasks
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| TaskSummary::from(entry.value()))
            .collect();
        summaries.sort_by_key(|s| s.submitted_at);
        summaries
    }

    pub fn get(&self, task_id: TaskId) -> Result<Task, SchedulerError> {
        self.tasks
            .get(&task_id)
            .map(|entry| entry.clone())
            .ok_or(SchedulerError::TaskNotFound { task_id })
    }

    /// Cancel a task in any non-terminal state. The lifecycle transition is
    /// the decision point: whichever of cancel, admission, and completion
    /// terminalizes the task first wins, and the losers clean up their own
    /// registrations. A running task's process gets the configured grace
    /// period before a forced stop.
    pub async fn cancel(&self, task_id: TaskId) -> Result<TaskState, SchedulerError> {
        self.queue.lock().remove(task_id);
        let task = self
            .apply_transition(task_id, TaskState::Cancelled, Some("cancelled"))
            .await?;

        // Reap whatever execution state exists by now. A concurrent admission
        // still installing its handle and run compensates for them itself
        // once it observes the lost transition.
        let forced = match self.handles.remove(&task_id) {
            Some((_, handle)) => handle.cancel(self.config.cancel_grace).await,
            None => false,
        };
        self.close_run_for(task_id, RunOutcome::Cancelled { forced })
            .await;
        tracing::info!(task = %task_id, forced, "task cancelled");
        Ok(task.state)
    }

    /// Activate a new policy. The version is assigned by the store; every
    /// admission decision after this returns sees the new version.
    pub async fn set_policy(&self, mut policy: Policy) -> Result<PolicyVersion, SchedulerError> {
        policy.validate()?;
        let version = self.store.save_policy(&policy).await?;
        policy.version = version;
        tracing::info!(policy = %policy.name, version = %version, "policy activated");
        self.policy.store(Arc::new(policy));
        self.queue_changed.notify_one();
        Ok(version)
    }

    pub fn active_policy(&self) -> Arc<Policy> {
        self.policy.load_full()
    }

    /// Evaluate a profile against the active policy and a fresh snapshot
    /// without touching any task state.
    pub async fn simulate(&self, profile: &ResourceProfile) -> Result<Decision, SchedulerError> {
        profile.validate()?;
        let snapshot = self.metrics.snapshot().await?;
        let policy = self.policy.load_full();
        Ok(crate::policy::evaluate(&policy, &snapshot, profile, Utc::now()))
    }

    /// Open a run for an advisory task (work executed by the caller, not by
    /// this process). A queued task is admitted and started in one step.
    pub async fn start_run(&self, task_id: TaskId) -> Result<Run, SchedulerError> {
        if self.run_by_task.contains_key(&task_id) {
            return Err(SchedulerError::AlreadyRunning { task_id });
        }
        let state = self.get(task_id)?.state;
        match state {
            s if s.is_terminal() => {
                return Err(SchedulerError::AlreadyTerminal { task_id, state: s })
            }
            TaskState::Running => return Err(SchedulerError::AlreadyRunning { task_id }),
            TaskState::Queued => {
                self.queue.lock().remove(task_id);
                self.apply_transition(task_id, TaskState::Admitted, None)
                    .await?;
                self.apply_transition(task_id, TaskState::Running, None)
                    .await?;
            }
            TaskState::Admitted => {
                self.apply_transition(task_id, TaskState::Running, None)
                    .await?;
            }
            _ => unreachable!("terminal states handled above"),
        }

        let run = Run::open(task_id);
        self.store.save_run(&run).await?;
        self.open_runs.insert(run.id, run.clone());
        self.run_by_task.insert(task_id, run.id);
        tracing::info!(task = %task_id, run = %run.id, "run started");
        Ok(run)
    }

    /// Close an open run and terminalize its task according to the outcome.
    pub async fn end_run(
        &self,
        run_id: RunId,
        outcome: RunOutcome,
        detail: Option<String>,
    ) -> Result<Run, SchedulerError> {
        let Some((_, mut run)) = self.open_runs.remove(&run_id) else {
            // Closed runs are immutable; distinguish them from unknown ids.
            return match self.store.get_run(run_id).await? {
                Some(closed) => {
                    let state = self
                        .tasks
                        .get(&closed.task_id)
                        .map(|t| t.state)
                        .unwrap_or(TaskState::Failed);
                    Err(SchedulerError::AlreadyTerminal {
                        task_id: closed.task_id,
                        state,
                    })
                }
                None => Err(SchedulerError::RunNotFound { run_id }),
            };
        };
        self.run_by_task.remove(&run.task_id);

        run.ended_at = Some(Utc::now());
        run.outcome = Some(outcome);
        self.store.save_run(&run).await?;

        let reason = match outcome {
            RunOutcome::Failed => Some(detail.unwrap_or_else(|| "run failed".to_string())),
            RunOutcome::Cancelled { .. } => Some(detail.unwrap_or_else(|| "cancelled".to_string())),
            RunOutcome::Interrupted => Some("interrupted".to_string()),
            RunOutcome::Succeeded => None,
        };
        if let Err(e) = self
            .apply_transition(run.task_id, outcome.terminal_state(), reason.as_deref())
            .await
        {
            tracing::warn!(task = %run.task_id, "run closed but task transition failed: {e}");
        }
        self.queue_changed.notify_one();
        tracing::info!(run = %run.id, outcome = %outcome, "run ended");
        Ok(run)
    }

    pub async fn usage_stats(
        &self,
        from: Option<chrono::DateTime<Utc>>,
        until: Option<chrono::DateTime<Utc>>,
    ) -> Result<UsageStats, SchedulerError> {
        Ok(self.store.usage_stats(from, until).await?)
    }

    /// One admission sweep: fail expired deadlines, then walk the queue in
    /// arrival order admitting what the policy allows. Admissions within a
    /// pass account for each other's projected CPU demand.
    async fn admission_pass(&self) {
        let now = Utc::now();

        // Snapshot the queue before walking it; the lock must not be held
        // across the transition awaits below.
        let queued = self.queue.lock().snapshot();
        for task_id in queued {
            let expired = self
                .tasks
                .get(&task_id)
                .and_then(|t| t.constraints.deadline)
                .is_some_and(|deadline| deadline < now);
            if expired {
                self.queue.lock().remove(task_id);
                if let Err(e) = self
                    .apply_transition(task_id, TaskState::Failed, Some(DEADLINE_MISSED))
                    .await
                {
                    tracing::warn!(task = %task_id, "deadline sweep failed: {e}");
                }
            }
        }

        let policy = self.policy.load_full();
        let snapshot = match self.metrics.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("skipping admission pass, no snapshot: {e}");
                return;
            }
        };

        let mut occupied = self
            .tasks
            .iter()
            .filter(|t| matches!(t.state, TaskState::Admitted | TaskState::Running))
            .count();
        let mut projected = (*snapshot).clone();

        let candidates = self.queue.lock().snapshot();
        for task_id in candidates {
            if occupied >= policy.max_concurrent {
                break;
            }
            let task = match self.tasks.get(&task_id) {
                Some(entry) => entry.clone(),
                None => {
                    self.queue.lock().remove(task_id);
                    continue;
                }
            };
            if task.state != TaskState::Queued {
                self.queue.lock().remove(task_id);
                continue;
            }
            if task
                .constraints
                .not_before
                .is_some_and(|not_before| not_before > now)
            {
                continue;
            }

            let decision = crate::policy::evaluate(&policy, &projected, &task.profile, now);
            if !decision.admit {
                tracing::debug!(
                    task = %task_id,
                    version = %decision.policy_version,
                    reasons = ?decision.reasons,
                    window = ?decision.recommended_window,
                    "admission deferred"
                );
                continue;
            }
            match self.admit(task).await {
                Ok(()) => {
                    occupied += 1;
                    projected.cpu_load += self
                        .tasks
                        .get(&task_id)
                        .map(|t| t.profile.cpu_share)
                        .unwrap_or(0.0);
                }
                Err(e) => tracing::warn!(task = %task_id, "admission failed: {e}"),
            }
        }
    }

    /// Admit one queued task. Command tasks are launched immediately;
    /// advisory tasks wait in `Admitted` for the caller to start their run.
    async fn admit(&self, task: Task) -> Result<(), SchedulerError> {
        self.queue.lock().remove(task.id);
        let task = self
            .apply_transition(task.id, TaskState::Admitted, None)
            .await?;
        tracing::info!(task = %task.id, "task admitted");

        if task.command.is_none() {
            return Ok(());
        }

        let handle = match self.executor.launch(&task, self.events_tx.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                let reason = e.to_string();
                self.apply_transition(task.id, TaskState::Failed, Some(reason.as_str()))
                    .await?;
                return Err(e);
            }
        };

        // A cancel may have terminalized the task while the launch was in
        // flight; the spawned process must not outlive that decision.
        if let Err(e) = self
            .apply_transition(task.id, TaskState::Running, None)
            .await
        {
            handle.cancel(self.config.cancel_grace).await;
            tracing::debug!(task = %task.id, "launch abandoned: {e}");
            return Err(e);
        }

        let run = Run::open(task.id);
        self.store.save_run(&run).await?;
        self.open_runs.insert(run.id, run.clone());
        self.run_by_task.insert(task.id, run.id);
        self.handles.insert(task.id, handle);

        // A cancel landing between the transition and the registrations
        // above could not see them; reap on its behalf.
        let terminal = self
            .get(task.id)
            .map(|t| t.state.is_terminal())
            .unwrap_or(true);
        if terminal {
            if let Some((_, handle)) = self.handles.remove(&task.id) {
                let forced = handle.cancel(self.config.cancel_grace).await;
                self.close_run_for(task.id, RunOutcome::Cancelled { forced })
                    .await;
            }
        }
        Ok(())
    }

    /// React to a natural completion reported by the executor.
    async fn handle_completion(&self, event: CompletionEvent) {
        self.handles.remove(&event.task_id);
        if !self.close_run_for(event.task_id, event.outcome).await {
            // Cancelled concurrently; the canceller already closed the run.
            tracing::debug!(task = %event.task_id, "completion for task with no open run");
            return;
        }

        let reason = match event.outcome {
            RunOutcome::Succeeded => None,
            _ => Some(
                event
                    .detail
                    .unwrap_or_else(|| event.outcome.label().to_string()),
            ),
        };
        if let Err(e) = self
            .apply_transition(event.task_id, event.outcome.terminal_state(), reason.as_deref())
            .await
        {
            tracing::warn!(task = %event.task_id, "completion transition failed: {e}");
        }
        self.queue_changed.notify_one();
    }

    /// Close the task's open run with the given outcome, if one exists.
    async fn close_run_for(&self, task_id: TaskId, outcome: RunOutcome) -> bool {
        let Some((_, run_id)) = self.run_by_task.remove(&task_id) else {
            return false;
        };
        let Some((_, mut run)) = self.open_runs.remove(&run_id) else {
            return false;
        };
        run.ended_at = Some(Utc::now());
        run.outcome = Some(outcome);
        if let Err(e) = self.store.save_run(&run).await {
            tracing::warn!(run = %run.id, "failed to persist closed run: {e}");
        }
        true
    }

    /// Validate and apply one state transition, then persist. The in-memory
    /// registry is authoritative; persistence happens outside the entry lock.
    async fn apply_transition(
        &self,
        task_id: TaskId,
        to: TaskState,
        reason: Option<&str>,
    ) -> Result<Task, SchedulerError> {
        let updated = {
            let mut entry = self
                .tasks
                .get_mut(&task_id)
                .ok_or(SchedulerError::TaskNotFound { task_id })?;
            let from = entry.state;
            if from.is_terminal() {
                return Err(SchedulerError::AlreadyTerminal {
                    task_id,
                    state: from,
                });
            }
            if !from.can_transition_to(to) {
                return Err(SchedulerError::InvalidStateTransition { task_id, from, to });
            }
            entry.state = to;
            let now = Utc::now();
            if to == TaskState::Running && entry.started_at.is_none() {
                entry.started_at = Some(now);
            }
            if to.is_terminal() {
                entry.ended_at = Some(now);
                if entry.failure_reason.is_none() {
                    entry.failure_reason = reason.map(str::to_string);
                }
            }
            entry.clone()
        };
        self.store.save_task(&updated).await?;
        tracing::debug!(task = %task_id, state = %updated.state, "state transition");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::metrics::{MetricsSnapshot, StaticSource};
    use crate::storage::SqliteStore;
    use std::time::Duration;

    fn snapshot(cpu_load: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            taken_at: Utc::now(),
            cpu_load,
            mem_used_bytes: 8 * 1024 * 1024 * 1024,
            mem_total_bytes: 32 * 1024 * 1024 * 1024,
            power: None,
            processes: Vec::new(),
        }
    }

    fn profile(cpu_share: f64) -> ResourceProfile {
        ResourceProfile {
            cpu_share,
            memory_mb: 128,
            est_duration: Duration::from_secs(30),
            energy_sensitive: false,
        }
    }

    async fn scheduler_with(
        cpu_load: f64,
        executor: Arc<dyn TaskExecutor>,
    ) -> Arc<TaskScheduler> {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let metrics = Arc::new(MetricsGateway::new(Arc::new(StaticSource::new(snapshot(
            cpu_load,
        )))));
        TaskScheduler::new(SchedulerConfig::default(), store, metrics, executor)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_profile() {
        let scheduler = scheduler_with(0.1, Arc::new(ManualExecutor::new())).await;
        let result = scheduler
            .enqueue(
                "bad".into(),
                profile(2.0),
                TaskConstraints::default(),
                None,
            )
            .await;
        assert!(matches!(result, Err(SchedulerError::InvalidProfile { .. })));
        assert!(scheduler.list(&TaskFilter::default()).is_empty());
    }

    #[tokio::test]
    async fn admission_skips_oversized_task_but_admits_small_one() {
        // Load 0.9 with 0.15 headroom: a 0.8 share overruns, 0.1 fits.
        let scheduler = scheduler_with(0.9, Arc::new(ManualExecutor::new())).await;
        let big = scheduler
            .enqueue("big".into(), profile(0.8), TaskConstraints::default(), None)
            .await
            .unwrap();
        let small = scheduler
            .enqueue("small".into(), profile(0.1), TaskConstraints::default(), None)
            .await
            .unwrap();

        scheduler.admission_pass().await;

        assert_eq!(scheduler.get(big).unwrap().state, TaskState::Queued);
        assert_eq!(scheduler.get(small).unwrap().state, TaskState::Admitted);
    }

    #[tokio::test]
    async fn admissions_in_one_pass_account_for_each_other() {
        // Two 0.4-share tasks at 0.5 load: the first fits, the second would
        // push projected demand past the headroom and must wait.
        let scheduler = scheduler_with(0.5, Arc::new(ManualExecutor::new())).await;
        let first = scheduler
            .enqueue("a".into(), profile(0.4), TaskConstraints::default(), None)
            .await
            .unwrap();
        let second = scheduler
            .enqueue("b".into(), profile(0.4), TaskConstraints::default(), None)
            .await
            .unwrap();

        scheduler.admission_pass().await;

        assert_eq!(scheduler.get(first).unwrap().state, TaskState::Admitted);
        assert_eq!(scheduler.get(second).unwrap().state, TaskState::Queued);
    }

    #[tokio::test]
    async fn advisory_lifecycle_through_runs() {
        let scheduler = scheduler_with(0.1, Arc::new(ManualExecutor::new())).await;
        let id = scheduler
            .enqueue("advisory".into(), profile(0.2), TaskConstraints::default(), None)
            .await
            .unwrap();

        let run = scheduler.start_run(id).await.unwrap();
        assert_eq!(scheduler.get(id).unwrap().state, TaskState::Running);

        // A second run on the same task is refused while one is open.
        assert!(matches!(
            scheduler.start_run(id).await,
            Err(SchedulerError::AlreadyRunning { .. })
        ));

        scheduler
            .end_run(run.id, RunOutcome::Succeeded, None)
            .await
            .unwrap();
        assert_eq!(scheduler.get(id).unwrap().state, TaskState::Completed);

        // Closing twice is refused.
        assert!(matches!(
            scheduler.end_run(run.id, RunOutcome::Succeeded, None).await,
            Err(SchedulerError::AlreadyTerminal { .. })
        ));

        let stats = scheduler.usage_stats(None, None).await.unwrap();
        assert_eq!(stats.total_runs, 1);
        assert_eq!(stats.by_outcome["succeeded"].runs, 1);
    }

    #[tokio::test]
    async fn cancel_queued_task() {
        let scheduler = scheduler_with(0.1, Arc::new(ManualExecutor::new())).await;
        let id = scheduler
            .enqueue("queued".into(), profile(0.2), TaskConstraints::default(), None)
            .await
            .unwrap();

        let state = scheduler.cancel(id).await.unwrap();
        assert_eq!(state, TaskState::Cancelled);
        assert!(matches!(
            scheduler.cancel(id).await,
            Err(SchedulerError::AlreadyTerminal { .. })
        ));
    }

    #[tokio::test]
    async fn command_task_runs_and_completes() {
        let executor = Arc::new(ManualExecutor::new());
        let scheduler = scheduler_with(0.1, executor.clone()).await;
        let id = scheduler
            .enqueue(
                "cmd".into(),
                profile(0.2),
                TaskConstraints::default(),
                Some("work".into()),
            )
            .await
            .unwrap();

        scheduler.admission_pass().await;
        assert_eq!(scheduler.get(id).unwrap().state, TaskState::Running);
        assert_eq!(executor.launched(), vec![id]);

        scheduler.start();
        executor
            .complete(id, RunOutcome::Failed, Some("exited with 2".into()))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop().await;

        let task = scheduler.get(id).unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.failure_reason.as_deref(), Some("exited with 2"));

        let stats = scheduler.usage_stats(None, None).await.unwrap();
        assert_eq!(stats.by_outcome["failed"].runs, 1);
    }

    /// Executor that parks inside `launch` until released, so a test can
    /// land a cancel in the middle of an admission.
    struct PausingExecutor {
        inner: ManualExecutor,
        entered: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl TaskExecutor for PausingExecutor {
        async fn launch(
            &self,
            task: &Task,
            events: mpsc::Sender<CompletionEvent>,
        ) -> Result<ExecutionHandle, SchedulerError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.launch(task, events).await
        }
    }

    #[tokio::test]
    async fn cancel_during_launch_leaves_no_run_or_handle_behind() {
        let executor = Arc::new(PausingExecutor {
            inner: ManualExecutor::new(),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let scheduler = scheduler_with(0.1, executor.clone()).await;
        let id = scheduler
            .enqueue(
                "racy".into(),
                profile(0.2),
                TaskConstraints::default(),
                Some("work".into()),
            )
            .await
            .unwrap();

        let pass = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.admission_pass().await })
        };
        executor.entered.notified().await;

        // The launch is in flight; the cancel must win the transition and
        // the admission must not leave a run or handle for a dead task.
        let state = scheduler.cancel(id).await.unwrap();
        assert_eq!(state, TaskState::Cancelled);

        executor.release.notify_one();
        pass.await.unwrap();

        assert_eq!(scheduler.get(id).unwrap().state, TaskState::Cancelled);
        assert!(scheduler.handles.is_empty());
        assert!(scheduler.open_runs.is_empty());
        assert!(scheduler.store.load_open_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn simulate_leaves_queue_tasks_and_store_untouched() {
        let scheduler = scheduler_with(0.9, Arc::new(ManualExecutor::new())).await;
        for name in ["one", "two"] {
            scheduler
                .enqueue(name.into(), profile(0.8), TaskConstraints::default(), None)
                .await
                .unwrap();
        }
        let queued_before = scheduler.queue.lock().snapshot();
        let states_before: Vec<_> = scheduler
            .list(&TaskFilter::default())
            .iter()
            .map(|s| s.state)
            .collect();
        let stored_before = scheduler.store.load_tasks().await.unwrap().len();

        let rejected = scheduler.simulate(&profile(0.8)).await.unwrap();
        assert!(!rejected.admit);
        let admitted = scheduler.simulate(&profile(0.05)).await.unwrap();
        assert!(admitted.admit);

        assert_eq!(scheduler.queue.lock().snapshot(), queued_before);
        let states_after: Vec<_> = scheduler
            .list(&TaskFilter::default())
            .iter()
            .map(|s| s.state)
            .collect();
        assert_eq!(states_after, states_before);
        assert_eq!(
            scheduler.store.load_tasks().await.unwrap().len(),
            stored_before
        );
        assert!(scheduler.open_runs.is_empty());
    }

    #[tokio::test]
    async fn deadline_missed_fails_queued_task() {
        let scheduler = scheduler_with(0.99, Arc::new(ManualExecutor::new())).await;
        let id = scheduler
            .enqueue(
                "urgent".into(),
                profile(0.5),
                TaskConstraints {
                    not_before: None,
                    deadline: Some(Utc::now() + chrono::Duration::milliseconds(20)),
                },
                None,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.admission_pass().await;

        let task = scheduler.get(id).unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.failure_reason.as_deref(), Some(DEADLINE_MISSED));
    }

    #[tokio::test]
    async fn not_before_holds_task_in_queue() {
        let scheduler = scheduler_with(0.1, Arc::new(ManualExecutor::new())).await;
        let id = scheduler
            .enqueue(
                "later".into(),
                profile(0.1),
                TaskConstraints {
                    not_before: Some(Utc::now() + chrono::Duration::hours(1)),
                    deadline: None,
                },
                None,
            )
            .await
            .unwrap();

        scheduler.admission_pass().await;
        assert_eq!(scheduler.get(id).unwrap().state, TaskState::Queued);
    }

    #[tokio::test]
    async fn max_concurrent_caps_admissions() {
        let scheduler = scheduler_with(0.0, Arc::new(ManualExecutor::new())).await;
        let mut policy = Policy::preset("balanced").unwrap();
        policy.max_concurrent = 1;
        scheduler.set_policy(policy).await.unwrap();

        for name in ["one", "two", "three"] {
            scheduler
                .enqueue(name.into(), profile(0.05), TaskConstraints::default(), None)
                .await
                .unwrap();
        }
        scheduler.admission_pass().await;

        let admitted = scheduler
            .list(&TaskFilter {
                state: Some(TaskState::Admitted),
                ..Default::default()
            })
            .len();
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn policy_set_bumps_version_and_applies() {
        let scheduler = scheduler_with(0.9, Arc::new(ManualExecutor::new())).await;
        let initial = scheduler.active_policy();
        assert_eq!(initial.name, "balanced");

        let v = scheduler
            .set_policy(Policy::preset("performance").unwrap())
            .await
            .unwrap();
        assert!(v > initial.version);
        assert_eq!(scheduler.active_policy().name, "performance");

        // 0.9 load + 0.3 share fits inside the performance headroom of 0.25.
        let decision = scheduler.simulate(&profile(0.3)).await.unwrap();
        assert!(decision.admit);
        assert_eq!(decision.policy_version, v);
    }

    #[tokio::test]
    async fn restart_recovers_queue_and_interrupts_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sched.db");
        let queued_id;
        let running_id;
        {
            let store = Arc::new(SqliteStore::open(&path).unwrap());
            let metrics = Arc::new(MetricsGateway::new(Arc::new(StaticSource::new(
                snapshot(0.1),
            ))));
            let scheduler = TaskScheduler::new(
                SchedulerConfig::default(),
                store,
                metrics,
                Arc::new(ManualExecutor::new()),
            )
            .await
            .unwrap();

            queued_id = scheduler
                .enqueue("queued".into(), profile(0.9), TaskConstraints::default(), None)
                .await
                .unwrap();
            running_id = scheduler
                .enqueue("running".into(), profile(0.1), TaskConstraints::default(), None)
                .await
                .unwrap();
            scheduler.start_run(running_id).await.unwrap();
            // Dropped without ending the run, as if the process died.
        }

        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let metrics = Arc::new(MetricsGateway::new(Arc::new(StaticSource::new(snapshot(
            0.1,
        )))));
        let scheduler = TaskScheduler::new(
            SchedulerConfig::default(),
            store.clone(),
            metrics,
            Arc::new(ManualExecutor::new()),
        )
        .await
        .unwrap();

        assert_eq!(scheduler.get(queued_id).unwrap().state, TaskState::Queued);
        let interrupted = scheduler.get(running_id).unwrap();
        assert_eq!(interrupted.state, TaskState::Failed);
        assert_eq!(
            interrupted.failure_reason.as_deref(),
            Some("interrupted by restart")
        );
        assert!(store.load_open_runs().await.unwrap().is_empty());

        let stats = scheduler.usage_stats(None, None).await.unwrap();
        assert_eq!(stats.by_outcome["interrupted"].runs, 1);
    }
}
