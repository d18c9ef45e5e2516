//! End-to-end scheduler behavior through the public API, with the admission
//! loop running against a fixed metrics source and an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use edgehelm::config::SchedulerConfig;
use edgehelm::metrics::{MetricsGateway, MetricsSnapshot, StaticSource};
use edgehelm::policy::{EnergyWindow, Policy};
use edgehelm::scheduler::{ManualExecutor, TaskScheduler};
use edgehelm::storage::SqliteStore;
use edgehelm::types::{
    ResourceProfile, RunOutcome, TaskConstraints, TaskFilter, TaskState,
};

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

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval: Duration::from_millis(20),
        cancel_grace: Duration::from_millis(200),
        default_policy: "balanced".to_string(),
    }
}

async fn build(cpu_load: f64) -> (Arc<TaskScheduler>, Arc<ManualExecutor>) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let metrics = Arc::new(MetricsGateway::new(Arc::new(StaticSource::new(snapshot(
        cpu_load,
    )))));
    let executor = Arc::new(ManualExecutor::new());
    let scheduler = TaskScheduler::new(fast_config(), store, metrics, executor.clone())
        .await
        .unwrap();
    (scheduler, executor)
}

async fn wait_for_state(
    scheduler: &TaskScheduler,
    task_id: edgehelm::types::TaskId,
    state: TaskState,
) {
    for _ in 0..100 {
        if scheduler.get(task_id).unwrap().state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "task {task_id} never reached {state}, stuck at {}",
        scheduler.get(task_id).unwrap().state
    );
}

#[tokio::test]
async fn loaded_host_admits_small_task_and_holds_large_one() {
    let (scheduler, executor) = build(0.9).await;
    scheduler.start();

    let big = scheduler
        .enqueue(
            "reindex".into(),
            profile(0.8),
            TaskConstraints::default(),
            Some("reindex --all".into()),
        )
        .await
        .unwrap();
    let small = scheduler
        .enqueue(
            "log-rotate".into(),
            profile(0.1),
            TaskConstraints::default(),
            Some("rotate".into()),
        )
        .await
        .unwrap();

    wait_for_state(&scheduler, small, TaskState::Running).await;
    assert_eq!(scheduler.get(big).unwrap().state, TaskState::Queued);
    assert_eq!(executor.launched(), vec![small]);

    executor.complete(small, RunOutcome::Succeeded, None).await;
    wait_for_state(&scheduler, small, TaskState::Completed).await;

    // The big task is still held; the host is loaded regardless of capacity
    // freed by the small one.
    assert_eq!(scheduler.get(big).unwrap().state, TaskState::Queued);

    scheduler.stop().await;

    let stats = scheduler.usage_stats(None, None).await.unwrap();
    assert_eq!(stats.total_runs, 1);
    assert_eq!(stats.by_outcome["succeeded"].runs, 1);
}

#[tokio::test]
async fn policy_switch_admits_previously_held_task() {
    let (scheduler, _executor) = build(0.9).await;
    scheduler.start();

    // 0.9 + 0.3 overruns the balanced headroom of 0.15 but fits within the
    // performance headroom of 0.25.
    let held = scheduler
        .enqueue("build".into(), profile(0.3), TaskConstraints::default(), None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.get(held).unwrap().state, TaskState::Queued);

    scheduler
        .set_policy(Policy::preset("performance").unwrap())
        .await
        .unwrap();

    wait_for_state(&scheduler, held, TaskState::Admitted).await;
    scheduler.stop().await;
}

#[tokio::test]
async fn energy_sensitive_task_waits_for_window() {
    let (scheduler, _executor) = build(0.1).await;

    let now = Utc::now().time();
    let in_one_hour = (Utc::now() + chrono::Duration::hours(1)).time();
    let in_two_hours = (Utc::now() + chrono::Duration::hours(2)).time();

    // Window that has not opened yet: the task must wait.
    let mut closed = Policy::preset("balanced").unwrap();
    closed.energy_windows = vec![EnergyWindow {
        start: in_one_hour,
        end: in_two_hours,
    }];
    scheduler.set_policy(closed).await.unwrap();
    scheduler.start();

    let task = scheduler
        .enqueue(
            "model-sync".into(),
            ResourceProfile {
                energy_sensitive: true,
                ..profile(0.1)
            },
            TaskConstraints::default(),
            None,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.get(task).unwrap().state, TaskState::Queued);

    // A simulate call surfaces the recommended window to the caller.
    let decision = scheduler
        .simulate(&ResourceProfile {
            energy_sensitive: true,
            ..profile(0.1)
        })
        .await
        .unwrap();
    assert!(!decision.admit);
    assert!(decision.recommended_window.is_some());

    // Window covering now: admission proceeds.
    let mut open = Policy::preset("balanced").unwrap();
    open.energy_windows = vec![EnergyWindow {
        start: now,
        end: in_two_hours,
    }];
    scheduler.set_policy(open).await.unwrap();

    wait_for_state(&scheduler, task, TaskState::Admitted).await;
    scheduler.stop().await;
}

#[tokio::test]
async fn cancel_running_command_task_closes_its_run() {
    let (scheduler, executor) = build(0.1).await;
    scheduler.start();

    let task = scheduler
        .enqueue(
            "long-job".into(),
            profile(0.2),
            TaskConstraints::default(),
            Some("work forever".into()),
        )
        .await
        .unwrap();
    wait_for_state(&scheduler, task, TaskState::Running).await;
    assert_eq!(executor.launched(), vec![task]);

    let state = scheduler.cancel(task).await.unwrap();
    assert_eq!(state, TaskState::Cancelled);
    scheduler.stop().await;

    let stats = scheduler.usage_stats(None, None).await.unwrap();
    assert_eq!(stats.by_outcome["cancelled"].runs, 1);
}

#[tokio::test]
async fn advisory_task_full_lifecycle() {
    let (scheduler, _executor) = build(0.1).await;
    scheduler.start();

    let task = scheduler
        .enqueue("report".into(), profile(0.1), TaskConstraints::default(), None)
        .await
        .unwrap();
    wait_for_state(&scheduler, task, TaskState::Admitted).await;

    let run = scheduler.start_run(task).await.unwrap();
    assert_eq!(scheduler.get(task).unwrap().state, TaskState::Running);

    scheduler
        .end_run(run.id, RunOutcome::Failed, Some("upstream timeout".into()))
        .await
        .unwrap();

    let finished = scheduler.get(task).unwrap();
    assert_eq!(finished.state, TaskState::Failed);
    assert_eq!(finished.failure_reason.as_deref(), Some("upstream timeout"));

    scheduler.stop().await;
}

#[tokio::test]
async fn list_reflects_lifecycle_and_filters() {
    let (scheduler, _executor) = build(0.99).await;

    for name in ["one", "two"] {
        scheduler
            .enqueue(name.into(), profile(0.5), TaskConstraints::default(), None)
            .await
            .unwrap();
    }

    let all = scheduler.list(&TaskFilter::default());
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].name, "one");

    let queued = scheduler.list(&TaskFilter {
        state: Some(TaskState::Queued),
        ..Default::default()
    });
    assert_eq!(queued.len(), 2);

    let none = scheduler.list(&TaskFilter {
        state: Some(TaskState::Running),
        ..Default::default()
    });
    assert!(none.is_empty());
}
