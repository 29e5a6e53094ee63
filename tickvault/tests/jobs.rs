//! Job engine semantics: priority, retry, timeout, cancellation, resume.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tickvault::{JobEngine, Scheduler};
use tickvault_mock::{ScriptedTask, TaskStep};
use tickvault_types::{
    CronSchedule, Execution, ExecutionStatus, Priority, SchedulerConfig, TaskReport, TaskType,
};

fn engine() -> Arc<JobEngine> {
    Arc::new(JobEngine::new(SchedulerConfig::default(), None, None, None).unwrap())
}

fn execution(id: &str, task: TaskType, priority: Priority, max_retries: u32) -> Execution {
    Execution::new(
        id,
        None,
        task,
        priority,
        serde_json::Value::Null,
        Duration::from_secs(3600),
        max_retries,
        Utc::now(),
    )
}

async fn wait_terminal(engine: &JobEngine, id: &str) -> ExecutionStatus {
    let mut rx = engine.subscribe_events();
    if let Some(exec) = engine.execution(id)
        && exec.status.is_terminal()
    {
        return exec.status;
    }
    loop {
        let event = rx.recv().await.expect("event stream open");
        if event.id == id && event.status.is_terminal() {
            return event.status;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_until_exhausted() {
    let engine = engine();
    let task = Arc::new(ScriptedTask::new(vec![
        TaskStep::FailTransient("busy"),
        TaskStep::FailTransient("busy"),
        TaskStep::FailTransient("busy"),
    ]));
    engine.register_task(TaskType::GapFill, task.clone());
    let _workers = engine.spawn_workers(1);

    // max_retries = 2: three attempts total, then Failed.
    engine.enqueue(execution("gap-1", TaskType::GapFill, Priority::Normal, 2));
    let status = wait_terminal(&engine, "gap-1").await;

    assert_eq!(status, ExecutionStatus::Failed);
    assert_eq!(task.runs(), 3);
    let exec = engine.execution("gap-1").unwrap();
    assert_eq!(exec.attempt, 2);
    assert!(exec.error.as_deref().unwrap_or_default().contains("busy"));
}

#[tokio::test(start_paused = true)]
async fn transient_failure_then_success_completes() {
    let engine = engine();
    let task = Arc::new(ScriptedTask::new(vec![
        TaskStep::FailTransient("busy"),
        TaskStep::Succeed(TaskReport {
            files_processed: 7,
            ..TaskReport::default()
        }),
    ]));
    engine.register_task(TaskType::Cleanup, task.clone());
    let _workers = engine.spawn_workers(1);

    engine.enqueue(execution("clean-1", TaskType::Cleanup, Priority::Normal, 2));
    let status = wait_terminal(&engine, "clean-1").await;

    assert_eq!(status, ExecutionStatus::Completed);
    assert_eq!(task.runs(), 2);
    assert_eq!(engine.execution("clean-1").unwrap().report.files_processed, 7);
}

#[tokio::test(start_paused = true)]
async fn overrunning_task_times_out() {
    let engine = engine();
    engine.register_task(
        TaskType::Compression,
        Arc::new(ScriptedTask::new(vec![TaskStep::Sleep(Duration::from_secs(
            600,
        ))])),
    );
    let _workers = engine.spawn_workers(1);

    let mut exec = execution("slow-1", TaskType::Compression, Priority::Normal, 0);
    exec.max_duration = Duration::from_secs(1);
    engine.enqueue(exec);

    let status = wait_terminal(&engine, "slow-1").await;
    assert_eq!(status, ExecutionStatus::TimedOut);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_not_retried() {
    let engine = engine();
    let task = Arc::new(ScriptedTask::new(vec![TaskStep::FailPermanent("corrupt")]));
    engine.register_task(TaskType::Repair, task.clone());
    let _workers = engine.spawn_workers(1);

    engine.enqueue(execution("repair-1", TaskType::Repair, Priority::Normal, 5));
    let status = wait_terminal(&engine, "repair-1").await;

    assert_eq!(status, ExecutionStatus::Failed);
    assert_eq!(task.runs(), 1);
}

#[tokio::test(start_paused = true)]
async fn critical_jumps_the_queue() {
    let engine = engine();
    engine.register_task(TaskType::Cleanup, Arc::new(ScriptedTask::new(Vec::new())));
    engine.register_task(TaskType::HealthCheck, Arc::new(ScriptedTask::new(Vec::new())));

    // Enqueue before any worker exists so ordering is purely the queue's.
    engine.enqueue(execution("bg", TaskType::Cleanup, Priority::Background, 0));
    engine.enqueue(execution("crit", TaskType::HealthCheck, Priority::Critical, 0));
    engine.enqueue(execution("norm", TaskType::Cleanup, Priority::Normal, 0));

    let mut rx = engine.subscribe_events();
    let _workers = engine.spawn_workers(1);

    let mut completed = Vec::new();
    while completed.len() < 3 {
        let event = rx.recv().await.unwrap();
        if event.status.is_terminal() {
            completed.push(event.id);
        }
    }
    assert_eq!(completed, vec!["crit", "norm", "bg"]);
}

#[tokio::test(start_paused = true)]
async fn queued_execution_cancels_immediately() {
    let engine = engine();
    // No workers: the execution stays queued.
    engine.enqueue(execution("q-1", TaskType::Cleanup, Priority::Normal, 0));
    engine.cancel("q-1").unwrap();
    assert_eq!(
        engine.execution("q-1").unwrap().status,
        ExecutionStatus::Cancelled
    );

    // A worker arriving later must not resurrect it.
    let _workers = engine.spawn_workers(1);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        engine.execution("q-1").unwrap().status,
        ExecutionStatus::Cancelled
    );
}

#[tokio::test(start_paused = true)]
async fn running_execution_cancels_cooperatively() {
    let engine = engine();
    engine.register_task(
        TaskType::Archival,
        Arc::new(ScriptedTask::new(vec![TaskStep::Sleep(Duration::from_secs(
            3600,
        ))])),
    );
    let _workers = engine.spawn_workers(1);

    engine.enqueue(execution("run-1", TaskType::Archival, Priority::Normal, 0));

    // Wait until it is running, then cancel.
    let mut rx = engine.subscribe_events();
    loop {
        if engine.execution("run-1").map(|e| e.status) == Some(ExecutionStatus::Running) {
            break;
        }
        let _ = rx.recv().await;
    }
    engine.cancel("run-1").unwrap();

    let status = wait_terminal(&engine, "run-1").await;
    assert_eq!(status, ExecutionStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn full_maintenance_runs_registered_steps_and_warns_on_missing() {
    let engine = engine();
    let cleanup = Arc::new(ScriptedTask::new(vec![TaskStep::Succeed(TaskReport {
        files_processed: 3,
        ..TaskReport::default()
    })]));
    engine.register_task(TaskType::Cleanup, cleanup.clone());
    let _workers = engine.spawn_workers(1);

    engine.enqueue(execution(
        "full-1",
        TaskType::FullMaintenance,
        Priority::Low,
        0,
    ));
    let status = wait_terminal(&engine, "full-1").await;

    // Unregistered steps become warnings, not failures.
    assert_eq!(status, ExecutionStatus::CompletedWithWarnings);
    assert_eq!(cleanup.runs(), 1);
    let exec = engine.execution("full-1").unwrap();
    assert_eq!(exec.report.files_processed, 3);
    assert!(
        exec.report
            .warnings
            .iter()
            .any(|w| w.contains("no task registered"))
    );
}

#[tokio::test(start_paused = true)]
async fn duplicate_enqueue_is_ignored() {
    let engine = engine();
    engine.register_task(TaskType::Cleanup, Arc::new(ScriptedTask::new(Vec::new())));
    engine.enqueue(execution("dup-1", TaskType::Cleanup, Priority::Normal, 0));
    engine.enqueue(execution("dup-1", TaskType::Cleanup, Priority::Normal, 0));
    assert_eq!(engine.history().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn interrupted_executions_resume_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let history = dir.path().join("executions.json");

    {
        let engine =
            Arc::new(JobEngine::new(SchedulerConfig::default(), Some(history.clone()), None, None).unwrap());
        // Enqueued but never run: persists as pending.
        engine.enqueue(execution("resume-1", TaskType::Cleanup, Priority::Normal, 0));
    }

    let engine = Arc::new(
        JobEngine::new(SchedulerConfig::default(), Some(history), None, None).unwrap(),
    );
    let task = Arc::new(ScriptedTask::new(Vec::new()));
    engine.register_task(TaskType::Cleanup, task.clone());
    let _workers = engine.spawn_workers(1);

    let status = wait_terminal(&engine, "resume-1").await;
    assert_eq!(status, ExecutionStatus::Completed);
    assert_eq!(task.runs(), 1);
}

#[tokio::test(start_paused = true)]
async fn scheduler_fires_due_schedules_into_the_engine() {
    let engine = engine();
    let scheduler = Arc::new(Scheduler::new(engine.clone(), None).unwrap());

    let stored = scheduler
        .upsert(CronSchedule::new(
            "nightly",
            "Nightly cleanup",
            "0 3 * * *",
            "America/New_York",
            TaskType::Cleanup,
        ))
        .unwrap();
    let next = stored.next_execution_at.expect("enabled schedule has next");
    assert!(next > Utc::now());

    // Drive the timer logic directly one minute past the fire time.
    scheduler.fire_due(next + chrono::Duration::minutes(1));

    let history = engine.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].task_type, TaskType::Cleanup);
    assert_eq!(history[0].schedule_id.as_deref(), Some("nightly"));

    let after = scheduler.get("nightly").unwrap();
    assert_eq!(after.execution_count, 1);
    assert!(after.next_execution_at.unwrap() > next);
}

#[tokio::test(start_paused = true)]
async fn scheduler_rejects_bad_cron_and_zone() {
    let engine = engine();
    let scheduler = Arc::new(Scheduler::new(engine, None).unwrap());

    let bad_cron = CronSchedule::new("x", "x", "61 * * * *", "UTC", TaskType::Cleanup);
    assert!(scheduler.upsert(bad_cron).is_err());

    let bad_zone = CronSchedule::new("y", "y", "0 3 * * *", "Mars/Olympus", TaskType::Cleanup);
    assert!(scheduler.upsert(bad_zone).is_err());

    assert!(scheduler.list().is_empty());
}

#[tokio::test(start_paused = true)]
async fn disabled_schedules_do_not_fire() {
    let engine = engine();
    let scheduler = Arc::new(Scheduler::new(engine.clone(), None).unwrap());

    let mut schedule = CronSchedule::new("off", "Off", "* * * * *", "UTC", TaskType::Cleanup);
    schedule.enabled = false;
    let stored = scheduler.upsert(schedule).unwrap();
    assert!(stored.next_execution_at.is_none());

    scheduler.fire_due(Utc::now() + chrono::Duration::days(1));
    assert!(engine.history().is_empty());
}
