//! Dead and silent workers, and the restart budget.

use std::time::Duration;

use convoy::bus::Category;
use convoy::core::{TaskId, TaskStatus};
use convoy::orchestration::Supervisor;

use crate::fixtures::{script_role, status_of, task, wait_until, TestEnv};

/// Scenario E: a worker that never reports is restarted three times, then
/// its task fails.
#[tokio::test]
async fn test_silent_worker_exhausts_restart_budget() {
    // Given: a worker that records each start and then stays silent
    let mut env = TestEnv::new("");
    let starts = env.scratch_file("starts");
    env.config.roles.insert(
        "default".to_string(),
        script_role(&format!(
            "echo started >> '{}'; exec sleep 30",
            starts.display()
        )),
    );
    env.config.health.unresponsive_timeout_secs = 1;
    env.config.health.poll_interval_ms = 100;
    env.config.health.max_restarts = 3;

    let supervisor = Supervisor::new(env.config.clone()).unwrap();
    let handle = supervisor.handle();
    let alerts = handle.subscribe("observer");
    let run = tokio::spawn(supervisor.run());

    // When: T1 is dispatched and never heard from
    handle.add_task(task("T1", 1, &["a.py"])).await.unwrap();
    let snapshot = wait_until(&handle, Duration::from_secs(30), |s| {
        status_of(s, "T1") == Some(TaskStatus::Failed)
    })
    .await;

    // Then: one initial start plus three restarts, then Failed
    let t1 = snapshot.get(&TaskId::from("T1")).unwrap();
    assert_eq!(t1.failures, 4);
    assert!(t1
        .status_reason
        .as_deref()
        .unwrap_or_default()
        .contains("restart budget of 3 exhausted"));
    let started = std::fs::read_to_string(&starts).unwrap();
    assert_eq!(started.lines().count(), 4);

    // And: the task is terminal
    assert!(handle.retry(TaskId::from("T1")).await.is_err());

    // And: unresponsive alerts preceded the final failure alert
    let mut health_alerts = 0;
    while let Some(message) = alerts.next(Duration::from_millis(100)).await {
        if message.category == Category::HealthAlert {
            health_alerts += 1;
        }
    }
    assert_eq!(health_alerts, 5);

    handle.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_killed_worker_returns_task_to_ready() {
    // Given: a long-running worker and a long backoff so the requeued task
    // stays visible
    let mut env = TestEnv::new("exec sleep 30");
    env.config.health.backoff_base_ms = 60_000;
    env.config.health.backoff_max_ms = 60_000;

    let supervisor = Supervisor::new(env.config.clone()).unwrap();
    let handle = supervisor.handle();
    let run = tokio::spawn(supervisor.run());

    handle.add_task(task("T1", 1, &["a.py"])).await.unwrap();
    let snapshot = wait_until(&handle, Duration::from_secs(10), |s| {
        s.get(&TaskId::from("T1"))
            .map(|t| t.status == TaskStatus::Running && t.worker_pid.is_some())
            .unwrap_or(false)
    })
    .await;
    let pid = snapshot.get(&TaskId::from("T1")).unwrap().worker_pid.unwrap();

    // When: the worker process is killed mid-task
    std::process::Command::new("kill")
        .args(["-KILL", &pid.to_string()])
        .status()
        .unwrap();

    // Then: the task is back to Ready with one failure and no context
    let snapshot = wait_until(&handle, Duration::from_secs(10), |s| {
        status_of(s, "T1") == Some(TaskStatus::Ready)
    })
    .await;
    let t1 = snapshot.get(&TaskId::from("T1")).unwrap();
    assert_eq!(t1.failures, 1);
    assert!(t1.worker_id.is_none());
    assert!(t1.context.is_none());
    assert!(t1.not_before.is_some());
    assert!(t1
        .status_reason
        .as_deref()
        .unwrap_or_default()
        .contains("signal"));

    handle.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failed_report_counts_against_budget() {
    // Given: a worker that always reports failure
    let mut env = TestEnv::new(r#"echo '{"type":"failed","reason":"tests do not pass"}'; exec sleep 30"#);
    env.config.health.max_restarts = 1;

    let supervisor = Supervisor::new(env.config.clone()).unwrap();
    let handle = supervisor.handle();
    let run = tokio::spawn(supervisor.run());

    // When: the task runs
    handle.add_task(task("T1", 1, &["a.py"])).await.unwrap();
    let snapshot = wait_until(&handle, Duration::from_secs(15), |s| {
        status_of(s, "T1") == Some(TaskStatus::Failed)
    })
    .await;

    // Then: one restart, then failed with the worker's reason
    let t1 = snapshot.get(&TaskId::from("T1")).unwrap();
    assert_eq!(t1.failures, 2);
    assert!(t1
        .status_reason
        .as_deref()
        .unwrap_or_default()
        .contains("tests do not pass"));

    handle.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_context_creation_failures_respect_restart_budget() {
    // Given: a worktree directory that cannot be created, and a dependent task
    let mut env = TestEnv::new("true");
    let blocked_dir = env.scratch_file("not-a-directory");
    std::fs::write(&blocked_dir, "occupied").unwrap();
    env.config.worktree_dir = Some(blocked_dir.display().to_string());
    env.config.health.max_restarts = 1;

    let supervisor = Supervisor::new(env.config.clone()).unwrap();
    let handle = supervisor.handle();
    let alerts = handle.subscribe("observer");
    let run = tokio::spawn(supervisor.run());

    // When: T1 can never get a context
    handle
        .add_tasks(vec![
            task("T1", 1, &["a.py"]),
            task("T2", 2, &["b.py"]).with_dependencies(["T1"]),
        ])
        .await
        .unwrap();
    let snapshot = wait_until(&handle, Duration::from_secs(10), |s| {
        status_of(s, "T1") == Some(TaskStatus::Failed)
    })
    .await;

    // Then: it fails after one restart instead of retrying forever
    let t1 = snapshot.get(&TaskId::from("T1")).unwrap();
    assert_eq!(t1.failures, 2);
    assert!(t1.context.is_none());
    let reason = t1.status_reason.as_deref().unwrap_or_default();
    assert!(reason.contains("restart budget of 1 exhausted"), "{}", reason);
    assert!(reason.contains("context creation failed"), "{}", reason);
    assert_eq!(status_of(&snapshot, "T2"), Some(TaskStatus::Blocked));

    // And: the count stays put once it has failed
    tokio::time::sleep(Duration::from_millis(300)).await;
    let later = handle.snapshot().await.unwrap();
    assert_eq!(later.get(&TaskId::from("T1")).unwrap().failures, 2);

    // And: the failure is surfaced as a health alert
    let mut alerted = false;
    while let Some(message) = alerts.next(Duration::from_millis(100)).await {
        if message.category == Category::HealthAlert && message.payload["task"] == "T1" {
            alerted = true;
        }
    }
    assert!(alerted);

    handle.shutdown();
    run.await.unwrap().unwrap();
}
