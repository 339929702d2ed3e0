//! Full supervisor runs, from task submission to a merged baseline.

use std::time::Duration;

use convoy::bus::Category;
use convoy::core::{Task, TaskId, TaskStatus};
use convoy::orchestration::{Inbox, InboxRequest, Supervisor};
use convoy::TaskLedger;

use crate::fixtures::{script_role, status_of, task, wait_until, TestEnv};

/// Each task writes `<id>.txt`. T4 first checks that T1's file is already
/// in its context.
const WRITER: &str = r#"if [ "$CONVOY_TASK_ID" = T4 ]; then test -f T1.txt || exit 9; fi
echo "$CONVOY_TASK_ID" > "$CONVOY_TASK_ID.txt"
echo '{"type":"progress","message":"written"}'
echo '{"type":"completed","summary":"wrote file"}'"#;

fn writer(id: &str, priority: u32, deps: &[&str]) -> Task {
    let resource = format!("{}.txt", id);
    task(id, priority, &[resource.as_str()]).with_dependencies(deps.iter().copied())
}

#[tokio::test]
async fn test_independent_and_dependent_tasks_reach_baseline() {
    // Given: T1 and T2 independent, T4 depending on T1
    let env = TestEnv::new(WRITER);
    let supervisor = Supervisor::new(env.config.clone()).unwrap();
    let handle = supervisor.handle();
    let run = tokio::spawn(supervisor.run());

    // When: all three are added at once
    handle
        .add_tasks(vec![
            writer("T1", 1, &[]),
            writer("T2", 2, &[]),
            writer("T4", 1, &["T1"]),
        ])
        .await
        .unwrap();
    let snapshot = wait_until(&handle, Duration::from_secs(20), |s| s.is_settled()).await;

    // Then: every task is done and every file is on the baseline
    for id in ["T1", "T2", "T4"] {
        assert_eq!(status_of(&snapshot, id), Some(TaskStatus::Done), "{}", id);
        assert_eq!(
            env.baseline_file(&format!("{}.txt", id)),
            Some(format!("{}\n", id))
        );
    }
    let t4 = snapshot.get(&TaskId::from("T4")).unwrap();
    assert_eq!(t4.failures, 0);
    assert!(t4.status_reason.as_deref().unwrap_or_default().starts_with("merged as"));

    handle.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_observer_sees_every_transition() {
    let env = TestEnv::new(WRITER);
    let supervisor = Supervisor::new(env.config.clone()).unwrap();
    let handle = supervisor.handle();
    let events = handle.subscribe("observer");
    let run = tokio::spawn(supervisor.run());

    handle.add_task(writer("T1", 1, &[])).await.unwrap();
    wait_until(&handle, Duration::from_secs(10), |s| {
        status_of(s, "T1") == Some(TaskStatus::Done)
    })
    .await;

    let mut path = Vec::new();
    while let Some(message) = events.next(Duration::from_millis(100)).await {
        assert_eq!(message.category, Category::StatusChange);
        assert_eq!(message.payload["task"], "T1");
        path.push(message.payload["to"].as_str().unwrap().to_string());
    }
    assert_eq!(
        path,
        vec!["spec_ready", "ready", "running", "awaiting_merge", "done"]
    );

    handle.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_inbox_requests_are_applied() {
    // Given: a running supervisor and a slow worker
    let env = TestEnv::new("exec sleep 30");
    let supervisor = Supervisor::new(env.config.clone()).unwrap();
    let handle = supervisor.handle();
    let run = tokio::spawn(supervisor.run());

    // When: another process submits tasks through the inbox
    Inbox::submit(
        &env.state_dir(),
        &InboxRequest::AddTasks {
            tasks: vec![task("T1", 1, &["a.py"]), task("T2", 2, &["b.py"])],
        },
    )
    .unwrap();

    // Then: they are added and dispatched
    wait_until(&handle, Duration::from_secs(10), |s| {
        status_of(s, "T1") == Some(TaskStatus::Running)
            && status_of(s, "T2") == Some(TaskStatus::Running)
    })
    .await;

    // When: T1 is cancelled through the inbox
    Inbox::submit(
        &env.state_dir(),
        &InboxRequest::Cancel {
            task: TaskId::from("T1"),
            requeue: false,
        },
    )
    .unwrap();
    let snapshot = wait_until(&handle, Duration::from_secs(10), |s| {
        status_of(s, "T1") == Some(TaskStatus::Failed)
    })
    .await;

    // Then: T1 is failed as cancelled, its work discarded
    let t1 = snapshot.get(&TaskId::from("T1")).unwrap();
    assert_eq!(t1.status_reason.as_deref(), Some("cancelled"));
    assert!(t1.context.is_none());
    assert_eq!(env.baseline_file("a.py"), None);
    assert!(env.state_dir().join("inbox").read_dir().unwrap().next().is_none());

    handle.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_task_without_ownership_runs_alone() {
    // Given: a worker that leaves a marker while it runs, and one task of
    // unknown ownership next to one with declared resources
    let env = TestEnv::new("");
    let marker = env.scratch_file("markers");
    let mut config = env.config.clone();
    config.roles.insert(
        "default".to_string(),
        script_role(&format!(
            r#"echo "start $CONVOY_TASK_ID" >> '{m}'; sleep 0.5; echo "end $CONVOY_TASK_ID" >> '{m}'; echo '{{"type":"completed"}}'"#,
            m = marker.display()
        )),
    );
    let supervisor = Supervisor::new(config).unwrap();
    let handle = supervisor.handle();
    let run = tokio::spawn(supervisor.run());

    // When: both are added
    handle
        .add_tasks(vec![Task::new("T1", "unknown", 1), task("T2", 2, &["b.py"])])
        .await
        .unwrap();
    wait_until(&handle, Duration::from_secs(15), |s| s.is_settled()).await;

    // Then: their runs never interleave
    let log = std::fs::read_to_string(&marker).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 4);
    for pair in lines.chunks(2) {
        let id = pair[0].trim_start_matches("start ");
        assert_eq!(pair[1], format!("end {}", id));
    }

    handle.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_status_is_readable_while_running() {
    let env = TestEnv::new("exec sleep 30");
    let supervisor = Supervisor::new(env.config.clone()).unwrap();
    let handle = supervisor.handle();
    let run = tokio::spawn(supervisor.run());
    handle.add_task(task("T1", 1, &["a.py"])).await.unwrap();
    wait_until(&handle, Duration::from_secs(10), |s| {
        status_of(s, "T1") == Some(TaskStatus::Running)
    })
    .await;

    let snapshot = TaskLedger::inspect(&env.state_dir()).unwrap();
    assert_eq!(status_of(&snapshot, "T1"), Some(TaskStatus::Running));
    assert!(Supervisor::new(env.config.clone()).is_err());

    handle.shutdown();
    run.await.unwrap().unwrap();
}
