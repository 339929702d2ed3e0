//! Durable ledger state across supervisor restarts.

use std::io::Write;
use std::time::Duration;

use convoy::core::{TaskId, TaskStatus};
use convoy::ledger::{LedgerOptions, TaskLedger};
use convoy::orchestration::Supervisor;
use convoy::Error;

use crate::fixtures::{script_role, status_of, task, wait_until, TestEnv};

#[test]
fn test_ledger_survives_reopen_with_failure_counters() {
    // Given: a durable ledger with history, a failure and a role outcome
    let env = TestEnv::new("true");
    let state_dir = env.state_dir();
    let options = LedgerOptions {
        max_restarts: 3,
        snapshot_every: 4,
    };
    {
        let mut ledger = TaskLedger::open(&state_dir, options).unwrap();
        ledger.add_task(task("T1", 1, &["a.py"])).unwrap();
        ledger
            .add_task(task("T2", 2, &["b.py"]).with_dependencies(["T1"]))
            .unwrap();
        let t1 = TaskId::from("T1");
        ledger.update_status(&t1, TaskStatus::SpecReady).unwrap();
        ledger.update_status(&t1, TaskStatus::Ready).unwrap();
        ledger
            .record_failure(&t1, "worker crashed", Duration::ZERO)
            .unwrap();
        ledger.record_role_outcome("default", false).unwrap();
        ledger.record_role_outcome("default", false).unwrap();
    }

    // When: reopened
    let ledger = TaskLedger::open(&state_dir, options).unwrap();

    // Then: tasks, order, counters and dependencies are intact
    let t1 = ledger.get(&TaskId::from("T1")).unwrap();
    assert_eq!(t1.status, TaskStatus::Ready);
    assert_eq!(t1.failures, 1);
    assert_eq!(ledger.role_failures("default"), 2);
    let ready: Vec<String> = ledger
        .get_ready_tasks()
        .into_iter()
        .map(|t| t.id.to_string())
        .collect();
    assert_eq!(ready, vec!["T1"]);

    // And: invariants still hold after replay
    let mut ledger = ledger;
    assert!(matches!(
        ledger.add_task(task("T1", 1, &[])),
        Err(Error::DuplicateId(_))
    ));
    assert!(matches!(
        ledger.update_status(&TaskId::from("T2"), TaskStatus::Done),
        Err(Error::InvalidTransition { .. })
    ));
}

#[test]
fn test_history_after_torn_write_survives_restarts() {
    // Given: a ledger whose log ends in a half-written entry
    let env = TestEnv::new("true");
    let state_dir = env.state_dir();
    let options = LedgerOptions::default();
    {
        let mut ledger = TaskLedger::open(&state_dir, options).unwrap();
        ledger.add_task(task("T1", 1, &["a.py"])).unwrap();
    }
    let mut log = std::fs::OpenOptions::new()
        .append(true)
        .open(state_dir.join("ledger.log"))
        .unwrap();
    log.write_all(b"{\"seq\":2,\"recorded_at\"").unwrap();
    drop(log);

    // When: the ledger is reopened and written to
    {
        let mut ledger = TaskLedger::open(&state_dir, options).unwrap();
        assert_eq!(ledger.len(), 1);
        ledger.add_task(task("T2", 2, &["b.py"])).unwrap();
        ledger.add_task(task("T3", 3, &["c.py"])).unwrap();
    }

    // Then: a second restart still sees every task
    let ledger = TaskLedger::open(&state_dir, options).unwrap();
    assert_eq!(ledger.len(), 3);
    for id in ["T1", "T2", "T3"] {
        assert!(ledger.get(&TaskId::from(id)).is_some(), "{} lost", id);
    }
    assert_eq!(TaskLedger::inspect(&state_dir).unwrap().len(), 3);
}

#[tokio::test]
async fn test_shutdown_requeues_running_tasks() {
    // Given: a supervisor with a long-running worker
    let env = TestEnv::new("exec sleep 30");
    let supervisor = Supervisor::new(env.config.clone()).unwrap();
    let handle = supervisor.handle();
    let run = tokio::spawn(supervisor.run());
    handle.add_task(task("T1", 1, &["a.py"])).await.unwrap();
    wait_until(&handle, Duration::from_secs(10), |s| {
        status_of(s, "T1") == Some(TaskStatus::Running)
    })
    .await;

    // When: it shuts down
    handle.shutdown();
    run.await.unwrap().unwrap();

    // Then: nothing is left Running and the failure budget is untouched
    let snapshot = TaskLedger::inspect(&env.state_dir()).unwrap();
    let t1 = snapshot.get(&TaskId::from("T1")).unwrap();
    assert_eq!(t1.status, TaskStatus::Ready);
    assert_eq!(t1.status_reason.as_deref(), Some("supervisor shutdown"));
    assert_eq!(t1.failures, 0);
    assert!(t1.context.is_none());
    assert!(!env.state_dir().join("supervisor.lock").exists());
}

#[tokio::test]
async fn test_restart_rechecks_tasks_left_running() {
    // Given: a supervisor that disappears while T1 is running
    let mut env = TestEnv::new("exec sleep 30");
    let supervisor = Supervisor::new(env.config.clone()).unwrap();
    let handle = supervisor.handle();
    let run = tokio::spawn(supervisor.run());
    handle.add_task(task("T1", 1, &["a.txt"])).await.unwrap();
    let snapshot = wait_until(&handle, Duration::from_secs(10), |s| {
        status_of(s, "T1") == Some(TaskStatus::Running)
    })
    .await;
    let stale_context = snapshot
        .get(&TaskId::from("T1"))
        .and_then(|t| t.context.clone())
        .unwrap();
    run.abort();
    let _ = run.await;
    let persisted = TaskLedger::inspect(&env.state_dir()).unwrap();
    assert_eq!(status_of(&persisted, "T1"), Some(TaskStatus::Running));

    // When: a new supervisor starts with a worker that succeeds
    env.config.roles.insert(
        "default".to_string(),
        script_role(r#"echo done > a.txt; echo '{"type":"completed"}'"#),
    );
    let supervisor = Supervisor::new(env.config.clone()).unwrap();
    let handle = supervisor.handle();
    let run = tokio::spawn(supervisor.run());

    // Then: T1 is re-checked without charging its budget, re-run and merged
    let snapshot = wait_until(&handle, Duration::from_secs(15), |s| {
        status_of(s, "T1") == Some(TaskStatus::Done)
    })
    .await;
    assert_eq!(snapshot.get(&TaskId::from("T1")).unwrap().failures, 0);
    assert!(!stale_context.path.exists());
    assert_eq!(env.baseline_file("a.txt").as_deref(), Some("done\n"));

    handle.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_restart_does_not_spend_an_exhausted_budget() {
    // Given: T1 running with every restart already used up
    let mut env = TestEnv::new("exec sleep 30");
    let supervisor = Supervisor::new(env.config.clone()).unwrap();
    let handle = supervisor.handle();
    let run = tokio::spawn(supervisor.run());
    handle.add_task(task("T1", 1, &["a.txt"])).await.unwrap();
    wait_until(&handle, Duration::from_secs(10), |s| {
        status_of(s, "T1") == Some(TaskStatus::Running)
    })
    .await;
    run.abort();
    let _ = run.await;
    {
        let mut ledger = TaskLedger::open(&env.state_dir(), LedgerOptions::default()).unwrap();
        let id = TaskId::from("T1");
        for _ in 0..env.config.health.max_restarts {
            ledger
                .record_failure(&id, "earlier worker crash", Duration::ZERO)
                .unwrap();
        }
    }

    // When: a new supervisor starts with a worker that succeeds
    env.config.roles.insert(
        "default".to_string(),
        script_role(r#"echo done > a.txt; echo '{"type":"completed"}'"#),
    );
    let supervisor = Supervisor::new(env.config.clone()).unwrap();
    let handle = supervisor.handle();
    let run = tokio::spawn(supervisor.run());

    // Then: the task is requeued rather than failed, and finishes
    let snapshot = wait_until(&handle, Duration::from_secs(15), |s| {
        matches!(
            status_of(s, "T1"),
            Some(TaskStatus::Done) | Some(TaskStatus::Failed)
        )
    })
    .await;
    let t1 = snapshot.get(&TaskId::from("T1")).unwrap();
    assert_eq!(t1.status, TaskStatus::Done, "{:?}", t1.status_reason);
    assert_eq!(t1.failures, env.config.health.max_restarts);

    handle.shutdown();
    run.await.unwrap().unwrap();
}
