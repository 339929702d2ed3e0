//! Priority-ordered merges and conflict handling.

use std::time::Duration;

use convoy::bus::Category;
use convoy::core::{TaskId, TaskStatus};
use convoy::ledger::{LedgerOptions, TaskLedger};
use convoy::orchestration::{MergeOutcome, Supervisor, WorkerId, WorktreeCoordinator};
use convoy::Error;

use crate::fixtures::{status_of, task, wait_until, TestEnv};

/// Scenario D: both tasks reach AwaitingMerge with conflicting edits.
#[test]
fn test_conflicting_merges_resolve_by_priority() {
    // Given: T1 (priority 1) and T2 (priority 2) both rewrite README.md
    let env = TestEnv::new("true");
    let coordinator = WorktreeCoordinator::from_config(&env.config).unwrap();
    let mut ledger = TaskLedger::in_memory(LedgerOptions::default());
    ledger.add_task(task("T2", 2, &["docs/b.md"])).unwrap();
    ledger.add_task(task("T1", 1, &["docs/a.md"])).unwrap();

    for (id, content) in [("T1", "# from T1\n"), ("T2", "# from T2\n")] {
        let id = TaskId::from(id);
        let snapshot = ledger.snapshot();
        let context = coordinator.create_context(snapshot.get(&id).unwrap()).unwrap();
        std::fs::write(context.path.join("README.md"), content).unwrap();
        ledger.update_status(&id, TaskStatus::SpecReady).unwrap();
        ledger.update_status(&id, TaskStatus::Ready).unwrap();
        ledger.start_task(&id, WorkerId::new(), context).unwrap();
        ledger.update_status(&id, TaskStatus::AwaitingMerge).unwrap();
    }

    // When: everything awaiting merge is merged in one pass
    let snapshot = ledger.snapshot();
    let items = snapshot
        .with_status(TaskStatus::AwaitingMerge)
        .into_iter()
        .map(|t| (t.clone(), t.context.clone().unwrap()))
        .rev()
        .collect();
    let results = coordinator.merge_all(items);

    // Then: T1 merged first; T2 conflicts on README.md
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0.as_str(), "T1");
    assert!(matches!(results[0].1, Ok(MergeOutcome::FastForward { .. })));
    match &results[1] {
        (id, Err(Error::MergeConflict { conflicts, .. })) => {
            assert_eq!(id.as_str(), "T2");
            assert_eq!(conflicts.len(), 1);
            assert!(conflicts[0].path.ends_with("README.md"));
            assert!(!conflicts[0].regions.is_empty());
        }
        other => panic!("expected a conflict for T2, got {:?}", other),
    }

    // And: the baseline reflects only the first merge
    assert_eq!(env.baseline_file("README.md").as_deref(), Some("# from T1\n"));
}

#[tokio::test]
async fn test_supervisor_fails_conflicting_task_and_keeps_baseline() {
    // Given: two tasks that claim different files but both write shared.txt;
    // T2 finishes later
    let env = TestEnv::new(
        r#"if [ "$CONVOY_TASK_ID" = T2 ]; then sleep 1; fi
echo "$CONVOY_TASK_ID" > shared.txt
echo '{"type":"completed"}'"#,
    );
    let supervisor = Supervisor::new(env.config.clone()).unwrap();
    let handle = supervisor.handle();
    let alerts = handle.subscribe("observer");
    let run = tokio::spawn(supervisor.run());

    // When: both are added and run in parallel
    handle
        .add_tasks(vec![task("T1", 1, &["a.txt"]), task("T2", 2, &["b.txt"])])
        .await
        .unwrap();
    let snapshot = wait_until(&handle, Duration::from_secs(20), |s| {
        status_of(s, "T1") == Some(TaskStatus::Done)
            && status_of(s, "T2") == Some(TaskStatus::Failed)
    })
    .await;

    // Then: T2 failed with the conflict, not counted against its budget
    let t2 = snapshot.get(&TaskId::from("T2")).unwrap();
    assert!(t2
        .status_reason
        .as_deref()
        .unwrap_or_default()
        .contains("Merge conflict"));
    assert_eq!(t2.failures, 0);
    assert!(t2.context.is_none());
    assert_eq!(env.baseline_file("shared.txt").as_deref(), Some("T1\n"));

    // And: a health alert names the conflicting file
    let mut conflict_alert = None;
    while let Some(message) = alerts.next(Duration::from_millis(100)).await {
        if message.category == Category::HealthAlert {
            conflict_alert = Some(message);
        }
    }
    let alert = conflict_alert.expect("no health alert");
    assert_eq!(alert.payload["task"], "T2");
    assert_eq!(
        alert.payload["detail"]["conflicts"][0]["path"],
        "shared.txt"
    );

    // And: the conflicted task can be retried explicitly
    handle.retry(TaskId::from("T2")).await.unwrap();

    handle.shutdown();
    run.await.unwrap().unwrap();
}
