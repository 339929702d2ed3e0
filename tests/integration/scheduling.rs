//! Batch selection over ledger snapshots.

use convoy::core::{Task, TaskId, TaskStatus};
use convoy::ledger::{LedgerOptions, TaskLedger};
use convoy::orchestration::{resources_overlap, DeferReason, TaskScheduler};

use crate::fixtures::task;

fn ledger(tasks: Vec<Task>) -> TaskLedger {
    let mut ledger = TaskLedger::in_memory(LedgerOptions::default());
    for task in tasks {
        ledger.add_task(task).unwrap();
    }
    ledger
}

fn ids(batch: &[TaskId]) -> Vec<&str> {
    batch.iter().map(TaskId::as_str).collect()
}

/// Scenario A: disjoint files, no dependencies.
#[test]
fn test_independent_tasks_share_a_batch() {
    // Given: T1 owns a.py and T2 owns b.py
    let ledger = ledger(vec![task("T1", 1, &["a.py"]), task("T2", 2, &["b.py"])]);

    // When: a batch is planned
    let batch = TaskScheduler::new(3).plan(&ledger.snapshot());

    // Then: both run together, with evidence for the pair
    assert_eq!(ids(&batch.tasks), vec!["T1", "T2"]);
    assert_eq!(batch.evidence.len(), 1);
    assert!(!batch.solo);
}

/// Scenario B: both tasks own a.py.
#[test]
fn test_overlapping_tasks_are_serialized() {
    // Given: T1 and T3 both own a.py
    let mut ledger = ledger(vec![task("T1", 1, &["a.py"]), task("T3", 2, &["a.py"])]);
    let mut scheduler = TaskScheduler::new(3);

    // When: a batch is planned
    let batch = scheduler.plan(&ledger.snapshot());

    // Then: only T1 runs; T3 waits on the overlap
    assert_eq!(ids(&batch.tasks), vec!["T1"]);
    assert!(matches!(
        batch.deferral(&TaskId::from("T3")),
        Some(DeferReason::ResourceOverlap { with, .. }) if with.as_str() == "T1"
    ));

    // And: once T1 is done, T3 is picked up next cycle
    let t1 = TaskId::from("T1");
    for status in [
        TaskStatus::SpecReady,
        TaskStatus::Ready,
        TaskStatus::Running,
        TaskStatus::Done,
    ] {
        ledger.update_status(&t1, status).unwrap();
    }
    let batch = scheduler.plan(&ledger.snapshot());
    assert_eq!(ids(&batch.tasks), vec!["T3"]);
}

/// Scenario C: dependency not yet done.
#[test]
fn test_dependent_task_is_not_ready() {
    // Given: T4 depends on T1, which is still planned
    let ledger = ledger(vec![
        task("T1", 1, &["a.py"]),
        task("T4", 1, &["d.py"]).with_dependencies(["T1"]),
    ]);

    // When: ready tasks are listed
    let ready = ledger.get_ready_tasks();

    // Then: T4 is excluded and the batch holds only T1
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id.as_str(), "T1");
    let batch = TaskScheduler::new(3).plan(&ledger.snapshot());
    assert_eq!(ids(&batch.tasks), vec!["T1"]);
}

#[test]
fn test_batches_never_contain_dependent_or_overlapping_pairs() {
    // Given: a mix of overlapping, nested and disjoint ownership
    let ledger = ledger(vec![
        task("T1", 1, &["src/api"]),
        task("T2", 1, &["src/api/routes.rs"]),
        task("T3", 2, &["docs/guide.md"]),
        task("T4", 2, &["src/db.rs", "docs"]),
        task("T5", 3, &["tests/api.rs"]),
        task("T6", 3, &["Cargo.toml"]),
    ]);

    // When: planned with a generous cap
    let snapshot = ledger.snapshot();
    let batch = TaskScheduler::new(6).plan(&snapshot);

    // Then: every pair in the batch is independent
    for (i, a) in batch.tasks.iter().enumerate() {
        for b in &batch.tasks[i + 1..] {
            let ta = snapshot.get(a).unwrap();
            let tb = snapshot.get(b).unwrap();
            assert!(!snapshot.has_dependency_edge(a, b));
            for ra in ta.resources.iter().flatten() {
                for rb in tb.resources.iter().flatten() {
                    assert!(!resources_overlap(ra, rb), "{} and {} overlap", a, b);
                }
            }
        }
    }
    assert_eq!(ids(&batch.tasks), vec!["T1", "T3", "T5", "T6"]);
}

#[test]
fn test_parallelism_cap_counts_running_work() {
    // Given: a cap of two with one task already running
    let mut ledger = ledger(vec![
        task("T1", 1, &["a"]),
        task("T2", 2, &["b"]),
        task("T3", 3, &["c"]),
    ]);
    let t1 = TaskId::from("T1");
    for status in [TaskStatus::SpecReady, TaskStatus::Ready, TaskStatus::Running] {
        ledger.update_status(&t1, status).unwrap();
    }

    // When: planned
    let batch = TaskScheduler::new(2).plan(&ledger.snapshot());

    // Then: only one slot remains
    assert_eq!(ids(&batch.tasks), vec!["T2"]);
    assert_eq!(batch.deferral(&TaskId::from("T3")), Some(&DeferReason::Capacity));
}

#[test]
fn test_plan_is_deterministic() {
    let ledger = ledger(vec![
        task("T1", 2, &["a"]),
        task("T2", 1, &["a"]),
        task("T3", 1, &["b"]),
        task("T4", 2, &["c"]),
    ]);
    let first = TaskScheduler::new(3).plan(&ledger.snapshot());
    for _ in 0..10 {
        assert_eq!(TaskScheduler::new(3).plan(&ledger.snapshot()), first);
    }
    assert_eq!(ids(&first.tasks), vec!["T2", "T3", "T4"]);
}
