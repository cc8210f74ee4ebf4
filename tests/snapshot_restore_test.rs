//! Snapshot-restore: in-flight work is requeued, finished work is not
//! replayed.

mod common;

use panion::domain::models::agent::AgentRole;
use panion::domain::models::goal::{Decomposition, Goal, GoalStatus, TaskDescriptor};
use panion::domain::models::resource::ResourceQuota;
use panion::domain::models::task::TaskStatus;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn restore_requeues_running_task_without_duplicating_completed() {
    let tmp = tempfile::tempdir().unwrap();

    let (goal_id, t1_id, t2_id) = {
        let runtime = common::test_runtime(tmp.path()).await;
        common::register_doubler(&runtime).await;

        let goal = Goal::new("interrupted goal", 5);
        let goal_id = goal.id;
        let t1 = TaskDescriptor::new("double").with_config(json!({ "input": 2 }));
        let t2 = TaskDescriptor::new("double").with_config(json!({ "input": 3 }));
        let (t1_id, t2_id) = (t1.id, t2.id);
        let mut dependencies: BTreeMap<Uuid, BTreeSet<Uuid>> = BTreeMap::new();
        dependencies.entry(t2_id).or_default().insert(t1_id);

        runtime
            .scheduler
            .register_goal(
                goal,
                Decomposition {
                    tasks: vec![t1, t2],
                    dependencies,
                    ..Decomposition::default()
                },
            )
            .await
            .unwrap();

        // Drive T1 to completed and T2 to running by hand, then
        // checkpoint and "kill the process" by dropping the runtime.
        let agent = Uuid::new_v4();
        runtime.scheduler.claim(t1_id, agent).await.unwrap();
        runtime
            .scheduler
            .start(t1_id, Some("doubler@1.0.0".to_string()))
            .await
            .unwrap();
        let mut outputs = BTreeMap::new();
        outputs.insert("result".to_string(), json!(4));
        runtime
            .scheduler
            .complete(t1_id, outputs, BTreeMap::new())
            .await
            .unwrap();

        runtime.scheduler.claim(t2_id, agent).await.unwrap();
        runtime
            .scheduler
            .start(t2_id, Some("doubler@1.0.0".to_string()))
            .await
            .unwrap();

        runtime.snapshot_now().await.unwrap();
        (goal_id, t1_id, t2_id)
    };

    // Restart over the same data dir.
    let runtime = common::test_runtime(tmp.path()).await;
    common::register_doubler(&runtime).await;

    let t1 = runtime.scheduler.get_task(t1_id).await.unwrap();
    assert_eq!(t1.status, TaskStatus::Completed, "completed work survives");
    assert_eq!(t1.attempts.len(), 1, "no duplicate completion");

    let t2 = runtime.scheduler.get_task(t2_id).await.unwrap();
    assert_eq!(t2.status, TaskStatus::Pending, "in-flight work requeued");
    assert_eq!(t2.retry_count, 1);
    assert!(t2.claimed_by.is_none());

    // Resume: a fresh worker finishes T2 and the goal completes.
    let handles = runtime.start();
    runtime
        .manager
        .spawn(
            AgentRole::Executor,
            BTreeSet::new(),
            goal_id,
            ResourceQuota::default(),
        )
        .await
        .unwrap();

    let status = tokio::time::timeout(
        Duration::from_secs(15),
        runtime.orchestrator.wait_for_goal(goal_id),
    )
    .await
    .expect("goal finished in time")
    .unwrap();
    assert_eq!(status, GoalStatus::Completed);

    let t1 = runtime.scheduler.get_task(t1_id).await.unwrap();
    assert_eq!(t1.attempts.len(), 1, "T1 was not re-run after restore");
    let t2 = runtime.scheduler.get_task(t2_id).await.unwrap();
    assert_eq!(t2.status, TaskStatus::Completed);

    handles.stop().await;
}

#[tokio::test]
async fn snapshot_files_obey_retention() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = common::test_runtime(tmp.path()).await;

    for _ in 0..5 {
        runtime.snapshot_now().await.unwrap();
    }

    let snaps: Vec<_> = std::fs::read_dir(runtime.data_dir.snapshots())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "snap"))
        .collect();
    assert_eq!(snaps.len(), 2, "only the two most recent snapshots kept");
}
