//! End-to-end scheduling flows with real workers.

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
async fn two_task_linear_goal_completes_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = common::test_runtime(tmp.path()).await;
    common::register_doubler(&runtime).await;
    let handles = runtime.start();

    // T1 -> T2, both served by the doubler.
    let goal = Goal::new("double twice", 5);
    let goal_id = goal.id;
    let t1 = TaskDescriptor::new("double").with_config(json!({ "input": 4 }));
    let t2 = TaskDescriptor::new("double").with_config(json!({ "input": 8 }));
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

    let first = runtime.scheduler.get_task(t1_id).await.unwrap();
    let second = runtime.scheduler.get_task(t2_id).await.unwrap();
    assert_eq!(first.status, TaskStatus::Completed);
    assert_eq!(second.status, TaskStatus::Completed);
    assert_eq!(
        first.attempts.last().unwrap().outputs.get("result"),
        Some(&json!(8))
    );
    assert_eq!(
        second.attempts.last().unwrap().outputs.get("result"),
        Some(&json!(16))
    );
    // Dependency ordering: T2 started only after T1 completed.
    assert!(second.started_at.unwrap() >= first.completed_at.unwrap());

    handles.stop().await;
}

#[tokio::test]
async fn retryable_timeout_exhausts_and_fails_goal() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = common::test_runtime(tmp.path()).await;
    // The plugin sleeps 2s; the task allows 1s.
    common::register_sleeper(&runtime, "slow", 2_000).await;
    let handles = runtime.start();

    let goal = Goal::new("too slow", 5);
    let goal_id = goal.id;
    let mut descriptor = TaskDescriptor::new("slow").with_config(json!({ "input": 1 }));
    descriptor.timeout_secs = Some(1);
    descriptor.max_retries = Some(2);
    let task_id = descriptor.id;

    runtime
        .scheduler
        .register_goal(
            goal,
            Decomposition {
                tasks: vec![descriptor],
                ..Decomposition::default()
            },
        )
        .await
        .unwrap();
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
        Duration::from_secs(30),
        runtime.orchestrator.wait_for_goal(goal_id),
    )
    .await
    .expect("goal finished in time")
    .unwrap();
    assert_eq!(status, GoalStatus::Failed);

    let task = runtime.scheduler.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.attempts.len(), 3, "initial run plus two retries");
    assert!(task
        .attempts
        .iter()
        .all(|a| a.status == TaskStatus::Timeout));

    handles.stop().await;
}

#[tokio::test]
async fn cancel_cascades_to_tasks_and_agents() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = common::test_runtime(tmp.path()).await;
    common::register_sleeper(&runtime, "nap", 30_000).await;
    let handles = runtime.start();

    let goal = Goal::new("long nap", 1);
    let goal_id = goal.id;
    let descriptor = TaskDescriptor::new("nap").with_config(json!({ "input": 1 }));
    let task_id = descriptor.id;
    runtime
        .scheduler
        .register_goal(
            goal,
            Decomposition {
                tasks: vec![descriptor],
                ..Decomposition::default()
            },
        )
        .await
        .unwrap();
    let agent_id = runtime
        .manager
        .spawn(
            AgentRole::Executor,
            BTreeSet::new(),
            goal_id,
            ResourceQuota::default(),
        )
        .await
        .unwrap();

    // Let the worker get the task in flight, then cancel.
    let started = common::wait_until(Duration::from_secs(5), || async {
        runtime
            .scheduler
            .get_task(task_id)
            .await
            .is_some_and(|t| t.status == TaskStatus::Running)
    })
    .await;
    assert!(started, "task should start before cancel");

    runtime.orchestrator.cancel(goal_id).await.unwrap();
    // Idempotent second cancel.
    runtime.orchestrator.cancel(goal_id).await.unwrap();

    let goal = runtime.scheduler.get_goal(goal_id).await.unwrap();
    assert_eq!(goal.status, GoalStatus::Cancelled);
    let task = runtime.scheduler.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);

    let agent_gone = common::wait_until(Duration::from_secs(10), || async {
        runtime
            .manager
            .status(agent_id)
            .await
            .is_some_and(|a| a.status.is_terminal())
    })
    .await;
    assert!(agent_gone, "owning agent terminated by cancel cascade");

    handles.stop().await;
}
