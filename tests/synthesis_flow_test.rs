//! Capability gaps trigger synthesis, and the unblocked task completes
//! with the freshly registered plugin.

mod common;

use panion::domain::models::agent::AgentRole;
use panion::domain::models::goal::{Decomposition, Goal, GoalStatus, TaskDescriptor};
use panion::domain::models::plugin::VersionConstraint;
use panion::domain::models::resource::ResourceQuota;
use panion::domain::models::task::TaskStatus;
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;

#[tokio::test]
async fn capability_gap_synthesizes_plugin_and_completes_task() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = common::test_runtime(tmp.path()).await;
    let handles = runtime.start();

    // No plugin provides c_new; the task carries the acceptance cases
    // the synthesizer will train and test against.
    let goal = Goal::new("need a new capability", 5);
    let goal_id = goal.id;
    let descriptor = TaskDescriptor::new("c_new").with_config(json!({
        "input": 5,
        "test_cases": [
            {"in": 1, "out": 2},
            {"in": 2, "out": 4},
            {"in": 3, "out": 6},
        ],
    }));
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
        Duration::from_secs(20),
        runtime.orchestrator.wait_for_goal(goal_id),
    )
    .await
    .expect("goal finished in time")
    .unwrap();
    assert_eq!(status, GoalStatus::Completed);

    // The registry now serves the capability.
    let resolved = runtime
        .registry
        .resolve("c_new", &VersionConstraint::any())
        .await;
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].plugin_id, "gen-c-new@1.0.0");

    // The task retried with the synthesized plugin and doubled its input.
    let task = runtime.scheduler.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let attempt = task.attempts.last().unwrap();
    assert_eq!(attempt.plugin_id.as_deref(), Some("gen-c-new@1.0.0"));
    assert_eq!(attempt.outputs.get("result"), Some(&json!(10)));

    // The gap is recorded as registered.
    let gaps = runtime.orchestrator.capability_gaps().await;
    assert!(gaps.iter().any(|g| {
        g.requirement.capability == "c_new"
            && g.status == panion::domain::models::capability::GapStatus::Registered
    }));

    // The materialized candidate exists on disk with its manifest.
    let plugin_dir = runtime
        .data_dir
        .plugin_dir("gen-c-new", &semver::Version::new(1, 0, 0));
    assert!(plugin_dir.join("manifest.json").exists());
    assert!(plugin_dir.join("test_cases.json").exists());

    handles.stop().await;
}

#[tokio::test]
async fn unlearnable_gap_leaves_task_blocked() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = common::test_runtime(tmp.path()).await;
    let handles = runtime.start();

    let goal = Goal::new("impossible ask", 5);
    let goal_id = goal.id;
    let descriptor = TaskDescriptor::new("square").with_config(json!({
        "input": 4,
        "test_cases": [
            {"in": 1, "out": 1},
            {"in": 2, "out": 4},
            {"in": 3, "out": 9},
        ],
    }));
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

    // The gap fails; the task stays blocked awaiting operator policy.
    let failed = common::wait_until(Duration::from_secs(15), || async {
        runtime.orchestrator.capability_gaps().await.iter().any(|g| {
            g.requirement.capability == "square"
                && g.status == panion::domain::models::capability::GapStatus::Failed
        })
    })
    .await;
    assert!(failed, "gap reaches failed status");

    let task = runtime.scheduler.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Blocked);

    handles.stop().await;
}
