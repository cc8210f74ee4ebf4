//! Container-mode execution against the real runner binary.

mod common;

use panion::domain::models::plugin::PluginMetadata;
use panion::domain::ports::{Caller, PluginHandle};
use panion::infrastructure::storage;
use panion::services::transform::{TransformSpec, TRANSFORM_SOURCE_FILE};
use semver::Version;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn runner_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_panion-plugin"))
}

#[tokio::test]
async fn runner_executes_materialized_plugin() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = common::test_runtime(tmp.path()).await;

    // Materialize a tripler by hand.
    let metadata = PluginMetadata::new("tripler", Version::new(1, 0, 0)).with_capability("triple");
    let spec = TransformSpec::Affine { a: 3.0, b: 0.0 };
    let plugin_dir = storage::write_plugin(
        &runtime.data_dir,
        &metadata,
        TRANSFORM_SOURCE_FILE,
        &spec.to_source().unwrap(),
        &json!([{"in": 1, "out": 3}]),
    )
    .unwrap();

    let handle = PluginHandle::Command {
        program: runner_binary(),
        args: Vec::new(),
        plugin_dir,
    };

    let outcome = runtime
        .sandbox
        .execute_handle(
            "tripler@1.0.0",
            &handle,
            metadata.resource_limits,
            json!(14),
            Duration::from_secs(10),
            Caller::Operator,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.output, json!(42));
}

#[tokio::test]
async fn runner_reports_plugin_error_over_the_wire() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = common::test_runtime(tmp.path()).await;

    // A string-map plugin has no mapping for an unexpected input; the
    // error must travel back as a wire failure, not a crash.
    let metadata = PluginMetadata::new("colors", Version::new(1, 0, 0)).with_capability("color");
    let spec = TransformSpec::fit(&[
        panion::domain::models::capability::SynthesisTestCase::new(
            json!("red"),
            json!("#ff0000"),
        ),
    ])
    .unwrap();
    let plugin_dir = storage::write_plugin(
        &runtime.data_dir,
        &metadata,
        TRANSFORM_SOURCE_FILE,
        &spec.to_source().unwrap(),
        &json!([]),
    )
    .unwrap();

    let handle = PluginHandle::Command {
        program: runner_binary(),
        args: Vec::new(),
        plugin_dir,
    };
    let err = runtime
        .sandbox
        .execute_handle(
            "colors@1.0.0",
            &handle,
            metadata.resource_limits,
            json!("chartreuse"),
            Duration::from_secs(10),
            Caller::Operator,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, panion::RuntimeError::PluginFailed { .. }),
        "got {err}"
    );
}

#[tokio::test]
async fn runner_with_missing_plugin_dir_fails_cleanly() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = common::test_runtime(tmp.path()).await;

    let handle = PluginHandle::Command {
        program: runner_binary(),
        args: Vec::new(),
        plugin_dir: tmp.path().join("does-not-exist"),
    };
    let err = runtime
        .sandbox
        .execute_handle(
            "ghost@1.0.0",
            &handle,
            Default::default(),
            json!(1),
            Duration::from_secs(5),
            Caller::Operator,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, panion::RuntimeError::PluginFailed { .. }),
        "got {err}"
    );
}
