//! Shared fixtures for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use panion::domain::errors::{RuntimeError, RuntimeResult};
use panion::domain::models::plugin::PluginMetadata;
use panion::domain::models::Config;
use panion::domain::ports::{ExecutionContext, Plugin, PluginHandle};
use panion::runtime::Runtime;
use panion::services::transform::{TransformPlugin, TransformSpec};
use semver::Version;
use std::sync::Arc;
use std::time::Duration;

/// Config rooted in a temp dir with a fast snapshot cadence.
pub fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config {
        data_dir: dir.to_path_buf(),
        ..Config::default()
    };
    config.snapshot.interval_secs = 1;
    config
}

/// Build a runtime over a temp dir with in-process candidates.
pub async fn test_runtime(dir: &std::path::Path) -> Arc<Runtime> {
    Runtime::new_in_process(test_config(dir))
        .await
        .expect("runtime builds")
}

/// Register a trusted native doubling plugin for capability `double`.
pub async fn register_doubler(runtime: &Runtime) -> String {
    let metadata = PluginMetadata::new("doubler", Version::new(1, 0, 0))
        .with_capability("double")
        .with_trusted(true);
    runtime
        .registry
        .register(
            metadata,
            PluginHandle::Native(Arc::new(TransformPlugin::new(TransformSpec::Affine {
                a: 2.0,
                b: 0.0,
            }))),
        )
        .await
        .expect("doubler registers")
}

/// A plugin that sleeps for a fixed duration, honoring cooperative
/// cancellation.
pub struct SleeperPlugin {
    pub millis: u64,
}

#[async_trait]
impl Plugin for SleeperPlugin {
    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> RuntimeResult<serde_json::Value> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(self.millis)) => Ok(input),
            _ = ctx.cancel.cancelled() => Err(RuntimeError::CancelRequested),
        }
    }
}

/// Register a sleeper under the given capability.
pub async fn register_sleeper(runtime: &Runtime, capability: &str, millis: u64) -> String {
    let metadata = PluginMetadata::new(capability, Version::new(1, 0, 0))
        .with_capability(capability)
        .with_trusted(true);
    runtime
        .registry
        .register(
            metadata,
            PluginHandle::Native(Arc::new(SleeperPlugin { millis })),
        )
        .await
        .expect("sleeper registers")
}

/// Poll until the predicate holds or the deadline passes.
pub async fn wait_until<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
