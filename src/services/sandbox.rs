//! Sandboxed plugin execution.
//!
//! Two isolation modes share one interface: container mode runs the
//! plugin as a subprocess speaking the wire protocol (optionally wrapped
//! in a container engine), in-process mode runs trusted plugins as
//! cooperative tasks. Both enforce the two-level deadline: cooperative
//! cancel at the soft mark, kill at the hard mark.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::config::SandboxConfig;
use crate::domain::models::resource::{ResourceAxis, ResourceQuota};
use crate::domain::ports::{Caller, ExecutionContext, PluginHandle};
use crate::infrastructure::wire::{WireRequest, WireResponse};
use crate::services::monitor::{MonitorEvent, ResourceMonitor};
use crate::services::registry::PluginRegistry;
use crate::services::transform::TransformPlugin;

/// Result of one sandboxed call.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub output: serde_json::Value,
    pub correlation_id: String,
    pub duration_ms: u64,
    /// Peak resource usage attributed to the call
    pub peaks: BTreeMap<String, f64>,
}

enum Interrupt {
    None,
    Quota(ResourceAxis),
    Cancelled,
}

/// Isolated plugin executor.
pub struct SandboxExecutor {
    config: SandboxConfig,
    registry: Arc<PluginRegistry>,
    monitor: Arc<ResourceMonitor>,
    /// Per-plugin concurrency gates; plugins without `max_concurrent > 1`
    /// serialize here.
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    corr_seq: AtomicU64,
}

impl SandboxExecutor {
    pub fn new(
        config: SandboxConfig,
        registry: Arc<PluginRegistry>,
        monitor: Arc<ResourceMonitor>,
    ) -> Self {
        Self {
            config,
            registry,
            monitor,
            gates: Mutex::new(HashMap::new()),
            corr_seq: AtomicU64::new(1),
        }
    }

    /// Execute a registered plugin under its declared quota.
    pub async fn execute(
        &self,
        plugin_id: &str,
        input: serde_json::Value,
        timeout: Duration,
        caller: Caller,
        cancel: CancellationToken,
    ) -> RuntimeResult<ExecutionOutcome> {
        let (metadata, handle) = self.registry.handle(plugin_id).await?;
        let quota = metadata.resource_limits;

        let gate = {
            let mut gates = self.gates.lock().await;
            Arc::clone(
                gates
                    .entry(plugin_id.to_string())
                    .or_insert_with(|| Arc::new(Semaphore::new(metadata.max_concurrent.max(1)))),
            )
        };
        let _permit = gate
            .acquire()
            .await
            .map_err(|_| RuntimeError::Internal("Execution gate closed".to_string()))?;

        // Promoted plugins run in-process even when materialized as a
        // command; the handle is re-resolved at execution time.
        let handle = if metadata.trusted {
            if let PluginHandle::Command { plugin_dir, .. } = &handle {
                match TransformPlugin::load(plugin_dir) {
                    Ok(plugin) => PluginHandle::Native(Arc::new(plugin)),
                    Err(_) => handle.clone(),
                }
            } else {
                handle
            }
        } else {
            handle
        };

        self.execute_handle(plugin_id, &handle, quota, input, timeout, caller, cancel)
            .await
    }

    /// Execute an unregistered handle (the synthesizer tests candidates
    /// this way before registration).
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_handle(
        &self,
        plugin_id: &str,
        handle: &PluginHandle,
        quota: ResourceQuota,
        input: serde_json::Value,
        timeout: Duration,
        caller: Caller,
        cancel: CancellationToken,
    ) -> RuntimeResult<ExecutionOutcome> {
        let corr = format!(
            "exec-{}-{}",
            self.corr_seq.fetch_add(1, Ordering::Relaxed),
            plugin_id
        );
        debug!(correlation_id = %corr, caller = %caller, "Sandbox execution starting");

        self.monitor
            .register_owner(corr.clone(), Some(quota), None)
            .await;

        let started = std::time::Instant::now();
        let result = match handle {
            PluginHandle::Native(plugin) => {
                self.run_in_process(&corr, Arc::clone(plugin), input, timeout, &cancel)
                    .await
            }
            PluginHandle::Command {
                program,
                args,
                plugin_dir,
            } => {
                self.run_subprocess(
                    &corr,
                    program.clone(),
                    args.clone(),
                    plugin_dir.clone(),
                    &quota,
                    input,
                    timeout,
                    &cancel,
                )
                .await
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let peaks = self
            .monitor
            .get_usage(&corr)
            .await
            .map(|usage| usage.peaks)
            .unwrap_or_default();
        self.monitor.unregister_owner(&corr).await;

        result.map(|output| ExecutionOutcome {
            output,
            correlation_id: corr,
            duration_ms,
            peaks,
        })
    }

    fn soft_duration(&self, timeout: Duration) -> Duration {
        timeout.mul_f64(self.config.soft_deadline_fraction.clamp(0.01, 1.0))
    }

    async fn run_in_process(
        &self,
        corr: &str,
        plugin: Arc<dyn crate::domain::ports::Plugin>,
        input: serde_json::Value,
        timeout: Duration,
        external_cancel: &CancellationToken,
    ) -> RuntimeResult<serde_json::Value> {
        let token = CancellationToken::new();
        let deadline = Utc::now() + chrono::Duration::milliseconds(timeout.as_millis() as i64);
        let ctx = ExecutionContext {
            correlation_id: corr.to_string(),
            deadline,
            cancel: token.clone(),
        };

        let mut run = tokio::spawn(async move { plugin.execute(input, &ctx).await });

        let soft_at = Instant::now() + self.soft_duration(timeout);
        let hard_at = Instant::now() + timeout;
        let mut quota_rx = self.monitor.subscribe();
        let mut interrupt = Interrupt::None;
        let mut soft_fired = false;

        loop {
            tokio::select! {
                res = &mut run => {
                    return match res {
                        Ok(inner) => self.map_inner(corr, inner, &interrupt, timeout),
                        Err(_) => Err(RuntimeError::Internal(
                            "Plugin task panicked".to_string(),
                        )),
                    };
                }
                _ = tokio::time::sleep_until(soft_at), if !soft_fired => {
                    soft_fired = true;
                    token.cancel();
                }
                _ = tokio::time::sleep_until(hard_at) => {
                    run.abort();
                    return Err(self.interrupt_error(corr, interrupt, timeout));
                }
                _ = external_cancel.cancelled(), if !matches!(interrupt, Interrupt::Cancelled) => {
                    interrupt = Interrupt::Cancelled;
                    token.cancel();
                }
                event = quota_rx.recv() => {
                    if let Ok(MonitorEvent::QuotaExceeded { owner, axis }) = event {
                        if owner == corr && matches!(interrupt, Interrupt::None) {
                            interrupt = Interrupt::Quota(axis);
                            token.cancel();
                        }
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_subprocess(
        &self,
        corr: &str,
        program: PathBuf,
        args: Vec<String>,
        plugin_dir: PathBuf,
        quota: &ResourceQuota,
        input: serde_json::Value,
        timeout: Duration,
        external_cancel: &CancellationToken,
    ) -> RuntimeResult<serde_json::Value> {
        let (resolved_program, resolved_args) =
            self.wrap_command(program, args, &plugin_dir, quota);

        let mut child = tokio::process::Command::new(&resolved_program)
            .args(&resolved_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::PluginFailed {
                plugin_id: corr.to_string(),
                message: format!("Failed to spawn plugin process: {e}"),
            })?;

        if let Some(pid) = child.id() {
            self.monitor
                .register_owner(corr.to_string(), Some(*quota), Some(pid))
                .await;
        }

        let request = WireRequest::execute(corr, input, timeout.as_millis() as u64);
        {
            let stdin = child.stdin.as_mut().ok_or_else(|| {
                RuntimeError::Internal("Plugin child has no stdin".to_string())
            })?;
            let write = async {
                stdin.write_all(request.encode()?.as_bytes()).await?;
                stdin.flush().await?;
                Ok::<(), RuntimeError>(())
            };
            write.await.map_err(|e| RuntimeError::PluginFailed {
                plugin_id: corr.to_string(),
                message: format!("Failed writing request: {e}"),
            })?;
        }

        let stdout = child.stdout.take().ok_or_else(|| {
            RuntimeError::Internal("Plugin child has no stdout".to_string())
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let soft_at = Instant::now() + self.soft_duration(timeout);
        let hard_at = Instant::now() + timeout;
        let mut quota_rx = self.monitor.subscribe();
        let mut interrupt = Interrupt::None;
        let mut soft_fired = false;

        let outcome = loop {
            tokio::select! {
                line = lines.next_line() => {
                    break match line {
                        Ok(Some(line)) => {
                            let response = WireResponse::decode(&line, corr)
                                .map_err(|e| RuntimeError::PluginFailed {
                                    plugin_id: corr.to_string(),
                                    message: e.to_string(),
                                })?;
                            if response.ok {
                                Ok(response.result.unwrap_or(serde_json::Value::Null))
                            } else {
                                Err(RuntimeError::PluginFailed {
                                    plugin_id: corr.to_string(),
                                    message: response
                                        .error
                                        .unwrap_or_else(|| "unspecified plugin error".to_string()),
                                })
                            }
                        }
                        Ok(None) => Err(match interrupt {
                            Interrupt::Quota(axis) => RuntimeError::QuotaExceeded {
                                owner: corr.to_string(),
                                axis: axis.as_str().to_string(),
                            },
                            Interrupt::Cancelled => RuntimeError::CancelRequested,
                            Interrupt::None => RuntimeError::PluginFailed {
                                plugin_id: corr.to_string(),
                                message: "Plugin exited without a response".to_string(),
                            },
                        }),
                        Err(e) => Err(RuntimeError::PluginFailed {
                            plugin_id: corr.to_string(),
                            message: format!("Failed reading plugin output: {e}"),
                        }),
                    };
                }
                _ = tokio::time::sleep_until(soft_at), if !soft_fired => {
                    soft_fired = true;
                    signal_child(&child, nix::sys::signal::Signal::SIGTERM);
                }
                _ = tokio::time::sleep_until(hard_at) => {
                    let _ = child.start_kill();
                    break Err(self.interrupt_error(corr, interrupt, timeout));
                }
                _ = external_cancel.cancelled(), if !matches!(interrupt, Interrupt::Cancelled) => {
                    interrupt = Interrupt::Cancelled;
                    signal_child(&child, nix::sys::signal::Signal::SIGTERM);
                }
                event = quota_rx.recv() => {
                    if let Ok(MonitorEvent::QuotaExceeded { owner, axis }) = event {
                        if owner == corr && matches!(interrupt, Interrupt::None) {
                            interrupt = Interrupt::Quota(axis);
                            signal_child(&child, nix::sys::signal::Signal::SIGTERM);
                        }
                    }
                }
            }
        };

        // Reap the child; the grace period covers slow exits after a
        // cooperative stop.
        let grace = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
        if grace.is_err() {
            warn!(correlation_id = %corr, "Plugin child ignored stop, killing");
            let _ = child.kill().await;
        }

        outcome
    }

    /// Build the actual command line, wrapping in the configured
    /// container engine when one is set.
    fn wrap_command(
        &self,
        program: PathBuf,
        args: Vec<String>,
        plugin_dir: &std::path::Path,
        quota: &ResourceQuota,
    ) -> (PathBuf, Vec<String>) {
        match &self.config.container_engine {
            Some(engine) => {
                // No network, read-only bind of the plugin dir, CPU and
                // memory caps from the quota.
                let wrapped = vec![
                    "run".to_string(),
                    "--rm".to_string(),
                    "-i".to_string(),
                    "--network".to_string(),
                    "none".to_string(),
                    "--memory".to_string(),
                    format!("{}m", quota.memory_mb),
                    "--cpus".to_string(),
                    format!("{:.2}", (quota.cpu_percent / 100.0).max(0.05)),
                    "-v".to_string(),
                    format!("{}:/plugin:ro", plugin_dir.display()),
                    self.config.container_image.clone(),
                    "/plugin".to_string(),
                ];
                (PathBuf::from(engine), wrapped)
            }
            None => {
                let mut full_args = args;
                full_args.push(plugin_dir.display().to_string());
                (program, full_args)
            }
        }
    }

    fn map_inner(
        &self,
        corr: &str,
        inner: RuntimeResult<serde_json::Value>,
        interrupt: &Interrupt,
        timeout: Duration,
    ) -> RuntimeResult<serde_json::Value> {
        match inner {
            Ok(value) => Ok(value),
            Err(RuntimeError::CancelRequested) => match interrupt {
                Interrupt::Quota(axis) => Err(RuntimeError::QuotaExceeded {
                    owner: corr.to_string(),
                    axis: axis.as_str().to_string(),
                }),
                Interrupt::Cancelled => Err(RuntimeError::CancelRequested),
                Interrupt::None => Err(RuntimeError::Timeout {
                    timeout_secs: timeout.as_secs(),
                }),
            },
            Err(other) => Err(other),
        }
    }

    fn interrupt_error(&self, corr: &str, interrupt: Interrupt, timeout: Duration) -> RuntimeError {
        match interrupt {
            Interrupt::Quota(axis) => RuntimeError::QuotaExceeded {
                owner: corr.to_string(),
                axis: axis.as_str().to_string(),
            },
            Interrupt::Cancelled => RuntimeError::CancelRequested,
            Interrupt::None => RuntimeError::Timeout {
                timeout_secs: timeout.as_secs(),
            },
        }
    }

    /// Default runner binary: configured path, or `panion-plugin` beside
    /// the current executable.
    pub fn default_runner(&self) -> PathBuf {
        if let Some(path) = &self.config.plugin_runner {
            return path.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("panion-plugin")))
            .unwrap_or_else(|| PathBuf::from("panion-plugin"))
    }
}

fn signal_child(child: &tokio::process::Child, signal: nix::sys::signal::Signal) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::MonitorConfig;
    use crate::domain::models::plugin::PluginMetadata;
    use crate::domain::ports::Plugin;
    use crate::services::transform::{TransformPlugin, TransformSpec};
    use async_trait::async_trait;
    use semver::Version;
    use serde_json::json;

    struct Sleeper {
        millis: u64,
        cooperative: bool,
    }

    #[async_trait]
    impl Plugin for Sleeper {
        async fn execute(
            &self,
            input: serde_json::Value,
            ctx: &ExecutionContext,
        ) -> RuntimeResult<serde_json::Value> {
            let nap = Duration::from_millis(self.millis);
            if self.cooperative {
                tokio::select! {
                    _ = tokio::time::sleep(nap) => Ok(input),
                    _ = ctx.cancel.cancelled() => Err(RuntimeError::CancelRequested),
                }
            } else {
                // Ignores the soft cancel entirely.
                tokio::time::sleep(nap).await;
                Ok(input)
            }
        }
    }

    fn fixture() -> (Arc<PluginRegistry>, Arc<ResourceMonitor>, SandboxExecutor) {
        let registry = Arc::new(PluginRegistry::new());
        let monitor = Arc::new(ResourceMonitor::new(
            MonitorConfig::default(),
            &BTreeMap::new(),
        ));
        let sandbox = SandboxExecutor::new(
            SandboxConfig::default(),
            Arc::clone(&registry),
            Arc::clone(&monitor),
        );
        (registry, monitor, sandbox)
    }

    async fn register_native(
        registry: &PluginRegistry,
        name: &str,
        plugin: Arc<dyn Plugin>,
    ) -> String {
        let metadata = PluginMetadata::new(name, Version::new(1, 0, 0))
            .with_capability(name)
            .with_trusted(true);
        registry
            .register(metadata, PluginHandle::Native(plugin))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_execute_native_plugin() {
        let (registry, _monitor, sandbox) = fixture();
        let id = register_native(
            &registry,
            "doubler",
            Arc::new(TransformPlugin::new(TransformSpec::Affine { a: 2.0, b: 0.0 })),
        )
        .await;

        let outcome = sandbox
            .execute(
                &id,
                json!(21),
                Duration::from_secs(5),
                Caller::Operator,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.output, json!(42));
        assert!(outcome.correlation_id.contains("doubler"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooperative_timeout() {
        let (registry, _monitor, sandbox) = fixture();
        let id = register_native(
            &registry,
            "sleepy",
            Arc::new(Sleeper {
                millis: 2000,
                cooperative: true,
            }),
        )
        .await;

        let err = sandbox
            .execute(
                &id,
                json!(null),
                Duration::from_millis(1000),
                Caller::Operator,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        // Soft cancel fires at 80%; a cooperative plugin returns
        // CancelRequested, mapped to Timeout.
        assert!(matches!(err, RuntimeError::Timeout { .. }), "got {err}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_kill_of_uncooperative_plugin() {
        let (registry, _monitor, sandbox) = fixture();
        let id = register_native(
            &registry,
            "stubborn",
            Arc::new(Sleeper {
                millis: 60_000,
                cooperative: false,
            }),
        )
        .await;

        let err = sandbox
            .execute(
                &id,
                json!(null),
                Duration::from_millis(500),
                Caller::Operator,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { .. }), "got {err}");
    }

    #[tokio::test]
    async fn test_external_cancel() {
        let (registry, _monitor, sandbox) = fixture();
        let id = register_native(
            &registry,
            "napper",
            Arc::new(Sleeper {
                millis: 5000,
                cooperative: true,
            }),
        )
        .await;

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = sandbox
            .execute(
                &id,
                json!(null),
                Duration::from_secs(30),
                Caller::Operator,
                cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CancelRequested), "got {err}");
    }

    #[tokio::test]
    async fn test_quota_event_interrupts_execution() {
        let (registry, monitor, sandbox) = fixture();
        let id = register_native(
            &registry,
            "hog",
            Arc::new(Sleeper {
                millis: 10_000,
                cooperative: true,
            }),
        )
        .await;

        // Feed over-quota samples for the correlation owner while the
        // plugin runs. Correlation ids embed the plugin id.
        let monitor_feed = Arc::clone(&monitor);
        let feeder = tokio::spawn(async move {
            for _ in 0..50 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let mut sample = crate::domain::models::resource::ResourceSample::zero();
                sample.memory_mb = 10_000.0;
                monitor_feed.record_sample("exec-1-hog@1.0.0", sample).await;
            }
        });

        let err = sandbox
            .execute(
                &id,
                json!(null),
                Duration::from_secs(30),
                Caller::Operator,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        feeder.abort();
        assert!(
            matches!(err, RuntimeError::QuotaExceeded { .. }),
            "got {err}"
        );
    }

    #[tokio::test]
    async fn test_unknown_plugin() {
        let (_registry, _monitor, sandbox) = fixture();
        let err = sandbox
            .execute(
                "ghost@1.0.0",
                json!(null),
                Duration::from_secs(1),
                Caller::Operator,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::PluginNotFound(_)));
    }
}
