//! Plugin runner: the container-mode execution boundary.
//!
//! Loads a materialized plugin directory, serves exactly one `execute`
//! request over stdin/stdout using the newline-delimited JSON protocol,
//! and exits. The sandbox owns the process lifecycle.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use panion::domain::ports::{ExecutionContext, Plugin};
use panion::infrastructure::wire::{decode_request, WireResponse};
use panion::services::transform::TransformPlugin;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let Some(plugin_dir) = std::env::args().nth(1).map(PathBuf::from) else {
        eprintln!("usage: panion-plugin <plugin-dir>");
        return ExitCode::from(2);
    };

    let plugin = match TransformPlugin::load(&plugin_dir) {
        Ok(plugin) => plugin,
        Err(e) => {
            eprintln!("failed to load plugin from {}: {e}", plugin_dir.display());
            return ExitCode::from(1);
        }
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let line = match lines.next_line().await {
        Ok(Some(line)) => line,
        Ok(None) => return ExitCode::from(1),
        Err(e) => {
            eprintln!("failed reading request: {e}");
            return ExitCode::from(1);
        }
    };

    let request = match decode_request(&line) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("bad request: {e}");
            return ExitCode::from(1);
        }
    };

    let deadline = Duration::from_millis(request.deadline_ms.max(1));
    let started = std::time::Instant::now();
    let ctx = ExecutionContext::new(
        request.corr.clone(),
        chrono::Utc::now() + chrono::Duration::milliseconds(request.deadline_ms as i64),
    );

    let outcome = tokio::time::timeout(deadline, plugin.execute(request.input, &ctx)).await;
    let duration_ms = started.elapsed().as_millis() as f64;

    let response = match outcome {
        Ok(Ok(result)) => {
            WireResponse::success(&request.corr, result).with_metric("duration_ms", duration_ms)
        }
        Ok(Err(e)) => {
            WireResponse::failure(&request.corr, e.to_string()).with_metric("duration_ms", duration_ms)
        }
        Err(_) => WireResponse::failure(&request.corr, "deadline exceeded")
            .with_metric("duration_ms", duration_ms),
    };

    let Ok(encoded) = response.encode() else {
        return ExitCode::from(1);
    };
    let mut stdout = tokio::io::stdout();
    if stdout.write_all(encoded.as_bytes()).await.is_err() {
        return ExitCode::from(1);
    }
    let _ = stdout.flush().await;
    ExitCode::SUCCESS
}
