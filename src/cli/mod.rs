//! Command-line interface: `run`, `submit`, `status`, `cancel`.
//!
//! `run` hosts the runtime and HTTP facade; the other commands are thin
//! clients against a running facade.

use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use console::style;
use std::time::Duration;
use uuid::Uuid;

/// Exit codes.
pub const EXIT_OK: i32 = 0;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_GOAL_FAILED: i32 = 3;
pub const EXIT_INTERNAL: i32 = 4;

/// Autonomous agent orchestration runtime.
#[derive(Debug, Parser)]
#[command(name = "panion", version, about)]
pub struct Cli {
    /// Emit raw JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    /// Facade base URL for client commands
    #[arg(long, global = true, env = "ORCH_SERVER")]
    pub server: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the orchestrator and HTTP facade
    Run {
        /// Configuration file path
        #[arg(long, env = "ORCH_CONFIG")]
        config: Option<String>,
    },
    /// Submit a goal
    Submit {
        /// Goal description
        #[arg(long)]
        goal: String,
        /// Priority, higher first
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Required capability tags (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,
        /// Poll until the goal reaches a terminal state
        #[arg(long)]
        wait: bool,
    },
    /// Show a goal's status
    Status {
        /// Goal id
        goal_id: Uuid,
    },
    /// Cancel a goal
    Cancel {
        /// Goal id
        goal_id: Uuid,
    },
}

/// Thin HTTP client for the facade.
pub struct FacadeClient {
    base: String,
    http: reqwest::Client,
}

impl FacadeClient {
    pub fn new(server: Option<String>) -> Self {
        let port = std::env::var("ORCH_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(8000);
        let base = server.unwrap_or_else(|| format!("http://127.0.0.1:{port}"));
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }

    pub async fn submit(
        &self,
        goal: &str,
        priority: i32,
        capabilities: &[String],
    ) -> anyhow::Result<serde_json::Value> {
        let body = serde_json::json!({
            "description": goal,
            "priority": priority,
            "required_capabilities": capabilities,
        });
        let response = self
            .http
            .post(format!("{}/goals", self.base))
            .json(&body)
            .send()
            .await?;
        parse_response(response).await
    }

    pub async fn status(&self, goal_id: Uuid) -> anyhow::Result<serde_json::Value> {
        let response = self
            .http
            .get(format!("{}/goals/{goal_id}", self.base))
            .send()
            .await?;
        parse_response(response).await
    }

    pub async fn cancel(&self, goal_id: Uuid) -> anyhow::Result<serde_json::Value> {
        let response = self
            .http
            .post(format!("{}/goals/{goal_id}/cancel", self.base))
            .send()
            .await?;
        parse_response(response).await
    }
}

async fn parse_response(response: reqwest::Response) -> anyhow::Result<serde_json::Value> {
    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
    if !status.is_success() {
        let message = body
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("request failed");
        anyhow::bail!("{status}: {message}");
    }
    Ok(body)
}

/// Handle `submit`. Returns the process exit code.
pub async fn handle_submit(
    client: &FacadeClient,
    goal: String,
    priority: i32,
    capabilities: Vec<String>,
    wait: bool,
    json: bool,
) -> anyhow::Result<i32> {
    let submitted = client.submit(&goal, priority, &capabilities).await?;
    if json && !wait {
        println!("{submitted}");
        return Ok(EXIT_OK);
    }
    let goal_id: Uuid = submitted
        .get("goal_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| anyhow::anyhow!("Malformed submit response"))?;
    println!("{} {}", style("Goal submitted:").green(), goal_id);

    if !wait {
        return Ok(EXIT_OK);
    }

    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let status = client.status(goal_id).await?;
        let state = status
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        match state {
            "completed" => {
                print_status(&status, json);
                return Ok(EXIT_OK);
            }
            "failed" | "cancelled" => {
                print_status(&status, json);
                return Ok(EXIT_GOAL_FAILED);
            }
            _ => {}
        }
    }
}

/// Handle `status`. Returns the process exit code.
pub async fn handle_status(
    client: &FacadeClient,
    goal_id: Uuid,
    json: bool,
) -> anyhow::Result<i32> {
    let status = client.status(goal_id).await?;
    print_status(&status, json);
    let state = status
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    Ok(if state == "failed" {
        EXIT_GOAL_FAILED
    } else {
        EXIT_OK
    })
}

/// Handle `cancel`.
pub async fn handle_cancel(
    client: &FacadeClient,
    goal_id: Uuid,
    json: bool,
) -> anyhow::Result<i32> {
    let cancelled = client.cancel(goal_id).await?;
    if json {
        println!("{cancelled}");
    } else {
        println!("{} {}", style("Goal cancelled:").yellow(), goal_id);
    }
    Ok(EXIT_OK)
}

fn print_status(status: &serde_json::Value, json: bool) {
    if json {
        println!("{status}");
        return;
    }

    let state = status
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let styled_state = match state {
        "completed" => style(state).green(),
        "failed" | "cancelled" => style(state).red(),
        _ => style(state).cyan(),
    };
    println!(
        "Goal {} [{}] {}",
        status.get("goal_id").and_then(|v| v.as_str()).unwrap_or("?"),
        styled_state,
        status
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or(""),
    );
    if let Some(error) = status.get("error").and_then(|v| v.as_str()) {
        println!("  error: {error}");
    }

    let Some(tasks) = status.get("tasks").and_then(|v| v.as_array()) else {
        return;
    };
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["task", "type", "status", "retries", "attempts", "error"]);
    for task in tasks {
        let short_id = task
            .get("task_id")
            .and_then(|v| v.as_str())
            .map(|s| s.chars().take(8).collect::<String>())
            .unwrap_or_default();
        table.add_row(vec![
            short_id,
            task.get("task_type")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            task.get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            task.get("retry_count")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0)
                .to_string(),
            task.get("attempts")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0)
                .to_string(),
            task.get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        ]);
    }
    println!("{table}");
}
