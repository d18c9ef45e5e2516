//! MCP server exposing the scheduler, policy engine, and metrics gateway
//! as tools over stdio transport using the rmcp SDK.
//!
//! Domain failures are reported as tool-level errors (`CallToolResult::error`)
//! so that clients see the reason instead of a protocol fault.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    tool, tool_handler, tool_router,
    transport::stdio,
    ErrorData as McpError, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;

use crate::config::Config;
use crate::metrics::{MetricsGateway, StreamSubscription, SysinfoSource};
use crate::policy::{EnergyWindow, Policy};
use crate::scheduler::{ProcessExecutor, TaskScheduler};
use crate::storage::SqliteStore;
use crate::types::{
    ResourceProfile, RunId, RunOutcome, StreamId, TaskConstraints, TaskFilter, TaskId, TaskState,
};

// ---------------------------------------------------------------------------
// Parameter structs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, JsonSchema)]
pub struct StreamStartParams {
    /// Sampling interval in milliseconds; the configured default when omitted
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct StreamStopParams {
    /// Stream id returned by metrics.stream_start
    pub stream_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnqueueParams {
    /// Human-readable task name
    pub name: String,
    /// Expected CPU share of total capacity, in (0, 1]
    pub cpu_share: f64,
    /// Expected peak resident memory in MiB
    pub memory_mb: u64,
    /// Estimated wall-clock duration in seconds
    pub est_duration_secs: u64,
    /// Prefer low-cost energy windows over immediate start
    pub energy_sensitive: Option<bool>,
    /// RFC 3339 instant before which the task must not start
    pub not_before: Option<String>,
    /// RFC 3339 instant by which the task must be admitted
    pub deadline: Option<String>,
    /// Shell command to execute; omit for advisory tasks driven via runs.start
    pub command: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListParams {
    /// Filter by lifecycle state (queued, admitted, running, completed, failed, cancelled)
    pub state: Option<String>,
    /// Only tasks submitted at or after this RFC 3339 instant
    pub submitted_after: Option<String>,
    /// Only tasks submitted at or before this RFC 3339 instant
    pub submitted_before: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CancelParams {
    /// Task id
    pub task_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnergyWindowParam {
    /// Window start, UTC time of day (HH:MM:SS)
    pub start: String,
    /// Window end, UTC time of day (HH:MM:SS); may wrap past midnight
    pub end: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PolicySetParams {
    /// Activate a named preset: performance, balanced, or battery-saver
    pub preset: Option<String>,
    /// Name for a custom policy (required when no preset is given)
    pub name: Option<String>,
    /// Maximum number of concurrently running tasks
    pub max_concurrent: Option<usize>,
    /// Tolerated CPU overcommit margin, e.g. 0.15
    pub cpu_headroom: Option<f64>,
    /// Free memory to keep in reserve, in MiB
    pub mem_reserve_mb: Option<u64>,
    /// Minimum battery percentage for admission while unplugged
    pub battery_min_pct: Option<f64>,
    /// Preferred windows for energy-sensitive tasks
    pub energy_windows: Option<Vec<EnergyWindowParam>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SimulateParams {
    /// Expected CPU share of total capacity, in (0, 1]
    pub cpu_share: f64,
    /// Expected peak resident memory in MiB
    pub memory_mb: u64,
    /// Estimated wall-clock duration in seconds
    pub est_duration_secs: u64,
    /// Prefer low-cost energy windows over immediate start
    pub energy_sensitive: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunStartParams {
    /// Task id to open a run for
    pub task_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunEndParams {
    /// Run id returned by runs.start
    pub run_id: String,
    /// Final outcome: succeeded, failed, cancelled, or cancelled_forced
    pub outcome: String,
    /// Optional detail recorded as the failure reason
    pub detail: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UsageStatsParams {
    /// Range start (RFC 3339) on run start time
    pub from: Option<String>,
    /// Range end (RFC 3339) on run start time
    pub until: Option<String>,
}

// ---------------------------------------------------------------------------
// Server struct
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EdgehelmMcpServer {
    scheduler: Arc<TaskScheduler>,
    metrics: Arc<MetricsGateway>,
    /// Live subscriptions; holding them keeps the sampling tasks alive.
    subscriptions: Arc<DashMap<StreamId, StreamSubscription>>,
    default_stream_interval: Duration,
    tool_router: ToolRouter<Self>,
}

fn tool_error(message: impl std::fmt::Display) -> CallToolResult {
    CallToolResult::error(vec![Content::text(message.to_string())])
}

fn tool_json(value: serde_json::Value) -> CallToolResult {
    let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
    CallToolResult::success(vec![Content::text(text)])
}

fn parse_instant(field: &str, value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("{field} must be an RFC 3339 timestamp: {e}"))
}

fn parse_opt_instant(field: &str, value: &Option<String>) -> Result<Option<DateTime<Utc>>, String> {
    value.as_deref().map(|v| parse_instant(field, v)).transpose()
}

// ---------------------------------------------------------------------------
// Tool definitions
// ---------------------------------------------------------------------------

#[tool_router]
impl EdgehelmMcpServer {
    pub fn new(
        scheduler: Arc<TaskScheduler>,
        metrics: Arc<MetricsGateway>,
        default_stream_interval: Duration,
    ) -> Self {
        Self {
            scheduler,
            metrics,
            subscriptions: Arc::new(DashMap::new()),
            default_stream_interval,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        name = "metrics.snapshot",
        description = "Collect a point-in-time snapshot of host resource utilization: CPU load, memory, power state, and top processes."
    )]
    async fn metrics_snapshot(&self) -> Result<CallToolResult, McpError> {
        match self.metrics.snapshot().await {
            Ok(snapshot) => Ok(tool_json(serde_json::to_value(&*snapshot).unwrap_or_default())),
            Err(e) => Ok(tool_error(format!("snapshot failed: {e}"))),
        }
    }

    #[tool(
        name = "metrics.stream_start",
        description = "Start a periodic metrics stream at the given interval. Returns a stream id. Delivery is latest-wins per subscriber; a slow consumer never sees stale backlog."
    )]
    async fn metrics_stream_start(
        &self,
        Parameters(params): Parameters<StreamStartParams>,
    ) -> Result<CallToolResult, McpError> {
        let interval = params
            .interval_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_stream_interval);
        match self.metrics.stream_start(interval) {
            Ok(subscription) => {
                let id = subscription.id;
                self.subscriptions.insert(id, subscription);
                Ok(tool_json(serde_json::json!({
                    "stream_id": id.to_string(),
                    "interval_ms": interval.as_millis() as u64,
                })))
            }
            Err(e) => Ok(tool_error(e)),
        }
    }

    #[tool(
        name = "metrics.stream_stop",
        description = "Stop a metrics stream previously started with metrics.stream_start."
    )]
    async fn metrics_stream_stop(
        &self,
        Parameters(params): Parameters<StreamStopParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = match StreamId::from_str(&params.stream_id) {
            Ok(id) => id,
            Err(_) => return Ok(tool_error("stream_id is not a valid id")),
        };
        self.subscriptions.remove(&id);
        match self.metrics.stream_stop(id) {
            Ok(()) => Ok(tool_json(serde_json::json!({ "stopped": id.to_string() }))),
            Err(e) => Ok(tool_error(e)),
        }
    }

    #[tool(
        name = "scheduler.enqueue",
        description = "Submit a task with a resource profile and optional time constraints. The task waits in the queue until the active policy admits it."
    )]
    async fn scheduler_enqueue(
        &self,
        Parameters(params): Parameters<EnqueueParams>,
    ) -> Result<CallToolResult, McpError> {
        let constraints = match (
            parse_opt_instant("not_before", &params.not_before),
            parse_opt_instant("deadline", &params.deadline),
        ) {
            (Ok(not_before), Ok(deadline)) => TaskConstraints {
                not_before,
                deadline,
            },
            (Err(e), _) | (_, Err(e)) => return Ok(tool_error(e)),
        };
        let profile = ResourceProfile {
            cpu_share: params.cpu_share,
            memory_mb: params.memory_mb,
            est_duration: Duration::from_secs(params.est_duration_secs),
            energy_sensitive: params.energy_sensitive.unwrap_or(false),
        };
        match self
            .scheduler
            .enqueue(params.name, profile, constraints, params.command)
            .await
        {
            Ok(task_id) => Ok(tool_json(serde_json::json!({
                "task_id": task_id.to_string(),
                "state": TaskState::Queued.to_string(),
            }))),
            Err(e) => Ok(tool_error(e)),
        }
    }

    #[tool(
        name = "scheduler.list",
        description = "List tasks, optionally filtered by state and submission time window. Oldest first."
    )]
    async fn scheduler_list(
        &self,
        Parameters(params): Parameters<ListParams>,
    ) -> Result<CallToolResult, McpError> {
        let state = match params.state.as_deref().map(TaskState::from_str).transpose() {
            Ok(state) => state,
            Err(e) => return Ok(tool_error(e)),
        };
        let filter = match (
            parse_opt_instant("submitted_after", &params.submitted_after),
            parse_opt_instant("submitted_before", &params.submitted_before),
        ) {
            (Ok(submitted_after), Ok(submitted_before)) => TaskFilter {
                state,
                submitted_after,
                submitted_before,
            },
            (Err(e), _) | (_, Err(e)) => return Ok(tool_error(e)),
        };
        let tasks = self.scheduler.list(&filter);
        Ok(tool_json(serde_json::to_value(&tasks).unwrap_or_default()))
    }

    #[tool(
        name = "scheduler.cancel",
        description = "Cancel a task. Queued and admitted tasks are cancelled immediately; running tasks get a grace period to stop before a forced kill."
    )]
    async fn scheduler_cancel(
        &self,
        Parameters(params): Parameters<CancelParams>,
    ) -> Result<CallToolResult, McpError> {
        let task_id = match TaskId::from_str(&params.task_id) {
            Ok(id) => id,
            Err(_) => return Ok(tool_error("task_id is not a valid id")),
        };
        match self.scheduler.cancel(task_id).await {
            Ok(state) => Ok(tool_json(serde_json::json!({
                "task_id": task_id.to_string(),
                "state": state.to_string(),
            }))),
            Err(e) => Ok(tool_error(e)),
        }
    }

    #[tool(
        name = "scheduler.policy_set",
        description = "Activate an admission policy: either a preset (performance, balanced, battery-saver) or a custom policy. Returns the new policy version."
    )]
    async fn scheduler_policy_set(
        &self,
        Parameters(params): Parameters<PolicySetParams>,
    ) -> Result<CallToolResult, McpError> {
        let policy = if let Some(preset) = params.preset.as_deref() {
            match Policy::preset(preset) {
                Ok(policy) => policy,
                Err(e) => return Ok(tool_error(e)),
            }
        } else {
            let Some(name) = params.name else {
                return Ok(tool_error("either 'preset' or 'name' must be provided"));
            };
            let mut windows = Vec::new();
            for window in params.energy_windows.unwrap_or_default() {
                let parse = |field: &str, value: &str| {
                    value.parse::<chrono::NaiveTime>().map_err(|e| {
                        format!("energy window {field} must be HH:MM:SS: {e}")
                    })
                };
                match (parse("start", &window.start), parse("end", &window.end)) {
                    (Ok(start), Ok(end)) => windows.push(EnergyWindow { start, end }),
                    (Err(e), _) | (_, Err(e)) => return Ok(tool_error(e)),
                }
            }
            Policy {
                name,
                version: Default::default(),
                max_concurrent: params.max_concurrent.unwrap_or(2),
                cpu_headroom: params.cpu_headroom.unwrap_or(0.15),
                mem_reserve_mb: params.mem_reserve_mb.unwrap_or(1024),
                battery_min_pct: params.battery_min_pct,
                energy_windows: windows,
            }
        };
        match self.scheduler.set_policy(policy).await {
            Ok(version) => {
                let active = self.scheduler.active_policy();
                Ok(tool_json(serde_json::json!({
                    "policy": active.name,
                    "version": version.0,
                })))
            }
            Err(e) => Ok(tool_error(e)),
        }
    }

    #[tool(
        name = "scheduler.simulate",
        description = "Evaluate a resource profile against the active policy and current host metrics without enqueuing anything. Returns the admission decision with reasons and any recommended energy window."
    )]
    async fn scheduler_simulate(
        &self,
        Parameters(params): Parameters<SimulateParams>,
    ) -> Result<CallToolResult, McpError> {
        let profile = ResourceProfile {
            cpu_share: params.cpu_share,
            memory_mb: params.memory_mb,
            est_duration: Duration::from_secs(params.est_duration_secs),
            energy_sensitive: params.energy_sensitive.unwrap_or(false),
        };
        match self.scheduler.simulate(&profile).await {
            Ok(decision) => Ok(tool_json(
                serde_json::to_value(&decision).unwrap_or_default(),
            )),
            Err(e) => Ok(tool_error(e)),
        }
    }

    #[tool(
        name = "runs.start",
        description = "Open a run for a task whose work is executed by the caller. A queued task is admitted and marked running in one step."
    )]
    async fn runs_start(
        &self,
        Parameters(params): Parameters<RunStartParams>,
    ) -> Result<CallToolResult, McpError> {
        let task_id = match TaskId::from_str(&params.task_id) {
            Ok(id) => id,
            Err(_) => return Ok(tool_error("task_id is not a valid id")),
        };
        match self.scheduler.start_run(task_id).await {
            Ok(run) => Ok(tool_json(serde_json::json!({
                "run_id": run.id.to_string(),
                "task_id": task_id.to_string(),
                "started_at": run.started_at.to_rfc3339(),
            }))),
            Err(e) => Ok(tool_error(e)),
        }
    }

    #[tool(
        name = "runs.end",
        description = "Close an open run with its final outcome (succeeded, failed, cancelled, cancelled_forced). Terminalizes the task accordingly."
    )]
    async fn runs_end(
        &self,
        Parameters(params): Parameters<RunEndParams>,
    ) -> Result<CallToolResult, McpError> {
        let run_id = match RunId::from_str(&params.run_id) {
            Ok(id) => id,
            Err(_) => return Ok(tool_error("run_id is not a valid id")),
        };
        let outcome = match RunOutcome::from_label(&params.outcome) {
            Some(RunOutcome::Interrupted) | None => {
                return Ok(tool_error(
                    "outcome must be one of: succeeded, failed, cancelled, cancelled_forced",
                ))
            }
            Some(outcome) => outcome,
        };
        match self.scheduler.end_run(run_id, outcome, params.detail).await {
            Ok(run) => Ok(tool_json(serde_json::json!({
                "run_id": run.id.to_string(),
                "task_id": run.task_id.to_string(),
                "outcome": outcome.to_string(),
            }))),
            Err(e) => Ok(tool_error(e)),
        }
    }

    #[tool(
        name = "usage.stats",
        description = "Aggregate closed-run statistics (count, total and average duration) bucketed by outcome, over an optional time range."
    )]
    async fn usage_stats(
        &self,
        Parameters(params): Parameters<UsageStatsParams>,
    ) -> Result<CallToolResult, McpError> {
        let (from, until) = match (
            parse_opt_instant("from", &params.from),
            parse_opt_instant("until", &params.until),
        ) {
            (Ok(from), Ok(until)) => (from, until),
            (Err(e), _) | (_, Err(e)) => return Ok(tool_error(e)),
        };
        match self.scheduler.usage_stats(from, until).await {
            Ok(stats) => Ok(tool_json(serde_json::to_value(&stats).unwrap_or_default())),
            Err(e) => Ok(tool_error(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// ServerHandler — #[tool_handler] auto-generates list_tools + call_tool
// ---------------------------------------------------------------------------

#[tool_handler]
impl ServerHandler for EdgehelmMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "edgehelm host copilot — observe host metrics, submit and manage \
                 resource-profiled tasks, tune admission policies, and account \
                 for completed work"
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Wire up the runtime from config and serve MCP over stdio until the client
/// disconnects. Storage being unavailable at boot is fatal.
pub async fn start_mcp_server(config: Config) -> anyhow::Result<()> {
    // Direct tracing to stderr — stdout is the MCP transport channel
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let db_path = config
        .storage
        .path
        .clone()
        .unwrap_or_else(SqliteStore::default_path);
    let store = Arc::new(SqliteStore::open(&db_path)?);
    tracing::info!(path = %db_path.display(), "storage opened");

    let source = Arc::new(SysinfoSource::new(config.metrics.top_processes));
    let metrics = Arc::new(MetricsGateway::new(source));

    let log_dir = db_path
        .parent()
        .map(|p| p.join("logs"))
        .unwrap_or_else(|| std::path::PathBuf::from("logs"));
    let executor = Arc::new(ProcessExecutor::new(log_dir));

    let scheduler = TaskScheduler::new(
        config.scheduler.clone(),
        store,
        Arc::clone(&metrics),
        executor,
    )
    .await?;
    scheduler.start();

    let server = EdgehelmMcpServer::new(
        Arc::clone(&scheduler),
        metrics,
        config.metrics.default_stream_interval,
    );
    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    scheduler.stop().await;
    Ok(())
}
