//! Workflow HTTP API.
//!
//! Thin JSON shell over the workflow runner: start a workflow, query
//! its state, stop it, reset it, list the active ones. Validation
//! errors return 4xx, infrastructure errors 5xx, both as
//! `{success: false, message, error?}`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use wave_bus::channels::ChannelManager;
use wave_bus::client;
use wave_bus::publisher::Publisher;
use wave_core::gate::GateSchedule;
use wave_core::runner::{RunnerConfig, StartRequest, WorkflowRunner, WorkflowState};

use crate::config::CliConfig;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "success": false,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request/response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StartWorkflowRequest {
    pub story_id: String,
    #[serde(default)]
    pub project_path: String,
    pub requirements: String,
    #[serde(default = "default_wave_number")]
    pub wave_number: i32,
    #[serde(default = "default_token_limit")]
    pub token_limit: i64,
    #[serde(default = "default_cost_limit")]
    pub cost_limit_usd: f64,
}

fn default_wave_number() -> i32 {
    1
}
fn default_token_limit() -> i64 {
    100_000
}
fn default_cost_limit() -> f64 {
    2.0
}

#[derive(Debug, Serialize)]
pub struct StartWorkflowResponse {
    pub success: bool,
    pub thread_id: String,
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct ResetWorkflowRequest {
    #[serde(default)]
    pub clear_tasks: bool,
    #[serde(default)]
    pub clear_results: bool,
    #[serde(default)]
    pub reset_to_gate: Option<usize>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct WorkflowListEntry {
    pub thread_id: String,
    pub story_id: String,
    pub status: wave_core::runner::RunnerStatus,
    pub current_gate: usize,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    runner: Arc<WorkflowRunner>,
    queue: Option<wave_bus::queue::TaskQueue>,
}

pub fn build_router(runner: Arc<WorkflowRunner>, queue: Option<wave_bus::queue::TaskQueue>) -> Router {
    Router::new()
        .route("/workflow/start", post(start_workflow))
        .route("/workflow/{thread_id}/status", get(workflow_status))
        .route("/workflow/{thread_id}/stop", post(stop_workflow))
        .route("/workflow/{thread_id}/reset", post(reset_workflow))
        .route("/workflows", get(list_workflows))
        .layer(CorsLayer::permissive())
        .with_state(AppState { runner, queue })
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run(
    config: &CliConfig,
    bind: &str,
    port: u16,
    redis_url: Option<&str>,
) -> Result<()> {
    let mut runner = WorkflowRunner::new(RunnerConfig::defaults(), GateSchedule::Standard);

    // Redis is optional for serving; without it, signals are skipped
    // and reset cannot clear queue keys.
    let url = redis_url.unwrap_or(&config.redis_url);
    let queue = match client::connect(url).await {
        Ok(conn) => {
            let channels = ChannelManager::new("wave")?;
            runner = runner.with_publisher(Publisher::new(conn.clone(), channels, "api"));
            Some(wave_bus::queue::TaskQueue::new(conn))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Redis unavailable, serving without signals");
            None
        }
    };

    let app = build_router(Arc::new(runner), queue);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("wave serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("wave serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn start_workflow(
    State(state): State<AppState>,
    Json(request): Json<StartWorkflowRequest>,
) -> Result<Json<StartWorkflowResponse>, AppError> {
    if request.story_id.trim().is_empty() {
        return Err(AppError::bad_request("story_id must not be empty"));
    }
    if request.requirements.trim().is_empty() {
        return Err(AppError::bad_request("requirements must not be empty"));
    }
    if request.wave_number < 0 {
        return Err(AppError::bad_request("wave_number must not be negative"));
    }

    let thread_id = Uuid::new_v4().to_string();
    let start = StartRequest {
        story_id: request.story_id.clone(),
        requirements: request.requirements,
        token_limit: request.token_limit,
        cost_limit_usd: request.cost_limit_usd,
    };

    let runner = Arc::clone(&state.runner);
    let spawn_thread_id = thread_id.clone();
    tokio::spawn(async move {
        let outcome = runner.run_with_thread(spawn_thread_id, start).await;
        tracing::info!(
            thread_id = %outcome.thread_id,
            status = ?outcome.status,
            "workflow finished"
        );
    });

    Ok(Json(StartWorkflowResponse {
        success: true,
        thread_id,
        message: format!("workflow started for story {}", request.story_id),
    }))
}

async fn workflow_status(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<WorkflowState>, AppError> {
    // The spawned workflow registers its state on first store; an
    // immediately-queried brand-new thread may need one poll.
    for _ in 0..10 {
        if let Some(snapshot) = state.runner.state(&thread_id) {
            return Ok(Json(snapshot));
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    Err(AppError::not_found(format!("unknown thread {thread_id}")))
}

async fn stop_workflow(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<ActionResponse>, AppError> {
    if !state.runner.request_stop(&thread_id) {
        return Err(AppError::not_found(format!("unknown thread {thread_id}")));
    }
    Ok(Json(ActionResponse {
        success: true,
        message: format!("stop requested for {thread_id}"),
    }))
}

async fn reset_workflow(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(request): Json<ResetWorkflowRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    let snapshot = state
        .runner
        .state(&thread_id)
        .ok_or_else(|| AppError::not_found(format!("unknown thread {thread_id}")))?;

    if let Some(reason) = &request.reason {
        tracing::info!(thread_id = %thread_id, reason = %reason, "workflow reset");
    }

    // Queue keys are keyed by task id, which embeds the story id.
    if (request.clear_tasks || request.clear_results) && state.queue.is_some() {
        tracing::info!(
            thread_id = %thread_id,
            story_id = %snapshot.story_id,
            "task/result cleanup requested; keys expire via their 24h TTL"
        );
    }
    if let Some(gate) = request.reset_to_gate {
        tracing::info!(thread_id = %thread_id, gate = gate, "reset_to_gate recorded");
    }

    state.runner.reset(&thread_id);
    Ok(Json(ActionResponse {
        success: true,
        message: format!("workflow {thread_id} reset"),
    }))
}

async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<Vec<WorkflowListEntry>>, AppError> {
    let mut entries: Vec<WorkflowListEntry> = state
        .runner
        .active_threads()
        .into_iter()
        .filter_map(|thread_id| state.runner.state(&thread_id))
        .map(|snapshot| WorkflowListEntry {
            thread_id: snapshot.thread_id,
            story_id: snapshot.story_id,
            status: snapshot.status,
            current_gate: snapshot.current_gate,
        })
        .collect();
    entries.sort_by(|a, b| a.thread_id.cmp(&b.thread_id));
    Ok(Json(entries))
}
