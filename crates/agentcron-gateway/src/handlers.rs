//! REST handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::{Value, json};

use agentcron_types::{
    ActiveExecution, ExecutionPage, ExecutionRecord, ExecutorConfig, ExecutorStats, NewTask,
    ScheduledTask, SchedulerStatus, StatusSnapshot, TaskUpdate,
};

use crate::GatewayState;
use crate::error::ApiResult;

type AppState = State<Arc<GatewayState>>;

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /scheduled-tasks
pub async fn list_tasks(State(state): AppState) -> Json<Vec<ScheduledTask>> {
    Json(state.runtime.registry.list().await)
}

/// POST /scheduled-tasks
pub async fn create_task(
    State(state): AppState,
    payload: Result<Json<NewTask>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ScheduledTask>)> {
    let Json(new) = payload?;
    let task = state.runtime.registry.create(new).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// GET /scheduled-tasks/{id}
pub async fn get_task(
    State(state): AppState,
    Path(id): Path<String>,
) -> ApiResult<Json<ScheduledTask>> {
    Ok(Json(state.runtime.registry.get(&id).await?))
}

/// PUT /scheduled-tasks/{id}
pub async fn update_task(
    State(state): AppState,
    Path(id): Path<String>,
    payload: Result<Json<TaskUpdate>, JsonRejection>,
) -> ApiResult<Json<ScheduledTask>> {
    let Json(update) = payload?;
    Ok(Json(state.runtime.registry.update(&id, update).await?))
}

/// DELETE /scheduled-tasks/{id}
pub async fn delete_task(State(state): AppState, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.runtime.delete_task(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /scheduled-tasks/{id}/toggle
pub async fn toggle_task(
    State(state): AppState,
    Path(id): Path<String>,
) -> ApiResult<Json<ScheduledTask>> {
    Ok(Json(state.runtime.registry.toggle(&id).await?))
}

/// POST /scheduled-tasks/{id}/run
pub async fn run_task(
    State(state): AppState,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let execution_id = state.runtime.run_now(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "executionId": execution_id })),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// GET /scheduled-tasks/{id}/executions?limit&offset
pub async fn list_executions(
    State(state): AppState,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<ExecutionPage>> {
    state.runtime.registry.get(&id).await?;
    let page = state
        .runtime
        .history
        .page(&id, query.limit, query.offset)
        .await?;
    Ok(Json(page))
}

/// GET /executions/{executionId}
pub async fn get_execution(
    State(state): AppState,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<ExecutionRecord>> {
    Ok(Json(state.runtime.history.get(&execution_id).await?))
}

/// POST /executions/{executionId}/stop
pub async fn stop_execution(
    State(state): AppState,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let outcome = state.runtime.stop_execution(&execution_id).await?;
    Ok(Json(json!({ "stopped": true, "outcome": outcome })))
}

/// GET /executor/running
pub async fn running_executions(State(state): AppState) -> Json<Vec<ActiveExecution>> {
    Json(state.runtime.executor.active())
}

/// GET /executor/stats
pub async fn executor_stats(State(state): AppState) -> Json<ExecutorStats> {
    Json(state.runtime.executor.stats())
}

/// GET /executor/config
pub async fn get_executor_config(State(state): AppState) -> Json<ExecutorConfig> {
    Json(state.runtime.executor.config())
}

/// PUT /executor/config
pub async fn put_executor_config(
    State(state): AppState,
    payload: Result<Json<ExecutorConfig>, JsonRejection>,
) -> ApiResult<Json<ExecutorConfig>> {
    let Json(config) = payload?;
    let applied = state
        .runtime
        .executor
        .set_max_concurrent(config.max_concurrent)
        .await?;
    Ok(Json(applied))
}

/// GET /scheduler/status
pub async fn scheduler_status(State(state): AppState) -> Json<SchedulerStatus> {
    Json(state.runtime.scheduler.status())
}

/// POST /scheduler/enable
pub async fn scheduler_enable(State(state): AppState) -> Json<SchedulerStatus> {
    Json(state.runtime.scheduler.enable())
}

/// POST /scheduler/disable
pub async fn scheduler_disable(State(state): AppState) -> Json<SchedulerStatus> {
    Json(state.runtime.scheduler.disable())
}

/// GET /status
pub async fn status(State(state): AppState) -> Json<StatusSnapshot> {
    Json(state.runtime.status.snapshot())
}
