//! agentcron-gateway: REST API over the cron runtime.
//!
//! Provides:
//! - CRUD for scheduled tasks, manual runs and toggling
//! - Paged execution history and per-execution lookup/stop
//! - Executor stats, live executions and concurrency control
//! - Scheduler enable/disable and an aggregated status snapshot
//! - Optional bearer token authentication (everything but `/health`)
//! - Configuration hot-reload

pub mod config_watcher;
pub mod error;
pub mod handlers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use agentcron_config::GatewayConfig;
use agentcron_cron::CronRuntime;

pub use error::{ApiError, ApiResult};

/// Shared gateway state.
pub struct GatewayState {
    pub runtime: Arc<CronRuntime>,
    pub auth_token: Option<String>,
}

/// Assemble the HTTP router.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    let api = Router::new()
        .route(
            "/scheduled-tasks",
            get(handlers::list_tasks).post(handlers::create_task),
        )
        .route(
            "/scheduled-tasks/{id}",
            get(handlers::get_task)
                .put(handlers::update_task)
                .delete(handlers::delete_task),
        )
        .route("/scheduled-tasks/{id}/toggle", post(handlers::toggle_task))
        .route("/scheduled-tasks/{id}/run", post(handlers::run_task))
        .route(
            "/scheduled-tasks/{id}/executions",
            get(handlers::list_executions),
        )
        .route("/executions/{execution_id}", get(handlers::get_execution))
        .route(
            "/executions/{execution_id}/stop",
            post(handlers::stop_execution),
        )
        .route("/executor/running", get(handlers::running_executions))
        .route("/executor/stats", get(handlers::executor_stats))
        .route(
            "/executor/config",
            get(handlers::get_executor_config).put(handlers::put_executor_config),
        )
        .route("/scheduler/status", get(handlers::scheduler_status))
        .route("/scheduler/enable", post(handlers::scheduler_enable))
        .route("/scheduler/disable", post(handlers::scheduler_disable))
        .route("/status", get(handlers::status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the Gateway server and serve until `shutdown` is cancelled.
///
/// `config_path` enables hot-reload of the runtime-tunable settings.
pub async fn start_gateway(
    runtime: Arc<CronRuntime>,
    config: &GatewayConfig,
    port_override: Option<u16>,
    config_path: Option<PathBuf>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let port = port_override.unwrap_or(config.port);
    let addr: SocketAddr = format!("{}:{port}", config.host).parse()?;

    let watcher = config_path.and_then(|path| {
        config_watcher::start_config_watcher(runtime.clone(), path, shutdown.clone())
    });

    let state = Arc::new(GatewayState {
        runtime,
        auth_token: config.auth_token.clone(),
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Gateway listening on {addr}");
    info!("  REST:   http://{addr}/scheduled-tasks");
    info!("  Health: http://{addr}/health");
    if watcher.is_some() {
        info!("  Config watcher: active");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Gateway stopped");
    Ok(())
}

async fn require_auth(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected_token) = &state.auth_token {
        match extract_bearer_token(request.headers()) {
            Some(token) if token == expected_token => {}
            _ => {
                warn!(path = %request.uri().path(), "Authentication failed");
                return Err(ApiError::Unauthorized);
            }
        }
    }
    Ok(next.run(request).await)
}

/// Extract bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

#[cfg(test)]
mod tests {
    use super::*;

    use agentcron_config::AgentCronConfig;
    use agentcron_cron::{AgentInvoker, InvocationOutcome, InvocationRequest, SystemClock};
    use agentcron_storage::AgentCronStorage;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::StatusCode;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    /// Runs until cancelled.
    struct WaitForStop;

    #[async_trait]
    impl AgentInvoker for WaitForStop {
        async fn invoke(
            &self,
            _request: &InvocationRequest,
            cancel: CancellationToken,
        ) -> anyhow::Result<InvocationOutcome> {
            cancel.cancelled().await;
            Ok(InvocationOutcome::Cancelled)
        }
    }

    async fn router(auth_token: Option<&str>) -> Router {
        let mut config = AgentCronConfig::default();
        config.executor.stop_grace_secs = 1;
        let runtime = CronRuntime::new(
            AgentCronStorage::open_in_memory().unwrap(),
            Arc::new(WaitForStop),
            Arc::new(SystemClock),
            &config,
        );
        runtime.bootstrap().await.unwrap();
        build_router(Arc::new(GatewayState {
            runtime: Arc::new(runtime),
            auth_token: auth_token.map(String::from),
        }))
    }

    async fn api(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let body = match body {
            Some(v) => Body::from(serde_json::to_string(&v).unwrap()),
            None => Body::empty(),
        };
        let resp = router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    fn hourly_task() -> Value {
        json!({
            "name": "nightly report",
            "agentId": "writer",
            "schedule": {"type": "interval", "minutes": 60}
        })
    }

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer my-secret-token".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), Some("my-secret-token"));
    }

    #[test]
    fn test_extract_bearer_token_missing() {
        let headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn test_extract_bearer_token_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic abc123".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let r = router(Some("secret")).await;
        let (status, body) = api(&r, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = api(&r, "GET", "/scheduled-tasks", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHENTICATED");

        let req = Request::builder()
            .uri("/scheduled-tasks")
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let resp = r.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_task_crud() {
        let r = router(None).await;

        let (status, task) = api(&r, "POST", "/scheduled-tasks", Some(hourly_task())).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = task["id"].as_str().unwrap().to_string();
        assert_eq!(task["enabled"], true);
        assert!(task["nextRunAt"].is_string());
        assert_eq!(task["lastRunStatus"], "idle");

        let (status, list) = api(&r, "GET", "/scheduled-tasks", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, updated) = api(
            &r,
            "PUT",
            &format!("/scheduled-tasks/{id}"),
            Some(json!({"name": "morning report"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["name"], "morning report");

        let (status, toggled) =
            api(&r, "POST", &format!("/scheduled-tasks/{id}/toggle"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(toggled["enabled"], false);
        assert!(toggled["nextRunAt"].is_null());

        let (status, _) = api(&r, "DELETE", &format!("/scheduled-tasks/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = api(&r, "GET", &format!("/scheduled-tasks/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let r = router(None).await;
        let (status, body) = api(
            &r,
            "POST",
            "/scheduled-tasks",
            Some(json!({
                "name": "broken",
                "agentId": "writer",
                "schedule": {"type": "cron", "expression": "61 * * * *"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_SCHEDULE");

        let (status, body) = api(
            &r,
            "POST",
            "/scheduled-tasks",
            Some(json!({"name": "no schedule", "agentId": "writer"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn test_run_conflict_and_stop() {
        let r = router(None).await;
        let (_, task) = api(&r, "POST", "/scheduled-tasks", Some(hourly_task())).await;
        let id = task["id"].as_str().unwrap().to_string();

        let (status, body) = api(&r, "POST", &format!("/scheduled-tasks/{id}/run"), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let execution_id = body["executionId"].as_str().unwrap().to_string();

        let (status, body) = api(&r, "POST", &format!("/scheduled-tasks/{id}/run"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "ALREADY_RUNNING");

        let (_, running) = api(&r, "GET", "/executor/running", None).await;
        assert_eq!(running[0]["executionId"], execution_id.as_str());

        let (status, body) = api(
            &r,
            "POST",
            &format!("/executions/{execution_id}/stop"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stopped"], true);
        assert_eq!(body["outcome"], "signalled");

        let (status, _) = api(&r, "POST", "/executions/nope/stop", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let mut stopped = false;
        for _ in 0..50 {
            let (_, record) = api(&r, "GET", &format!("/executions/{execution_id}"), None).await;
            if record["status"] == "stopped" {
                stopped = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(stopped);

        let (status, page) = api(
            &r,
            "GET",
            &format!("/scheduled-tasks/{id}/executions?limit=5"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 1);
        assert_eq!(page["limit"], 5);
        assert_eq!(page["executions"][0]["trigger"], "manual");

        let (_, stats) = api(&r, "GET", "/executor/stats", None).await;
        assert_eq!(stats["stoppedTasks"], 1);
        assert_eq!(stats["runningTasks"], 0);
    }

    #[tokio::test]
    async fn test_scheduler_and_executor_controls() {
        let r = router(None).await;

        let (_, body) = api(&r, "POST", "/scheduler/disable", None).await;
        assert_eq!(body, json!({"enabled": false}));
        let (_, body) = api(&r, "GET", "/scheduler/status", None).await;
        assert_eq!(body, json!({"enabled": false}));
        let (_, body) = api(&r, "POST", "/scheduler/enable", None).await;
        assert_eq!(body, json!({"enabled": true}));

        let (status, body) = api(
            &r,
            "PUT",
            "/executor/config",
            Some(json!({"maxConcurrent": 7})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"maxConcurrent": 7}));

        let (status, body) = api(
            &r,
            "PUT",
            "/executor/config",
            Some(json!({"maxConcurrent": 11})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_FAILED");

        let (_, body) = api(&r, "GET", "/executor/config", None).await;
        assert_eq!(body, json!({"maxConcurrent": 7}));

        let (_, snapshot) = api(&r, "GET", "/status", None).await;
        assert_eq!(snapshot["schedulerEnabled"], true);
        assert_eq!(snapshot["maxConcurrent"], 7);
        assert_eq!(snapshot["executorStats"]["completedTasks"], 0);
    }
}
