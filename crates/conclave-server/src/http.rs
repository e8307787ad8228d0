use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;
use uuid::Uuid;

use conclave_core::{ProgressHub, RuntimeError};
use conclave_types::{IntermediateState, Task, TaskStatus};

use crate::AppState;

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        let status = match &err {
            RuntimeError::QuotaExceeded => StatusCode::FORBIDDEN,
            RuntimeError::NotFound => StatusCode::NOT_FOUND,
            RuntimeError::NotOwner => StatusCode::FORBIDDEN,
            RuntimeError::WrongStatus { .. } => StatusCode::BAD_REQUEST,
            RuntimeError::InvalidState(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RuntimeError::Internal(inner) => {
                warn!("internal error: {inner:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.message }))).into_response()
    }
}

/// Authentication is handled upstream; the gateway injects the authenticated
/// principal as `x-user-id`.
fn require_user(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from)
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "missing x-user-id header"))
}

async fn owned_task(state: &AppState, task_id: &str, user_id: &str) -> Result<Task, ApiError> {
    let task = state
        .runtime
        .get_task(task_id)
        .await
        .ok_or(RuntimeError::NotFound)?;
    if task.user_id != user_id {
        return Err(RuntimeError::NotOwner.into());
    }
    Ok(task)
}

#[derive(Debug, Deserialize)]
struct TaskCreateBody {
    scene: String,
    user_input: String,
}

#[derive(Debug, Deserialize)]
struct AnswersBody {
    #[serde(default)]
    answers: BTreeMap<u32, String>,
    #[serde(default)]
    intermediate_state: IntermediateState,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    20
}

async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TaskCreateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = require_user(&headers)?;
    let response = state
        .runtime
        .create_task(&user_id, &body.scene, &body.user_input)
        .await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn submit_answers(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AnswersBody>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = require_user(&headers)?;
    let task = owned_task(&state, &task_id, &user_id).await?;
    if task.status != TaskStatus::Inquiring {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("task is in state `{}`", task.status.as_str()),
        ));
    }
    let response = state
        .runtime
        .submit_answers(&task_id, body.answers, body.intermediate_state)
        .await?;
    Ok(Json(response))
}

async fn start_processing(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = require_user(&headers)?;
    let task = owned_task(&state, &task_id, &user_id).await?;

    // Idempotent against a worker that already won the race.
    match task.status {
        TaskStatus::Processing => {
            return Ok(Json(json!({
                "task_id": task_id,
                "status": "processing",
                "message": "task is already processing",
            })))
        }
        TaskStatus::Completed => {
            return Ok(Json(json!({
                "task_id": task_id,
                "status": "completed",
                "message": "task is already completed",
            })))
        }
        TaskStatus::ReadyForProcessing => {}
        other => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("task is in state `{}`", other.as_str()),
            ))
        }
    }

    match state.runtime.start_processing(&task_id).await {
        Ok(response) => Ok(Json(json!({
            "task_id": response.task_id,
            "status": response.status,
            "message": response.message,
        }))),
        // Lost the CAS race after our status read; report the winner's state.
        Err(RuntimeError::WrongStatus { current })
            if current == "processing" || current == "completed" =>
        {
            Ok(Json(json!({
                "task_id": task_id,
                "status": current,
                "message": "task was already started elsewhere",
            })))
        }
        Err(err) => Err(err.into()),
    }
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Task>, ApiError> {
    let user_id = require_user(&headers)?;
    let task = owned_task(&state, &task_id, &user_id).await?;
    Ok(Json(task))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = require_user(&headers)?;
    let limit = page.limit.clamp(1, 100);
    Ok(Json(
        state.runtime.list_tasks(&user_id, limit, page.offset).await,
    ))
}

async fn get_progress(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = require_user(&headers)?;
    owned_task(&state, &task_id, &user_id).await?;
    let items = state.runtime.hub().get_full_progress(&task_id).await;
    Ok((
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        Json(items),
    ))
}

/// Keeps the hub registration alive as long as the SSE stream; dropping the
/// stream unsubscribes.
struct SubscriberGuard {
    hub: ProgressHub,
    subscriber_id: String,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        let hub = self.hub.clone();
        let subscriber_id = self.subscriber_id.clone();
        tokio::spawn(async move {
            hub.unsubscribe(&subscriber_id).await;
        });
    }
}

async fn task_events(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let user_id = require_user(&headers)?;
    owned_task(&state, &task_id, &user_id).await?;

    let subscriber_id = format!("sse-{}", Uuid::new_v4());
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let hub = state.runtime.hub().clone();
    hub.subscribe(&task_id, &subscriber_id, tx).await;
    let guard = SubscriberGuard {
        hub,
        subscriber_id,
    };

    let joined = tokio_stream::once(Ok(Event::default().data(
        serde_json::to_string(&json!({"type": "joined", "task_id": task_id}))
            .unwrap_or_default(),
    )));
    let live = UnboundedReceiverStream::new(rx).map(move |event| {
        let _keep = &guard;
        let payload = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().data(payload))
    });
    Ok(Sse::new(joined.chain(live))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10))))
}

async fn upstream_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.stats().await)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

fn cors_layer(origins: &str) -> CorsLayer {
    if origins.trim() == "*" {
        warn!("CORS is set to '*'; tighten CORS_ORIGINS for production");
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .split(',')
        .filter_map(|origin| origin.trim().parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn app_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);
    Router::new()
        .route("/health", get(health))
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/answers", post(submit_answers))
        .route("/tasks/{id}/start-processing", post(start_processing))
        .route("/tasks/{id}/progress", get(get_progress))
        .route("/tasks/{id}/events", get(task_events))
        .route("/upstreams/stats", get(upstream_stats))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_state;
    use axum::body::Body;
    use axum::http::Request;
    use conclave_core::EngineConfig;
    use conclave_providers::RetryPolicy;
    use conclave_types::UserRecord;
    use tower::ServiceExt;

    /// Upstreams point at an unroutable port: every chat call fails fast
    /// (original retry policy), so creation always degrades into the inquiry
    /// path with generic questions. That exercises the full HTTP surface
    /// without any live model.
    async fn test_state(dir: &std::path::Path) -> AppState {
        let mut config = EngineConfig::from_env();
        config.state_dir = dir.to_path_buf();
        config.retry = RetryPolicy::original();
        config.quota_enabled = true;
        config.cors_origins = "*".to_string();
        config.meta_endpoint.base_url = "http://127.0.0.1:9".to_string();
        config.ai_a_endpoint.base_url = "http://127.0.0.1:9".to_string();
        config.ai_b_endpoint.base_url = "http://127.0.0.1:9".to_string();
        let state = build_state(config).await.expect("state");
        state
            .runtime
            .store()
            .upsert_user(UserRecord::new("u-1", 10))
            .await
            .expect("user");
        state
            .runtime
            .store()
            .upsert_user(UserRecord::new("u-broke", 0))
            .await
            .expect("user");
        state
    }

    fn post_json(uri: &str, user: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-user-id", user)
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn get_as(uri: &str, user: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("x-user-id", user)
            .body(Body::empty())
            .expect("request")
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn create_task_degrades_to_inquiry_and_answers_flow_works() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path()).await;
        let app = app_router(state);

        let response = app
            .clone()
            .oneshot(post_json(
                "/tasks",
                "u-1",
                json!({"scene": "topic-analysis", "user_input": "AI Agent video"}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["status"], "inquiring");
        assert_eq!(created["need_inquiry"], true);
        let questions = created["inquiry_questions"].as_array().expect("questions");
        assert!((3..=5).contains(&questions.len()));
        let task_id = created["task_id"].as_str().expect("task id").to_string();

        // Skip the questionnaire; the task parks as ready_for_processing.
        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/tasks/{task_id}/answers"),
                "u-1",
                json!({"answers": {}, "intermediate_state": created["intermediate_state"]}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let submitted = body_json(response).await;
        assert_eq!(submitted["status"], "ready_for_processing");

        // A second submission hits the CAS and is a 400.
        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/tasks/{task_id}/answers"),
                "u-1",
                json!({"answers": {}, "intermediate_state": created["intermediate_state"]}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_user_header_is_unauthorized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path()).await;
        let app = app_router(state);
        let request = Request::builder()
            .method("POST")
            .uri("/tasks")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"scene": "topic-analysis", "user_input": "x"}).to_string(),
            ))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn quota_exhaustion_is_forbidden() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path()).await;
        let app = app_router(state);
        let response = app
            .oneshot(post_json(
                "/tasks",
                "u-broke",
                json!({"scene": "topic-analysis", "user_input": "x"}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn foreign_tasks_are_forbidden_and_unknown_tasks_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path()).await;
        let app = app_router(state.clone());

        let response = app
            .clone()
            .oneshot(post_json(
                "/tasks",
                "u-1",
                json!({"scene": "topic-analysis", "user_input": "mine"}),
            ))
            .await
            .expect("response");
        let task_id = body_json(response).await["task_id"]
            .as_str()
            .expect("task id")
            .to_string();
        state
            .runtime
            .store()
            .upsert_user(UserRecord::new("u-2", 10))
            .await
            .expect("user");

        let response = app
            .clone()
            .oneshot(get_as(&format!("/tasks/{task_id}"), "u-2"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(get_as("/tasks/does-not-exist", "u-1"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn injected_intermediate_state_fields_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path()).await;
        let app = app_router(state);

        let response = app
            .clone()
            .oneshot(post_json(
                "/tasks",
                "u-1",
                json!({"scene": "topic-analysis", "user_input": "x"}),
            ))
            .await
            .expect("response");
        let task_id = body_json(response).await["task_id"]
            .as_str()
            .expect("task id")
            .to_string();

        let response = app
            .oneshot(post_json(
                &format!("/tasks/{task_id}/answers"),
                "u-1",
                json!({"answers": {}, "intermediate_state": {"user_id": "attacker"}}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn progress_endpoint_is_never_cached() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path()).await;
        let app = app_router(state);

        let response = app
            .clone()
            .oneshot(post_json(
                "/tasks",
                "u-1",
                json!({"scene": "topic-analysis", "user_input": "x"}),
            ))
            .await
            .expect("response");
        let task_id = body_json(response).await["task_id"]
            .as_str()
            .expect("task id")
            .to_string();

        let response = app
            .oneshot(get_as(&format!("/tasks/{task_id}/progress"), "u-1"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).and_then(|v| v.to_str().ok()),
            Some("no-store")
        );
    }

    #[tokio::test]
    async fn task_listing_pages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path()).await;
        let app = app_router(state);
        for _ in 0..3 {
            app.clone()
                .oneshot(post_json(
                    "/tasks",
                    "u-1",
                    json!({"scene": "topic-analysis", "user_input": "x"}),
                ))
                .await
                .expect("response");
        }
        let response = app
            .oneshot(get_as("/tasks?limit=2&offset=0", "u-1"))
            .await
            .expect("response");
        let page = body_json(response).await;
        assert_eq!(page["total"], 3);
        assert_eq!(page["tasks"].as_array().map(Vec::len), Some(2));
        assert_eq!(page["has_more"], true);
    }
}
