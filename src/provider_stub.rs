//! Local task provider for developing host pages offline. Serves the
//! built-in demo tasks over the same HTTP surface the widget consumes.

use crate::task::{Task, TaskOrigin, TaskResponse};
use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Default)]
pub struct StubState {
    served: AtomicUsize,
    answered: AtomicUsize,
}

impl StubState {
    pub fn served(&self) -> usize {
        self.served.load(Ordering::Relaxed)
    }

    pub fn answered(&self) -> usize {
        self.answered.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Deserialize)]
struct TaskQuery {
    session_id: Option<String>,
}

pub fn router(state: Arc<StubState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tasks/request", post(request_task))
        .route("/responses/", post(submit_response))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn request_task(
    State(state): State<Arc<StubState>>,
    Query(query): Query<TaskQuery>,
    Json(profile): Json<Value>,
) -> Json<Task> {
    let n = state.served.fetch_add(1, Ordering::Relaxed);
    let mut task = Task::fallback_variant(n);
    task.task_id = format!("stub-{n}");
    task.origin = TaskOrigin::Provider;
    info!(
        session_id = query.session_id.as_deref().unwrap_or("-"),
        topics = %profile["topics"],
        task_id = %task.task_id,
        "serving stub task"
    );
    Json(task)
}

async fn submit_response(
    State(state): State<Arc<StubState>>,
    Json(response): Json<TaskResponse>,
) -> impl IntoResponse {
    state.answered.fetch_add(1, Ordering::Relaxed);
    info!(
        task_id = %response.task_id,
        choice = %response.selected_choice,
        response_time_ms = response.response_time_ms,
        "stub received response"
    );
    (
        StatusCode::CREATED,
        Json(json!({ "status": "accepted", "task_id": response.task_id })),
    )
}

/// Serves the stub until ctrl-c.
pub async fn serve(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding stub provider to {addr}"))?;
    let local = listener.local_addr()?;
    info!(%local, "stub task provider listening");
    axum::serve(listener, router(Arc::new(StubState::default())))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(?err, "ctrl-c handler failed; stopping stub provider");
            }
        })
        .await
        .context("stub provider server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::parse_task_payload;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, header};
    use tower::ServiceExt;

    fn json_post(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let resp = router(Arc::default())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn serves_tasks_the_client_can_parse() {
        let state = Arc::new(StubState::default());
        let app = router(Arc::clone(&state));
        for expected in ["stub-0", "stub-1", "stub-2"] {
            let resp = app
                .clone()
                .oneshot(json_post(
                    "/tasks/request?session_id=s-1",
                    json!({"language": "en", "topics": []}),
                ))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
            let task = parse_task_payload(&bytes).unwrap().unwrap();
            assert_eq!(task.task_id, expected);
            assert!(!task.is_fallback());
        }
        assert_eq!(state.served(), 3);
    }

    #[tokio::test]
    async fn accepts_responses() {
        let state = Arc::new(StubState::default());
        let resp = router(Arc::clone(&state))
            .oneshot(json_post(
                "/responses/",
                json!({
                    "task_id": "stub-0",
                    "session_id": "s-1",
                    "user_id": "u-1",
                    "publisher_id": "pub-1",
                    "category": "image",
                    "selected_choice": "a",
                    "response_time_ms": 900,
                    "client_info": {"browser": "chrome", "device": "desktop"},
                    "submitted_at": "2024-05-01T12:00:00.000Z"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(state.answered(), 1);
    }
}
