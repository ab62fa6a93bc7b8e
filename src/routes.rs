//! HTTP surface: event intake plus health, readiness, and metrics probes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tracing::{debug, error};

use crate::events;
use crate::metrics;
use crate::queue::ReplicationQueue;

// Inbound events all carry normal priority for now; per-command weighting
// can slot in here once the event payload warrants it.
const EVENT_PRIORITY_FACTOR: f64 = 1.0;

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<ReplicationQueue>,
    pub ready: Arc<AtomicBool>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/events", post(ingest_event))
        .route("/healthz", get(health_check))
        .route("/readyz", get(readiness_check))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

async fn ingest_event(State(state): State<AppState>, body: Bytes) -> Response {
    metrics::EVENTS_RECEIVED.inc();

    let accepted = match events::filter(&body) {
        Ok(accepted) => accepted,
        Err(err) => {
            debug!(reason = %err, "event rejected by filter");
            return StatusCode::NO_CONTENT.into_response();
        }
    };
    metrics::EVENTS_ACCEPTED.inc();

    match state
        .queue
        .enqueue(&accepted.username, EVENT_PRIORITY_FACTOR)
        .await
    {
        Ok(()) => {
            metrics::EVENTS_ENQUEUED.inc();
            StatusCode::ACCEPTED.into_response()
        }
        Err(err) => {
            metrics::ENQUEUE_ERRORS.inc();
            error!(username = %accepted.username, error = %err, "failed to enqueue event");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to enqueue event: {err}"),
            )
                .into_response()
        }
    }
}

async fn health_check() -> &'static str {
    "ok"
}

async fn readiness_check(State(state): State<AppState>) -> Response {
    if !state.ready.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response();
    }
    if state.queue.health().await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "queue not healthy").into_response();
    }
    (StatusCode::OK, "ready").into_response()
}

async fn prometheus_metrics(State(state): State<AppState>) -> String {
    if let Ok(depth) = state.queue.size().await {
        metrics::QUEUE_DEPTH.set(depth as i64);
    }
    metrics::export_prometheus()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::util::ServiceExt;

    fn test_state() -> AppState {
        AppState {
            queue: Arc::new(ReplicationQueue::new(Arc::new(Store::embedded()), "test")),
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    fn event_request(payload: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/events")
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn accepted_event_is_enqueued() {
        let state = test_state();
        let app = build_router(state.clone());

        let response = app
            .oneshot(event_request(json!({
                "event": "imap_command_finished",
                "fields": { "user": "alice", "cmd_name": "APPEND" }
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(state.queue.order().await.unwrap(), vec!["alice"]);
    }

    #[tokio::test]
    async fn filtered_event_returns_no_content() {
        let state = test_state();
        let app = build_router(state.clone());

        let response = app
            .oneshot(event_request(json!({
                "event": "imap_command_finished",
                "fields": { "user": "alice", "cmd_name": "FETCH" }
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(state.queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn health_check_is_always_ok() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_reflects_ready_flag() {
        let state = test_state();
        state.ready.store(false, Ordering::SeqCst);
        let app = build_router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/readyz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.ready.store(true, Ordering::SeqCst);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/readyz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_exports_queue_depth() {
        let state = test_state();
        state.queue.enqueue("alice", 1.0).await.unwrap();
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("maildrift_queue_depth"));
    }
}
