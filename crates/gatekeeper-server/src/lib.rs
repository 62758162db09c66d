//! Thin axum HTTP surface over [`gatekeeper_core::SchedulingEngine`].
//! Wires request/response JSON bodies to the engine's operations and maps
//! its two real failure modes to HTTP status codes.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use gatekeeper_core::{CompletionStatus, EngineError, GatekeeperConfig, HistorySink, InMemoryMetricsProvider, JobSpec, LeaseOutcome, MetricsProvider, Priority, SchedulingEngine};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SchedulingEngine>,
    pub metrics: Arc<InMemoryMetricsProvider>,
}

pub fn build_router(engine: Arc<SchedulingEngine>, metrics: Arc<InMemoryMetricsProvider>) -> Router {
    let state = AppState { engine, metrics };
    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs", post(submit_handler))
        .route("/leases/request", post(request_lease_handler))
        .route("/leases/:lease_id/heartbeat", post(heartbeat_handler))
        .route("/leases/:lease_id/complete", post(complete_handler))
        .route("/snapshot", get(snapshot_handler))
        .route("/metrics", post(push_metrics_handler))
        .route("/history/stats", get(history_stats_handler))
        .route("/history/cleanup", post(history_cleanup_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The one non-terminal error this surface maps: engine failures, mapped
/// via `EngineError`'s own shape. `LeaseOutcome::Denied` never reaches here
/// as an error — it is a normal 200 response body (see [`request_lease_handler`]).
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Engine(EngineError::NotFound { .. }) => (StatusCode::NOT_FOUND, "lease_not_found"),
            ApiError::Engine(EngineError::PermissionDenied { .. }) => (StatusCode::FORBIDDEN, "worker_mismatch"),
        };
        (status, Json(json!({ "error": code, "detail": self.to_string() }))).into_response()
    }
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct SubmitJobRequest {
    job_type: String,
    #[serde(default)]
    priority: Option<Priority>,
    requested_units: i64,
    #[serde(default)]
    unique: bool,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    idempotency_key: Option<String>,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Serialize)]
struct SubmitJobResponse {
    job_id: Uuid,
    state: gatekeeper_core::JobState,
}

async fn submit_handler(State(state): State<AppState>, Json(req): Json<SubmitJobRequest>) -> Json<SubmitJobResponse> {
    let mut spec = JobSpec::new(req.job_type, req.priority.unwrap_or(Priority::Normal), req.requested_units)
        .with_tags(req.tags)
        .with_unique(req.unique)
        .with_payload(req.payload);
    if let Some(key) = req.idempotency_key {
        spec = spec.with_idempotency_key(key);
    }
    let job = state.engine.submit(spec).await;
    Json(SubmitJobResponse { job_id: job.job_id, state: job.state })
}

#[derive(Debug, Deserialize)]
struct RequestLeaseRequest {
    worker_id: String,
    #[serde(default)]
    max_units: Option<i64>,
}

async fn request_lease_handler(State(state): State<AppState>, Json(req): Json<RequestLeaseRequest>) -> Json<Value> {
    match state.engine.request_lease(&req.worker_id, req.max_units).await {
        LeaseOutcome::Granted { lease, job } => Json(json!({ "denied": false, "lease": lease, "job": job })),
        LeaseOutcome::Denied { reason, retry_after_ms } => {
            Json(json!({ "denied": true, "reason": reason, "retry_after_ms": retry_after_ms }))
        }
    }
}

#[derive(Debug, Deserialize)]
struct WorkerIdRequest {
    worker_id: String,
}

async fn heartbeat_handler(
    State(state): State<AppState>,
    Path(lease_id): Path<Uuid>,
    Json(req): Json<WorkerIdRequest>,
) -> Result<Json<Value>, ApiError> {
    let lease = state.engine.heartbeat(lease_id, &req.worker_id).await?;
    Ok(Json(json!({ "ok": true, "expires_at": lease.expires_at })))
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    worker_id: String,
    status: CompletionStatus,
}

async fn complete_handler(
    State(state): State<AppState>,
    Path(lease_id): Path<Uuid>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<Value>, ApiError> {
    state.engine.complete(lease_id, &req.worker_id, req.status).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn snapshot_handler(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.engine.snapshot().await;
    Json(json!(snapshot))
}

#[derive(Debug, Deserialize)]
struct PushMetricsRequest {
    #[serde(default)]
    host: Option<Value>,
    #[serde(default)]
    api: Option<Value>,
}

/// Lets an external collector push a host/API snapshot instead of the engine
/// polling one. Field names go through the busy-rating evaluator's alias
/// table, so a collector doesn't need to match this crate's schema exactly.
async fn push_metrics_handler(State(state): State<AppState>, Json(req): Json<PushMetricsRequest>) -> Json<Value> {
    state.metrics.set_from_json(req.host.as_ref(), req.api.as_ref());
    Json(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
struct DaysQuery {
    #[serde(default = "default_days")]
    days: i64,
}

fn default_days() -> i64 {
    30
}

async fn history_stats_handler(State(state): State<AppState>, Query(query): Query<DaysQuery>) -> Json<Value> {
    match state.engine.history().stats(query.days).await {
        Ok(stats) => Json(json!({ "ok": true, "stats": stats })),
        Err(err) => Json(json!({ "ok": false, "error": err.to_string() })),
    }
}

async fn history_cleanup_handler(State(state): State<AppState>, Query(query): Query<DaysQuery>) -> Json<Value> {
    match state.engine.history().cleanup(query.days).await {
        Ok(deleted) => Json(json!({ "ok": true, "deleted": deleted, "days": query.days })),
        Err(err) => Json(json!({ "ok": false, "error": err.to_string() })),
    }
}

/// Convenience used by `main` and tests to build an engine with the given
/// config, an in-memory metrics provider, and a SQLite history sink at
/// `history_db_path`.
pub async fn build_engine(
    config: GatekeeperConfig,
    metrics: Arc<dyn MetricsProvider>,
    history: Arc<dyn HistorySink>,
) -> Arc<SchedulingEngine> {
    Arc::new(SchedulingEngine::builder(config).metrics(metrics).history(history).build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use gatekeeper_core::NullHistorySink;
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let config = GatekeeperConfig::builder().total_capacity_units(100).reserve_units(0).build();
        let metrics = Arc::new(InMemoryMetricsProvider::new());
        let engine = build_engine(config, metrics.clone(), Arc::new(NullHistorySink)).await;
        build_router(engine, metrics)
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn submit_then_request_lease_round_trips() {
        let app = test_app().await;
        let submit_body = json!({ "job_type": "demo.task", "requested_units": 5 }).to_string();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(submit_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let lease_body = json!({ "worker_id": "w1" }).to_string();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/leases/request")
                    .header("content-type", "application/json")
                    .body(Body::from(lease_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn heartbeat_on_unknown_lease_returns_404() {
        let app = test_app().await;
        let body = json!({ "worker_id": "w1" }).to_string();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/leases/{}/heartbeat", Uuid::new_v4()))
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pushed_metrics_surface_in_snapshot_busy_rating() {
        let app = test_app().await;
        let push_body = json!({
            "host": { "cpu_pct": 95.0, "mem_percent": 95.0 },
            "api": { "latency_ms_p95": 2000.0, "error_pct": 50.0, "inflight": 500.0 }
        })
        .to_string();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/metrics")
                    .header("content-type", "application/json")
                    .body(Body::from(push_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/snapshot").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let snapshot: Value = serde_json::from_slice(&body).unwrap();
        assert!(snapshot.get("busy_rating").is_some());
    }
}
