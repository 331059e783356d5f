//! HTTP surface.
//!
//! Thin axum handlers over the core operations: webhook ingestion, run
//! artifacts, the approval path, the explainability composite, metrics
//! exposition, health probes, and the SSE dashboard stream. No handler
//! contains pipeline logic.

use std::sync::Arc;

use axum::extract::{MatchedPath, Path, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, body::Bytes};
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;

use crate::artifact::{attach_operation_links, build_provenance_artifact, extract_evidence_lines};
use crate::config::Settings;
use crate::errors::{IngestError, StageError};
use crate::events::{CiProvider, DashboardPublisher};
use crate::ingest::{self, IngestOutcome, Ingestor};
use crate::metrics::Metrics;
use crate::pipeline::{ActorIdentity, PipelineRunner, PostMergeMonitor};
use crate::providers;
use crate::store::Store;

pub struct AppState {
    pub store: Arc<Store>,
    pub ingestor: Ingestor,
    pub runner: Arc<PipelineRunner>,
    pub monitor: Arc<PostMergeMonitor>,
    pub metrics: Metrics,
    pub publisher: DashboardPublisher,
    pub redactor: Arc<crate::artifact::Redactor>,
    pub settings: Settings,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhooks/{provider}", post(receive_webhook))
        .route("/runs/{id}/artifact", get(get_run_artifact))
        .route("/runs/{id}/diff", get(get_run_diff))
        .route("/runs/{id}/timeline", get(get_run_timeline))
        .route("/runs/{id}/approve-pr", post(approve_run_pr))
        .route("/failures/{id}/explain", get(explain_failure))
        .route("/dashboard/stream", get(dashboard_stream))
        .route("/metrics", get(metrics_text))
        .route("/health", get(health))
        .route("/health/ready", get(health_ready))
        .route("/health/live", get(health))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            track_requests,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn track_requests(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let response = next.run(request).await;
    let status = response.status().as_u16().to_string();
    state
        .metrics
        .http_requests_total
        .with_label_values(&[method.as_str(), route.as_str(), status.as_str()])
        .inc();
    response
}

// ── Webhooks ─────────────────────────────────────────────────────────

fn header<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(provider) = CiProvider::from_str(&provider) else {
        return error_response(StatusCode::NOT_FOUND, "unsupported provider");
    };

    let signature = header(&headers, "x-hub-signature-256");
    if state.settings.github_webhook_secret.is_empty() {
        if state.settings.is_production() {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "server misconfigured");
        }
        tracing::warn!("Webhook signature verification skipped (no secret configured)");
    } else if let Err(e) = ingest::verify_signature(
        &body,
        signature,
        &state.settings.github_webhook_secret,
    ) {
        let status = match e {
            IngestError::MissingHeader(_) | IngestError::InvalidSignatureFormat => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::UNAUTHORIZED,
        };
        return error_response(status, &e.to_string());
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("malformed payload: {}", e));
        }
    };

    let correlation_id = header(&headers, "x-github-delivery")
        .or_else(|| header(&headers, "x-request-id"))
        .map(str::to_string);
    let delivery_id = correlation_id
        .clone()
        .unwrap_or_else(|| ingest::fallback_delivery_id(provider.as_str(), &payload));
    let event_type = header(&headers, "x-github-event").unwrap_or("pipeline").to_string();

    // Post-merge correlation sees every conclusion, successes included.
    if let Some(outcome) = providers::extract_ci_outcome(provider, &payload)
        && let Err(e) =
            state
                .monitor
                .process_outcome(&outcome.repo, &outcome.branch, &outcome.conclusion)
    {
        tracing::warn!(error = %e, "Post-merge correlation failed");
    }

    let normalized = match providers::normalize(provider, &payload, correlation_id.as_deref()) {
        Ok(Some(event)) => event,
        Ok(None) => {
            return (
                StatusCode::OK,
                Json(json!({
                    "status": "ignored",
                    "message": "not a failure event",
                    "correlation_id": correlation_id,
                })),
            )
                .into_response();
        }
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    match state.ingestor.ingest(&normalized, &delivery_id, &event_type) {
        Ok(IngestOutcome::Accepted { event_id }) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "accepted",
                "message": "event dispatched",
                "event_id": event_id,
                "correlation_id": correlation_id,
            })),
        )
            .into_response(),
        Ok(IngestOutcome::DuplicateEvent { event_id }) => (
            StatusCode::OK,
            Json(json!({
                "status": "ignored",
                "message": "duplicate event",
                "event_id": event_id,
                "correlation_id": correlation_id,
            })),
        )
            .into_response(),
        Ok(IngestOutcome::DuplicateDelivery) => (
            StatusCode::OK,
            Json(json!({
                "status": "ignored",
                "message": "duplicate delivery",
                "correlation_id": correlation_id,
            })),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"status": "error", "message": message}))).into_response()
}

// ── Runs ─────────────────────────────────────────────────────────────

async fn get_run_artifact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.store.get_run(&id) {
        Ok(Some(run)) => match &run.artifact_json {
            // Redaction applies on read as well as write.
            Some(artifact) => Json(state.redactor.redact_value(artifact)).into_response(),
            None => error_response(StatusCode::NOT_FOUND, "artifact not found"),
        },
        Ok(None) => error_response(StatusCode::NOT_FOUND, "run not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn get_run_diff(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.store.get_run(&id) {
        Ok(Some(run)) => match &run.patch_diff {
            Some(diff) => Json(json!({
                "run_id": run.id,
                "diff_text": state.redactor.redact_text(diff),
                "stats": run.patch_stats_json,
                "redacted": true,
            }))
            .into_response(),
            None => error_response(StatusCode::NOT_FOUND, "diff not found"),
        },
        Ok(None) => error_response(StatusCode::NOT_FOUND, "run not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn get_run_timeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.store.get_run(&id) {
        Ok(Some(run)) => {
            let timeline = run
                .artifact_json
                .as_ref()
                .and_then(|a| a.get("timeline").cloned())
                .unwrap_or_else(|| {
                    serde_json::to_value(crate::artifact::build_timeline(&run))
                        .unwrap_or(Value::Array(vec![]))
                });
            Json(json!({"run_id": run.id, "timeline": timeline})).into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "run not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn approve_run_pr(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    // Identity is resolved by the auth layer in front of this service;
    // the forwarded header is trusted here.
    let actor = ActorIdentity {
        id: header(&headers, "x-actor-id").unwrap_or("unknown").to_string(),
        display_name: header(&headers, "x-actor-name").unwrap_or("unknown").to_string(),
    };
    match state.runner.approve_run(&id, &actor).await {
        Ok(run) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "accepted",
                "run_id": run.id,
                "run_status": run.status.as_str(),
            })),
        )
            .into_response(),
        Err(StageError::StateConflict { current }) => (
            StatusCode::CONFLICT,
            Json(json!({
                "status": "error",
                "message": format!("run status must be 'awaiting_approval', is '{}'", current),
            })),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

// ── Explainability ───────────────────────────────────────────────────

async fn explain_failure(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let run = match state.store.get_run_by_event(&id) {
        Ok(Some(run)) => run,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "failure not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    let summary = run
        .context_json
        .as_ref()
        .and_then(|c| c.get("log_summary"))
        .and_then(|s| s.as_str())
        .unwrap_or("")
        .to_string();

    // Evidence from the retained build log, linked to plan operations.
    let log_path = state
        .settings
        .artifacts_dir
        .join("workspaces")
        .join(&run.id)
        .join(".remedy-build.log");
    let evidence = std::fs::read_to_string(&log_path)
        .map(|log| {
            let lines = extract_evidence_lines(&log, &state.redactor, 30);
            let operations: Vec<Value> = run
                .plan_json
                .as_ref()
                .and_then(|p| p.get("operations"))
                .and_then(|o| o.as_array())
                .cloned()
                .unwrap_or_default();
            attach_operation_links(lines, &operations)
        })
        .unwrap_or_default();

    let payload = json!({
        "failure_id": id,
        "summary": state.redactor.redact_text(&summary),
        "evidence": evidence,
        "proposed_fix": run.plan_json,
        "safety": {
            "plan_policy": run.plan_policy_json,
            "patch_policy": run.patch_policy_json,
        },
        "validation": run.validation_json,
        "run": {
            "id": run.id,
            "status": run.status.as_str(),
            "blocked_reason": run.blocked_reason,
            "error_message": run.error_message,
            "pr_url": run.last_pr_url,
        },
        "timeline": crate::artifact::build_timeline(&run),
    });
    Json(state.redactor.redact_value(&payload)).into_response()
}

// ── Dashboard stream ─────────────────────────────────────────────────

async fn dashboard_stream(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stream = BroadcastStream::new(state.publisher.subscribe()).filter_map(|event| async {
        match event {
            Ok(event) => SseEvent::default().json_data(&event).ok().map(Ok::<_, std::convert::Infallible>),
            Err(_) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ── Metrics + health ─────────────────────────────────────────────────

async fn metrics_text(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn health_ready(State(state): State<Arc<AppState>>) -> Response {
    // Ready means the store answers.
    match state.store.get_run("readiness-probe") {
        Ok(_) => Json(json!({"status": "ready"})).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

/// Provenance lookup used by operators debugging a run that has not yet
/// persisted an artifact: build one on the fly from current state.
pub fn preview_artifact(state: &AppState, run_id: &str) -> Option<Value> {
    let run = state.store.get_run(run_id).ok().flatten()?;
    let event = state.store.get_event(&run.event_id).ok().flatten()?;
    Some(build_provenance_artifact(
        &run,
        &event.id,
        &event.repo,
        &state.redactor,
    ))
}
