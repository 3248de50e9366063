//! Webhook receiver and read-only status API.
//!
//! GitHub deliveries are recorded as [`WorkflowEvent`]s and left for the
//! driver loop to process; the receiver never advances a workflow itself.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::errors::WorkflowError;
use crate::workflow::events::EventQueue;
use crate::workflow::models::{NewWorkflowEvent, WorkflowState};
use crate::workflow::store::WorkflowStore;

pub const GITHUB_EVENT_HEADER: &str = "x-github-event";
pub const GITHUB_DELIVERY_HEADER: &str = "x-github-delivery";

pub struct AppState {
    pub store: Arc<WorkflowStore>,
    pub events: EventQueue,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(store: Arc<WorkflowStore>) -> SharedState {
        let events = EventQueue::new(store.clone());
        Arc::new(Self { store, events })
    }
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<WorkflowError> for ApiError {
    fn from(e: WorkflowError) -> Self {
        match e {
            WorkflowError::WorkflowNotFound { .. } | WorkflowError::EventNotFound { .. } => {
                ApiError::NotFound(e.to_string())
            }
            WorkflowError::Validation(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/webhooks/github", post(github_webhook))
        .route("/api/workflows", get(list_workflows))
        .route("/api/workflows/{id}", get(get_workflow))
        .route("/api/events/pending", get(pending_events))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: SharedState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "Webhook receiver listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;
    info!("Webhook receiver stopped");
    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct WorkflowFilter {
    state: Option<String>,
}

async fn list_workflows(
    State(state): State<SharedState>,
    Query(filter): Query<WorkflowFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let workflows = match filter.state {
        Some(s) => {
            let wanted: WorkflowState = s.parse().map_err(ApiError::BadRequest)?;
            state.store.list_workflows_by_state(wanted)?
        }
        None => state.store.list_workflows()?,
    };
    Ok(Json(workflows))
}

async fn get_workflow(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.get_workflow(id)?))
}

async fn pending_events(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.events.pending()?))
}

// ── GitHub webhooks ───────────────────────────────────────────────────

/// Where a delivery points: the repository and the issue it concerns.
#[derive(Debug, PartialEq, Eq)]
struct EventTarget {
    owner: String,
    repo: String,
    issue_number: i64,
}

fn repository_of(payload: &Map<String, Value>) -> Option<(String, String)> {
    let repo = payload.get("repository")?;
    let name = repo.get("name")?.as_str()?;
    let owner = repo
        .get("owner")
        .and_then(|o| o.get("login"))
        .and_then(Value::as_str)
        .or_else(|| {
            repo.get("full_name")
                .and_then(Value::as_str)
                .and_then(|full| full.split_once('/'))
                .map(|(owner, _)| owner)
        })?;
    Some((owner.to_string(), name.to_string()))
}

fn number_at(payload: &Map<String, Value>, key: &str) -> Option<i64> {
    payload.get(key)?.get("number")?.as_i64()
}

/// GitHub delivers comments on a pull request as `issue_comment` with the
/// pull request in `issue` and an `issue.pull_request` marker.
fn is_pull_request_comment(payload: &Map<String, Value>) -> bool {
    payload
        .get("issue")
        .and_then(|issue| issue.get("pull_request"))
        .is_some_and(|marker| !marker.is_null())
}

/// Resolve the issue a delivery is about. Pull-request deliveries map back to
/// the issue through the workflow that opened the pull request.
fn resolve_target(
    store: &WorkflowStore,
    event_type: &str,
    payload: &Map<String, Value>,
) -> Result<Option<EventTarget>, WorkflowError> {
    let Some((owner, repo)) = repository_of(payload) else {
        return Ok(None);
    };
    let pr_number = match event_type {
        "issue_comment" if is_pull_request_comment(payload) => number_at(payload, "issue"),
        "pull_request" | "pull_request_review" | "pull_request_review_comment" => {
            number_at(payload, "pull_request")
        }
        _ => None,
    };
    let issue_number = match (event_type, pr_number) {
        (_, Some(pr)) => store
            .get_workflow_by_pr(&owner, &repo, pr)?
            .map(|wf| wf.issue_number),
        ("issues" | "issue_comment", None) if !is_pull_request_comment(payload) => {
            number_at(payload, "issue")
        }
        _ => None,
    };
    Ok(issue_number.map(|issue_number| EventTarget {
        owner,
        repo,
        issue_number,
    }))
}

async fn github_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<Map<String, Value>>,
) -> Result<impl IntoResponse, ApiError> {
    let event_type = headers
        .get(GITHUB_EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing X-GitHub-Event header".into()))?
        .to_string();
    let delivery = headers
        .get(GITHUB_DELIVERY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");

    if event_type == "ping" {
        return Ok((StatusCode::OK, Json(json!({"status": "pong"}))));
    }

    let Some(target) = resolve_target(&state.store, &event_type, &payload)? else {
        debug!(event_type = %event_type, delivery, "Ignoring webhook with no known issue");
        return Ok((StatusCode::ACCEPTED, Json(json!({"status": "ignored"}))));
    };

    let event = state
        .events
        .record(NewWorkflowEvent {
            event_type: event_type.clone(),
            provider: "github".to_string(),
            owner: target.owner,
            repo: target.repo,
            issue_number: target.issue_number,
            payload,
        })
        .inspect_err(|e| {
            warn!(event_type = %event_type, delivery, error = %e, "Failed to record webhook")
        })?;

    info!(
        event_id = %event.id,
        event_type = %event.event_type,
        issue = event.issue_number,
        delivery,
        "Recorded webhook event"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"status": "recorded", "event_id": event.id})),
    ))
}
