//! Request handlers.
//!
//! Mutating calls are `POST /v1/<operation>` with a JSON body and three
//! headers: `x-caller-id`, `x-request-id` (the idempotency key) and an
//! optional `x-deadline-ms`. Reads are plain `GET`s.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;

use proxy_attestation::HeartbeatEnvelope;
use proxy_engine::{
    AttestedStep, CancelTaskRequest, DeclineTaskRequest, EngineMetrics, HeartbeatAck,
    IssueNonceRequest, NodeRequest, NodeStanding, NodeView, NonceResponse, PostTaskRequest,
    PostTaskResponse, ProxyApi, RequestContext, SubmitProofRequest, TaskStatus,
    VerifyCallbackRequest,
};
use proxy_types::{NodeId, PhysicalTask, TaskId};

use crate::error::RpcError;
use crate::pagination::{Page, PaginationParams};

pub const CALLER_HEADER: &str = "x-caller-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const DEADLINE_HEADER: &str = "x-deadline-ms";

/// Deadline applied when the caller sends none.
pub const DEFAULT_DEADLINE_MS: u64 = 30_000;

pub struct AppState {
    pub api: Arc<ProxyApi>,
    pub metrics: Option<Arc<EngineMetrics>>,
}

type Shared = State<Arc<AppState>>;

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<Option<&'a str>, RpcError> {
    headers
        .get(name)
        .map(|v| {
            v.to_str().map_err(|e| RpcError::InvalidHeader {
                name,
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn required(headers: &HeaderMap, name: &'static str) -> Result<String, RpcError> {
    match header(headers, name)? {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(RpcError::MissingHeader(name)),
    }
}

/// Build the request context from the call's headers.
pub fn context(headers: &HeaderMap) -> Result<RequestContext, RpcError> {
    let caller = required(headers, CALLER_HEADER)?;
    let request_id = required(headers, REQUEST_ID_HEADER)?;
    let deadline_ms = match header(headers, DEADLINE_HEADER)? {
        Some(v) => v.trim().parse::<u64>().map_err(|e| RpcError::InvalidHeader {
            name: DEADLINE_HEADER,
            reason: e.to_string(),
        })?,
        None => DEFAULT_DEADLINE_MS,
    };
    Ok(RequestContext::new(
        caller,
        request_id,
        Duration::from_millis(deadline_ms),
    ))
}

// ── Tasks ──────────────────────────────────────────────────────────────

pub async fn post_task(
    State(state): Shared,
    headers: HeaderMap,
    Json(req): Json<PostTaskRequest>,
) -> Result<Json<PostTaskResponse>, RpcError> {
    let ctx = context(&headers)?;
    Ok(Json(state.api.post_task(&ctx, req).await?))
}

pub async fn accept_task(
    State(state): Shared,
    headers: HeaderMap,
    Json(req): Json<AttestedStep>,
) -> Result<Json<TaskStatus>, RpcError> {
    let ctx = context(&headers)?;
    Ok(Json(state.api.accept_task(&ctx, req).await?))
}

pub async fn decline_task(
    State(state): Shared,
    headers: HeaderMap,
    Json(req): Json<DeclineTaskRequest>,
) -> Result<Json<TaskStatus>, RpcError> {
    let ctx = context(&headers)?;
    Ok(Json(state.api.decline_task(&ctx, req).await?))
}

pub async fn start_task(
    State(state): Shared,
    headers: HeaderMap,
    Json(req): Json<AttestedStep>,
) -> Result<Json<TaskStatus>, RpcError> {
    let ctx = context(&headers)?;
    Ok(Json(state.api.start_task(&ctx, req).await?))
}

pub async fn submit_proof(
    State(state): Shared,
    headers: HeaderMap,
    Json(req): Json<SubmitProofRequest>,
) -> Result<Json<TaskStatus>, RpcError> {
    let ctx = context(&headers)?;
    Ok(Json(state.api.submit_proof(&ctx, req).await?))
}

pub async fn verify_callback(
    State(state): Shared,
    headers: HeaderMap,
    Json(req): Json<VerifyCallbackRequest>,
) -> Result<Json<TaskStatus>, RpcError> {
    let ctx = context(&headers)?;
    Ok(Json(state.api.verify_callback(&ctx, req).await?))
}

pub async fn cancel_task(
    State(state): Shared,
    headers: HeaderMap,
    Json(req): Json<CancelTaskRequest>,
) -> Result<Json<TaskStatus>, RpcError> {
    let ctx = context(&headers)?;
    Ok(Json(state.api.cancel_task(&ctx, req).await?))
}

pub async fn get_task(
    State(state): Shared,
    Path(task_id): Path<String>,
) -> Result<Json<PhysicalTask>, RpcError> {
    let task_id: TaskId = task_id
        .parse()
        .map_err(|e| RpcError::InvalidParam(format!("task_id: {e}")))?;
    Ok(Json(state.api.get_task(&task_id)?))
}

// ── Nodes ──────────────────────────────────────────────────────────────

pub async fn heartbeat(
    State(state): Shared,
    headers: HeaderMap,
    Json(envelope): Json<HeartbeatEnvelope>,
) -> Result<Json<HeartbeatAck>, RpcError> {
    let ctx = context(&headers)?;
    Ok(Json(state.api.heartbeat(&ctx, envelope).await?))
}

pub async fn issue_nonce(
    State(state): Shared,
    headers: HeaderMap,
    Json(req): Json<IssueNonceRequest>,
) -> Result<Json<NonceResponse>, RpcError> {
    let ctx = context(&headers)?;
    Ok(Json(state.api.issue_nonce(&ctx, req).await?))
}

pub async fn retire_node(
    State(state): Shared,
    headers: HeaderMap,
    Json(req): Json<NodeRequest>,
) -> Result<Json<NodeStanding>, RpcError> {
    let ctx = context(&headers)?;
    Ok(Json(state.api.retire_node(&ctx, req).await?))
}

pub async fn recertify_node(
    State(state): Shared,
    headers: HeaderMap,
    Json(req): Json<NodeRequest>,
) -> Result<Json<NodeStanding>, RpcError> {
    let ctx = context(&headers)?;
    Ok(Json(state.api.recertify_node(&ctx, req).await?))
}

fn node_id(raw: &str) -> Result<NodeId, RpcError> {
    raw.parse()
        .map_err(|e| RpcError::InvalidParam(format!("node_id: {e}")))
}

pub async fn get_node(
    State(state): Shared,
    Path(raw): Path<String>,
) -> Result<Json<NodeView>, RpcError> {
    Ok(Json(state.api.get_node(&node_id(&raw)?)?))
}

pub async fn list_node_tasks(
    State(state): Shared,
    Path(raw): Path<String>,
    Query(params): Query<PaginationParams>,
) -> Result<Json<Page<PhysicalTask>>, RpcError> {
    let tasks = state.api.list_node_tasks(&node_id(&raw)?)?;
    Ok(Json(Page::of(tasks, &params)))
}

// ── Plumbing ───────────────────────────────────────────────────────────

pub async fn health() -> &'static str {
    "OK"
}

pub async fn metrics(State(state): Shared) -> Result<String, RpcError> {
    match &state.metrics {
        Some(metrics) => metrics.encode().map_err(|e| RpcError::Metrics(e.to_string())),
        None => Ok(String::new()),
    }
}
