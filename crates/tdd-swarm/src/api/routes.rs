use std::time::Instant;

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use coordination::escalation::EscalationAdvice;
use coordination::router::{Role, RouteOutcome, RoutingDecision};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::error::ApiError;
use super::state::AppState;
use crate::config::ResidencyPolicy;
use crate::prompts::direct_prompt;
use crate::residency::{ContextSnapshot, MemorySnapshot, ResidentExecutor};
use crate::roles::CallOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct RouteRequest {
    pub prompt: String,
    /// Untrusted reference document. Scanned by the gate, fenced in prompts.
    #[serde(default, alias = "reference")]
    pub external_doc: Option<String>,
    /// Trusted caller context prepended to the prompt.
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteResponse {
    pub model: String,
    pub target_role: Role,
    pub agent: String,
    pub response: String,
    pub routing_decision: RoutingDecision,
    pub tokens_generated: u64,
    pub latency_ms: u64,
    pub memory_delta_gb: f64,
    pub timestamp: DateTime<Utc>,
}

/// Classify, gate and invoke. `forced` replaces the target of a decision
/// that passed the gate; blocked, frontier and human outcomes still apply.
pub async fn route_task(
    state: &AppState,
    req: &RouteRequest,
    forced: Option<Role>,
) -> Result<RouteResponse, ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt must not be empty".into()));
    }
    let started = Instant::now();
    let reference = req.external_doc.as_deref();

    let fingerprint = state.fingerprint_of(&req.prompt, reference);
    let prior_failures = state.escalation.failure_count(&fingerprint);

    let outcome = state.classifier.route(&req.prompt, reference, prior_failures).await;
    let (role, mut decision) = match outcome {
        RouteOutcome::Proceed { role, decision } => (role, decision),
        other => {
            info!(outcome = other.status(), "Request not routed to a local role");
            return Err(ApiError::from_outcome(other)
                .unwrap_or_else(|| ApiError::BadRequest("unroutable request".into())));
        }
    };
    let role = match forced {
        Some(forced) => {
            decision.target = forced;
            forced
        }
        None => role,
    };

    let requirement = match req.context.as_deref().filter(|c| !c.trim().is_empty()) {
        Some(context) => format!("## Context\n{context}\n\n## Task\n{}", req.prompt),
        None => req.prompt.clone(),
    };
    let prompt = direct_prompt(&requirement, reference);
    let options = CallOptions {
        temperature: req.temperature,
        max_tokens: req.max_tokens,
    };

    let reply = state
        .roles
        .invoke_with(role, &prompt, &ContextSnapshot::new(&req.prompt), options)
        .await?;

    let latency_ms = started.elapsed().as_millis() as u64;
    info!(role = %role, agent = %reply.agent, latency_ms, tokens = reply.tokens, "Request routed");

    Ok(RouteResponse {
        model: reply.model,
        target_role: role,
        agent: reply.agent,
        response: reply.text,
        routing_decision: decision,
        tokens_generated: reply.tokens,
        latency_ms,
        memory_delta_gb: reply.memory_delta_gb,
        timestamp: Utc::now(),
    })
}

pub async fn route(
    State(state): State<AppState>,
    Json(req): Json<RouteRequest>,
) -> Result<Json<RouteResponse>, ApiError> {
    route_task(&state, &req, None).await.map(Json)
}

pub async fn architect(
    State(state): State<AppState>,
    Json(req): Json<RouteRequest>,
) -> Result<Json<RouteResponse>, ApiError> {
    route_task(&state, &req, Some(Role::Architect)).await.map(Json)
}

pub async fn coder(
    State(state): State<AppState>,
    Json(req): Json<RouteRequest>,
) -> Result<Json<RouteResponse>, ApiError> {
    route_task(&state, &req, Some(Role::Coder)).await.map(Json)
}

pub async fn reviewer(
    State(state): State<AppState>,
    Json(req): Json<RouteRequest>,
) -> Result<Json<RouteResponse>, ApiError> {
    route_task(&state, &req, Some(Role::Reviewer)).await.map(Json)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub inference: String,
    pub memory: MemorySnapshot,
    pub resident_executors: Vec<ResidentExecutor>,
    /// Models the inference host reports loaded. Empty when it cannot say.
    pub host_models: Vec<String>,
    /// Registry entries the host no longer holds.
    pub stale_executors: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let (status, inference) = match state.backend.ping().await {
        Ok(()) => ("healthy", "connected".to_string()),
        Err(e) => ("degraded", format!("unreachable: {e}")),
    };
    let resident_executors = state.residency.resident().await;

    let (host_models, stale_executors) = match state.backend.loaded_models().await {
        Ok(models) => {
            let stale: Vec<String> = resident_executors
                .iter()
                .filter(|r| !models.contains(&r.id))
                .map(|r| r.id.clone())
                .collect();
            if !stale.is_empty() {
                warn!(stale = ?stale, "Resident executors missing from inference host");
            }
            (models, stale)
        }
        Err(e) => {
            debug!(error = %e, "Loaded-model listing unavailable");
            (Vec::new(), Vec::new())
        }
    };

    Json(HealthResponse {
        status: status.to_string(),
        inference,
        memory: state.residency.memory(),
        resident_executors,
        host_models,
        stale_executors,
        timestamp: Utc::now(),
    })
}

#[derive(Debug, Serialize)]
pub struct ExecutorInfo {
    pub id: String,
    pub name: String,
    pub roles: Vec<Role>,
    pub classifier: bool,
    pub memory_gb: f64,
    pub residency: ResidencyPolicy,
    pub exclusive: bool,
    pub keep_alive: String,
    pub description: String,
    pub resident: bool,
}

#[derive(Debug, Serialize)]
pub struct ExecutorsResponse {
    pub executors: Vec<ExecutorInfo>,
    pub total: usize,
}

pub async fn executors(State(state): State<AppState>) -> Json<ExecutorsResponse> {
    let mut executors = Vec::new();
    for spec in &state.residency.catalog().executors {
        executors.push(ExecutorInfo {
            id: spec.id.clone(),
            name: spec.name.clone(),
            roles: spec.roles.clone(),
            classifier: spec.classifier,
            memory_gb: spec.memory_gb,
            residency: spec.residency,
            exclusive: spec.exclusive,
            keep_alive: spec.keep_alive.clone(),
            description: spec.description.clone(),
            resident: state.residency.is_resident(&spec.id).await,
        });
    }
    let total = executors.len();
    Json(ExecutorsResponse { executors, total })
}

pub async fn memory(State(state): State<AppState>) -> Json<MemorySnapshot> {
    Json(state.residency.memory())
}

#[derive(Debug, Deserialize)]
pub struct EscalateRequest {
    pub prompt: String,
    #[serde(default, alias = "reference")]
    pub external_doc: Option<String>,
}

/// Record one failure for the task and return the advice.
pub async fn escalate(
    State(state): State<AppState>,
    Json(req): Json<EscalateRequest>,
) -> Result<Json<EscalationAdvice>, ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt must not be empty".into()));
    }
    let fingerprint = state.fingerprint_of(&req.prompt, req.external_doc.as_deref());
    let advice = state.escalation.record_and_advise(&fingerprint);
    info!(
        failure_count = advice.failure_count,
        escalated = advice.escalated,
        "Failure recorded"
    );
    Ok(Json(advice))
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItem {
    Success { index: usize, result: RouteResponse },
    Error { index: usize, error: String },
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<BatchItem>,
}

/// Route every item as an independent task. A failure or panic in one item
/// is reported in its slot and does not affect the others.
pub async fn batch(
    State(state): State<AppState>,
    Json(requests): Json<Vec<RouteRequest>>,
) -> Json<BatchResponse> {
    let total = requests.len();
    let handles: Vec<_> = requests
        .into_iter()
        .map(|req| {
            let state = state.clone();
            tokio::spawn(async move { route_task(&state, &req, None).await })
        })
        .collect();

    let mut results = Vec::with_capacity(total);
    for (index, joined) in join_all(handles).await.into_iter().enumerate() {
        let item = match joined {
            Ok(Ok(result)) => BatchItem::Success { index, result },
            Ok(Err(e)) => BatchItem::Error {
                index,
                error: e.to_string(),
            },
            Err(e) => {
                error!(index, error = %e, "Batch item panicked");
                BatchItem::Error {
                    index,
                    error: format!("task aborted: {e}"),
                }
            }
        };
        results.push(item);
    }

    let succeeded = results
        .iter()
        .filter(|r| matches!(r, BatchItem::Success { .. }))
        .count();
    info!(total, succeeded, "Batch finished");
    Json(BatchResponse {
        total,
        succeeded,
        failed: total - succeeded,
        results,
    })
}
