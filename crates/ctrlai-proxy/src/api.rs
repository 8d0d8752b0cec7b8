//! Admin and query REST API.
//!
//! Operational surface over the core: agents and the kill switch, the
//! active ruleset, and the audit log. Everything here is also reachable
//! from the CLI; the handlers stay thin.

use crate::agents::AgentStatus;
use crate::proxy::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ctrlai_audit::QueryParams;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Error shape
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

fn api_error(status: StatusCode, message: &str) -> Response {
    let body = ApiError {
        error: ApiErrorDetail {
            message: message.to_string(),
            error_type: "api_error".to_string(),
        },
    };
    (status, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let body = serde_json::json!({
        "status": "healthy",
        "rules": {
            "total": state.engine.total_rules(),
            "builtin": state.engine.builtin_count(),
            "custom": state.engine.custom_count(),
        },
        "agents": state.registry.list().len(),
        "killed": state.kill_switch.killed_agents().len(),
        "audit_seq": state.audit.last_seq().await,
    });
    Json(body).into_response()
}

// ---------------------------------------------------------------------------
// Agents + kill switch
// ---------------------------------------------------------------------------

/// `GET /api/v1/agents`
pub async fn list_agents(State(state): State<Arc<AppState>>) -> Response {
    Json(state.registry.list()).into_response()
}

/// `GET /api/v1/agents/:id`
pub async fn get_agent(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id) {
        Some(agent) => Json(agent).into_response(),
        None => api_error(StatusCode::NOT_FOUND, &format!("agent {id:?} not found")),
    }
}

/// Body for `POST /api/v1/agents/:id/kill`.
#[derive(Debug, Default, Deserialize)]
pub struct KillRequest {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub by: String,
}

/// `POST /api/v1/agents/:id/kill`
pub async fn kill_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: String,
) -> Response {
    let req: KillRequest = if body.trim().is_empty() {
        KillRequest::default()
    } else {
        match serde_json::from_str(&body) {
            Ok(req) => req,
            Err(e) => return api_error(StatusCode::BAD_REQUEST, &format!("invalid body: {e}")),
        }
    };
    let reason = if req.reason.is_empty() {
        "killed via API".to_string()
    } else {
        req.reason
    };
    let by = if req.by.is_empty() { "api".to_string() } else { req.by };

    if let Err(e) = state.kill_switch.kill(&id, &reason, &by) {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }
    state.registry.set_status(&id, AgentStatus::Killed);
    if let Some(entry) = state.audit.log_kill(&id, &reason).await {
        state.events.publish(entry);
    }
    Json(serde_json::json!({"agent": id, "status": "killed"})).into_response()
}

/// `POST /api/v1/agents/:id/revive`
pub async fn revive_agent(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    if let Err(e) = state.kill_switch.revive(&id) {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }
    state.registry.set_status(&id, AgentStatus::Active);
    Json(serde_json::json!({"agent": id, "status": "active"})).into_response()
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// `GET /api/v1/rules`
pub async fn list_rules(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.list_rules()).into_response()
}

/// `POST /api/v1/rules` — body is one rule as YAML.
pub async fn add_rule(State(state): State<Arc<AppState>>, body: String) -> Response {
    if let Err(e) = state.engine.add_rule(&body) {
        return api_error(StatusCode::BAD_REQUEST, &e.to_string());
    }
    if let Err(e) = state.engine.save(&state.rules_path) {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }
    Json(serde_json::json!({"rules": state.engine.total_rules()})).into_response()
}

/// `DELETE /api/v1/rules/:name`
pub async fn remove_rule(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    if let Err(e) = state.engine.remove_rule(&name) {
        return api_error(StatusCode::NOT_FOUND, &e.to_string());
    }
    if let Err(e) = state.engine.save(&state.rules_path) {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }
    Json(serde_json::json!({"rules": state.engine.total_rules()})).into_response()
}

/// `POST /api/v1/rules/test` — dry-run a hand-written tool call (JSON with
/// `name` and `arguments`) against the active ruleset.
pub async fn test_rule(State(state): State<Arc<AppState>>, body: String) -> Response {
    match state.engine.test_json(&body) {
        Ok(decision) => Json(decision).into_response(),
        Err(e) => api_error(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Query parameters for `GET /api/v1/audit`.
#[derive(Debug, Default, Deserialize)]
pub struct AuditQueryParams {
    pub agent: Option<String>,
    pub decision: Option<String>,
    /// RFC 3339 timestamp or duration string (`1h`, `30m`).
    pub since: Option<String>,
    pub limit: Option<usize>,
}

/// `GET /api/v1/audit`
pub async fn query_audit(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuditQueryParams>,
) -> Response {
    let query = QueryParams {
        agent: params.agent,
        decision: params.decision,
        since: params.since,
        limit: Some(params.limit.unwrap_or(100)),
    };
    match state.audit.query(query).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => api_error(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

/// `GET /api/v1/audit/verify`
pub async fn verify_audit(State(state): State<Arc<AppState>>) -> Response {
    match state.audit.verify_chain() {
        Ok(result) => Json(result).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// Query parameters for `GET /api/v1/audit/export`.
#[derive(Debug, Default, Deserialize)]
pub struct ExportParams {
    pub format: Option<String>,
}

/// `GET /api/v1/audit/export?format=jsonl|json|csv`
pub async fn export_audit(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ExportParams>,
) -> Response {
    let format = params.format.unwrap_or_else(|| "jsonl".to_string());
    match state.audit.export(&format) {
        Ok(text) => {
            let content_type = match format.as_str() {
                "json" => "application/json",
                "csv" => "text/csv",
                _ => "application/x-ndjson",
            };
            ([("content-type", content_type)], text).into_response()
        }
        Err(e) => api_error(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}
