// Badge catalogue reads are public; awarding and revoking require auth.
use crate::api::agent_context::resolve_agent;
use crate::api::errors::service_error_response;
use crate::services::error::ServiceError;
use crate::services::now_ts;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/badges", get(list_badges))
        .route("/api/badges/award", post(award_badge))
        .route("/api/badges/revoke", delete(revoke_badge))
        .route("/api/badges/agent/{agent_id}", get(agent_badges))
        .route("/api/badges/{slug}", get(get_badge))
}

#[derive(Debug, Deserialize)]
struct AwardRequest {
    agent_id: String,
    badge_slug: String,
    #[serde(default)]
    expires_at: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RevokeRequest {
    agent_id: String,
    badge_slug: String,
}

async fn list_badges(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, Response> {
    let badges = state.badges.list().map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "badges": badges })))
}

async fn get_badge(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let badge = state.badges.get(&slug).map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "badge": badge })))
}

async fn agent_badges(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    if state
        .storage
        .get_agent(&agent_id)
        .map_err(|err| service_error_response(err.into()))?
        .is_none()
    {
        return Err(service_error_response(ServiceError::NotFound(
            "agent not found".to_string(),
        )));
    }
    let badges = state
        .badges
        .badges_for_agent(&agent_id, now_ts())
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "badges": badges })))
}

async fn award_badge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<AwardRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    if state
        .storage
        .get_agent(&payload.agent_id)
        .map_err(|err| service_error_response(err.into()))?
        .is_none()
    {
        return Err(service_error_response(ServiceError::NotFound(
            "agent not found".to_string(),
        )));
    }
    let awarded = state
        .badges
        .award(
            &payload.agent_id,
            &payload.badge_slug,
            &resolved.agent.agent_id,
            payload.expires_at,
            now_ts(),
        )
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "awarded": awarded })))
}

async fn revoke_badge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<RevokeRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    resolve_agent(&state, &headers)?;
    state
        .badges
        .revoke(&payload.agent_id, &payload.badge_slug)
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true })))
}
