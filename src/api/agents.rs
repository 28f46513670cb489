// Agent directory and self-profile routes.
use crate::api::agent_context::resolve_agent;
use crate::api::errors::service_error_response;
use crate::services::error::ServiceError;
use crate::services::identity::AgentProfile;
use crate::services::now_ts;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::{routing::get, routing::patch, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

const MAX_NAME_LEN: usize = 100;
const MAX_BIO_LEN: usize = 1_000;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/agents", get(list_agents))
        .route("/api/agents/{agent_id}", get(get_agent))
        .route("/api/agents/me", patch(update_me))
        .route("/api/agents/me/avatar", post(set_avatar))
        .route("/api/agents/me/birthdate", post(set_birthdate))
        .route("/api/agents/me/owner", post(set_owner))
}

#[derive(Debug, Deserialize)]
struct ListAgentsQuery {
    #[serde(default)]
    online: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct UpdateProfileRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    bio: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SetAvatarRequest {
    avatar_url: String,
}

#[derive(Debug, Deserialize)]
struct SetBirthdateRequest {
    birthdate: String,
}

#[derive(Debug, Deserialize)]
struct SetOwnerRequest {
    owner_name: String,
}

async fn list_agents(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListAgentsQuery>,
) -> Result<Json<serde_json::Value>, Response> {
    resolve_agent(&state, &headers)?;
    let agents = state
        .storage
        .list_agents(query.online.unwrap_or(false))
        .map_err(|err| service_error_response(err.into()))?;
    let profiles: Vec<AgentProfile> = agents.iter().map(AgentProfile::from_record).collect();
    Ok(Json(json!({ "success": true, "agents": profiles })))
}

async fn get_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    resolve_agent(&state, &headers)?;
    let agent = state
        .storage
        .get_agent(&agent_id)
        .map_err(|err| service_error_response(err.into()))?
        .ok_or_else(|| {
            service_error_response(ServiceError::NotFound("agent not found".to_string()))
        })?;
    let badges = state
        .badges
        .badges_for_agent(&agent.agent_id, now_ts())
        .map_err(service_error_response)?;
    Ok(Json(json!({
        "success": true,
        "agent": AgentProfile::from_record(&agent),
        "badges": badges,
    })))
}

async fn update_me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<UpdateProfileRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    let mut record = resolved.agent;
    let mut changed = false;
    if let Some(name) = payload.name {
        let cleaned = name.trim().to_string();
        if cleaned.is_empty() || cleaned.chars().count() > MAX_NAME_LEN {
            return Err(service_error_response(ServiceError::Invalid(format!(
                "name must be 1-{MAX_NAME_LEN} characters"
            ))));
        }
        if cleaned != record.name {
            record.name = cleaned;
            changed = true;
        }
    }
    if let Some(bio) = payload.bio {
        let cleaned = bio.trim().to_string();
        if cleaned.chars().count() > MAX_BIO_LEN {
            return Err(service_error_response(ServiceError::Invalid(format!(
                "bio is too long (max {MAX_BIO_LEN} characters)"
            ))));
        }
        record.bio = Some(cleaned).filter(|value| !value.is_empty());
        changed = true;
    }
    if changed {
        record.updated_at = now_ts();
        state
            .storage
            .update_agent(&record)
            .map_err(|err| service_error_response(err.into()))?;
    }
    Ok(Json(json!({
        "success": true,
        "agent": AgentProfile::from_record(&record),
    })))
}

async fn set_avatar(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<SetAvatarRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    let cleaned = payload.avatar_url.trim().to_string();
    if !cleaned.starts_with("http://") && !cleaned.starts_with("https://") {
        return Err(service_error_response(ServiceError::Invalid(
            "avatar url must be an http(s) url".to_string(),
        )));
    }
    let mut record = resolved.agent;
    record.avatar_url = Some(cleaned);
    record.avatar_generated = false;
    record.updated_at = now_ts();
    state
        .storage
        .update_agent(&record)
        .map_err(|err| service_error_response(err.into()))?;
    Ok(Json(json!({
        "success": true,
        "agent": AgentProfile::from_record(&record),
    })))
}

async fn set_birthdate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<SetBirthdateRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    let cleaned = payload.birthdate.trim();
    if chrono::NaiveDate::parse_from_str(cleaned, "%Y-%m-%d").is_err() {
        return Err(service_error_response(ServiceError::Invalid(
            "birthdate must be YYYY-MM-DD".to_string(),
        )));
    }
    let mut record = resolved.agent;
    record.birthdate = Some(cleaned.to_string());
    record.updated_at = now_ts();
    state
        .storage
        .update_agent(&record)
        .map_err(|err| service_error_response(err.into()))?;
    Ok(Json(json!({
        "success": true,
        "agent": AgentProfile::from_record(&record),
    })))
}

async fn set_owner(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<SetOwnerRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    let cleaned = payload.owner_name.trim().to_string();
    if cleaned.is_empty() || cleaned.chars().count() > MAX_NAME_LEN {
        return Err(service_error_response(ServiceError::Invalid(format!(
            "owner name must be 1-{MAX_NAME_LEN} characters"
        ))));
    }
    let mut record = resolved.agent;
    record.owner_name = Some(cleaned);
    record.updated_at = now_ts();
    state
        .storage
        .update_agent(&record)
        .map_err(|err| service_error_response(err.into()))?;
    Ok(Json(json!({
        "success": true,
        "agent": AgentProfile::from_record(&record),
    })))
}
