// Group lifecycle routes: CRUD, membership, roles, settings, permission
// overrides and pins.
use crate::api::agent_context::resolve_agent;
use crate::api::errors::service_error_response;
use crate::services::now_ts;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/groups", get(list_groups).post(create_group))
        .route("/api/groups/{group_id}", get(get_group).delete(delete_group))
        .route(
            "/api/groups/{group_id}/settings",
            get(get_settings).patch(update_settings),
        )
        .route("/api/groups/{group_id}/permissions", put(update_permissions))
        .route("/api/groups/{group_id}/join", post(join_group))
        .route("/api/groups/{group_id}/leave", post(leave_group))
        .route(
            "/api/groups/{group_id}/members/{agent_id}",
            delete(remove_member),
        )
        .route(
            "/api/groups/{group_id}/members/{agent_id}/role",
            axum::routing::patch(set_member_role),
        )
        .route(
            "/api/groups/{group_id}/messages/{message_id}/pin",
            post(pin_message).delete(unpin_message),
        )
}

#[derive(Debug, Deserialize)]
struct ListGroupsQuery {
    #[serde(default)]
    all: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    is_public: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct UpdateSettingsRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SetRoleRequest {
    role: String,
}

async fn list_groups(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListGroupsQuery>,
) -> Result<Json<serde_json::Value>, Response> {
    resolve_agent(&state, &headers)?;
    let public_only = !query.all.unwrap_or(false);
    let groups = state
        .groups
        .list(public_only)
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "groups": groups })))
}

async fn create_group(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateGroupRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    let view = state
        .groups
        .create(
            &resolved.agent,
            &payload.name,
            payload.description,
            payload.is_public.unwrap_or(true),
            now_ts(),
        )
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "group": view })))
}

async fn get_group(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(group_id): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    resolve_agent(&state, &headers)?;
    let view = state.groups.get(&group_id).map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "group": view })))
}

async fn delete_group(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(group_id): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    state
        .groups
        .delete(&resolved.agent, &group_id)
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true })))
}

async fn get_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(group_id): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    let view = state
        .groups
        .get_settings(&resolved.agent, &group_id)
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "settings": view })))
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(group_id): Path<String>,
    Json(payload): Json<UpdateSettingsRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    let view = state
        .groups
        .update_settings(
            &resolved.agent,
            &group_id,
            payload.name,
            payload.description,
            payload.avatar_url,
        )
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "group": view })))
}

async fn update_permissions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(group_id): Path<String>,
    Json(payload): Json<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    let permissions = state
        .groups
        .update_permissions(&resolved.agent, &group_id, &payload)
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "permissions": permissions })))
}

async fn join_group(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(group_id): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    let member = state
        .groups
        .join(&resolved.agent, &group_id, now_ts())
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "member": member })))
}

async fn leave_group(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(group_id): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    state
        .groups
        .leave(&resolved.agent, &group_id)
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true })))
}

async fn remove_member(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((group_id, agent_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    state
        .groups
        .remove_member(&resolved.agent, &group_id, &agent_id)
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true })))
}

async fn set_member_role(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((group_id, agent_id)): Path<(String, String)>,
    Json(payload): Json<SetRoleRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    state
        .groups
        .set_member_role(&resolved.agent, &group_id, &agent_id, &payload.role)
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true })))
}

async fn pin_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((group_id, message_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    state
        .groups
        .pin_message(&resolved.agent, &group_id, &message_id, now_ts())
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true })))
}

async fn unpin_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((group_id, message_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    state
        .groups
        .unpin_message(&resolved.agent, &group_id, &message_id)
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true })))
}
