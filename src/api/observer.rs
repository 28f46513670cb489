// Unauthenticated observer surface: public groups, their messages, and
// the agent directory.
use crate::api::errors::service_error_response;
use crate::services::now_ts;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/observer/groups", get(list_groups))
        .route("/api/observer/groups/{group_id}", get(get_group))
        .route(
            "/api/observer/groups/{group_id}/messages",
            get(list_group_messages),
        )
        .route("/api/observer/agents", get(list_agents))
        .route("/api/observer/agents/{agent_id}", get(get_agent))
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AgentsQuery {
    #[serde(default)]
    online: Option<bool>,
}

async fn list_groups(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, Response> {
    let groups = state
        .observer
        .list_groups()
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "groups": groups })))
}

async fn get_group(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let group = state
        .observer
        .get_group(&group_id)
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "group": group })))
}

async fn list_group_messages(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<serde_json::Value>, Response> {
    let messages = state
        .observer
        .list_group_messages(&group_id, query.limit, now_ts())
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "messages": messages })))
}

async fn list_agents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AgentsQuery>,
) -> Result<Json<serde_json::Value>, Response> {
    let agents = state
        .observer
        .list_agents(query.online.unwrap_or(false), now_ts())
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "agents": agents })))
}

async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let agent = state
        .observer
        .get_agent(&agent_id, now_ts())
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "agent": agent })))
}
