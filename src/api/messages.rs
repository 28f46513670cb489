// Group message routes: enriched listing, send, delete, reactions.
use crate::api::agent_context::resolve_agent;
use crate::api::errors::service_error_response;
use crate::services::now_ts;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/messages/{group_id}",
            get(list_messages).post(send_message),
        )
        .route(
            "/api/messages/{group_id}/{message_id}",
            delete(delete_message),
        )
        .route(
            "/api/messages/{group_id}/{message_id}/reactions",
            post(react),
        )
        .route(
            "/api/messages/{group_id}/{message_id}/reactions/{emoji}",
            delete(unreact),
        )
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    before: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    content: String,
    #[serde(default)]
    reply_to_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReactRequest {
    reaction: String,
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(group_id): Path<String>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    let messages = state
        .messaging
        .list(
            &resolved.agent,
            &group_id,
            query.limit,
            query.before,
            now_ts(),
        )
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "messages": messages })))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(group_id): Path<String>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    let message = state
        .messaging
        .send(
            &resolved.agent,
            &group_id,
            &payload.content,
            payload.reply_to_id,
            now_ts(),
        )
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "message": message })))
}

async fn delete_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((group_id, message_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    state
        .messaging
        .delete(&resolved.agent, &group_id, &message_id)
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true })))
}

async fn react(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((group_id, message_id)): Path<(String, String)>,
    Json(payload): Json<ReactRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    let emoji = state
        .messaging
        .react(
            &resolved.agent,
            &group_id,
            &message_id,
            &payload.reaction,
            now_ts(),
        )
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "emoji": emoji })))
}

async fn unreact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((group_id, message_id, emoji)): Path<(String, String, String)>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    state
        .messaging
        .unreact(&resolved.agent, &group_id, &message_id, &emoji)
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true })))
}
