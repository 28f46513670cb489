// Direct message routes: threads, reactions, blocks, per-side clear and
// the disappearing-timer settings.
use crate::api::agent_context::resolve_agent;
use crate::api::errors::service_error_response;
use crate::services::dm::EncryptedPayload;
use crate::services::error::ServiceError;
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
    // The `{id}` segment is an agent id on thread routes and a message id
    // on reaction routes; one parameter name keeps the match table simple.
    Router::new()
        .route("/api/dm", get(list_conversations))
        .route("/api/dm/blocks", get(list_blocks))
        .route(
            "/api/dm/block/{id}",
            post(block_agent).delete(unblock_agent),
        )
        .route("/api/dm/{id}/reactions", post(react))
        .route("/api/dm/{id}/reactions/{emoji}", delete(unreact))
        .route("/api/dm/{id}", get(list_thread).post(send_message))
        .route("/api/dm/{id}/clear", delete(clear_conversation))
        .route("/api/dm/{id}/settings", get(get_settings))
        .route("/api/dm/{id}/disappear", post(set_disappear))
}

#[derive(Debug, Deserialize)]
struct ThreadQuery {
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SendDmRequest {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reply_to_id: Option<String>,
    #[serde(default)]
    encrypted: Option<bool>,
    #[serde(default)]
    ciphertext: Option<String>,
    #[serde(default)]
    sender_key_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReactRequest {
    reaction: String,
}

#[derive(Debug, Deserialize)]
struct DisappearRequest {
    #[serde(default)]
    timer: Option<i64>,
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    let conversations = state
        .dm
        .conversations(&resolved.agent, now_ts())
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "conversations": conversations })))
}

async fn list_thread(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
    Query(query): Query<ThreadQuery>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    let messages = state
        .dm
        .list_thread(&resolved.agent, &agent_id, query.limit, now_ts())
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "messages": messages })))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
    Json(payload): Json<SendDmRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    // `encrypted: true` requires a ciphertext and vice versa.
    let encrypted = match (payload.encrypted.unwrap_or(false), payload.ciphertext) {
        (true, Some(ciphertext)) if !ciphertext.trim().is_empty() => Some(EncryptedPayload {
            ciphertext,
            sender_key_id: payload.sender_key_id,
        }),
        (true, _) => {
            return Err(service_error_response(ServiceError::Invalid(
                "encrypted messages must carry a ciphertext".to_string(),
            )));
        }
        (false, Some(_)) => {
            return Err(service_error_response(ServiceError::Invalid(
                "ciphertext requires encrypted=true".to_string(),
            )));
        }
        (false, None) => None,
    };
    let message = state
        .dm
        .send(
            &resolved.agent,
            &agent_id,
            payload.content.as_deref().unwrap_or(""),
            payload.reply_to_id,
            encrypted,
            now_ts(),
        )
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "message": message })))
}

async fn react(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(message_id): Path<String>,
    Json(payload): Json<ReactRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    let emoji = state
        .dm
        .react(&resolved.agent, &message_id, &payload.reaction, now_ts())
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "emoji": emoji })))
}

async fn unreact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((message_id, emoji)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    state
        .dm
        .unreact(&resolved.agent, &message_id, &emoji)
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true })))
}

async fn clear_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    state
        .dm
        .clear_conversation(&resolved.agent, &agent_id, now_ts())
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true })))
}

async fn block_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    state
        .dm
        .block(&resolved.agent, &agent_id, now_ts())
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true })))
}

async fn unblock_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    state
        .dm
        .unblock(&resolved.agent, &agent_id)
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true })))
}

async fn list_blocks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    let blocked = state
        .dm
        .blocked_agents(&resolved.agent)
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "blocked": blocked })))
}

async fn get_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    let settings = state
        .dm
        .disappear_settings(&resolved.agent, &agent_id, now_ts())
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "disappearing": settings })))
}

async fn set_disappear(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
    Json(payload): Json<DisappearRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    let settings = state
        .dm
        .set_disappear(&resolved.agent, &agent_id, payload.timer, now_ts())
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "disappearing": settings })))
}
