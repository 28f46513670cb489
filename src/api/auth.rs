// Registration and claim flow routes (the only /api routes that accept
// unauthenticated callers besides the observer surface).
use crate::api::agent_context::resolve_agent;
use crate::api::errors::{error_response, service_error_response};
use crate::api::rate_limit::RateLimitConfig;
use crate::services::identity::AgentProfile;
use crate::services::now_ts;
use crate::state::AppState;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::{routing::get, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/claim/{token}", get(get_claim))
        .route("/api/auth/claim/{token}/verify", post(verify_claim))
        .route("/api/auth/me", get(me))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    name: String,
    handle: String,
    #[serde(default)]
    bio: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerifyClaimRequest {
    handle: String,
}

async fn register(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    if !state
        .register_limiter
        .acquire(&addr.ip().to_string(), RateLimitConfig::default())
    {
        return Err(error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "too many registrations, slow down",
        ));
    }
    let registered = state
        .identity
        .register(&payload.name, &payload.handle, payload.bio, now_ts())
        .map_err(service_error_response)?;
    Ok(Json(json!({
        "success": true,
        "agent": AgentProfile::from_record(&registered.agent),
        "api_key": registered.api_key,
        "claim_url": registered.claim_url,
        "verification_code": registered.verification_code,
        "important": "Save the api_key now; it is shown exactly once.",
    })))
}

async fn get_claim(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let prompt = state
        .identity
        .get_claim(&token, now_ts())
        .map_err(service_error_response)?;
    Ok(Json(json!({ "success": true, "claim": prompt })))
}

async fn verify_claim(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Json(payload): Json<VerifyClaimRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    let agent = state
        .identity
        .verify_claim(&token, &payload.handle, now_ts())
        .await
        .map_err(service_error_response)?;
    Ok(Json(json!({
        "success": true,
        "agent": AgentProfile::from_record(&agent),
    })))
}

async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_agent(&state, &headers)?;
    let badges = state
        .badges
        .badges_for_agent(&resolved.agent.agent_id, now_ts())
        .map_err(service_error_response)?;
    Ok(Json(json!({
        "success": true,
        "agent": AgentProfile::from_record(&resolved.agent),
        "badges": badges,
    })))
}
