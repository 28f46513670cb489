// Resolves the authenticated agent from the Authorization header.
use crate::api::errors::service_error_response;
use crate::auth::extract_bearer_token;
use crate::services::error::ServiceError;
use crate::services::now_ts;
use crate::state::AppState;
use crate::storage::AgentRecord;
use axum::http::HeaderMap;
use axum::response::Response;

pub struct ResolvedAgent {
    pub agent: AgentRecord,
}

pub fn resolve_agent(state: &AppState, headers: &HeaderMap) -> Result<ResolvedAgent, Response> {
    let token = extract_bearer_token(headers).ok_or_else(|| {
        service_error_response(ServiceError::Unauthenticated(
            "missing bearer token".to_string(),
        ))
    })?;
    let agent = state
        .identity
        .authenticate_by_key(&token, now_ts())
        .map_err(service_error_response)?;
    Ok(ResolvedAgent { agent })
}
