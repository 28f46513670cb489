// Maps the service error taxonomy onto HTTP statuses and the unified
// `{"success": false, "error": "..."}` body.
use crate::services::error::ServiceError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": message.into() })),
    )
        .into_response()
}

pub fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Conflict(_) => StatusCode::CONFLICT,
        ServiceError::Invalid(_) => StatusCode::BAD_REQUEST,
        ServiceError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
        ServiceError::ExternalUnavailable(_) => StatusCode::BAD_GATEWAY,
        ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn service_error_response(err: ServiceError) -> Response {
    if let ServiceError::Internal(inner) = &err {
        // Internal detail goes to the log, not the client.
        error!("internal error: {inner:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
    }
    error_response(status_for(&err), err.message())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;

    #[tokio::test]
    async fn error_body_uses_the_success_envelope() {
        let response = error_response(StatusCode::BAD_REQUEST, "message content is empty");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let payload: Value = serde_json::from_slice(&body).expect("parse json");
        assert_eq!(payload["success"], json!(false));
        assert_eq!(payload["error"], json!("message content is empty"));
    }

    #[test]
    fn taxonomy_maps_to_the_documented_statuses() {
        assert_eq!(
            status_for(&ServiceError::Unauthenticated(String::new())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&ServiceError::Forbidden(String::new())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&ServiceError::NotFound(String::new())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&ServiceError::Conflict(String::new())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&ServiceError::Invalid(String::new())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&ServiceError::PreconditionFailed(String::new())),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            status_for(&ServiceError::ExternalUnavailable(String::new())),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn internal_detail_is_not_leaked() {
        let response =
            service_error_response(ServiceError::Internal(anyhow::anyhow!("db path /secret")));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let payload: Value = serde_json::from_slice(&body).expect("parse json");
        assert_eq!(payload["error"], json!("internal error"));
    }
}
