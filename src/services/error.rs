use crate::storage::StoreError;
use std::fmt;

/// Service-level error taxonomy. The HTTP gateway maps each kind to a
/// status code; realtime handlers log and drop.
#[derive(Debug)]
pub enum ServiceError {
    Unauthenticated(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Invalid(String),
    PreconditionFailed(String),
    ExternalUnavailable(String),
    Internal(anyhow::Error),
}

impl ServiceError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(anyhow::anyhow!(message.into()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "UNAUTHENTICATED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Invalid(_) => "INVALID",
            Self::PreconditionFailed(_) => "PRECONDITION_FAILED",
            Self::ExternalUnavailable(_) => "EXTERNAL_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Unauthenticated(message)
            | Self::Forbidden(message)
            | Self::NotFound(message)
            | Self::Conflict(message)
            | Self::Invalid(message)
            | Self::PreconditionFailed(message)
            | Self::ExternalUnavailable(message) => message.clone(),
            Self::Internal(err) => err.to_string(),
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

impl std::error::Error for ServiceError {}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(message) => Self::Conflict(message),
            StoreError::Other(inner) => Self::Internal(inner),
        }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
