use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use crate::dispatch::DispatchError;
use crate::location::{LookupError, RefreshError};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(json!({ "detail": message }))).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        let message = err.to_string();
        match err {
            DispatchError::EmptyName => ApiError::BadRequest(message),
            DispatchError::ZoneNotFound { .. } | DispatchError::InstanceNotFound { .. } => {
                ApiError::NotFound(message)
            }
            DispatchError::ZoneLookupUnavailable { .. } | DispatchError::Unavailable { .. } => {
                ApiError::Unavailable(message)
            }
            DispatchError::Failed { .. } => ApiError::Internal(message),
        }
    }
}

impl From<LookupError> for ApiError {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::EmptyName => ApiError::BadRequest(err.to_string()),
            LookupError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            LookupError::ProviderUnavailable { name, .. } => {
                ApiError::Unavailable(format!("Unable to locate VM {name}, the cloud provider is unavailable"))
            }
        }
    }
}

impl From<RefreshError> for ApiError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::InProgress => ApiError::Conflict(err.to_string()),
            RefreshError::NoZones | RefreshError::Scan(_) => ApiError::Unavailable(err.to_string()),
        }
    }
}
