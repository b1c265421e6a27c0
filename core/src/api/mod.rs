//! HTTP surface exposed to clients.
//!
//! Versioned modules (currently `v1`) group related routes so the interface
//! stays stable while the implementation moves underneath.

pub mod v1;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::errors::{GenieError, ProviderFailure};

/// JSON error body: `{ code, error, explain }`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub error: String,
    pub explain: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<ProviderFailure>,
}

/// Adapter turning [`GenieError`] into an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub GenieError);

impl From<GenieError> for ApiError {
    fn from(err: GenieError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            GenieError::InvalidRequest(_) | GenieError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            GenieError::NotFound(_) => StatusCode::NOT_FOUND,
            GenieError::ProvidersExhausted(_) | GenieError::SourceUnavailable { .. } => {
                StatusCode::BAD_GATEWAY
            }
            GenieError::NoProviderConfigured => StatusCode::SERVICE_UNAVAILABLE,
            GenieError::DbUnavailable(_) | GenieError::Unknown(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("request failed [{}]: {}", self.0.code(), self.0);
        }
        let attempts = match &self.0 {
            GenieError::ProvidersExhausted(failures) => failures.clone(),
            _ => Vec::new(),
        };
        let body = ErrorBody {
            code: self.0.code(),
            error: self.0.to_string(),
            explain: self.0.explain(),
            attempts,
        };
        (status, Json(body)).into_response()
    }
}
