use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::models::FieldErrors;
use crate::resolver::ResolveError;

pub const RATE_LIMIT_MESSAGE: &str = "Rate limit exceeded. Please wait a moment and try again.";
pub const GENERIC_MESSAGE: &str = "An unexpected error occurred. Please try again.";

/// Errors an HTTP handler can answer with.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request")]
    Validation(FieldErrors),
    #[error("{0}")]
    Configuration(String),
    #[error("{}", RATE_LIMIT_MESSAGE)]
    RateLimited,
    #[error("Conversation not found")]
    NotFound,
    #[error("Conversation persistence is not configured")]
    PersistenceDisabled,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a FieldErrors>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Configuration(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::PersistenceDisabled => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error, details) = match &self {
            Self::Validation(details) => (self.to_string(), Some(details)),
            Self::Internal(e) => {
                log::error!("Request failed: {:?}", e);
                (GENERIC_MESSAGE.to_string(), None)
            }
            _ => (self.to_string(), None),
        };
        (status, Json(ErrorBody { error, details })).into_response()
    }
}
