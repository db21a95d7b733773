//! API error responses
//!
//! Domain and precondition failures answer 400 with `{message, type}`.
//! Missing admin credentials answer 401. System failures answer 500 with
//! `{message, error}` and are logged.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cartwright_billing::BillingError;
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Unknown checkout action: {0}")]
    UnknownAction(String),

    #[error("Missing or invalid x-organization-id header")]
    MissingOrganization,

    #[error("Missing or invalid admin credentials")]
    Unauthorized,

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn error_type(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::UnknownAction(_) => "unknown_action",
            ApiError::MissingOrganization => "missing_organization",
            ApiError::Unauthorized => "unauthorized",
            ApiError::Billing(e) => e.error_type(),
            ApiError::Internal(_) => "internal_error",
        }
    }

    fn is_client_error(&self) -> bool {
        match self {
            ApiError::Billing(e) => e.is_client_error(),
            ApiError::Internal(_) => false,
            _ => true,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, ApiError::Unauthorized) {
            tracing::warn!("Rejected admin request without valid credentials");
            let body = json!({
                "message": self.to_string(),
                "type": self.error_type(),
            });
            return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
        }

        if self.is_client_error() {
            tracing::debug!(error_type = self.error_type(), error = %self, "Rejected request");
            let body = json!({
                "message": self.to_string(),
                "type": self.error_type(),
            });
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }

        tracing::error!(error_type = self.error_type(), error = %self, "Request failed");
        let body = json!({
            "message": "Internal server error",
            "error": self.to_string(),
        });
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Validation(format!("Invalid request body: {}", e))
    }
}
