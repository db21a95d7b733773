//! API routes

pub mod checkout;

use axum::{
    extract::{FromRequestParts, State},
    http::{header, request::Parts, HeaderName, Method},
    routing::{get, post},
    Json, Router,
};
use cartwright_billing::InvariantCheckSummary;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub const ORGANIZATION_HEADER: &str = "x-organization-id";

/// Organization the request acts for, taken from the `x-organization-id` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrganizationId(pub Uuid);

impl<S> FromRequestParts<S> for OrganizationId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(ORGANIZATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .map(OrganizationId)
            .ok_or(ApiError::MissingOrganization)
    }
}

/// Caller presented the configured admin bearer token
#[derive(Debug, Clone, Copy)]
pub struct AdminAuth;

impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.admin_api_token.as_deref() else {
            return Err(ApiError::Unauthorized);
        };

        let presented = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;

        if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
            Ok(AdminAuth)
        } else {
            Err(ApiError::Unauthorized)
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(ORGANIZATION_HEADER),
        ]);

    Router::new()
        .route("/health", get(health))
        .route("/checkout/{session_id}", post(checkout::checkout_action))
        .route("/checkout/{session_id}/preview", get(checkout::preview))
        .route("/admin/invariants", get(admin_invariants))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(cors),
        )
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn admin_invariants(
    _admin: AdminAuth,
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state.billing.check_invariants().await?;

    if !summary.healthy {
        tracing::warn!(
            checks_failed = summary.checks_failed,
            violations = summary.violations.len(),
            "Invariant check found violations"
        );
    }

    Ok(Json(summary))
}
