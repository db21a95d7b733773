//! Billing error types
//!
//! Errors are grouped the way callers need to react to them:
//! precondition violations are rejected before any write and never retried,
//! unsupported capabilities are configuration problems, and gateway failures
//! keep the gateway's message for diagnostics.

use cartwright_shared::{IntegrationType, SharedError};
use thiserror::Error;
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    // Preconditions
    #[error("Checkout session {0} is already closed")]
    SessionClosed(Uuid),

    #[error("Checkout session {0} already has a completed order")]
    AlreadyHasOrder(Uuid),

    #[error("Checkout session {0} is already being committed")]
    CommitInProgress(Uuid),

    #[error("Payment for checkout session {0} is already confirmed")]
    PaymentAlreadyConfirmed(Uuid),

    #[error("Checkout session {0} has no customer")]
    MissingCustomer(Uuid),

    #[error("Checkout session {0} has no prepared payment intent")]
    MissingPaymentIntent(Uuid),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    // Capabilities
    #[error("Integration '{integration}' does not support {capability}")]
    CapabilityUnsupported {
        integration: IntegrationType,
        capability: &'static str,
    },

    #[error("Subscription change preview unavailable: {0}")]
    PreviewUnavailable(String),

    // Gateway
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Gateway request timed out after {0} seconds")]
    GatewayTimeout(u64),

    // Input / lookup
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // System
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Rejected before any mutation; retrying will not help
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BillingError::SessionClosed(_)
                | BillingError::AlreadyHasOrder(_)
                | BillingError::CommitInProgress(_)
                | BillingError::PaymentAlreadyConfirmed(_)
                | BillingError::MissingCustomer(_)
                | BillingError::MissingPaymentIntent(_)
                | BillingError::Precondition(_)
        )
    }

    /// Errors caused by the request or the session state rather than the system
    pub fn is_client_error(&self) -> bool {
        self.is_precondition()
            || matches!(
                self,
                BillingError::CapabilityUnsupported { .. }
                    | BillingError::PreviewUnavailable(_)
                    | BillingError::StripeApi(_)
                    | BillingError::NotFound(_)
                    | BillingError::InvalidInput(_)
            )
    }

    /// Short machine-readable name used in API error bodies
    pub fn error_type(&self) -> &'static str {
        match self {
            BillingError::SessionClosed(_) => "session_closed",
            BillingError::AlreadyHasOrder(_) => "already_has_order",
            BillingError::CommitInProgress(_) => "commit_in_progress",
            BillingError::PaymentAlreadyConfirmed(_) => "payment_already_confirmed",
            BillingError::MissingCustomer(_) => "missing_customer",
            BillingError::MissingPaymentIntent(_) => "missing_payment_intent",
            BillingError::Precondition(_) => "precondition_failed",
            BillingError::CapabilityUnsupported { .. } => "capability_unsupported",
            BillingError::PreviewUnavailable(_) => "preview_unavailable",
            BillingError::StripeApi(_) => "gateway_error",
            BillingError::GatewayTimeout(_) => "gateway_timeout",
            BillingError::NotFound(_) => "not_found",
            BillingError::InvalidInput(_) => "invalid_input",
            BillingError::Database(_) => "database_error",
            BillingError::Config(_) => "configuration_error",
            BillingError::Internal(_) => "internal_error",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        BillingError::StripeApi(format!("Failed to call Stripe API: {}", e))
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::Internal(format!("JSON error: {}", e))
    }
}

impl From<SharedError> for BillingError {
    fn from(e: SharedError) -> Self {
        BillingError::InvalidInput(e.to_string())
    }
}
