// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Cartwright Billing Module
//!
//! Decision engine behind checkout: decides what a checkout means for a
//! customer's subscription and carries it out on the payment gateway.
//!
//! ## Features
//!
//! - **Signals**: Classify a change as acquisition, upgrade, downgrade, expansion, ...
//! - **Change Previews**: Proration and due-now amounts before anything is charged
//! - **Payment Intents**: SetupIntent or PaymentIntent with filtered payment methods
//! - **Commit**: Idempotent order creation or subscription change replay
//! - **Cart Mutations**: Items, properties, customer fields, discount codes
//! - **Invariants**: Runnable consistency checks over sessions and orders

pub mod base_line;
pub mod client;
pub mod commit;
pub mod config;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod payment;
pub mod payment_methods;
pub mod pg_store;
pub mod preview;
pub mod session;
pub mod signal;
pub mod store;
pub mod stripe_gateway;


// Base line
pub use base_line::{resolve_existing_base_item, resolve_new_base_line, BaseLine};

// Client
pub use client::{StripeClient, StripeConfig};

// Commit
pub use commit::{CheckoutCommitOrchestrator, CommitOutcome};

// Config
pub use config::{CheckoutConfig, DEFAULT_TRIAL_DAYS, MAX_TRIAL_DAYS};

// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::{
    ChangeCommitter, ChangeContext, ChangeIntent, ChangePreviewer, CommitResult,
    CreateIntentRequest, DiscountProvider, GatewayCustomer, GatewayIntent, GatewayPrice,
    GatewayRegistry, GatewaySubscription, GatewaySubscriptionItem, PaymentGateway,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Payment
pub use payment::{PaymentIntentPreparer, PrepareRequest, PreparedIntent};
pub use payment_methods::{filter_payment_methods, intent_mode_for, is_redirect_method};

// Preview
pub use preview::{
    resolve_effective_at, ChangePreview, ChangePreviewEngine, CommitDescriptor, EffectiveAt,
    EffectiveTiming, PreviewResult,
};

// Session
pub use session::{recompute_total, CheckoutSessionService, SetItemRequest};

// Signal
pub use signal::{classify, Signal, SubscriptionStatus};

// Store
pub use pg_store::PgCheckoutStore;
pub use store::CheckoutStore;

// Stripe
pub use stripe_gateway::StripeGateway;

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all checkout functionality
#[derive(Clone)]
pub struct BillingService {
    pub store: Arc<dyn CheckoutStore>,
    pub gateways: GatewayRegistry,
    pub sessions: CheckoutSessionService,
    pub previews: ChangePreviewEngine,
    pub payments: PaymentIntentPreparer,
    pub commits: CheckoutCommitOrchestrator,
}

impl BillingService {
    /// Postgres store and Stripe gateway, configured from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let config = CheckoutConfig::from_env()?;
        let gateways =
            GatewayRegistry::new().with_gateway(Arc::new(StripeGateway::new(stripe)));

        tracing::info!(
            integrations = ?gateways.integrations(),
            trial_days = config.trial_days,
            "Billing service configured"
        );

        Ok(Self::new(
            Arc::new(PgCheckoutStore::new(pool)),
            gateways,
            config,
        ))
    }

    /// Create a billing service with an explicit store and gateways
    pub fn new(
        store: Arc<dyn CheckoutStore>,
        gateways: GatewayRegistry,
        config: CheckoutConfig,
    ) -> Self {
        let previews = ChangePreviewEngine::new(gateways.clone(), config.clone());

        Self {
            sessions: CheckoutSessionService::new(store.clone(), gateways.clone()),
            payments: PaymentIntentPreparer::new(store.clone(), gateways.clone(), config),
            commits: CheckoutCommitOrchestrator::new(
                store.clone(),
                gateways.clone(),
                previews.clone(),
            ),
            previews,
            store,
            gateways,
        }
    }

    /// Run every invariant check against the configured store
    pub async fn check_invariants(&self) -> BillingResult<InvariantCheckSummary> {
        self.store.check_invariants().await
    }
}
