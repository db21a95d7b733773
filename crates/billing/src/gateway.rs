//! Payment gateway capabilities
//!
//! Every organization has one active integration. The core talks to it through
//! [`PaymentGateway`]; optional features (change previews, change commits,
//! discount codes) are narrow capability traits that a gateway may or may not
//! expose. Gateways are registered per [`IntegrationType`] when the service is
//! built, so an unsupported capability is known before any state is touched.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cartwright_shared::{
    CheckoutSessionView, CurrencyCode, Discount, IntegrationType, IntentMode, RenewInterval,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::base_line::BaseLine;
use crate::error::{BillingError, BillingResult};
use crate::preview::{ChangePreview, EffectiveAt};
use crate::signal::{Signal, SubscriptionStatus};

/// Price attached to a live subscription item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPrice {
    pub id: String,
    pub unit_amount: i64,
    pub currency: CurrencyCode,
    /// `None` for one-time prices
    pub recurring_interval: Option<RenewInterval>,
    pub product_id: Option<String>,
    pub product_name: Option<String>,
}

impl GatewayPrice {
    pub fn is_recurring(&self) -> bool {
        self.recurring_interval.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySubscriptionItem {
    pub id: String,
    pub price: GatewayPrice,
    pub quantity: u32,
}

/// Live subscription as reported by the gateway, with item prices and products expanded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySubscription {
    pub id: String,
    pub customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub items: Vec<GatewaySubscriptionItem>,
    pub trial_end: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
}

/// Requested subscription modification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeIntent {
    pub target_price_id: Uuid,
    pub signal: Signal,
    /// Desired quantity minus current quantity
    pub quantity_delta: i64,
    pub credits_delta: Option<i64>,
    pub effective_at: EffectiveAt,
}

/// Everything the preview engine resolved before asking the gateway for numbers
pub struct ChangeContext<'a> {
    pub session: &'a CheckoutSessionView,
    pub subscription: &'a GatewaySubscription,
    pub base_line: &'a BaseLine,
    pub existing_item: &'a GatewaySubscriptionItem,
    pub desired_quantity: u32,
}

#[derive(Debug, Clone)]
pub struct CreateIntentRequest {
    pub mode: IntentMode,
    pub customer_id: String,
    pub payment_methods: Vec<String>,
    /// Charged amount; only used for payment intents
    pub amount: i64,
    pub currency: CurrencyCode,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayIntent {
    pub id: String,
    pub mode: IntentMode,
    pub client_secret: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayCustomer {
    pub id: String,
}

/// Outcome of a committed subscription change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitResult {
    /// Gateway id of the resulting subscription
    pub id: String,
    pub status: String,
    /// Raw gateway response, kept for support and reconciliation
    pub payload: serde_json::Value,
}

impl CommitResult {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "status": self.status,
            "payload": self.payload,
        })
    }
}

/// Operations every integration supports
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn integration(&self) -> IntegrationType;

    /// Fetch a subscription with item prices and products expanded
    async fn retrieve_subscription(&self, subscription_id: &str)
        -> BillingResult<GatewaySubscription>;

    async fn create_intent(&self, request: CreateIntentRequest) -> BillingResult<GatewayIntent>;

    async fn create_customer(
        &self,
        email: &str,
        metadata: HashMap<String, String>,
    ) -> BillingResult<GatewayCustomer>;

    fn change_previewer(&self) -> Option<&dyn ChangePreviewer> {
        None
    }

    fn change_committer(&self) -> Option<&dyn ChangeCommitter> {
        None
    }

    fn discount_provider(&self) -> Option<&dyn DiscountProvider> {
        None
    }
}

/// Computes proration and due-now amounts for a change
#[async_trait]
pub trait ChangePreviewer: Send + Sync {
    async fn preview_change(
        &self,
        ctx: &ChangeContext<'_>,
        intent: &ChangeIntent,
    ) -> BillingResult<ChangePreview>;
}

/// Replays a previewed change on the gateway
#[async_trait]
pub trait ChangeCommitter: Send + Sync {
    async fn commit_change(
        &self,
        session: &CheckoutSessionView,
        preview: &ChangePreview,
    ) -> BillingResult<CommitResult>;
}

/// Resolves discount codes into discount records
#[async_trait]
pub trait DiscountProvider: Send + Sync {
    /// `Ok(None)` when the code does not exist or is not redeemable
    async fn resolve_discount(
        &self,
        session: &CheckoutSessionView,
        code: &str,
    ) -> BillingResult<Option<Discount>>;
}

/// Gateways keyed by integration, fixed at construction time
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<IntegrationType, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.register(gateway);
        self
    }

    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>) {
        let integration = gateway.integration();
        if self.gateways.insert(integration, gateway).is_some() {
            tracing::warn!(integration = %integration, "Replaced registered payment gateway");
        }
    }

    pub fn get(&self, integration: IntegrationType) -> BillingResult<Arc<dyn PaymentGateway>> {
        self.gateways.get(&integration).cloned().ok_or_else(|| {
            BillingError::Config(format!(
                "No payment gateway registered for integration '{}'",
                integration
            ))
        })
    }

    pub fn integrations(&self) -> Vec<IntegrationType> {
        self.gateways.keys().copied().collect()
    }
}

/// Mock gateway for tests
#[cfg(any(test, feature = "test-billing"))]
#[allow(clippy::unwrap_used)]
pub mod test {
    use super::*;
    use crate::preview::{CommitDescriptor, PreviewLine, PreviewOperation, PreviewTotals, PriceQuantity};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockState {
        subscriptions: HashMap<String, GatewaySubscription>,
        discounts: HashMap<String, Discount>,
        retrieve_error: Option<String>,
        commit_error: Option<String>,
        calls: Vec<String>,
        intents: Vec<CreateIntentRequest>,
        commits: Vec<ChangePreview>,
        intent_error: Option<String>,
    }

    /// In-memory gateway that records every call
    ///
    /// Previews charge the full price difference as a single proration line.
    pub struct MockGateway {
        integration: IntegrationType,
        previews: bool,
        commits: bool,
        discounts: bool,
        counter: AtomicU64,
        state: Mutex<MockState>,
    }

    impl Default for MockGateway {
        fn default() -> Self {
            Self {
                integration: IntegrationType::Stripe,
                previews: true,
                commits: true,
                discounts: true,
                counter: AtomicU64::new(0),
                state: Mutex::new(MockState::default()),
            }
        }
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn for_integration(integration: IntegrationType) -> Self {
            Self {
                integration,
                ..Self::default()
            }
        }

        /// Gateway with no optional capabilities
        pub fn basic(integration: IntegrationType) -> Self {
            Self {
                integration,
                previews: false,
                commits: false,
                discounts: false,
                ..Self::default()
            }
        }

        pub fn without_commits(mut self) -> Self {
            self.commits = false;
            self
        }

        fn next_id(&self, prefix: &str) -> String {
            format!("{}_mock_{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst))
        }

        fn record(&self, call: &str) {
            self.state.lock().unwrap().calls.push(call.to_string());
        }

        pub fn insert_subscription(&self, subscription: GatewaySubscription) {
            self.state
                .lock()
                .unwrap()
                .subscriptions
                .insert(subscription.id.clone(), subscription);
        }

        pub fn insert_discount(&self, discount: Discount) {
            self.state
                .lock()
                .unwrap()
                .discounts
                .insert(discount.code.clone(), discount);
        }

        pub fn fail_retrieve(&self, message: &str) {
            self.state.lock().unwrap().retrieve_error = Some(message.to_string());
        }

        pub fn fail_commit(&self, message: &str) {
            self.state.lock().unwrap().commit_error = Some(message.to_string());
        }

        pub fn fail_intent(&self, message: &str) {
            self.state.lock().unwrap().intent_error = Some(message.to_string());
        }

        pub fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        pub fn call_count(&self, name: &str) -> usize {
            self.state
                .lock()
                .unwrap()
                .calls
                .iter()
                .filter(|c| c.as_str() == name)
                .count()
        }

        pub fn intent_requests(&self) -> Vec<CreateIntentRequest> {
            self.state.lock().unwrap().intents.clone()
        }

        pub fn committed_previews(&self) -> Vec<ChangePreview> {
            self.state.lock().unwrap().commits.clone()
        }
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        fn integration(&self) -> IntegrationType {
            self.integration
        }

        async fn retrieve_subscription(
            &self,
            subscription_id: &str,
        ) -> BillingResult<GatewaySubscription> {
            self.record("retrieve_subscription");
            let state = self.state.lock().unwrap();
            if let Some(message) = &state.retrieve_error {
                return Err(BillingError::StripeApi(message.clone()));
            }
            state
                .subscriptions
                .get(subscription_id)
                .cloned()
                .ok_or_else(|| {
                    BillingError::StripeApi(format!("No such subscription: '{}'", subscription_id))
                })
        }

        async fn create_intent(&self, request: CreateIntentRequest) -> BillingResult<GatewayIntent> {
            self.record("create_intent");
            if let Some(message) = &self.state.lock().unwrap().intent_error {
                return Err(BillingError::StripeApi(message.clone()));
            }
            let prefix = match request.mode {
                IntentMode::Setup => "seti",
                IntentMode::Payment => "pi",
            };
            let id = self.next_id(prefix);
            let intent = GatewayIntent {
                client_secret: format!("{}_secret_mock", id),
                id,
                mode: request.mode,
                status: "requires_payment_method".to_string(),
            };
            self.state.lock().unwrap().intents.push(request);
            Ok(intent)
        }

        async fn create_customer(
            &self,
            _email: &str,
            _metadata: HashMap<String, String>,
        ) -> BillingResult<GatewayCustomer> {
            self.record("create_customer");
            Ok(GatewayCustomer {
                id: self.next_id("cus"),
            })
        }

        fn change_previewer(&self) -> Option<&dyn ChangePreviewer> {
            if self.previews {
                Some(self)
            } else {
                None
            }
        }

        fn change_committer(&self) -> Option<&dyn ChangeCommitter> {
            if self.commits {
                Some(self)
            } else {
                None
            }
        }

        fn discount_provider(&self) -> Option<&dyn DiscountProvider> {
            if self.discounts {
                Some(self)
            } else {
                None
            }
        }
    }

    #[async_trait]
    impl ChangePreviewer for MockGateway {
        async fn preview_change(
            &self,
            ctx: &ChangeContext<'_>,
            intent: &ChangeIntent,
        ) -> BillingResult<ChangePreview> {
            self.record("preview_change");
            let current = ctx.existing_item.price.unit_amount * i64::from(ctx.existing_item.quantity);
            let future = ctx.base_line.unit_amount * i64::from(ctx.desired_quantity);
            let due_now = (future - current).max(0);
            let currency = ctx.base_line.currency.clone();

            Ok(ChangePreview {
                signal: intent.signal,
                effective: intent.effective_at.clone(),
                totals: PreviewTotals {
                    due_now,
                    currency: currency.clone(),
                },
                lines: vec![PreviewLine {
                    description: format!("Proration for {}", ctx.base_line.product_name),
                    amount: future - current,
                    currency,
                    is_proration: true,
                }],
                operations: vec![PreviewOperation {
                    current: Some(PriceQuantity {
                        price: Some(ctx.existing_item.price.id.clone()),
                        unit_amount: ctx.existing_item.price.unit_amount,
                        quantity: ctx.existing_item.quantity,
                    }),
                    future: PriceQuantity {
                        price: ctx.base_line.gateway_price_ref.clone(),
                        unit_amount: ctx.base_line.unit_amount,
                        quantity: ctx.desired_quantity,
                    },
                    quantity_delta: intent.quantity_delta,
                }],
                commit: CommitDescriptor::Update {
                    subscription_id: ctx.subscription.id.clone(),
                    item_id: ctx.existing_item.id.clone(),
                    price: ctx.base_line.gateway_price_ref.clone(),
                    local_price_id: intent.target_price_id,
                    quantity: ctx.desired_quantity,
                    proration_behavior: "create_prorations".to_string(),
                    proration_date: Some(intent.effective_at.at.unix_timestamp()),
                },
            })
        }
    }

    #[async_trait]
    impl ChangeCommitter for MockGateway {
        async fn commit_change(
            &self,
            _session: &CheckoutSessionView,
            preview: &ChangePreview,
        ) -> BillingResult<CommitResult> {
            self.record("commit_change");
            // Let a concurrent caller run while this commit is "on the wire"
            tokio::task::yield_now().await;
            let mut state = self.state.lock().unwrap();
            if let Some(message) = &state.commit_error {
                return Err(BillingError::StripeApi(message.clone()));
            }
            state.commits.push(preview.clone());
            let id = match &preview.commit {
                CommitDescriptor::Update {
                    subscription_id, ..
                } => subscription_id.clone(),
                CommitDescriptor::Create { .. } => self.next_id("sub"),
            };
            Ok(CommitResult {
                id,
                status: "active".to_string(),
                payload: serde_json::json!({ "signal": preview.signal }),
            })
        }
    }

    #[async_trait]
    impl DiscountProvider for MockGateway {
        async fn resolve_discount(
            &self,
            _session: &CheckoutSessionView,
            code: &str,
        ) -> BillingResult<Option<Discount>> {
            self.record("resolve_discount");
            Ok(self.state.lock().unwrap().discounts.get(code).cloned())
        }
    }
}
