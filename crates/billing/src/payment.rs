//! Payment intent preparation
//!
//! Creates the gateway intent the checkout page confirms: a SetupIntent when
//! anything recurring is in the cart (the first charge may come after a
//! trial), a PaymentIntent otherwise.

use std::collections::HashMap;
use std::sync::Arc;

use cartwright_shared::{CheckoutSessionView, IntentMode};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::CheckoutConfig;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{CreateIntentRequest, GatewayRegistry};
use crate::payment_methods::{
    filter_payment_methods, intent_mode_for, is_redirect_method, DEFAULT_METHOD,
};
use crate::store::CheckoutStore;

#[derive(Debug, Clone, Deserialize)]
pub struct PrepareRequest {
    pub email: String,
    /// Method the customer picked, e.g. `card` or `ideal`
    pub payment_type: Option<String>,
    /// Page the customer is on when starting payment
    pub current_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparedIntent {
    pub intent_state: String,
    pub intent_id: String,
    pub intent_type: IntentMode,
    pub client_secret: String,
    pub return_url: String,
    pub is_redirect_method: bool,
    pub payment_methods: Vec<String>,
}

#[derive(Clone)]
pub struct PaymentIntentPreparer {
    store: Arc<dyn CheckoutStore>,
    gateways: GatewayRegistry,
    config: CheckoutConfig,
}

impl PaymentIntentPreparer {
    pub fn new(
        store: Arc<dyn CheckoutStore>,
        gateways: GatewayRegistry,
        config: CheckoutConfig,
    ) -> Self {
        Self {
            store,
            gateways,
            config,
        }
    }

    async fn check_preconditions(&self, view: &CheckoutSessionView) -> BillingResult<()> {
        let session = &view.session;
        if session.is_closed() {
            return Err(BillingError::SessionClosed(session.id));
        }
        if session.is_committing() {
            return Err(BillingError::CommitInProgress(session.id));
        }
        if self
            .store
            .find_order_for_session(session.organization_id, session.id)
            .await?
            .is_some()
        {
            return Err(BillingError::AlreadyHasOrder(session.id));
        }
        if session.payment_confirmed_at.is_some() {
            return Err(BillingError::PaymentAlreadyConfirmed(session.id));
        }
        Ok(())
    }

    pub async fn prepare(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        request: PrepareRequest,
    ) -> BillingResult<PreparedIntent> {
        let mut view = self
            .store
            .load_session(org_id, session_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Checkout session {}", session_id)))?;
        self.check_preconditions(&view).await?;

        let current_url = url::Url::parse(&request.current_url).map_err(|e| {
            BillingError::InvalidInput(format!("Invalid current URL '{}': {}", request.current_url, e))
        })?;

        let mode = intent_mode_for(&view);
        if mode == IntentMode::Payment && view.session.total <= 0 {
            return Err(BillingError::Precondition(format!(
                "Checkout session {} has nothing to pay",
                session_id
            )));
        }

        let integration = view.session.integration;
        let gateway = self.gateways.get(integration)?;

        let customer_id = match view.session.customer_id.clone() {
            Some(existing) => existing,
            None => {
                let metadata = HashMap::from([
                    ("organization_id".to_string(), org_id.to_string()),
                    ("checkout_session_id".to_string(), session_id.to_string()),
                ]);
                let customer = gateway.create_customer(&request.email, metadata).await?;
                tracing::info!(
                    org_id = %org_id,
                    session_id = %session_id,
                    customer_id = %customer.id,
                    "Created gateway customer for checkout"
                );

                // Saved before the intent call so a retry reuses this customer
                view.session.customer_id = Some(customer.id.clone());
                view.session.customer_email = Some(request.email.clone());
                self.store.save_session(&view.session).await?;
                customer.id
            }
        };
        view.session.customer_id = Some(customer_id.clone());
        view.session.customer_email = Some(request.email.clone());

        let enabled = if view.session.enabled_payment_methods.is_empty() {
            vec![DEFAULT_METHOD.to_string()]
        } else {
            view.session.enabled_payment_methods.clone()
        };
        let methods =
            filter_payment_methods(&enabled, mode, view.session.total, &view.session.currency);

        let intent = gateway
            .create_intent(CreateIntentRequest {
                mode,
                customer_id,
                payment_methods: methods.clone(),
                amount: view.session.total,
                currency: view.session.currency.clone(),
                metadata: HashMap::from([
                    ("organization_id".to_string(), org_id.to_string()),
                    ("checkout_session_id".to_string(), session_id.to_string()),
                ]),
            })
            .await?;

        let selected = request
            .payment_type
            .clone()
            .or_else(|| methods.first().cloned())
            .unwrap_or_else(|| DEFAULT_METHOD.to_string());
        let redirect = is_redirect_method(&selected);

        let now = OffsetDateTime::now_utc();
        let session = &mut view.session;
        session.intent_id = Some(intent.id.clone());
        session.intent_type = Some(intent.mode);
        session.client_secret = Some(intent.client_secret.clone());
        session.intent_status = Some(intent.status.clone());
        session.return_url = if self.config.is_app_route(current_url.path()) {
            None
        } else {
            Some(request.current_url.clone())
        };
        session.metadata.insert(
            "payment_current_url".to_string(),
            serde_json::Value::String(request.current_url.clone()),
        );
        session.metadata.insert(
            "payment_method".to_string(),
            serde_json::Value::String(selected.clone()),
        );
        session.metadata.insert(
            "payment_prepared_at".to_string(),
            serde_json::Value::String(now.format(&Rfc3339).unwrap_or_default()),
        );
        session.updated_at = now;

        self.store.save_session(session).await?;

        tracing::info!(
            org_id = %org_id,
            session_id = %session_id,
            intent_id = %intent.id,
            mode = %intent.mode,
            payment_method = %selected,
            redirect = redirect,
            "Prepared payment intent"
        );

        let return_url = if redirect {
            self.config.redirect_callback_url(session_id)
        } else {
            request.current_url
        };

        Ok(PreparedIntent {
            intent_state: intent.status,
            intent_id: intent.id,
            intent_type: intent.mode,
            client_secret: intent.client_secret,
            return_url,
            is_redirect_method: redirect,
            payment_methods: methods,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::test::MockGateway;
    use crate::store::test::{fixtures, InMemoryCheckoutStore};
    use cartwright_shared::{IntegrationType, JsonMap};

    struct Harness {
        store: InMemoryCheckoutStore,
        gateway: Arc<MockGateway>,
        preparer: PaymentIntentPreparer,
    }

    fn harness() -> Harness {
        let store = InMemoryCheckoutStore::new();
        let gateway = Arc::new(MockGateway::new());
        let preparer = PaymentIntentPreparer::new(
            Arc::new(store.clone()),
            GatewayRegistry::new().with_gateway(gateway.clone()),
            CheckoutConfig {
                app_base_url: "https://pay.example.com".to_string(),
                ..Default::default()
            },
        );
        Harness {
            store,
            gateway,
            preparer,
        }
    }

    fn one_time_view(amount: i64, methods: &[&str]) -> CheckoutSessionView {
        let org = fixtures::organization();
        let mut session = fixtures::session(org, IntegrationType::Stripe);
        session.enabled_payment_methods = methods.iter().map(|m| m.to_string()).collect();
        let price = fixtures::one_time_price_view(org, "Workshop", amount);
        fixtures::view(session.clone(), vec![fixtures::line(&session, &price, None, 1)])
    }

    fn request(current_url: &str, payment_type: Option<&str>) -> PrepareRequest {
        PrepareRequest {
            email: "buyer@example.com".to_string(),
            payment_type: payment_type.map(str::to_string),
            current_url: current_url.to_string(),
        }
    }

    #[tokio::test]
    async fn test_recurring_cart_uses_setup_intent() {
        let h = harness();
        let org = fixtures::organization();
        let mut session = fixtures::session(org, IntegrationType::Stripe);
        session.enabled_payment_methods = vec!["card".into(), "klarna".into()];
        let plan = fixtures::recurring_price_view(org, "Pro", 2000, "price_pro");
        let view = fixtures::view(session.clone(), vec![fixtures::line(&session, &plan, None, 1)]);
        h.store.insert_view(&view);

        let prepared = h
            .preparer
            .prepare(
                org,
                session.id,
                request(&format!("https://pay.example.com/checkout/{}", session.id), None),
            )
            .await
            .unwrap();

        assert_eq!(prepared.intent_type, IntentMode::Setup);
        assert_eq!(prepared.payment_methods, vec!["card".to_string()]);
        assert!(!prepared.is_redirect_method);

        let stored = h.store.session(session.id).unwrap();
        assert!(stored.has_prepared_intent());
        assert!(stored.customer_id.is_some());
        // App routes need no explicit return URL
        assert_eq!(stored.return_url, None);
        assert!(stored.metadata.contains_key("payment_prepared_at"));
    }

    #[tokio::test]
    async fn test_external_page_is_stored_as_return_url() {
        let h = harness();
        let view = one_time_view(5000, &["card"]);
        h.store.insert_view(&view);

        let prepared = h
            .preparer
            .prepare(
                view.session.organization_id,
                view.session.id,
                request("https://shop.example.org/cart?step=2", None),
            )
            .await
            .unwrap();

        assert_eq!(prepared.intent_type, IntentMode::Payment);
        assert_eq!(prepared.return_url, "https://shop.example.org/cart?step=2");
        let stored = h.store.session(view.session.id).unwrap();
        assert_eq!(
            stored.return_url.as_deref(),
            Some("https://shop.example.org/cart?step=2")
        );
    }

    #[tokio::test]
    async fn test_redirect_method_gets_callback_url() {
        let h = harness();
        let view = one_time_view(5000, &["card", "ideal"]);
        h.store.insert_view(&view);

        let prepared = h
            .preparer
            .prepare(
                view.session.organization_id,
                view.session.id,
                request("https://shop.example.org/cart", Some("ideal")),
            )
            .await
            .unwrap();

        assert!(prepared.is_redirect_method);
        assert_eq!(
            prepared.return_url,
            format!("https://pay.example.com/checkout/{}/redirect", view.session.id)
        );
    }

    #[tokio::test]
    async fn test_existing_customer_is_reused() {
        let h = harness();
        let mut view = one_time_view(5000, &["card"]);
        view.session.customer_id = Some("cus_existing".to_string());
        h.store.insert_view(&view);

        h.preparer
            .prepare(
                view.session.organization_id,
                view.session.id,
                request("https://shop.example.org/cart", None),
            )
            .await
            .unwrap();

        assert_eq!(h.gateway.call_count("create_customer"), 0);
        assert_eq!(h.gateway.intent_requests()[0].customer_id, "cus_existing");
    }

    #[tokio::test]
    async fn test_failed_intent_keeps_created_customer() {
        let h = harness();
        let view = one_time_view(5000, &["card"]);
        h.store.insert_view(&view);
        h.gateway.fail_intent("Stripe is unavailable");
        let org = view.session.organization_id;

        for _ in 0..2 {
            let result = h
                .preparer
                .prepare(org, view.session.id, request("https://shop.example.org/cart", None))
                .await;
            assert!(matches!(result, Err(BillingError::StripeApi(_))));
        }

        // The retry reused the customer from the first attempt
        assert_eq!(h.gateway.call_count("create_customer"), 1);
        assert_eq!(h.gateway.call_count("create_intent"), 2);
        let stored = h.store.session(view.session.id).unwrap();
        assert_eq!(stored.customer_id.as_deref(), Some("cus_mock_0"));
        assert_eq!(stored.customer_email.as_deref(), Some("buyer@example.com"));
        assert!(!stored.has_prepared_intent());
    }

    #[tokio::test]
    async fn test_payment_mode_filters_by_ceiling() {
        let h = harness();
        let view = one_time_view(250_000, &["card", "afterpay_clearpay"]);
        h.store.insert_view(&view);

        let prepared = h
            .preparer
            .prepare(
                view.session.organization_id,
                view.session.id,
                request("https://shop.example.org/cart", None),
            )
            .await
            .unwrap();
        assert_eq!(prepared.payment_methods, vec!["card".to_string()]);
    }

    #[tokio::test]
    async fn test_preconditions() {
        let h = harness();
        let mut confirmed = one_time_view(5000, &["card"]);
        confirmed.session.payment_confirmed_at = Some(OffsetDateTime::now_utc());
        h.store.insert_view(&confirmed);

        let result = h
            .preparer
            .prepare(
                confirmed.session.organization_id,
                confirmed.session.id,
                request("https://shop.example.org/cart", None),
            )
            .await;
        assert!(matches!(result, Err(BillingError::PaymentAlreadyConfirmed(_))));

        let closed = one_time_view(5000, &["card"]);
        h.store.insert_view(&closed);
        h.store
            .close_session(closed.session.organization_id, closed.session.id, JsonMap::new())
            .await
            .unwrap();
        let result = h
            .preparer
            .prepare(
                closed.session.organization_id,
                closed.session.id,
                request("https://shop.example.org/cart", None),
            )
            .await;
        assert!(matches!(result, Err(BillingError::SessionClosed(_))));
        assert!(h.gateway.calls().is_empty());
    }
}
