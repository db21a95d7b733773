//! Cart mutations
//!
//! Every mutation loads the session, rejects it if closed, applies the change
//! and recomputes the cached total before saving.

use std::sync::Arc;

use cartwright_shared::{CheckoutLineItem, CheckoutSessionView, JsonMap, Money};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::GatewayRegistry;
use crate::store::CheckoutStore;

/// Target of a `set_item` call; an offer item wins over a bare price
#[derive(Debug, Clone, Default)]
pub struct SetItemRequest {
    pub offer_item_id: Option<Uuid>,
    pub price_id: Option<Uuid>,
    pub quantity: u32,
}

/// Sum of live line totals minus discounts, floored at zero.
///
/// Fixed amounts in the session currency apply first, then percentages on
/// what remains.
pub fn recompute_total(view: &CheckoutSessionView) -> BillingResult<i64> {
    let currency = &view.session.currency;
    let mut subtotal = Money::zero(currency.clone());
    for line in view.live_lines() {
        subtotal = subtotal.checked_add(&Money::new(line.line.total_amount, currency.clone()))?;
    }

    let amount_off: i64 = view
        .session
        .discounts
        .iter()
        .filter(|d| d.currency.as_ref().map(|c| c == currency).unwrap_or(true))
        .filter_map(|d| d.amount_off)
        .sum();
    let mut remaining = subtotal.amount.saturating_sub(amount_off).max(0);

    for percent in view.session.discounts.iter().filter_map(|d| d.percent_off) {
        let keep = (100.0 - percent.clamp(0.0, 100.0)) / 100.0;
        remaining = (remaining as f64 * keep).round() as i64;
    }

    Ok(remaining.max(0))
}

#[derive(Clone)]
pub struct CheckoutSessionService {
    store: Arc<dyn CheckoutStore>,
    gateways: GatewayRegistry,
}

impl CheckoutSessionService {
    pub fn new(store: Arc<dyn CheckoutStore>, gateways: GatewayRegistry) -> Self {
        Self { store, gateways }
    }

    pub async fn get(&self, org_id: Uuid, session_id: Uuid) -> BillingResult<CheckoutSessionView> {
        self.store
            .load_session(org_id, session_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Checkout session {}", session_id)))
    }

    async fn load_open(&self, org_id: Uuid, session_id: Uuid) -> BillingResult<CheckoutSessionView> {
        let view = self.get(org_id, session_id).await?;
        if view.session.is_closed() {
            return Err(BillingError::SessionClosed(session_id));
        }
        if view.session.is_committing() {
            return Err(BillingError::CommitInProgress(session_id));
        }
        Ok(view)
    }

    /// Recompute the total and persist the session
    async fn save(&self, mut view: CheckoutSessionView) -> BillingResult<CheckoutSessionView> {
        view.session.total = recompute_total(&view)?;
        view.session.updated_at = OffsetDateTime::now_utc();
        self.store.save_session(&view.session).await?;
        Ok(view)
    }

    pub async fn set_fields(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        email: Option<String>,
        name: Option<String>,
    ) -> BillingResult<CheckoutSessionView> {
        let mut view = self.load_open(org_id, session_id).await?;

        if let Some(email) = email {
            let email = email.trim();
            if email.is_empty() || !email.contains('@') {
                return Err(BillingError::InvalidInput(format!(
                    "Invalid email address: {}",
                    email
                )));
            }
            view.session.customer_email = Some(email.to_string());
        }
        if let Some(name) = name {
            let name = name.trim();
            view.session.customer_name = (!name.is_empty()).then(|| name.to_string());
        }

        self.save(view).await
    }

    /// Merge properties; a `null` value removes the key
    pub async fn set_properties(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        properties: JsonMap,
    ) -> BillingResult<CheckoutSessionView> {
        let mut view = self.load_open(org_id, session_id).await?;

        for (key, value) in properties {
            if value.is_null() {
                view.session.properties.remove(&key);
            } else {
                view.session.properties.insert(key, value);
            }
        }

        self.save(view).await
    }

    /// Upsert the live line for an offer item or price; quantity 0 removes it
    pub async fn set_item(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        request: SetItemRequest,
    ) -> BillingResult<CheckoutSessionView> {
        let view = self.load_open(org_id, session_id).await?;

        let offer_item = match request.offer_item_id {
            Some(id) => {
                let item = self
                    .store
                    .find_offer_item(id)
                    .await?
                    .ok_or_else(|| BillingError::NotFound(format!("Offer item {}", id)))?;
                if let Some(offer_id) = view.session.offer_id {
                    if item.offer_id != offer_id {
                        return Err(BillingError::InvalidInput(format!(
                            "Offer item {} does not belong to this checkout's offer",
                            id
                        )));
                    }
                }
                Some(item)
            }
            None => None,
        };

        let price_id = request
            .price_id
            .or_else(|| offer_item.as_ref().and_then(|i| i.price_id))
            .ok_or_else(|| {
                BillingError::InvalidInput("set_item needs an offer item or a price".to_string())
            })?;

        let existing = view
            .live_lines()
            .find(|l| match &offer_item {
                Some(item) => l.line.offer_item_id == Some(item.id),
                None => l.line.offer_item_id.is_none() && l.line.price_id == Some(price_id),
            })
            .map(|l| l.line.clone());

        if request.quantity == 0 {
            if offer_item.as_ref().map(|i| i.required).unwrap_or(false) {
                return Err(BillingError::Precondition(
                    "A required offer item cannot be removed".to_string(),
                ));
            }
            if let Some(mut line) = existing {
                line.deleted_at = Some(OffsetDateTime::now_utc());
                self.store.upsert_line(&line).await?;
                tracing::debug!(session_id = %session_id, line_id = %line.id, "Removed checkout line");
            }
        } else {
            let price = self
                .store
                .find_price(org_id, price_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("Price {}", price_id)))?;
            if !price.price.active {
                return Err(BillingError::InvalidInput(format!(
                    "Price {} is not active",
                    price_id
                )));
            }
            if price.price.currency != view.session.currency {
                return Err(BillingError::InvalidInput(format!(
                    "Price currency {} does not match checkout currency {}",
                    price.price.currency, view.session.currency
                )));
            }

            let total_amount = price.price.unit_money().scale(request.quantity)?.amount;
            let line = match existing {
                Some(mut line) => {
                    line.price_id = Some(price_id);
                    line.quantity = request.quantity;
                    line.total_amount = total_amount;
                    line
                }
                None => CheckoutLineItem {
                    id: Uuid::new_v4(),
                    session_id,
                    price_id: Some(price_id),
                    offer_item_id: offer_item.as_ref().map(|i| i.id),
                    quantity: request.quantity,
                    total_amount,
                    deleted_at: None,
                },
            };
            self.store.upsert_line(&line).await?;
            tracing::debug!(
                session_id = %session_id,
                line_id = %line.id,
                quantity = line.quantity,
                total_amount = line.total_amount,
                "Set checkout line"
            );
        }

        let view = self.get(org_id, session_id).await?;
        self.save(view).await
    }

    pub async fn add_discount(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        code: &str,
    ) -> BillingResult<CheckoutSessionView> {
        let mut view = self.load_open(org_id, session_id).await?;
        let code = code.trim();

        if view.session.discounts.iter().any(|d| d.code == code) {
            return Ok(view);
        }

        let integration = view.session.integration;
        let gateway = self.gateways.get(integration)?;
        let provider = gateway
            .discount_provider()
            .ok_or(BillingError::CapabilityUnsupported {
                integration,
                capability: "discount codes",
            })?;

        let discount = provider
            .resolve_discount(&view, code)
            .await?
            .ok_or_else(|| {
                BillingError::InvalidInput(format!("Discount code '{}' is not valid", code))
            })?;

        tracing::info!(
            org_id = %org_id,
            session_id = %session_id,
            code = %code,
            "Applied discount code"
        );
        view.session.discounts.push(discount);
        self.save(view).await
    }

    pub async fn remove_discount(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        code: &str,
    ) -> BillingResult<CheckoutSessionView> {
        let mut view = self.load_open(org_id, session_id).await?;
        view.session.discounts.retain(|d| d.code != code.trim());
        self.save(view).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::test::MockGateway;
    use crate::store::test::{fixtures, InMemoryCheckoutStore};
    use cartwright_shared::{Discount, IntegrationType, OfferItemKind};
    use serde_json::json;

    fn service(store: &InMemoryCheckoutStore) -> (CheckoutSessionService, Arc<MockGateway>) {
        let gateway = Arc::new(MockGateway::new());
        let service = CheckoutSessionService::new(
            Arc::new(store.clone()),
            GatewayRegistry::new().with_gateway(gateway.clone()),
        );
        (service, gateway)
    }

    fn empty_session(store: &InMemoryCheckoutStore) -> CheckoutSessionView {
        let org = fixtures::organization();
        let view = fixtures::view(fixtures::session(org, IntegrationType::Stripe), vec![]);
        store.insert_view(&view);
        view
    }

    fn percent(code: &str, percent_off: f64) -> Discount {
        Discount {
            code: code.to_string(),
            gateway_ref: None,
            amount_off: None,
            percent_off: Some(percent_off),
            currency: None,
        }
    }

    #[test]
    fn test_recompute_total_applies_fixed_then_percent() {
        let org = fixtures::organization();
        let mut session = fixtures::session(org, IntegrationType::Stripe);
        let plan = fixtures::recurring_price_view(org, "Pro", 1000, "price_pro");
        session.discounts = vec![
            percent("HALF", 50.0),
            Discount {
                code: "TWO".to_string(),
                gateway_ref: None,
                amount_off: Some(200),
                percent_off: None,
                currency: Some(fixtures::usd()),
            },
        ];
        let view = fixtures::view(session.clone(), vec![fixtures::line(&session, &plan, None, 3)]);

        // (3000 - 200) * 0.5
        assert_eq!(recompute_total(&view).unwrap(), 1400);
    }

    #[test]
    fn test_recompute_total_floors_at_zero() {
        let org = fixtures::organization();
        let mut session = fixtures::session(org, IntegrationType::Stripe);
        let plan = fixtures::recurring_price_view(org, "Pro", 1000, "price_pro");
        session.discounts = vec![Discount {
            code: "BIG".to_string(),
            gateway_ref: None,
            amount_off: Some(5000),
            percent_off: None,
            currency: None,
        }];
        let view = fixtures::view(session.clone(), vec![fixtures::line(&session, &plan, None, 1)]);
        assert_eq!(recompute_total(&view).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_set_item_upserts_and_removes() {
        let store = InMemoryCheckoutStore::new();
        let view = empty_session(&store);
        let org = view.session.organization_id;
        let plan = fixtures::recurring_price_view(org, "Pro", 1200, "price_pro");
        store.insert_price(plan.clone());
        let (service, _) = service(&store);

        let request = |quantity| SetItemRequest {
            price_id: Some(plan.price.id),
            quantity,
            ..Default::default()
        };

        let updated = service
            .set_item(org, view.session.id, request(2))
            .await
            .unwrap();
        assert_eq!(updated.session.total, 2400);

        let updated = service
            .set_item(org, view.session.id, request(5))
            .await
            .unwrap();
        assert_eq!(updated.live_lines().count(), 1);
        assert_eq!(updated.session.total, 6000);

        let updated = service
            .set_item(org, view.session.id, request(0))
            .await
            .unwrap();
        assert_eq!(updated.live_lines().count(), 0);
        assert_eq!(updated.session.total, 0);
        assert_eq!(store.lines(view.session.id).len(), 1);
    }

    #[tokio::test]
    async fn test_required_offer_item_cannot_be_removed() {
        let store = InMemoryCheckoutStore::new();
        let view = empty_session(&store);
        let org = view.session.organization_id;
        let plan = fixtures::recurring_price_view(org, "Pro", 1200, "price_pro");
        let item = fixtures::offer_item(OfferItemKind::Standard, true, plan.price.id);
        store.insert_price(plan);
        store.insert_offer_item(item.clone());
        let (service, _) = service(&store);

        let result = service
            .set_item(
                org,
                view.session.id,
                SetItemRequest {
                    offer_item_id: Some(item.id),
                    quantity: 0,
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(BillingError::Precondition(_))));
    }

    #[tokio::test]
    async fn test_set_item_rejects_other_currency() {
        let store = InMemoryCheckoutStore::new();
        let view = empty_session(&store);
        let org = view.session.organization_id;
        let mut plan = fixtures::recurring_price_view(org, "Pro", 1200, "price_pro");
        plan.price.currency = cartwright_shared::CurrencyCode::parse("eur").unwrap();
        store.insert_price(plan.clone());
        let (service, _) = service(&store);

        let result = service
            .set_item(
                org,
                view.session.id,
                SetItemRequest {
                    price_id: Some(plan.price.id),
                    quantity: 1,
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(BillingError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_set_properties_merges_and_removes() {
        let store = InMemoryCheckoutStore::new();
        let view = empty_session(&store);
        let org = view.session.organization_id;
        let (service, _) = service(&store);

        let mut props = JsonMap::new();
        props.insert("company".to_string(), json!("Acme"));
        props.insert("seats_note".to_string(), json!("ten"));
        service
            .set_properties(org, view.session.id, props)
            .await
            .unwrap();

        let mut patch = JsonMap::new();
        patch.insert("seats_note".to_string(), serde_json::Value::Null);
        let updated = service
            .set_properties(org, view.session.id, patch)
            .await
            .unwrap();

        assert_eq!(updated.session.properties.get("company"), Some(&json!("Acme")));
        assert!(!updated.session.properties.contains_key("seats_note"));
    }

    #[tokio::test]
    async fn test_discounts() {
        let store = InMemoryCheckoutStore::new();
        let view = empty_session(&store);
        let org = view.session.organization_id;
        let (service, gateway) = service(&store);
        gateway.insert_discount(percent("SPRING", 20.0));

        let updated = service
            .add_discount(org, view.session.id, "SPRING")
            .await
            .unwrap();
        assert_eq!(updated.session.discounts.len(), 1);

        // Adding the same code twice is a no-op
        let updated = service
            .add_discount(org, view.session.id, "SPRING")
            .await
            .unwrap();
        assert_eq!(updated.session.discounts.len(), 1);
        assert_eq!(gateway.call_count("resolve_discount"), 1);

        let invalid = service.add_discount(org, view.session.id, "NOPE").await;
        assert!(matches!(invalid, Err(BillingError::InvalidInput(_))));

        let updated = service
            .remove_discount(org, view.session.id, "SPRING")
            .await
            .unwrap();
        assert!(updated.session.discounts.is_empty());
    }

    #[tokio::test]
    async fn test_discounts_need_capability() {
        let store = InMemoryCheckoutStore::new();
        let org = fixtures::organization();
        let view = fixtures::view(fixtures::session(org, IntegrationType::Offline), vec![]);
        store.insert_view(&view);
        let service = CheckoutSessionService::new(
            Arc::new(store.clone()),
            GatewayRegistry::new()
                .with_gateway(Arc::new(MockGateway::basic(IntegrationType::Offline))),
        );

        let result = service.add_discount(org, view.session.id, "SPRING").await;
        assert!(matches!(
            result,
            Err(BillingError::CapabilityUnsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_mutations_rejected_on_closed_session() {
        let store = InMemoryCheckoutStore::new();
        let view = empty_session(&store);
        let org = view.session.organization_id;
        store
            .close_session(org, view.session.id, JsonMap::new())
            .await
            .unwrap();
        let (service, _) = service(&store);

        let result = service
            .set_fields(org, view.session.id, Some("a@example.com".into()), None)
            .await;
        assert!(matches!(result, Err(BillingError::SessionClosed(_))));
    }

    #[tokio::test]
    async fn test_mutations_rejected_while_change_commits() {
        let store = InMemoryCheckoutStore::new();
        let view = empty_session(&store);
        let org = view.session.organization_id;
        store.begin_change_commit(org, view.session.id).await.unwrap();
        let (service, _) = service(&store);

        let result = service
            .set_fields(org, view.session.id, Some("a@example.com".into()), None)
            .await;
        assert!(matches!(result, Err(BillingError::CommitInProgress(_))));
        assert_eq!(store.session(view.session.id).unwrap().customer_email, None);
    }
}
