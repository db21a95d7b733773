//! Checkout persistence
//!
//! [`CheckoutStore`] is the only seam between the decision engine and storage.
//! Every read is scoped to an organization; a session owned by another
//! organization is reported as absent.

use async_trait::async_trait;
use cartwright_shared::{
    CheckoutLineItem, CheckoutSession, CheckoutSessionView, JsonMap, OfferItem, Order, PriceView,
};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::invariants::InvariantCheckSummary;

#[async_trait]
pub trait CheckoutStore: Send + Sync {
    /// Load a session with its lines, prices, products and offer items
    async fn load_session(
        &self,
        org_id: Uuid,
        session_id: Uuid,
    ) -> BillingResult<Option<CheckoutSessionView>>;

    async fn find_price(&self, org_id: Uuid, price_id: Uuid) -> BillingResult<Option<PriceView>>;

    async fn find_offer_item(&self, offer_item_id: Uuid) -> BillingResult<Option<OfferItem>>;

    /// Persist session fields. Fails with `SessionClosed` if the stored session
    /// is no longer open.
    async fn save_session(&self, session: &CheckoutSession) -> BillingResult<()>;

    /// Insert or update a line by id
    async fn upsert_line(&self, line: &CheckoutLineItem) -> BillingResult<()>;

    async fn find_order_for_session(
        &self,
        org_id: Uuid,
        session_id: Uuid,
    ) -> BillingResult<Option<Order>>;

    /// Turn an open session into an order and close it, atomically.
    ///
    /// Re-checks "no order yet" and "still open" under the same lock as the
    /// write, copies live lines into order items, and derives the order total
    /// from those items.
    async fn create_order_from_session(&self, org_id: Uuid, session_id: Uuid)
        -> BillingResult<Order>;

    /// Claim an open session for a subscription change, atomically.
    ///
    /// Moves the session from open to committing under the same lock as the
    /// "still open, no order" checks, so a second commit of the same session
    /// fails with `CommitInProgress` before it reaches the gateway.
    async fn begin_change_commit(
        &self,
        org_id: Uuid,
        session_id: Uuid,
    ) -> BillingResult<CheckoutSession>;

    /// Return a claimed session to open after the gateway rejected the change
    async fn release_change_commit(&self, org_id: Uuid, session_id: Uuid) -> BillingResult<()>;

    /// Close an open or committing session and merge `metadata_patch` into its metadata
    async fn close_session(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        metadata_patch: JsonMap,
    ) -> BillingResult<CheckoutSession>;

    async fn check_invariants(&self) -> BillingResult<InvariantCheckSummary>;
}

/// In-memory store and fixtures for tests
#[cfg(any(test, feature = "test-billing"))]
#[allow(clippy::unwrap_used)]
pub mod test {
    use super::*;
    use crate::error::BillingError;
    use crate::invariants;
    use cartwright_shared::{OrderItem, SessionStatus};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use time::OffsetDateTime;

    #[derive(Default)]
    struct State {
        sessions: HashMap<Uuid, CheckoutSession>,
        lines: Vec<CheckoutLineItem>,
        prices: HashMap<Uuid, PriceView>,
        offer_items: HashMap<Uuid, OfferItem>,
        orders: Vec<Order>,
    }

    impl State {
        fn view(&self, session: &CheckoutSession) -> CheckoutSessionView {
            let lines = self
                .lines
                .iter()
                .filter(|l| l.session_id == session.id)
                .map(|line| cartwright_shared::LineView {
                    line: line.clone(),
                    price: line.price_id.and_then(|id| self.prices.get(&id).cloned()),
                    offer_item: line
                        .offer_item_id
                        .and_then(|id| self.offer_items.get(&id).cloned()),
                })
                .collect();

            CheckoutSessionView {
                session: session.clone(),
                lines,
            }
        }

        fn open_session_mut(
            &mut self,
            org_id: Uuid,
            session_id: Uuid,
        ) -> BillingResult<&mut CheckoutSession> {
            let session = self
                .sessions
                .get_mut(&session_id)
                .filter(|s| s.organization_id == org_id)
                .ok_or_else(|| {
                    BillingError::NotFound(format!("Checkout session {}", session_id))
                })?;
            match session.status {
                SessionStatus::Open => Ok(session),
                SessionStatus::Committing => Err(BillingError::CommitInProgress(session_id)),
                SessionStatus::Closed => Err(BillingError::SessionClosed(session_id)),
            }
        }

        fn session_mut(
            &mut self,
            org_id: Uuid,
            session_id: Uuid,
        ) -> BillingResult<&mut CheckoutSession> {
            self.sessions
                .get_mut(&session_id)
                .filter(|s| s.organization_id == org_id)
                .ok_or_else(|| BillingError::NotFound(format!("Checkout session {}", session_id)))
        }

        fn has_order(&self, session_id: Uuid) -> bool {
            self.orders
                .iter()
                .any(|o| o.checkout_session_id == session_id)
        }
    }

    /// Store backed by one mutex; every operation is serialised through it
    #[derive(Clone, Default)]
    pub struct InMemoryCheckoutStore {
        inner: Arc<Mutex<State>>,
    }

    impl InMemoryCheckoutStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed a session together with everything its lines reference
        pub fn insert_view(&self, view: &CheckoutSessionView) {
            let mut state = self.inner.lock().unwrap();
            state.sessions.insert(view.session.id, view.session.clone());
            for line in &view.lines {
                if let Some(price) = &line.price {
                    state.prices.insert(price.price.id, price.clone());
                }
                if let Some(item) = &line.offer_item {
                    state.offer_items.insert(item.id, item.clone());
                }
                state.lines.push(line.line.clone());
            }
        }

        pub fn insert_price(&self, price: PriceView) {
            self.inner
                .lock()
                .unwrap()
                .prices
                .insert(price.price.id, price);
        }

        pub fn insert_offer_item(&self, item: OfferItem) {
            self.inner
                .lock()
                .unwrap()
                .offer_items
                .insert(item.id, item);
        }

        pub fn insert_order(&self, order: Order) {
            self.inner.lock().unwrap().orders.push(order);
        }

        pub fn session(&self, session_id: Uuid) -> Option<CheckoutSession> {
            self.inner.lock().unwrap().sessions.get(&session_id).cloned()
        }

        pub fn orders(&self) -> Vec<Order> {
            self.inner.lock().unwrap().orders.clone()
        }

        pub fn lines(&self, session_id: Uuid) -> Vec<CheckoutLineItem> {
            self.inner
                .lock()
                .unwrap()
                .lines
                .iter()
                .filter(|l| l.session_id == session_id)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl CheckoutStore for InMemoryCheckoutStore {
        async fn load_session(
            &self,
            org_id: Uuid,
            session_id: Uuid,
        ) -> BillingResult<Option<CheckoutSessionView>> {
            let state = self.inner.lock().unwrap();
            Ok(state
                .sessions
                .get(&session_id)
                .filter(|s| s.organization_id == org_id)
                .map(|s| state.view(s)))
        }

        async fn find_price(
            &self,
            org_id: Uuid,
            price_id: Uuid,
        ) -> BillingResult<Option<PriceView>> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .prices
                .get(&price_id)
                .filter(|p| p.price.organization_id == org_id)
                .cloned())
        }

        async fn find_offer_item(&self, offer_item_id: Uuid) -> BillingResult<Option<OfferItem>> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .offer_items
                .get(&offer_item_id)
                .cloned())
        }

        async fn save_session(&self, session: &CheckoutSession) -> BillingResult<()> {
            let mut state = self.inner.lock().unwrap();
            let stored = state.open_session_mut(session.organization_id, session.id)?;
            *stored = session.clone();
            Ok(())
        }

        async fn upsert_line(&self, line: &CheckoutLineItem) -> BillingResult<()> {
            let mut state = self.inner.lock().unwrap();
            match state.lines.iter_mut().find(|l| l.id == line.id) {
                Some(existing) => *existing = line.clone(),
                None => state.lines.push(line.clone()),
            }
            Ok(())
        }

        async fn find_order_for_session(
            &self,
            org_id: Uuid,
            session_id: Uuid,
        ) -> BillingResult<Option<Order>> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .orders
                .iter()
                .find(|o| o.checkout_session_id == session_id && o.organization_id == org_id)
                .cloned())
        }

        async fn create_order_from_session(
            &self,
            org_id: Uuid,
            session_id: Uuid,
        ) -> BillingResult<Order> {
            let mut state = self.inner.lock().unwrap();

            if state.has_order(session_id) {
                return Err(BillingError::AlreadyHasOrder(session_id));
            }

            let session = state.open_session_mut(org_id, session_id)?.clone();
            let order_id = Uuid::new_v4();
            let items: Vec<OrderItem> = state
                .lines
                .iter()
                .filter(|l| l.session_id == session_id && l.is_live())
                .map(|line| OrderItem {
                    id: Uuid::new_v4(),
                    order_id,
                    price_id: line.price_id,
                    quantity: line.quantity,
                    amount: line.total_amount,
                })
                .collect();

            if items.is_empty() {
                return Err(BillingError::Precondition(format!(
                    "Checkout session {} has no items",
                    session_id
                )));
            }

            let now = OffsetDateTime::now_utc();
            let order = Order {
                id: order_id,
                organization_id: org_id,
                checkout_session_id: session_id,
                customer_id: session.customer_id.clone(),
                currency: session.currency.clone(),
                discounts: session.discounts.clone(),
                total_amount: items.iter().map(|i| i.amount).sum(),
                items,
                created_at: now,
            };

            let stored = state.open_session_mut(org_id, session_id)?;
            stored.status = SessionStatus::Closed;
            stored.updated_at = now;
            state.orders.push(order.clone());

            Ok(order)
        }

        async fn begin_change_commit(
            &self,
            org_id: Uuid,
            session_id: Uuid,
        ) -> BillingResult<CheckoutSession> {
            let mut state = self.inner.lock().unwrap();
            if state.has_order(session_id) {
                return Err(BillingError::AlreadyHasOrder(session_id));
            }
            let session = state.open_session_mut(org_id, session_id)?;
            session.status = SessionStatus::Committing;
            session.updated_at = OffsetDateTime::now_utc();
            Ok(session.clone())
        }

        async fn release_change_commit(&self, org_id: Uuid, session_id: Uuid) -> BillingResult<()> {
            let mut state = self.inner.lock().unwrap();
            let session = state.session_mut(org_id, session_id)?;
            if session.is_committing() {
                session.status = SessionStatus::Open;
                session.updated_at = OffsetDateTime::now_utc();
            }
            Ok(())
        }

        async fn close_session(
            &self,
            org_id: Uuid,
            session_id: Uuid,
            metadata_patch: JsonMap,
        ) -> BillingResult<CheckoutSession> {
            let mut state = self.inner.lock().unwrap();
            let session = state.session_mut(org_id, session_id)?;
            if session.is_closed() {
                return Err(BillingError::SessionClosed(session_id));
            }
            session.metadata.extend(metadata_patch);
            session.status = SessionStatus::Closed;
            session.updated_at = OffsetDateTime::now_utc();
            Ok(session.clone())
        }

        async fn check_invariants(&self) -> BillingResult<invariants::InvariantCheckSummary> {
            let state = self.inner.lock().unwrap();
            let sessions: Vec<CheckoutSession> = state.sessions.values().cloned().collect();
            let violations = invariants::evaluate(&sessions, &state.orders);
            Ok(invariants::InvariantCheckSummary::from_violations(violations))
        }
    }

    /// Builders for catalog and session records
    pub mod fixtures {
        use cartwright_shared::{
            CheckoutLineItem, CheckoutSession, CheckoutSessionView, CurrencyCode,
            IntegrationType, LineView, OfferItem, OfferItemKind, Price, PriceType, PriceView,
            Product, RenewInterval, SessionStatus,
        };
        use time::OffsetDateTime;
        use uuid::Uuid;

        pub fn organization() -> Uuid {
            Uuid::new_v4()
        }

        pub fn usd() -> CurrencyCode {
            CurrencyCode::parse("usd").unwrap()
        }

        pub fn session(org_id: Uuid, integration: IntegrationType) -> CheckoutSession {
            let now = OffsetDateTime::now_utc();
            CheckoutSession {
                id: Uuid::new_v4(),
                organization_id: org_id,
                offer_id: None,
                integration,
                status: SessionStatus::Open,
                currency: usd(),
                total: 0,
                intent_id: None,
                intent_type: None,
                client_secret: None,
                intent_status: None,
                payment_confirmed_at: None,
                enabled_payment_methods: vec!["card".to_string()],
                discounts: vec![],
                properties: Default::default(),
                metadata: Default::default(),
                return_url: None,
                customer_id: None,
                customer_email: None,
                customer_name: None,
                subscription_id: None,
                intent_tag: None,
                created_at: now,
                updated_at: now,
            }
        }

        fn price_view(
            org_id: Uuid,
            product_name: &str,
            amount: i64,
            price_type: PriceType,
            renew_interval: Option<RenewInterval>,
            gateway_price_ref: Option<&str>,
        ) -> PriceView {
            let product = Product {
                id: Uuid::new_v4(),
                organization_id: org_id,
                name: product_name.to_string(),
                gateway_product_ref: Some(format!("prod_{}", product_name)),
            };
            PriceView {
                price: Price {
                    id: Uuid::new_v4(),
                    organization_id: org_id,
                    product_id: product.id,
                    currency: usd(),
                    amount,
                    price_type,
                    renew_interval,
                    gateway_price_ref: gateway_price_ref.map(str::to_string),
                    lookup_key: None,
                    active: true,
                },
                product,
            }
        }

        /// Monthly price; the product's gateway ref is `prod_<name>`
        pub fn recurring_price_view(
            org_id: Uuid,
            product_name: &str,
            amount: i64,
            gateway_price_ref: &str,
        ) -> PriceView {
            price_view(
                org_id,
                product_name,
                amount,
                PriceType::Recurring,
                Some(RenewInterval::Month),
                Some(gateway_price_ref),
            )
        }

        pub fn one_time_price_view(org_id: Uuid, product_name: &str, amount: i64) -> PriceView {
            price_view(org_id, product_name, amount, PriceType::OneTime, None, None)
        }

        pub fn offer_item(kind: OfferItemKind, required: bool, price_id: Uuid) -> OfferItem {
            OfferItem {
                id: Uuid::new_v4(),
                offer_id: Uuid::new_v4(),
                kind,
                required,
                price_id: Some(price_id),
            }
        }

        pub fn line(
            session: &CheckoutSession,
            price: &PriceView,
            offer_item: Option<OfferItem>,
            quantity: u32,
        ) -> LineView {
            LineView {
                line: CheckoutLineItem {
                    id: Uuid::new_v4(),
                    session_id: session.id,
                    price_id: Some(price.price.id),
                    offer_item_id: offer_item.as_ref().map(|i| i.id),
                    quantity,
                    total_amount: price.price.amount * i64::from(quantity),
                    deleted_at: None,
                },
                price: Some(price.clone()),
                offer_item,
            }
        }

        /// Assemble a view and set the session total from its live lines
        pub fn view(mut session: CheckoutSession, lines: Vec<LineView>) -> CheckoutSessionView {
            session.total = lines
                .iter()
                .filter(|l| l.line.is_live())
                .map(|l| l.line.total_amount)
                .sum();
            CheckoutSessionView { session, lines }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::fixtures;
        use super::*;
        use cartwright_shared::IntegrationType;

        fn seeded() -> (InMemoryCheckoutStore, CheckoutSessionView) {
            let org = fixtures::organization();
            let mut session = fixtures::session(org, IntegrationType::Stripe);
            session.customer_id = Some("cus_1".to_string());
            let plan = fixtures::recurring_price_view(org, "Pro", 2000, "price_pro");
            let fee = fixtures::one_time_price_view(org, "Setup", 500);
            let mut removed = fixtures::line(&session, &fee, None, 1);
            removed.line.deleted_at = Some(OffsetDateTime::now_utc());
            let view = fixtures::view(
                session.clone(),
                vec![fixtures::line(&session, &plan, None, 2), removed],
            );

            let store = InMemoryCheckoutStore::new();
            store.insert_view(&view);
            (store, view)
        }

        #[tokio::test]
        async fn test_load_session_is_org_scoped() {
            let (store, view) = seeded();
            let loaded = store
                .load_session(view.session.organization_id, view.session.id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(loaded.lines.len(), 2);

            let other_org = store
                .load_session(Uuid::new_v4(), view.session.id)
                .await
                .unwrap();
            assert!(other_org.is_none());
        }

        #[tokio::test]
        async fn test_order_copies_live_lines_and_closes_session() {
            let (store, view) = seeded();
            let org = view.session.organization_id;

            let order = store
                .create_order_from_session(org, view.session.id)
                .await
                .unwrap();
            assert_eq!(order.items.len(), 1);
            assert_eq!(order.total_amount, 4000);
            assert_eq!(order.customer_id.as_deref(), Some("cus_1"));
            assert!(store.session(view.session.id).unwrap().is_closed());

            let again = store.create_order_from_session(org, view.session.id).await;
            assert!(matches!(again, Err(BillingError::AlreadyHasOrder(_))));
            assert_eq!(store.orders().len(), 1);
        }

        #[tokio::test]
        async fn test_save_rejects_closed_session() {
            let (store, view) = seeded();
            let org = view.session.organization_id;
            store
                .close_session(org, view.session.id, JsonMap::new())
                .await
                .unwrap();

            let result = store.save_session(&view.session).await;
            assert!(matches!(result, Err(BillingError::SessionClosed(_))));
        }

        #[tokio::test]
        async fn test_change_commit_claim_is_exclusive() {
            let (store, view) = seeded();
            let org = view.session.organization_id;

            let claimed = store.begin_change_commit(org, view.session.id).await.unwrap();
            assert!(claimed.is_committing());

            let second = store.begin_change_commit(org, view.session.id).await;
            assert!(matches!(second, Err(BillingError::CommitInProgress(_))));

            // Cart edits are locked out while the gateway call is in flight
            let save = store.save_session(&view.session).await;
            assert!(matches!(save, Err(BillingError::CommitInProgress(_))));

            let closed = store
                .close_session(org, view.session.id, JsonMap::new())
                .await
                .unwrap();
            assert!(closed.is_closed());

            let after = store.begin_change_commit(org, view.session.id).await;
            assert!(matches!(after, Err(BillingError::SessionClosed(_))));
        }

        #[tokio::test]
        async fn test_released_claim_reopens_session() {
            let (store, view) = seeded();
            let org = view.session.organization_id;

            store.begin_change_commit(org, view.session.id).await.unwrap();
            store.release_change_commit(org, view.session.id).await.unwrap();

            let session = store.session(view.session.id).unwrap();
            assert_eq!(session.status, SessionStatus::Open);
            assert!(store.begin_change_commit(org, view.session.id).await.is_ok());
        }

        #[tokio::test]
        async fn test_duplicate_order_reports_existing_order() {
            let (store, view) = seeded();
            let org = view.session.organization_id;
            store
                .create_order_from_session(org, view.session.id)
                .await
                .unwrap();

            // The session is closed by now; the order is what gets reported
            for _ in 0..2 {
                let again = store.create_order_from_session(org, view.session.id).await;
                assert!(matches!(again, Err(BillingError::AlreadyHasOrder(_))));
                let claim = store.begin_change_commit(org, view.session.id).await;
                assert!(matches!(claim, Err(BillingError::AlreadyHasOrder(_))));
            }
        }
    }
}
