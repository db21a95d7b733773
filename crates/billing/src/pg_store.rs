//! Postgres checkout store
//!
//! Order creation and session closing run in a transaction that locks the
//! session row (`FOR UPDATE`). The unique index on `orders.checkout_session_id`
//! backs the "one order per session" rule even if two transactions race.
//! A change commit first moves the session to `committing` so only one caller
//! reaches the gateway; a failed commit moves it back to `open`.

use std::str::FromStr;

use async_trait::async_trait;
use cartwright_shared::{
    CheckoutLineItem, CheckoutSession, CheckoutSessionView, CurrencyCode, Discount, JsonMap,
    LineView, OfferItem, Order, OrderItem, Price, PriceView, Product, SessionStatus, SharedError,
};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::invariants::{InvariantCheckSummary, InvariantChecker};
use crate::store::CheckoutStore;

fn decode<T: FromStr<Err = SharedError>>(raw: &str) -> BillingResult<T> {
    raw.parse()
        .map_err(|e: SharedError| BillingError::Database(format!("Invalid stored value: {}", e)))
}

fn decode_currency(raw: &str) -> BillingResult<CurrencyCode> {
    CurrencyCode::parse(raw)
        .map_err(|e| BillingError::Database(format!("Invalid stored currency: {}", e)))
}

fn decode_quantity(raw: i32) -> BillingResult<u32> {
    u32::try_from(raw)
        .map_err(|_| BillingError::Database(format!("Invalid stored quantity: {}", raw)))
}

fn encode_quantity(quantity: u32) -> BillingResult<i32> {
    i32::try_from(quantity)
        .map_err(|_| BillingError::InvalidInput(format!("Quantity {} is too large", quantity)))
}

const SESSION_COLUMNS: &str = r#"
    id, organization_id, offer_id, integration, status, currency, total,
    intent_id, intent_type, client_secret, intent_status, payment_confirmed_at,
    enabled_payment_methods, discounts, properties, metadata, return_url,
    customer_id, customer_email, customer_name, subscription_id, intent_tag,
    created_at, updated_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    organization_id: Uuid,
    offer_id: Option<Uuid>,
    integration: String,
    status: String,
    currency: String,
    total: i64,
    intent_id: Option<String>,
    intent_type: Option<String>,
    client_secret: Option<String>,
    intent_status: Option<String>,
    payment_confirmed_at: Option<OffsetDateTime>,
    enabled_payment_methods: Json<Vec<String>>,
    discounts: Json<Vec<Discount>>,
    properties: Json<JsonMap>,
    metadata: Json<JsonMap>,
    return_url: Option<String>,
    customer_id: Option<String>,
    customer_email: Option<String>,
    customer_name: Option<String>,
    subscription_id: Option<String>,
    intent_tag: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SessionRow> for CheckoutSession {
    type Error = BillingError;

    fn try_from(row: SessionRow) -> BillingResult<Self> {
        Ok(CheckoutSession {
            id: row.id,
            organization_id: row.organization_id,
            offer_id: row.offer_id,
            integration: decode(&row.integration)?,
            status: decode(&row.status)?,
            currency: decode_currency(&row.currency)?,
            total: row.total,
            intent_id: row.intent_id,
            intent_type: row.intent_type.as_deref().map(decode).transpose()?,
            client_secret: row.client_secret,
            intent_status: row.intent_status,
            payment_confirmed_at: row.payment_confirmed_at,
            enabled_payment_methods: row.enabled_payment_methods.0,
            discounts: row.discounts.0,
            properties: row.properties.0,
            metadata: row.metadata.0,
            return_url: row.return_url,
            customer_id: row.customer_id,
            customer_email: row.customer_email,
            customer_name: row.customer_name,
            subscription_id: row.subscription_id,
            intent_tag: row.intent_tag,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PriceRow {
    id: Uuid,
    organization_id: Uuid,
    product_id: Uuid,
    currency: String,
    amount: i64,
    price_type: String,
    renew_interval: Option<String>,
    gateway_price_ref: Option<String>,
    lookup_key: Option<String>,
    active: bool,
    product_name: String,
    gateway_product_ref: Option<String>,
}

impl TryFrom<PriceRow> for PriceView {
    type Error = BillingError;

    fn try_from(row: PriceRow) -> BillingResult<Self> {
        Ok(PriceView {
            price: Price {
                id: row.id,
                organization_id: row.organization_id,
                product_id: row.product_id,
                currency: decode_currency(&row.currency)?,
                amount: row.amount,
                price_type: decode(&row.price_type)?,
                renew_interval: row.renew_interval.as_deref().map(decode).transpose()?,
                gateway_price_ref: row.gateway_price_ref,
                lookup_key: row.lookup_key,
                active: row.active,
            },
            product: Product {
                id: row.product_id,
                organization_id: row.organization_id,
                name: row.product_name,
                gateway_product_ref: row.gateway_product_ref,
            },
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OfferItemRow {
    id: Uuid,
    offer_id: Uuid,
    kind: String,
    required: bool,
    price_id: Option<Uuid>,
}

impl TryFrom<OfferItemRow> for OfferItem {
    type Error = BillingError;

    fn try_from(row: OfferItemRow) -> BillingResult<Self> {
        Ok(OfferItem {
            id: row.id,
            offer_id: row.offer_id,
            kind: decode(&row.kind)?,
            required: row.required,
            price_id: row.price_id,
        })
    }
}

/// Line joined with its price, product and offer item
#[derive(Debug, sqlx::FromRow)]
struct LineRow {
    id: Uuid,
    session_id: Uuid,
    price_id: Option<Uuid>,
    offer_item_id: Option<Uuid>,
    quantity: i32,
    total_amount: i64,
    deleted_at: Option<OffsetDateTime>,
    price_org_id: Option<Uuid>,
    product_id: Option<Uuid>,
    price_currency: Option<String>,
    price_amount: Option<i64>,
    price_type: Option<String>,
    renew_interval: Option<String>,
    gateway_price_ref: Option<String>,
    lookup_key: Option<String>,
    price_active: Option<bool>,
    product_name: Option<String>,
    gateway_product_ref: Option<String>,
    offer_id: Option<Uuid>,
    offer_item_kind: Option<String>,
    offer_item_required: Option<bool>,
    offer_item_price_id: Option<Uuid>,
}

impl TryFrom<LineRow> for LineView {
    type Error = BillingError;

    fn try_from(row: LineRow) -> BillingResult<Self> {
        let price = match (
            row.price_id,
            row.price_org_id,
            row.product_id,
            row.price_currency,
            row.price_amount,
            row.price_type,
            row.product_name,
        ) {
            (
                Some(id),
                Some(organization_id),
                Some(product_id),
                Some(currency),
                Some(amount),
                Some(price_type),
                Some(product_name),
            ) => Some(PriceView::try_from(PriceRow {
                id,
                organization_id,
                product_id,
                currency,
                amount,
                price_type,
                renew_interval: row.renew_interval,
                gateway_price_ref: row.gateway_price_ref,
                lookup_key: row.lookup_key,
                active: row.price_active.unwrap_or(true),
                product_name,
                gateway_product_ref: row.gateway_product_ref,
            })?),
            _ => None,
        };

        let offer_item = match (row.offer_item_id, row.offer_id, row.offer_item_kind) {
            (Some(id), Some(offer_id), Some(kind)) => Some(OfferItem::try_from(OfferItemRow {
                id,
                offer_id,
                kind,
                required: row.offer_item_required.unwrap_or(false),
                price_id: row.offer_item_price_id,
            })?),
            _ => None,
        };

        Ok(LineView {
            line: CheckoutLineItem {
                id: row.id,
                session_id: row.session_id,
                price_id: row.price_id,
                offer_item_id: row.offer_item_id,
                quantity: decode_quantity(row.quantity)?,
                total_amount: row.total_amount,
                deleted_at: row.deleted_at,
            },
            price,
            offer_item,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    organization_id: Uuid,
    checkout_session_id: Uuid,
    customer_id: Option<String>,
    currency: String,
    discounts: Json<Vec<Discount>>,
    total_amount: i64,
    created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct OrderItemRow {
    id: Uuid,
    order_id: Uuid,
    price_id: Option<Uuid>,
    quantity: i32,
    amount: i64,
}

impl TryFrom<OrderItemRow> for OrderItem {
    type Error = BillingError;

    fn try_from(row: OrderItemRow) -> BillingResult<Self> {
        Ok(OrderItem {
            id: row.id,
            order_id: row.order_id,
            price_id: row.price_id,
            quantity: decode_quantity(row.quantity)?,
            amount: row.amount,
        })
    }
}

/// Checkout store on Postgres
#[derive(Clone)]
pub struct PgCheckoutStore {
    pool: PgPool,
}

impl PgCheckoutStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_lines<'e, E>(executor: E, session_id: Uuid) -> BillingResult<Vec<LineView>>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let rows: Vec<LineRow> = sqlx::query_as(
            r#"
            SELECT
                l.id, l.session_id, l.price_id, l.offer_item_id, l.quantity,
                l.total_amount, l.deleted_at,
                p.organization_id AS price_org_id,
                p.product_id,
                p.currency AS price_currency,
                p.amount AS price_amount,
                p.price_type,
                p.renew_interval,
                p.gateway_price_ref,
                p.lookup_key,
                p.active AS price_active,
                pr.name AS product_name,
                pr.gateway_product_ref,
                oi.offer_id,
                oi.kind AS offer_item_kind,
                oi.required AS offer_item_required,
                oi.price_id AS offer_item_price_id
            FROM checkout_line_items l
            LEFT JOIN prices p ON p.id = l.price_id
            LEFT JOIN products pr ON pr.id = p.product_id
            LEFT JOIN offer_items oi ON oi.id = l.offer_item_id
            WHERE l.session_id = $1
            ORDER BY l.created_at, l.id
            "#,
        )
        .bind(session_id)
        .fetch_all(executor)
        .await?;

        rows.into_iter().map(LineView::try_from).collect()
    }

    async fn load_order_items<'e, E>(executor: E, order_id: Uuid) -> BillingResult<Vec<OrderItem>>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let rows: Vec<OrderItemRow> = sqlx::query_as(
            "SELECT id, order_id, price_id, quantity, amount FROM order_items WHERE order_id = $1 ORDER BY id",
        )
        .bind(order_id)
        .fetch_all(executor)
        .await?;

        rows.into_iter().map(OrderItem::try_from).collect()
    }

    /// Lock the session row whatever its status
    async fn lock_session(
        tx: &mut Transaction<'_, Postgres>,
        org_id: Uuid,
        session_id: Uuid,
    ) -> BillingResult<CheckoutSession> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM checkout_sessions WHERE id = $1 AND organization_id = $2 FOR UPDATE",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .bind(org_id)
        .fetch_optional(&mut **tx)
        .await?;

        CheckoutSession::try_from(row.ok_or_else(|| {
            BillingError::NotFound(format!("Checkout session {}", session_id))
        })?)
    }

    fn ensure_open(session: &CheckoutSession) -> BillingResult<()> {
        match session.status {
            SessionStatus::Open => Ok(()),
            SessionStatus::Committing => Err(BillingError::CommitInProgress(session.id)),
            SessionStatus::Closed => Err(BillingError::SessionClosed(session.id)),
        }
    }

    async fn has_order(
        tx: &mut Transaction<'_, Postgres>,
        session_id: Uuid,
    ) -> BillingResult<bool> {
        let existing: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM orders WHERE checkout_session_id = $1")
                .bind(session_id)
                .fetch_optional(&mut **tx)
                .await?;
        Ok(existing.is_some())
    }
}

#[async_trait]
impl CheckoutStore for PgCheckoutStore {
    async fn load_session(
        &self,
        org_id: Uuid,
        session_id: Uuid,
    ) -> BillingResult<Option<CheckoutSessionView>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM checkout_sessions WHERE id = $1 AND organization_id = $2",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let session = CheckoutSession::try_from(row)?;
        let lines = Self::load_lines(&self.pool, session_id).await?;
        Ok(Some(CheckoutSessionView { session, lines }))
    }

    async fn find_price(&self, org_id: Uuid, price_id: Uuid) -> BillingResult<Option<PriceView>> {
        let row: Option<PriceRow> = sqlx::query_as(
            r#"
            SELECT
                p.id, p.organization_id, p.product_id, p.currency, p.amount,
                p.price_type, p.renew_interval, p.gateway_price_ref, p.lookup_key, p.active,
                pr.name AS product_name, pr.gateway_product_ref
            FROM prices p
            JOIN products pr ON pr.id = p.product_id
            WHERE p.id = $1 AND p.organization_id = $2
            "#,
        )
        .bind(price_id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PriceView::try_from).transpose()
    }

    async fn find_offer_item(&self, offer_item_id: Uuid) -> BillingResult<Option<OfferItem>> {
        let row: Option<OfferItemRow> = sqlx::query_as(
            "SELECT id, offer_id, kind, required, price_id FROM offer_items WHERE id = $1",
        )
        .bind(offer_item_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OfferItem::try_from).transpose()
    }

    async fn save_session(&self, session: &CheckoutSession) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE checkout_sessions SET
                total = $3,
                intent_id = $4,
                intent_type = $5,
                client_secret = $6,
                intent_status = $7,
                payment_confirmed_at = $8,
                enabled_payment_methods = $9,
                discounts = $10,
                properties = $11,
                metadata = $12,
                return_url = $13,
                customer_id = $14,
                customer_email = $15,
                customer_name = $16,
                updated_at = NOW()
            WHERE id = $1 AND organization_id = $2 AND status = 'open'
            "#,
        )
        .bind(session.id)
        .bind(session.organization_id)
        .bind(session.total)
        .bind(&session.intent_id)
        .bind(session.intent_type.map(|m| m.as_str()))
        .bind(&session.client_secret)
        .bind(&session.intent_status)
        .bind(session.payment_confirmed_at)
        .bind(Json(&session.enabled_payment_methods))
        .bind(Json(&session.discounts))
        .bind(Json(&session.properties))
        .bind(Json(&session.metadata))
        .bind(&session.return_url)
        .bind(&session.customer_id)
        .bind(&session.customer_email)
        .bind(&session.customer_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<(String,)> = sqlx::query_as(
                "SELECT status FROM checkout_sessions WHERE id = $1 AND organization_id = $2",
            )
            .bind(session.id)
            .bind(session.organization_id)
            .fetch_optional(&self.pool)
            .await?;

            return Err(match exists {
                Some((status,)) if status == SessionStatus::Committing.as_str() => {
                    BillingError::CommitInProgress(session.id)
                }
                Some(_) => BillingError::SessionClosed(session.id),
                None => BillingError::NotFound(format!("Checkout session {}", session.id)),
            });
        }

        Ok(())
    }

    async fn upsert_line(&self, line: &CheckoutLineItem) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO checkout_line_items
                (id, session_id, price_id, offer_item_id, quantity, total_amount, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                price_id = EXCLUDED.price_id,
                quantity = EXCLUDED.quantity,
                total_amount = EXCLUDED.total_amount,
                deleted_at = EXCLUDED.deleted_at
            "#,
        )
        .bind(line.id)
        .bind(line.session_id)
        .bind(line.price_id)
        .bind(line.offer_item_id)
        .bind(encode_quantity(line.quantity)?)
        .bind(line.total_amount)
        .bind(line.deleted_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_order_for_session(
        &self,
        org_id: Uuid,
        session_id: Uuid,
    ) -> BillingResult<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(
            r#"
            SELECT id, organization_id, checkout_session_id, customer_id, currency,
                   discounts, total_amount, created_at
            FROM orders
            WHERE checkout_session_id = $1 AND organization_id = $2
            "#,
        )
        .bind(session_id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let items = Self::load_order_items(&self.pool, row.id).await?;
        Ok(Some(Order {
            id: row.id,
            organization_id: row.organization_id,
            checkout_session_id: row.checkout_session_id,
            customer_id: row.customer_id,
            currency: decode_currency(&row.currency)?,
            discounts: row.discounts.0,
            total_amount: row.total_amount,
            items,
            created_at: row.created_at,
        }))
    }

    async fn create_order_from_session(
        &self,
        org_id: Uuid,
        session_id: Uuid,
    ) -> BillingResult<Order> {
        let mut tx = self.pool.begin().await?;

        // Lock first so a racing loser sees the winner's order, not just a closed session
        let session = Self::lock_session(&mut tx, org_id, session_id).await?;
        if Self::has_order(&mut tx, session_id).await? {
            return Err(BillingError::AlreadyHasOrder(session_id));
        }
        Self::ensure_open(&session)?;

        let lines: Vec<LineView> = Self::load_lines(&mut *tx, session_id)
            .await?
            .into_iter()
            .filter(|l| l.line.is_live())
            .collect();
        if lines.is_empty() {
            return Err(BillingError::Precondition(format!(
                "Checkout session {} has no items",
                session_id
            )));
        }

        let order_id = Uuid::new_v4();
        let inserted = sqlx::query(
            r#"
            INSERT INTO orders (id, organization_id, checkout_session_id, customer_id, currency, discounts, total_amount)
            VALUES ($1, $2, $3, $4, $5, $6, 0)
            "#,
        )
        .bind(order_id)
        .bind(org_id)
        .bind(session_id)
        .bind(&session.customer_id)
        .bind(session.currency.as_str())
        .bind(Json(&session.discounts))
        .execute(&mut *tx)
        .await;

        if let Err(sqlx::Error::Database(db_err)) = &inserted {
            if db_err.is_unique_violation() {
                return Err(BillingError::AlreadyHasOrder(session_id));
            }
        }
        inserted?;

        for view in &lines {
            sqlx::query(
                "INSERT INTO order_items (id, order_id, price_id, quantity, amount) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(Uuid::new_v4())
            .bind(order_id)
            .bind(view.line.price_id)
            .bind(encode_quantity(view.line.quantity)?)
            .bind(view.line.total_amount)
            .execute(&mut *tx)
            .await?;
        }

        let (total_amount, created_at): (i64, OffsetDateTime) = sqlx::query_as(
            r#"
            UPDATE orders
            SET total_amount = (
                SELECT COALESCE(SUM(amount), 0)::BIGINT FROM order_items WHERE order_id = $1
            )
            WHERE id = $1
            RETURNING total_amount, created_at
            "#,
        )
        .bind(order_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE checkout_sessions SET status = 'closed', updated_at = NOW() WHERE id = $1",
        )
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        let items = Self::load_order_items(&mut *tx, order_id).await?;
        tx.commit().await?;

        tracing::info!(
            org_id = %org_id,
            session_id = %session_id,
            order_id = %order_id,
            total_amount = total_amount,
            items = items.len(),
            "Created order from checkout session"
        );

        Ok(Order {
            id: order_id,
            organization_id: org_id,
            checkout_session_id: session_id,
            customer_id: session.customer_id,
            currency: session.currency,
            discounts: session.discounts,
            total_amount,
            items,
            created_at,
        })
    }

    async fn begin_change_commit(
        &self,
        org_id: Uuid,
        session_id: Uuid,
    ) -> BillingResult<CheckoutSession> {
        let mut tx = self.pool.begin().await?;

        let session = Self::lock_session(&mut tx, org_id, session_id).await?;
        if Self::has_order(&mut tx, session_id).await? {
            return Err(BillingError::AlreadyHasOrder(session_id));
        }
        Self::ensure_open(&session)?;

        let row: SessionRow = sqlx::query_as(&format!(
            r#"
            UPDATE checkout_sessions
            SET status = 'committing', updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(org_id = %org_id, session_id = %session_id, "Claimed session for change commit");
        CheckoutSession::try_from(row)
    }

    async fn release_change_commit(&self, org_id: Uuid, session_id: Uuid) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE checkout_sessions
            SET status = 'open', updated_at = NOW()
            WHERE id = $1 AND organization_id = $2 AND status = 'committing'
            "#,
        )
        .bind(session_id)
        .bind(org_id)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            org_id = %org_id,
            session_id = %session_id,
            released = result.rows_affected() > 0,
            "Released change commit claim"
        );
        Ok(())
    }

    async fn close_session(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        metadata_patch: JsonMap,
    ) -> BillingResult<CheckoutSession> {
        let mut tx = self.pool.begin().await?;
        let session = Self::lock_session(&mut tx, org_id, session_id).await?;
        if session.is_closed() {
            return Err(BillingError::SessionClosed(session_id));
        }

        let row: SessionRow = sqlx::query_as(&format!(
            r#"
            UPDATE checkout_sessions
            SET status = 'closed', metadata = metadata || $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .bind(Json(&metadata_patch))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(org_id = %org_id, session_id = %session_id, "Closed checkout session");
        CheckoutSession::try_from(row)
    }

    async fn check_invariants(&self) -> BillingResult<InvariantCheckSummary> {
        InvariantChecker::new(self.pool.clone()).run_all_checks().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartwright_shared::run_migrations;
    use sqlx::postgres::PgPoolOptions;

    async fn test_store() -> PgCheckoutStore {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/cartwright_test".to_string());

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .expect("Failed to connect to test database");
        run_migrations(&pool).await.expect("Failed to run migrations");
        PgCheckoutStore::new(pool)
    }

    /// Open session with one live one-time line
    async fn seed_session(store: &PgCheckoutStore) -> (Uuid, Uuid) {
        let org = Uuid::new_v4();
        let product = Uuid::new_v4();
        let price = Uuid::new_v4();
        let session = Uuid::new_v4();

        sqlx::query("INSERT INTO products (id, organization_id, name) VALUES ($1, $2, 'Workshop')")
            .bind(product)
            .bind(org)
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO prices (id, organization_id, product_id, currency, amount, price_type) VALUES ($1, $2, $3, 'usd', 1500, 'one_time')",
        )
        .bind(price)
        .bind(org)
        .bind(product)
        .execute(store.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO checkout_sessions (id, organization_id, currency, total, customer_id) VALUES ($1, $2, 'usd', 1500, 'cus_1')",
        )
        .bind(session)
        .bind(org)
        .execute(store.pool())
        .await
        .unwrap();

        store
            .upsert_line(&CheckoutLineItem {
                id: Uuid::new_v4(),
                session_id: session,
                price_id: Some(price),
                offer_item_id: None,
                quantity: 1,
                total_amount: 1500,
                deleted_at: None,
            })
            .await
            .unwrap();

        (org, session)
    }

    #[tokio::test]
    #[ignore = "requires a Postgres database at DATABASE_URL"]
    async fn test_racing_orders_report_existing_order() {
        let store = test_store().await;
        let (org, session) = seed_session(&store).await;

        let (a, b) = tokio::join!(
            store.create_order_from_session(org, session),
            store.create_order_from_session(org, session)
        );

        let lost = match (a, b) {
            (Ok(order), Err(e)) | (Err(e), Ok(order)) => {
                assert_eq!(order.total_amount, 1500);
                e
            }
            other => panic!("expected exactly one order, got {:?}", other),
        };
        assert!(matches!(lost, BillingError::AlreadyHasOrder(_)));

        let again = store.create_order_from_session(org, session).await;
        assert!(matches!(again, Err(BillingError::AlreadyHasOrder(_))));
    }

    #[tokio::test]
    #[ignore = "requires a Postgres database at DATABASE_URL"]
    async fn test_change_commit_claim_lifecycle() {
        let store = test_store().await;
        let (org, session) = seed_session(&store).await;

        let claimed = store.begin_change_commit(org, session).await.unwrap();
        assert!(claimed.is_committing());

        let second = store.begin_change_commit(org, session).await;
        assert!(matches!(second, Err(BillingError::CommitInProgress(_))));
        let save = store.save_session(&claimed).await;
        assert!(matches!(save, Err(BillingError::CommitInProgress(_))));
        let order = store.create_order_from_session(org, session).await;
        assert!(matches!(order, Err(BillingError::CommitInProgress(_))));

        store.release_change_commit(org, session).await.unwrap();
        store.begin_change_commit(org, session).await.unwrap();

        let mut patch = JsonMap::new();
        patch.insert("change_signal".to_string(), serde_json::json!("upgrade"));
        let closed = store.close_session(org, session, patch).await.unwrap();
        assert!(closed.is_closed());
        assert_eq!(closed.metadata["change_signal"], "upgrade");

        // Releasing after close leaves the session closed
        store.release_change_commit(org, session).await.unwrap();
        let view = store.load_session(org, session).await.unwrap().unwrap();
        assert!(view.session.is_closed());
    }
}
