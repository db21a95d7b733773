//! Checkout Invariants Module
//!
//! Runnable consistency checks for checkout sessions and orders. They can be
//! run after any commit to confirm the store is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: each invariant is a real SQL query against Postgres, with
//!    an equivalent in-memory evaluation for the test store
//! 2. **Explanatory**: violations include enough context to debug
//! 3. **Non-destructive**: checks only read, never write

use std::collections::{HashMap, HashSet};

use cartwright_shared::{CheckoutSession, Order};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

pub const SINGLE_ORDER_PER_SESSION: &str = "single_order_per_session";
pub const CLOSED_SESSION_HAS_RESULT: &str = "closed_session_has_result";
pub const ORDER_TOTAL_MATCHES_ITEMS: &str = "order_total_matches_items";
pub const OPEN_SESSION_HAS_NO_ORDER: &str = "open_session_has_no_order";

/// Metadata key written when a subscription change is committed
pub const CHANGE_COMMIT_KEY: &str = "change_commit";

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Organization(s) affected
    pub org_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - a customer may be double-fulfilled or charged incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        let checks_run = available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Self {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

/// Names of all invariant checks
pub fn available_checks() -> Vec<&'static str> {
    vec![
        SINGLE_ORDER_PER_SESSION,
        CLOSED_SESSION_HAS_RESULT,
        ORDER_TOTAL_MATCHES_ITEMS,
        OPEN_SESSION_HAS_NO_ORDER,
    ]
}

fn multiple_orders(org_id: Uuid, session_id: Uuid, order_count: i64) -> InvariantViolation {
    InvariantViolation {
        invariant: SINGLE_ORDER_PER_SESSION.to_string(),
        org_ids: vec![org_id],
        description: format!(
            "Checkout session has {} orders (expected at most 1)",
            order_count
        ),
        context: serde_json::json!({
            "session_id": session_id,
            "order_count": order_count,
        }),
        severity: ViolationSeverity::Critical,
    }
}

fn closed_without_result(org_id: Uuid, session_id: Uuid) -> InvariantViolation {
    InvariantViolation {
        invariant: CLOSED_SESSION_HAS_RESULT.to_string(),
        org_ids: vec![org_id],
        description: "Closed checkout session has neither an order nor a change commit"
            .to_string(),
        context: serde_json::json!({ "session_id": session_id }),
        severity: ViolationSeverity::High,
    }
}

fn total_mismatch(
    org_id: Uuid,
    order_id: Uuid,
    total_amount: i64,
    items_total: i64,
    item_count: i64,
) -> InvariantViolation {
    InvariantViolation {
        invariant: ORDER_TOTAL_MATCHES_ITEMS.to_string(),
        org_ids: vec![org_id],
        description: format!(
            "Order total {} does not match the sum of its {} items ({})",
            total_amount, item_count, items_total
        ),
        context: serde_json::json!({
            "order_id": order_id,
            "total_amount": total_amount,
            "items_total": items_total,
            "item_count": item_count,
        }),
        severity: ViolationSeverity::Critical,
    }
}

fn open_with_order(org_id: Uuid, session_id: Uuid, order_id: Uuid) -> InvariantViolation {
    InvariantViolation {
        invariant: OPEN_SESSION_HAS_NO_ORDER.to_string(),
        org_ids: vec![org_id],
        description: "Checkout session is still open but already has an order".to_string(),
        context: serde_json::json!({
            "session_id": session_id,
            "order_id": order_id,
        }),
        severity: ViolationSeverity::High,
    }
}

/// Evaluate every invariant over loaded sessions and orders
pub fn evaluate(sessions: &[CheckoutSession], orders: &[Order]) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    let mut per_session: HashMap<Uuid, Vec<&Order>> = HashMap::new();
    for order in orders {
        per_session
            .entry(order.checkout_session_id)
            .or_default()
            .push(order);
    }

    for (session_id, session_orders) in &per_session {
        if session_orders.len() > 1 {
            violations.push(multiple_orders(
                session_orders[0].organization_id,
                *session_id,
                session_orders.len() as i64,
            ));
        }
    }

    for session in sessions {
        let order = per_session.get(&session.id).and_then(|o| o.first());
        if session.is_closed() {
            if order.is_none() && !session.metadata.contains_key(CHANGE_COMMIT_KEY) {
                violations.push(closed_without_result(session.organization_id, session.id));
            }
        } else if let Some(order) = order {
            violations.push(open_with_order(session.organization_id, session.id, order.id));
        }
    }

    for order in orders {
        let items_total: i64 = order.items.iter().map(|i| i.amount).sum();
        if order.items.is_empty() || items_total != order.total_amount {
            violations.push(total_mismatch(
                order.organization_id,
                order.id,
                order.total_amount,
                items_total,
                order.items.len() as i64,
            ));
        }
    }

    violations
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleOrdersRow {
    organization_id: Uuid,
    checkout_session_id: Uuid,
    order_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    organization_id: Uuid,
    id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct TotalMismatchRow {
    organization_id: Uuid,
    id: Uuid,
    total_amount: i64,
    items_total: i64,
    item_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct OpenWithOrderRow {
    organization_id: Uuid,
    session_id: Uuid,
    order_id: Uuid,
}

/// Runs the invariant checks against Postgres
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();

        violations.extend(self.check_single_order_per_session().await?);
        violations.extend(self.check_closed_session_has_result().await?);
        violations.extend(self.check_order_total_matches_items().await?);
        violations.extend(self.check_open_session_has_no_order().await?);

        let summary = InvariantCheckSummary::from_violations(violations);
        if !summary.healthy {
            tracing::warn!(
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Checkout invariant violations found"
            );
        }

        Ok(summary)
    }

    /// Invariant 1: a session produces at most one order
    async fn check_single_order_per_session(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleOrdersRow> = sqlx::query_as(
            r#"
            SELECT organization_id, checkout_session_id, COUNT(*) AS order_count
            FROM orders
            GROUP BY organization_id, checkout_session_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                multiple_orders(row.organization_id, row.checkout_session_id, row.order_count)
            })
            .collect())
    }

    /// Invariant 2: a closed session has an order or a recorded change commit
    async fn check_closed_session_has_result(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"
            SELECT s.organization_id, s.id
            FROM checkout_sessions s
            WHERE s.status = 'closed'
              AND NOT (s.metadata ? $1)
              AND NOT EXISTS (
                  SELECT 1 FROM orders o WHERE o.checkout_session_id = s.id
              )
            "#,
        )
        .bind(CHANGE_COMMIT_KEY)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| closed_without_result(row.organization_id, row.id))
            .collect())
    }

    /// Invariant 3: order totals equal the sum of their items, and orders are never empty
    async fn check_order_total_matches_items(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TotalMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                o.organization_id,
                o.id,
                o.total_amount,
                COALESCE(SUM(i.amount), 0)::BIGINT AS items_total,
                COUNT(i.id) AS item_count
            FROM orders o
            LEFT JOIN order_items i ON i.order_id = o.id
            GROUP BY o.organization_id, o.id, o.total_amount
            HAVING COUNT(i.id) = 0
                OR COALESCE(SUM(i.amount), 0) != o.total_amount
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                total_mismatch(
                    row.organization_id,
                    row.id,
                    row.total_amount,
                    row.items_total,
                    row.item_count,
                )
            })
            .collect())
    }

    /// Invariant 4: creating an order always closes its session
    async fn check_open_session_has_no_order(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OpenWithOrderRow> = sqlx::query_as(
            r#"
            SELECT s.organization_id, s.id AS session_id, o.id AS order_id
            FROM checkout_sessions s
            JOIN orders o ON o.checkout_session_id = s.id
            WHERE s.status <> 'closed'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| open_with_order(row.organization_id, row.session_id, row.order_id))
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            SINGLE_ORDER_PER_SESSION => self.check_single_order_per_session().await,
            CLOSED_SESSION_HAS_RESULT => self.check_closed_session_has_result().await,
            ORDER_TOTAL_MATCHES_ITEMS => self.check_order_total_matches_items().await,
            OPEN_SESSION_HAS_NO_ORDER => self.check_open_session_has_no_order().await,
            _ => Ok(vec![]),
        }
    }
}
