//! Subscription change previews
//!
//! A preview answers "what happens if this checkout is committed": which
//! signal the change carries, when it takes effect, what is due now, and the
//! exact descriptor the commit step will replay on the gateway.
//!
//! Two paths exist:
//! - no live subscription: a trial acquisition computed locally, the gateway
//!   is never called
//! - live subscription: the gateway's [`ChangePreviewer`] supplies proration
//!   numbers for the classified change
//!
//! Failures never surface as errors. They become [`PreviewResult::Disabled`]
//! with a human-readable reason so the checkout can still render.

use cartwright_shared::{CheckoutSessionView, CurrencyCode, Money};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::base_line::{resolve_existing_base_item, resolve_new_base_line, BaseLine};
use crate::config::{CheckoutConfig, MAX_TRIAL_DAYS};
use crate::gateway::{ChangeContext, ChangeIntent, GatewayRegistry};
use crate::signal::{classify, Signal, SubscriptionStatus};

pub const NO_BASE_LINE_REASON: &str = "no recurring base line in checkout";
pub const NO_EXISTING_ITEM_REASON: &str = "cannot resolve current base item";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveTiming {
    AtTrialEnd,
    AtPeriodEnd,
    AtDate,
}

/// When a change takes effect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveAt {
    pub timing: EffectiveTiming,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Decide when a change takes effect.
///
/// An explicit date wins. Otherwise a running trial ends the change at trial
/// end, then a future period end, then now.
pub fn resolve_effective_at(
    explicit: Option<OffsetDateTime>,
    status: &SubscriptionStatus,
    trial_end: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> EffectiveAt {
    if let Some(at) = explicit {
        return EffectiveAt {
            timing: EffectiveTiming::AtDate,
            at,
        };
    }

    if status.is_trialing() {
        if let Some(at) = trial_end.filter(|t| *t > now) {
            return EffectiveAt {
                timing: EffectiveTiming::AtTrialEnd,
                at,
            };
        }
    }

    match current_period_end.filter(|t| *t > now) {
        Some(at) => EffectiveAt {
            timing: EffectiveTiming::AtPeriodEnd,
            at,
        },
        None => EffectiveAt {
            timing: EffectiveTiming::AtDate,
            at: now,
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewTotals {
    /// Amount charged when the change is committed, minor units
    pub due_now: i64,
    pub currency: CurrencyCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewLine {
    pub description: String,
    pub amount: i64,
    pub currency: CurrencyCode,
    pub is_proration: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuantity {
    /// Gateway price id
    pub price: Option<String>,
    pub unit_amount: i64,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewOperation {
    /// `None` when nothing is being replaced
    pub current: Option<PriceQuantity>,
    pub future: PriceQuantity,
    pub quantity_delta: i64,
}

/// What the commit step replays on the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CommitDescriptor {
    /// Start a new subscription (first acquisition or resume)
    Create {
        customer_id: Option<String>,
        price: Option<String>,
        local_price_id: Uuid,
        quantity: u32,
        trial_days: Option<u32>,
        /// Unix timestamp
        trial_end: Option<i64>,
    },
    /// Swap the base item of a live subscription
    Update {
        subscription_id: String,
        item_id: String,
        price: Option<String>,
        local_price_id: Uuid,
        quantity: u32,
        proration_behavior: String,
        /// Unix timestamp
        proration_date: Option<i64>,
    },
}

impl CommitDescriptor {
    pub fn local_price_id(&self) -> Uuid {
        match self {
            CommitDescriptor::Create { local_price_id, .. }
            | CommitDescriptor::Update { local_price_id, .. } => *local_price_id,
        }
    }
}

/// A computed subscription change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePreview {
    pub signal: Signal,
    pub effective: EffectiveAt,
    pub totals: PreviewTotals,
    pub lines: Vec<PreviewLine>,
    pub operations: Vec<PreviewOperation>,
    pub commit: CommitDescriptor,
}

/// Outcome of a preview request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviewResult {
    Disabled { reason: String },
    Enabled(ChangePreview),
}

impl PreviewResult {
    pub fn disabled(reason: impl Into<String>) -> Self {
        PreviewResult::Disabled {
            reason: reason.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, PreviewResult::Enabled(_))
    }

    pub fn preview(&self) -> Option<&ChangePreview> {
        match self {
            PreviewResult::Enabled(preview) => Some(preview),
            PreviewResult::Disabled { .. } => None,
        }
    }

    pub fn disabled_reason(&self) -> Option<&str> {
        match self {
            PreviewResult::Disabled { reason } => Some(reason),
            PreviewResult::Enabled(_) => None,
        }
    }
}

#[derive(Serialize)]
struct PreviewResultWire<'a> {
    enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    disabled_reason: Option<&'a str>,
    #[serde(flatten)]
    preview: Option<&'a ChangePreview>,
}

impl Serialize for PreviewResult {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        PreviewResultWire {
            enabled: self.is_enabled(),
            disabled_reason: self.disabled_reason(),
            preview: self.preview(),
        }
        .serialize(serializer)
    }
}

/// Builds change previews for checkout sessions
#[derive(Clone)]
pub struct ChangePreviewEngine {
    gateways: GatewayRegistry,
    config: CheckoutConfig,
}

impl ChangePreviewEngine {
    pub fn new(gateways: GatewayRegistry, config: CheckoutConfig) -> Self {
        Self { gateways, config }
    }

    pub async fn preview(
        &self,
        view: &CheckoutSessionView,
        effective_at: Option<OffsetDateTime>,
    ) -> PreviewResult {
        self.preview_at(view, effective_at, OffsetDateTime::now_utc())
            .await
    }

    /// Preview against a fixed clock
    pub async fn preview_at(
        &self,
        view: &CheckoutSessionView,
        effective_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> PreviewResult {
        let session = &view.session;

        let Some(base) = resolve_new_base_line(view) else {
            tracing::debug!(session_id = %session.id, "Preview disabled: no recurring base line");
            return PreviewResult::disabled(NO_BASE_LINE_REASON);
        };
        let desired_quantity = view.quantity_for_price(base.local_price_id);

        let Some(subscription_id) = session.subscription_id.as_deref() else {
            return self.trial_preview(view, &base, desired_quantity, now);
        };

        let gateway = match self.gateways.get(session.integration) {
            Ok(gateway) => gateway,
            Err(e) => return PreviewResult::disabled(e.to_string()),
        };
        let Some(previewer) = gateway.change_previewer() else {
            return PreviewResult::disabled(format!(
                "integration '{}' does not support subscription change previews",
                session.integration
            ));
        };

        let subscription = match gateway.retrieve_subscription(subscription_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id,
                    subscription_id = %subscription_id,
                    error = %e,
                    "Failed to retrieve subscription for preview"
                );
                return PreviewResult::disabled(e.to_string());
            }
        };

        let Some(existing) =
            resolve_existing_base_item(&subscription.items, base.gateway_product_ref.as_deref())
        else {
            return PreviewResult::disabled(NO_EXISTING_ITEM_REASON);
        };

        let signal = classify(
            &subscription.status,
            existing.price.unit_amount,
            base.unit_amount,
            existing.quantity,
            desired_quantity,
        );
        let effective = resolve_effective_at(
            effective_at,
            &subscription.status,
            subscription.trial_end,
            subscription.current_period_end,
            now,
        );

        let intent = ChangeIntent {
            target_price_id: base.local_price_id,
            signal,
            quantity_delta: i64::from(desired_quantity) - i64::from(existing.quantity),
            credits_delta: None,
            effective_at: effective,
        };
        let ctx = ChangeContext {
            session: view,
            subscription: &subscription,
            base_line: &base,
            existing_item: existing,
            desired_quantity,
        };

        match previewer.preview_change(&ctx, &intent).await {
            Ok(mut preview) => {
                preview.signal = signal;
                tracing::info!(
                    session_id = %session.id,
                    subscription_id = %subscription_id,
                    signal = %signal,
                    due_now = preview.totals.due_now,
                    "Computed subscription change preview"
                );
                PreviewResult::Enabled(preview)
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id,
                    error = %e,
                    "Gateway rejected subscription change preview"
                );
                PreviewResult::disabled(e.to_string())
            }
        }
    }

    fn trial_preview(
        &self,
        view: &CheckoutSessionView,
        base: &BaseLine,
        quantity: u32,
        now: OffsetDateTime,
    ) -> PreviewResult {
        let trial_days = self.config.trial_days;
        let trial_end = match now.checked_add(Duration::days(i64::from(trial_days))) {
            Some(end) if trial_days <= MAX_TRIAL_DAYS => end,
            _ => {
                return PreviewResult::disabled(format!(
                    "trial of {} days is longer than the {} day maximum",
                    trial_days, MAX_TRIAL_DAYS
                ))
            }
        };

        let after_trial = match Money::new(base.unit_amount, base.currency.clone()).scale(quantity)
        {
            Ok(money) => money.amount,
            Err(e) => return PreviewResult::disabled(e.to_string()),
        };

        let interval = base
            .renew_interval
            .map(|i| format!(" per {}", i.as_str()))
            .unwrap_or_default();

        PreviewResult::Enabled(ChangePreview {
            signal: Signal::Acquisition,
            effective: EffectiveAt {
                timing: EffectiveTiming::AtTrialEnd,
                at: trial_end,
            },
            totals: PreviewTotals {
                due_now: 0,
                currency: base.currency.clone(),
            },
            lines: vec![
                PreviewLine {
                    description: format!("{} ({}-day trial)", base.product_name, trial_days),
                    amount: 0,
                    currency: base.currency.clone(),
                    is_proration: false,
                },
                PreviewLine {
                    description: format!(
                        "{} x {} after trial{}",
                        quantity, base.product_name, interval
                    ),
                    amount: after_trial,
                    currency: base.currency.clone(),
                    is_proration: false,
                },
            ],
            operations: vec![PreviewOperation {
                current: None,
                future: PriceQuantity {
                    price: base.gateway_price_ref.clone(),
                    unit_amount: base.unit_amount,
                    quantity,
                },
                quantity_delta: i64::from(quantity),
            }],
            commit: CommitDescriptor::Create {
                customer_id: view.session.customer_id.clone(),
                price: base.gateway_price_ref.clone(),
                local_price_id: base.local_price_id,
                quantity,
                trial_days: Some(trial_days),
                trial_end: Some(trial_end.unix_timestamp()),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::test::MockGateway;
    use crate::gateway::{GatewayPrice, GatewaySubscription, GatewaySubscriptionItem};
    use crate::store::test::fixtures;
    use cartwright_shared::{IntegrationType, RenewInterval};
    use std::sync::Arc;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-03-01 12:00 UTC);

    fn engine(gateway: Arc<MockGateway>) -> ChangePreviewEngine {
        ChangePreviewEngine::new(
            GatewayRegistry::new().with_gateway(gateway),
            CheckoutConfig::default(),
        )
    }

    fn live_subscription(status: &str, unit_amount: i64, quantity: u32) -> GatewaySubscription {
        GatewaySubscription {
            id: "sub_123".to_string(),
            customer_id: Some("cus_123".to_string()),
            status: SubscriptionStatus::parse(status),
            items: vec![GatewaySubscriptionItem {
                id: "si_123".to_string(),
                price: GatewayPrice {
                    id: "price_old".to_string(),
                    unit_amount,
                    currency: CurrencyCode::parse("usd").unwrap(),
                    recurring_interval: Some(RenewInterval::Month),
                    product_id: Some("prod_Pro".to_string()),
                    product_name: Some("Pro".to_string()),
                },
                quantity,
            }],
            trial_end: Some(NOW + Duration::days(3)),
            current_period_end: Some(NOW + Duration::days(20)),
        }
    }

    fn change_view(unit_amount: i64, quantity: u32) -> CheckoutSessionView {
        let org = fixtures::organization();
        let mut session = fixtures::session(org, IntegrationType::Stripe);
        session.subscription_id = Some("sub_123".to_string());
        let plan = fixtures::recurring_price_view(org, "Pro", unit_amount, "price_new");
        fixtures::view(session.clone(), vec![fixtures::line(&session, &plan, None, quantity)])
    }

    #[test]
    fn test_effective_at_explicit_wins() {
        let explicit = NOW + Duration::days(1);
        let effective = resolve_effective_at(
            Some(explicit),
            &SubscriptionStatus::Trialing,
            Some(NOW + Duration::days(5)),
            Some(NOW + Duration::days(10)),
            NOW,
        );
        assert_eq!(effective.timing, EffectiveTiming::AtDate);
        assert_eq!(effective.at, explicit);
    }

    #[test]
    fn test_effective_at_trial_then_period_then_now() {
        let trial_end = NOW + Duration::days(5);
        let period_end = NOW + Duration::days(10);

        let trial = resolve_effective_at(
            None,
            &SubscriptionStatus::Trialing,
            Some(trial_end),
            Some(period_end),
            NOW,
        );
        assert_eq!(trial.timing, EffectiveTiming::AtTrialEnd);
        assert_eq!(trial.at, trial_end);

        let period = resolve_effective_at(
            None,
            &SubscriptionStatus::Active,
            Some(trial_end),
            Some(period_end),
            NOW,
        );
        assert_eq!(period.timing, EffectiveTiming::AtPeriodEnd);

        let lapsed = resolve_effective_at(
            None,
            &SubscriptionStatus::PastDue,
            None,
            Some(NOW - Duration::days(1)),
            NOW,
        );
        assert_eq!(lapsed.timing, EffectiveTiming::AtDate);
        assert_eq!(lapsed.at, NOW);
    }

    #[tokio::test]
    async fn test_trial_preview_without_subscription() {
        let gateway = Arc::new(MockGateway::new());
        let org = fixtures::organization();
        let session = fixtures::session(org, IntegrationType::Stripe);
        let plan = fixtures::recurring_price_view(org, "Pro", 2000, "price_pro");
        let view = fixtures::view(session.clone(), vec![fixtures::line(&session, &plan, None, 2)]);

        let result = engine(gateway.clone()).preview_at(&view, None, NOW).await;
        let preview = result.preview().unwrap();

        assert_eq!(preview.signal, Signal::Acquisition);
        assert_eq!(preview.totals.due_now, 0);
        assert_eq!(preview.effective.timing, EffectiveTiming::AtTrialEnd);
        assert_eq!(preview.effective.at, NOW + Duration::days(14));
        assert_eq!(preview.lines.len(), 2);
        assert_eq!(preview.lines[0].amount, 0);
        assert_eq!(preview.lines[1].amount, 4000);

        match &preview.commit {
            CommitDescriptor::Create {
                trial_days,
                quantity,
                ..
            } => {
                assert_eq!(*trial_days, Some(14));
                assert_eq!(*quantity, 2);
            }
            other => panic!("expected create descriptor, got {:?}", other),
        }

        // The trial path never reaches the gateway
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_trial_disables_preview() {
        let gateway = Arc::new(MockGateway::new());
        let engine = ChangePreviewEngine::new(
            GatewayRegistry::new().with_gateway(gateway),
            CheckoutConfig {
                trial_days: u32::MAX,
                ..Default::default()
            },
        );
        let org = fixtures::organization();
        let session = fixtures::session(org, IntegrationType::Stripe);
        let plan = fixtures::recurring_price_view(org, "Pro", 2000, "price_pro");
        let view = fixtures::view(session.clone(), vec![fixtures::line(&session, &plan, None, 1)]);

        match engine.preview_at(&view, None, NOW).await {
            PreviewResult::Disabled { reason } => assert!(reason.contains("maximum")),
            PreviewResult::Enabled(preview) => panic!("expected disabled preview, got {:?}", preview),
        }
    }

    #[tokio::test]
    async fn test_no_base_line_disables_preview() {
        let gateway = Arc::new(MockGateway::new());
        let org = fixtures::organization();
        let session = fixtures::session(org, IntegrationType::Stripe);
        let fee = fixtures::one_time_price_view(org, "Setup", 900);
        let view = fixtures::view(session.clone(), vec![fixtures::line(&session, &fee, None, 1)]);

        let result = engine(gateway).preview_at(&view, None, NOW).await;
        assert_eq!(result.disabled_reason(), Some(NO_BASE_LINE_REASON));
    }

    #[tokio::test]
    async fn test_upgrade_preview_uses_gateway() {
        let gateway = Arc::new(MockGateway::new());
        gateway.insert_subscription(live_subscription("active", 1000, 1));

        let view = change_view(2500, 1);
        let result = engine(gateway.clone()).preview_at(&view, None, NOW).await;
        let preview = result.preview().unwrap();

        assert_eq!(preview.signal, Signal::Upgrade);
        assert_eq!(preview.effective.timing, EffectiveTiming::AtPeriodEnd);
        assert_eq!(preview.totals.due_now, 1500);
        assert_eq!(gateway.call_count("preview_change"), 1);
    }

    #[tokio::test]
    async fn test_gateway_failure_becomes_disabled_reason() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_retrieve("No such subscription: 'sub_123'");

        let result = engine(gateway).preview_at(&change_view(2000, 1), None, NOW).await;
        let reason = result.disabled_reason().unwrap();
        assert!(reason.contains("No such subscription"));
    }

    #[tokio::test]
    async fn test_missing_previewer_disables_preview() {
        let gateway = Arc::new(MockGateway::basic(IntegrationType::Stripe));
        let result = engine(gateway).preview_at(&change_view(2000, 1), None, NOW).await;
        assert!(!result.is_enabled());
        assert!(result.disabled_reason().unwrap().contains("does not support"));
    }

    #[tokio::test]
    async fn test_missing_existing_item_disables_preview() {
        let gateway = Arc::new(MockGateway::new());
        let mut subscription = live_subscription("active", 1000, 1);
        subscription.items[0].price.recurring_interval = None;
        gateway.insert_subscription(subscription);

        let result = engine(gateway).preview_at(&change_view(2000, 1), None, NOW).await;
        assert_eq!(result.disabled_reason(), Some(NO_EXISTING_ITEM_REASON));
    }

    #[test]
    fn test_disabled_result_serialization() {
        let json = serde_json::to_value(PreviewResult::disabled("nope")).unwrap();
        assert_eq!(json, serde_json::json!({"enabled": false, "disabled_reason": "nope"}));
    }
}
