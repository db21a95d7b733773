//! Base line resolution
//!
//! The base line is the single recurring plan that drives a subscription
//! change. On the checkout side it comes from the session's lines; on the
//! gateway side it is the matching item of the live subscription.

use cartwright_shared::{CheckoutSessionView, CurrencyCode, LineView, RenewInterval};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::GatewaySubscriptionItem;

/// Projection of the checkout's recurring base line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseLine {
    pub local_price_id: Uuid,
    pub gateway_price_ref: Option<String>,
    pub currency: CurrencyCode,
    pub unit_amount: i64,
    pub renew_interval: Option<RenewInterval>,
    pub gateway_product_ref: Option<String>,
    pub product_name: String,
}

impl BaseLine {
    fn from_line(line: &LineView) -> Option<Self> {
        let view = line.price.as_ref()?;
        Some(Self {
            local_price_id: view.price.id,
            gateway_price_ref: view.price.gateway_price_ref.clone(),
            currency: view.price.currency.clone(),
            unit_amount: view.price.amount,
            renew_interval: view.price.renew_interval,
            gateway_product_ref: view.product.gateway_product_ref.clone(),
            product_name: view.product.name.clone(),
        })
    }
}

/// Pick the checkout's recurring base line.
///
/// The offer's standard, required recurring item wins; otherwise the first
/// recurring live line. `None` when the checkout has nothing recurring.
pub fn resolve_new_base_line(view: &CheckoutSessionView) -> Option<BaseLine> {
    let primary = view.live_lines().find(|line| {
        line.is_recurring()
            && line
                .offer_item
                .as_ref()
                .map(|item| item.is_standard_required())
                .unwrap_or(false)
    });

    primary
        .or_else(|| view.live_lines().find(|line| line.is_recurring()))
        .and_then(BaseLine::from_line)
}

/// Pick the live subscription item the base line replaces.
///
/// Prefers a recurring item on the same gateway product, then the first
/// recurring item.
pub fn resolve_existing_base_item<'a>(
    items: &'a [GatewaySubscriptionItem],
    target_product_ref: Option<&str>,
) -> Option<&'a GatewaySubscriptionItem> {
    let same_product = target_product_ref.and_then(|product| {
        items.iter().find(|item| {
            item.price.is_recurring() && item.price.product_id.as_deref() == Some(product)
        })
    });

    same_product.or_else(|| items.iter().find(|item| item.price.is_recurring()))
}
