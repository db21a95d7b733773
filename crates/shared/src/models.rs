//! Checkout data model
//!
//! Plain data types for the catalog, checkout sessions, and orders. Everything the
//! decision engine reads arrives as a fully populated [`CheckoutSessionView`], so
//! none of these types load anything lazily.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::SharedError;
use crate::money::{CurrencyCode, Money};

/// Free-form JSON object used for session properties and metadata
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

fn unknown(kind: &'static str, value: &str) -> SharedError {
    SharedError::UnknownVariant {
        kind,
        value: value.to_string(),
    }
}

/// Lifecycle of a checkout session.
///
/// Open -> Closed for orders. A subscription change passes through
/// Committing while the gateway call is in flight, and falls back to Open if
/// that call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Committing,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Committing => "committing",
            SessionStatus::Closed => "closed",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(SessionStatus::Open),
            "committing" => Ok(SessionStatus::Committing),
            "closed" => Ok(SessionStatus::Closed),
            other => Err(unknown("session status", other)),
        }
    }
}

/// Payment integration configured for an organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationType {
    Stripe,
    /// Bank transfer / manual invoicing with no gateway-side subscriptions
    Offline,
}

impl IntegrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationType::Stripe => "stripe",
            IntegrationType::Offline => "offline",
        }
    }
}

impl std::fmt::Display for IntegrationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IntegrationType {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stripe" => Ok(IntegrationType::Stripe),
            "offline" => Ok(IntegrationType::Offline),
            other => Err(unknown("integration", other)),
        }
    }
}

/// Kind of gateway intent prepared for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentMode {
    /// Charge now (PaymentIntent)
    Payment,
    /// Save the payment method for a deferred or recurring charge (SetupIntent)
    Setup,
}

impl IntentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentMode::Payment => "payment",
            IntentMode::Setup => "setup",
        }
    }
}

impl std::fmt::Display for IntentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IntentMode {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payment" => Ok(IntentMode::Payment),
            "setup" => Ok(IntentMode::Setup),
            other => Err(unknown("intent mode", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceType {
    OneTime,
    Recurring,
}

impl PriceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceType::OneTime => "one_time",
            PriceType::Recurring => "recurring",
        }
    }
}

impl std::str::FromStr for PriceType {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one_time" => Ok(PriceType::OneTime),
            "recurring" => Ok(PriceType::Recurring),
            other => Err(unknown("price type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewInterval {
    Day,
    Week,
    Month,
    Year,
}

impl RenewInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenewInterval::Day => "day",
            RenewInterval::Week => "week",
            RenewInterval::Month => "month",
            RenewInterval::Year => "year",
        }
    }
}

impl std::str::FromStr for RenewInterval {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(RenewInterval::Day),
            "week" => Ok(RenewInterval::Week),
            "month" => Ok(RenewInterval::Month),
            "year" => Ok(RenewInterval::Year),
            other => Err(unknown("renew interval", other)),
        }
    }
}

/// Role of an item within an offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferItemKind {
    /// The primary plan of the offer
    Standard,
    Optional,
    Addon,
}

impl OfferItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferItemKind::Standard => "standard",
            OfferItemKind::Optional => "optional",
            OfferItemKind::Addon => "addon",
        }
    }
}

impl std::str::FromStr for OfferItemKind {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(OfferItemKind::Standard),
            "optional" => Ok(OfferItemKind::Optional),
            "addon" => Ok(OfferItemKind::Addon),
            other => Err(unknown("offer item kind", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    /// Product id on the payment gateway (e.g. `prod_...`)
    pub gateway_product_ref: Option<String>,
}

/// Catalog price
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub product_id: Uuid,
    pub currency: CurrencyCode,
    /// Unit amount in minor units, never negative
    pub amount: i64,
    pub price_type: PriceType,
    pub renew_interval: Option<RenewInterval>,
    /// Price id on the payment gateway (e.g. `price_...`)
    pub gateway_price_ref: Option<String>,
    pub lookup_key: Option<String>,
    pub active: bool,
}

impl Price {
    pub fn is_recurring(&self) -> bool {
        self.price_type == PriceType::Recurring
    }

    pub fn unit_money(&self) -> Money {
        Money::new(self.amount, self.currency.clone())
    }
}

/// A price together with the product it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceView {
    pub price: Price,
    pub product: Product,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferItem {
    pub id: Uuid,
    pub offer_id: Uuid,
    pub kind: OfferItemKind,
    pub required: bool,
    pub price_id: Option<Uuid>,
}

impl OfferItem {
    pub fn is_standard_required(&self) -> bool {
        self.kind == OfferItemKind::Standard && self.required
    }
}

/// Discount applied to a checkout session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discount {
    pub code: String,
    /// Coupon / promotion id on the gateway
    pub gateway_ref: Option<String>,
    /// Fixed amount off in minor units of `currency`
    pub amount_off: Option<i64>,
    /// Percentage off, 0-100
    pub percent_off: Option<f64>,
    pub currency: Option<CurrencyCode>,
}

/// Mutable cart/workflow aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub offer_id: Option<Uuid>,
    pub integration: IntegrationType,
    pub status: SessionStatus,
    pub currency: CurrencyCode,
    /// Cached total in minor units; orders never trust it
    pub total: i64,
    pub intent_id: Option<String>,
    pub intent_type: Option<IntentMode>,
    pub client_secret: Option<String>,
    /// Last intent status reported by the gateway
    pub intent_status: Option<String>,
    pub payment_confirmed_at: Option<OffsetDateTime>,
    pub enabled_payment_methods: Vec<String>,
    pub discounts: Vec<Discount>,
    pub properties: JsonMap,
    pub metadata: JsonMap,
    pub return_url: Option<String>,
    /// Gateway customer id
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    /// Gateway id of the live subscription this session modifies
    pub subscription_id: Option<String>,
    /// Free-form purpose tag, e.g. "upgrade"
    pub intent_tag: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl CheckoutSession {
    pub fn is_closed(&self) -> bool {
        self.status == SessionStatus::Closed
    }

    /// A subscription change for this session is being sent to the gateway
    pub fn is_committing(&self) -> bool {
        self.status == SessionStatus::Committing
    }

    /// Whether committing this session modifies a subscription rather than
    /// creating a fresh order
    pub fn is_subscription_change(&self) -> bool {
        self.subscription_id.is_some()
            || matches!(
                self.intent_tag.as_deref(),
                Some("upgrade") | Some("downgrade") | Some("change")
            )
    }

    pub fn has_prepared_intent(&self) -> bool {
        self.intent_id.is_some() && self.client_secret.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutLineItem {
    pub id: Uuid,
    pub session_id: Uuid,
    pub price_id: Option<Uuid>,
    pub offer_item_id: Option<Uuid>,
    pub quantity: u32,
    /// Line total in minor units (unit amount * quantity)
    pub total_amount: i64,
    pub deleted_at: Option<OffsetDateTime>,
}

impl CheckoutLineItem {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// A line item with its price and offer item resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineView {
    pub line: CheckoutLineItem,
    pub price: Option<PriceView>,
    pub offer_item: Option<OfferItem>,
}

impl LineView {
    pub fn is_recurring(&self) -> bool {
        self.price
            .as_ref()
            .map(|p| p.price.is_recurring())
            .unwrap_or(false)
    }
}

/// Read model of a session with every line, price, product and offer item loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSessionView {
    pub session: CheckoutSession,
    pub lines: Vec<LineView>,
}

impl CheckoutSessionView {
    /// Lines that have not been soft-deleted
    pub fn live_lines(&self) -> impl Iterator<Item = &LineView> {
        self.lines.iter().filter(|l| l.line.is_live())
    }

    pub fn has_recurring_line(&self) -> bool {
        self.live_lines().any(LineView::is_recurring)
    }

    /// Quantity of the live line for a price, defaulting to 1
    pub fn quantity_for_price(&self, price_id: Uuid) -> u32 {
        self.live_lines()
            .find(|l| l.line.price_id == Some(price_id))
            .map(|l| l.line.quantity)
            .unwrap_or(1)
    }
}

/// Immutable record created when a session is committed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub checkout_session_id: Uuid,
    pub customer_id: Option<String>,
    pub currency: CurrencyCode,
    pub discounts: Vec<Discount>,
    /// Always the sum of the order items
    pub total_amount: i64,
    pub items: Vec<OrderItem>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub price_id: Option<Uuid>,
    pub quantity: u32,
    pub amount: i64,
}
