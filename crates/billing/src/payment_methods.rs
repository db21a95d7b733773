//! Payment method rules
//!
//! Single home for the fixed method tables: which methods cannot be saved
//! for later charges, which need a full-page redirect, and per-currency
//! amount ceilings.

use cartwright_shared::{CheckoutSessionView, CurrencyCode, IntentMode};

/// Fallback when filtering leaves nothing
pub const DEFAULT_METHOD: &str = "card";

/// Methods that cannot be saved for deferred or recurring charges
pub const SETUP_DENYLIST: &[&str] = &[
    "klarna",
    "afterpay_clearpay",
    "affirm",
    "zip",
    "alipay",
    "wechat_pay",
    "oxxo",
    "boleto",
    "konbini",
    "paynow",
    "promptpay",
];

/// Methods confirmed through a full-page redirect instead of an embedded form
pub const REDIRECT_METHODS: &[&str] = &[
    "klarna",
    "afterpay_clearpay",
    "affirm",
    "ideal",
    "sofort",
    "bancontact",
    "giropay",
    "eps",
    "p24",
    "alipay",
    "wechat_pay",
    "fpx",
    "grabpay",
    "oxxo",
    "boleto",
    "konbini",
    "paynow",
    "promptpay",
    "zip",
    "swish",
    "twint",
    "mb_way",
    "multibanco",
    "blik",
    "mobilepay",
    "vipps",
    "satispay",
];

/// Maximum payable amount in minor units, per method and currency
const AMOUNT_CEILINGS: &[(&str, &[(&str, i64)])] = &[
    (
        "afterpay_clearpay",
        &[
            ("usd", 200_000),
            ("cad", 200_000),
            ("aud", 200_000),
            ("nzd", 200_000),
            ("gbp", 100_000),
            ("eur", 100_000),
        ],
    ),
    ("affirm", &[("usd", 3_000_000), ("cad", 3_000_000)]),
    (
        "klarna",
        &[("usd", 1_000_000), ("eur", 1_000_000), ("gbp", 1_000_000)],
    ),
    ("zip", &[("usd", 100_000), ("aud", 500_000)]),
    ("oxxo", &[("mxn", 1_000_000)]),
    ("boleto", &[("brl", 4_999_999)]),
    ("konbini", &[("jpy", 300_000)]),
];

/// Ceiling for a method in a currency; `None` means unlimited
pub fn amount_ceiling(method: &str, currency: &CurrencyCode) -> Option<i64> {
    AMOUNT_CEILINGS
        .iter()
        .find(|(m, _)| *m == method)
        .and_then(|(_, limits)| {
            limits
                .iter()
                .find(|(c, _)| *c == currency.as_str())
                .map(|(_, limit)| *limit)
        })
}

pub fn is_redirect_method(method: &str) -> bool {
    REDIRECT_METHODS.contains(&method)
}

/// Setup when anything recurring is in the cart, payment otherwise
pub fn intent_mode_for(view: &CheckoutSessionView) -> IntentMode {
    if view.has_recurring_line() {
        IntentMode::Setup
    } else {
        IntentMode::Payment
    }
}

/// Narrow the session's enabled methods to those usable for this intent
pub fn filter_payment_methods(
    enabled: &[String],
    mode: IntentMode,
    total: i64,
    currency: &CurrencyCode,
) -> Vec<String> {
    let allowed: Vec<String> = enabled
        .iter()
        .filter(|method| match mode {
            IntentMode::Setup => !SETUP_DENYLIST.contains(&method.as_str()),
            IntentMode::Payment => amount_ceiling(method, currency)
                .map(|ceiling| total <= ceiling)
                .unwrap_or(true),
        })
        .cloned()
        .collect();

    if allowed.is_empty() {
        vec![DEFAULT_METHOD.to_string()]
    } else {
        allowed
    }
}
