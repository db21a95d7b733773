#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Cartwright shared types
//!
//! Checkout data model, money primitives, and database helpers used by the
//! billing and API crates.

pub mod db;
pub mod error;
pub mod models;
pub mod money;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use error::{SharedError, SharedResult};
pub use models::{
    CheckoutLineItem, CheckoutSession, CheckoutSessionView, Discount, IntegrationType, IntentMode,
    JsonMap, LineView, OfferItem, OfferItemKind, Order, OrderItem, Price, PriceType, PriceView,
    Product, RenewInterval, SessionStatus,
};
pub use money::{CurrencyCode, Money};
