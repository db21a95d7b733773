//! Errors raised by the shared model types

use thiserror::Error;

pub type SharedResult<T> = Result<T, SharedError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SharedError {
    #[error("Invalid currency code '{0}'")]
    InvalidCurrency(String),

    #[error("Currency mismatch: expected {expected}, found {found}")]
    CurrencyMismatch { expected: String, found: String },

    #[error("Amount overflow")]
    AmountOverflow,

    #[error("Unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}
