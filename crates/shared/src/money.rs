//! Currency amounts in minor units

use serde::{Deserialize, Serialize};

use crate::error::{SharedError, SharedResult};

/// Lower-cased ISO 4217 currency code (e.g. `usd`, `eur`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn parse(code: &str) -> SharedResult<Self> {
        let trimmed = code.trim();
        if trimmed.len() != 3 || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(SharedError::InvalidCurrency(code.to_string()));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for CurrencyCode {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = SharedError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CurrencyCode> for String {
    fn from(code: CurrencyCode) -> Self {
        code.0
    }
}

/// An amount of money in the currency's minor unit (cents for `usd`, yen for `jpy`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: i64,
    pub currency: CurrencyCode,
}

impl Money {
    pub fn new(amount: i64, currency: CurrencyCode) -> Self {
        Self { amount, currency }
    }

    pub fn zero(currency: CurrencyCode) -> Self {
        Self {
            amount: 0,
            currency,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }

    /// Add two amounts of the same currency
    pub fn checked_add(&self, other: &Money) -> SharedResult<Money> {
        if self.currency != other.currency {
            return Err(SharedError::CurrencyMismatch {
                expected: self.currency.to_string(),
                found: other.currency.to_string(),
            });
        }
        let amount = self
            .amount
            .checked_add(other.amount)
            .ok_or(SharedError::AmountOverflow)?;
        Ok(Money::new(amount, self.currency.clone()))
    }

    /// Multiply a unit amount by a quantity
    pub fn scale(&self, quantity: u32) -> SharedResult<Money> {
        let amount = self
            .amount
            .checked_mul(i64::from(quantity))
            .ok_or(SharedError::AmountOverflow)?;
        Ok(Money::new(amount, self.currency.clone()))
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.amount, self.currency.as_str().to_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usd() -> CurrencyCode {
        CurrencyCode::parse("USD").unwrap()
    }

    #[test]
    fn test_currency_is_lowercased() {
        assert_eq!(usd().as_str(), "usd");
        assert_eq!(CurrencyCode::parse(" eur ").unwrap().as_str(), "eur");
    }

    #[test]
    fn test_currency_rejects_garbage() {
        assert!(CurrencyCode::parse("us").is_err());
        assert!(CurrencyCode::parse("dollars").is_err());
        assert!(CurrencyCode::parse("u$d").is_err());
    }

    #[test]
    fn test_money_add_same_currency() {
        let total = Money::new(1000, usd())
            .checked_add(&Money::new(250, usd()))
            .unwrap();
        assert_eq!(total.amount, 1250);
    }

    #[test]
    fn test_money_add_refuses_mixed_currencies() {
        let eur = CurrencyCode::parse("eur").unwrap();
        let err = Money::new(1000, usd())
            .checked_add(&Money::new(250, eur))
            .unwrap_err();
        assert!(matches!(err, SharedError::CurrencyMismatch { .. }));
    }

    #[test]
    fn test_money_scale_detects_overflow() {
        assert_eq!(Money::new(1500, usd()).scale(3).unwrap().amount, 4500);
        assert!(matches!(
            Money::new(i64::MAX, usd()).scale(2),
            Err(SharedError::AmountOverflow)
        ));
    }

    #[test]
    fn test_currency_serde_roundtrip_normalizes() {
        let code: CurrencyCode = serde_json::from_str("\"GBP\"").unwrap();
        assert_eq!(serde_json::to_string(&code).unwrap(), "\"gbp\"");
        assert!(serde_json::from_str::<CurrencyCode>("\"pounds\"").is_err());
    }
}
