//! Monetary types.
//!
//! Balances and amounts are integers in the currency's minor unit (cents for
//! USD). Decimal conversion exists only for display.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::BankError;

/// Currencies accounts may be opened in.
pub const SUPPORTED_CURRENCIES: &[&str] = &["USD", "EUR", "CAD"];

/// ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    /// Create a new currency from code.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().to_uppercase())
    }

    /// Parse a code, rejecting currencies the bank does not hold.
    pub fn parse_supported(code: &str) -> Result<Self, BankError> {
        let currency = Self::new(code.trim());
        if currency.is_supported() {
            Ok(currency)
        } else {
            Err(BankError::UnsupportedCurrency(code.to_string()))
        }
    }

    /// Get the currency code.
    pub fn code(&self) -> &str {
        &self.0
    }

    /// Check whether accounts can be opened in this currency.
    pub fn is_supported(&self) -> bool {
        SUPPORTED_CURRENCIES.contains(&self.0.as_str())
    }

    /// Get the standard decimal places for this currency.
    pub fn decimal_places(&self) -> u32 {
        match self.0.as_str() {
            "JPY" | "KRW" | "VND" => 0,
            "BHD" | "KWD" | "OMR" => 3,
            _ => 2,
        }
    }

    /// Express an amount of minor units in major units (e.g. 1050 USD cents -> 10.50).
    pub fn to_major(&self, minor_units: i64) -> Decimal {
        Decimal::new(minor_units, self.decimal_places())
    }

    pub fn usd() -> Self {
        Self::new("USD")
    }

    pub fn eur() -> Self {
        Self::new("EUR")
    }

    pub fn cad() -> Self {
        Self::new("CAD")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Currency {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Currency {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// An amount in minor units tagged with its currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// Amount in minor units.
    pub minor_units: i64,
    /// Currency of the amount.
    pub currency: Currency,
}

impl Money {
    /// Create a new amount.
    pub fn new(minor_units: i64, currency: Currency) -> Self {
        Self {
            minor_units,
            currency,
        }
    }

    /// Check if the amount is positive.
    pub fn is_positive(&self) -> bool {
        self.minor_units > 0
    }

    /// Get the amount in major units.
    pub fn to_major(&self) -> Decimal {
        self.currency.to_major(self.minor_units)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.to_major(), self.currency)
    }
}
