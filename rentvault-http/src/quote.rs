//! Informational fiat-equivalent quotes for 402 challenges.
//!
//! Quotes are presentation only. Verification arithmetic runs exclusively on
//! integer chain units; nothing downstream of a [`FiatQuote`] feeds back into
//! the ledger.

use rust_decimal::Decimal;

/// Converts a chain-unit amount into a displayable fiat approximation.
pub trait FiatQuote: Send + Sync {
    /// A human-readable fiat estimate for `amount` chain units, or `None`
    /// when no quote is available.
    fn approx_fiat(&self, amount: u64) -> Option<String>;
}

/// A fixed conversion rate configured at startup.
#[derive(Debug, Clone)]
pub struct StaticRate {
    /// Fiat value of a single chain unit.
    rate: Decimal,
    /// Currency symbol, e.g. `"USD"`.
    symbol: String,
}

impl StaticRate {
    /// Creates a quote source with a fixed per-unit rate.
    #[must_use]
    pub fn new(rate: Decimal, symbol: impl Into<String>) -> Self {
        Self {
            rate,
            symbol: symbol.into(),
        }
    }
}

impl FiatQuote for StaticRate {
    fn approx_fiat(&self, amount: u64) -> Option<String> {
        let value = (Decimal::from(amount) * self.rate).round_dp(2);
        Some(format!("{value} {}", self.symbol))
    }
}
