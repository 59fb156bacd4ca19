//! Display-currency normalization with a refreshing rate cache.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use helm_core::{CurrencyCode, Price};
use rust_decimal::Decimal;
use tracing::warn;

use crate::{MarketError, MarketResult};

/// Conversion outcome; `approximate` is set when the static fallback table
/// had to be used because the cache was empty or stale.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Converted {
    pub amount: Price,
    pub approximate: bool,
}

/// Source of fresh exchange rates, quoted against the display currency.
#[async_trait]
pub trait RateSource: Send + Sync {
    /// Fetch rates mapping currency code -> units of display currency.
    async fn fetch(&self, display: &str) -> MarketResult<HashMap<CurrencyCode, Decimal>>;
}

struct RateTable {
    rates: HashMap<CurrencyCode, Decimal>,
    refreshed_at: DateTime<Utc>,
}

/// Periodically refreshed rate cache with a hard-coded fallback.
pub struct CurrencyConverter {
    display: CurrencyCode,
    max_age: Duration,
    table: RwLock<Option<RateTable>>,
    fallback: HashMap<CurrencyCode, Decimal>,
}

impl CurrencyConverter {
    /// Build a converter for the given display currency. `max_age` bounds
    /// how old a cached table may be before conversions degrade to the
    /// fallback.
    #[must_use]
    pub fn new(display: impl Into<CurrencyCode>, max_age: Duration) -> Self {
        Self {
            display: display.into(),
            max_age,
            table: RwLock::new(None),
            fallback: static_fallback(),
        }
    }

    /// The configured display currency.
    #[must_use]
    pub fn display_currency(&self) -> &str {
        &self.display
    }

    /// Replace the cached table with freshly fetched rates.
    pub async fn refresh(&self, source: &dyn RateSource) -> MarketResult<()> {
        let rates = source.fetch(&self.display).await?;
        if rates.is_empty() {
            return Err(MarketError::Schema {
                adapter: "rate-source".into(),
                detail: "rate source returned an empty table".into(),
            });
        }
        let mut guard = self.table.write().expect("rate table poisoned");
        *guard = Some(RateTable {
            rates,
            refreshed_at: Utc::now(),
        });
        Ok(())
    }

    /// Convert `amount` from `currency` into the display currency.
    ///
    /// Falls back to the static table (tagging the result approximate) when
    /// the cache is missing, stale, or lacks the currency.
    pub fn to_display(&self, amount: Price, currency: &str) -> MarketResult<Converted> {
        if currency == self.display {
            return Ok(Converted {
                amount,
                approximate: false,
            });
        }
        let cached = {
            let guard = self.table.read().expect("rate table poisoned");
            guard.as_ref().and_then(|table| {
                let fresh = Utc::now() - table.refreshed_at <= self.max_age;
                fresh
                    .then(|| table.rates.get(currency).copied())
                    .flatten()
            })
        };
        if let Some(rate) = cached {
            return Ok(Converted {
                amount: amount * rate,
                approximate: false,
            });
        }
        match self.fallback.get(currency) {
            Some(rate) => {
                warn!(%currency, "rate cache unavailable; using static fallback");
                Ok(Converted {
                    amount: amount * rate,
                    approximate: true,
                })
            }
            None => Err(MarketError::UnknownCurrency(currency.to_string())),
        }
    }

    /// Convert a display-currency amount back to `currency` with the same
    /// rate, so that a round trip reproduces the input.
    pub fn from_display(&self, amount: Price, currency: &str) -> MarketResult<Converted> {
        if currency == self.display {
            return Ok(Converted {
                amount,
                approximate: false,
            });
        }
        let cached = {
            let guard = self.table.read().expect("rate table poisoned");
            guard.as_ref().and_then(|table| {
                let fresh = Utc::now() - table.refreshed_at <= self.max_age;
                fresh
                    .then(|| table.rates.get(currency).copied())
                    .flatten()
            })
        };
        let (rate, approximate) = match cached {
            Some(rate) => (rate, false),
            None => match self.fallback.get(currency) {
                Some(rate) => (*rate, true),
                None => return Err(MarketError::UnknownCurrency(currency.to_string())),
            },
        };
        if rate.is_zero() {
            return Err(MarketError::UnknownCurrency(currency.to_string()));
        }
        Ok(Converted {
            amount: amount / rate,
            approximate,
        })
    }
}

/// Conservative static rates against KRW, used only when the live table is
/// unavailable.
fn static_fallback() -> HashMap<CurrencyCode, Decimal> {
    let mut table = HashMap::new();
    table.insert("KRW".to_string(), Decimal::ONE);
    table.insert("USD".to_string(), Decimal::from(1_350));
    table.insert("USDT".to_string(), Decimal::from(1_350));
    table.insert("HKD".to_string(), Decimal::from(173));
    table.insert("JPY".to_string(), Decimal::new(90, 1));
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource(HashMap<CurrencyCode, Decimal>);

    #[async_trait]
    impl RateSource for FixedSource {
        async fn fetch(&self, _display: &str) -> MarketResult<HashMap<CurrencyCode, Decimal>> {
            Ok(self.0.clone())
        }
    }

    fn converter() -> CurrencyConverter {
        CurrencyConverter::new("KRW", Duration::hours(2))
    }

    #[tokio::test]
    async fn fresh_table_converts_exactly() {
        let converter = converter();
        let mut rates = HashMap::new();
        rates.insert("USD".to_string(), Decimal::from(1_400));
        converter.refresh(&FixedSource(rates)).await.unwrap();

        let out = converter.to_display(Decimal::from(2), "USD").unwrap();
        assert_eq!(out.amount, Decimal::from(2_800));
        assert!(!out.approximate);
    }

    #[test]
    fn empty_cache_degrades_to_fallback() {
        let converter = converter();
        let out = converter.to_display(Decimal::ONE, "USD").unwrap();
        assert_eq!(out.amount, Decimal::from(1_350));
        assert!(out.approximate);
    }

    #[test]
    fn unknown_currency_is_an_error() {
        let converter = converter();
        assert!(matches!(
            converter.to_display(Decimal::ONE, "XXX"),
            Err(MarketError::UnknownCurrency(_))
        ));
    }

    #[tokio::test]
    async fn round_trip_reproduces_input() {
        let converter = converter();
        let mut rates = HashMap::new();
        rates.insert("USD".to_string(), Decimal::from(1_337));
        converter.refresh(&FixedSource(rates)).await.unwrap();

        let amount = Decimal::new(123_456, 2);
        let display = converter.to_display(amount, "USD").unwrap();
        let back = converter.from_display(display.amount, "USD").unwrap();
        assert_eq!(back.amount, amount);
    }
}
