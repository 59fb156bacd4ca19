//! Scripted in-memory adapter used by tests and simulated sessions.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use helm_core::{AssetId, BarWidth, Quote, Series};

use crate::{MarketData, MarketError, MarketResult};

/// Adapter that serves pre-loaded quotes and series. Each quote is consumed
/// once; the final quote keeps being served after the script runs out, which
/// mirrors a feed that has gone quiet.
pub struct ReplayAdapter {
    name: String,
    currency: String,
    quotes: Mutex<HashMap<AssetId, VecDeque<Quote>>>,
    last: Mutex<HashMap<AssetId, Quote>>,
    series: Mutex<HashMap<(AssetId, BarWidth), Series>>,
}

impl ReplayAdapter {
    #[must_use]
    pub fn new(name: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            currency: currency.into(),
            quotes: Mutex::new(HashMap::new()),
            last: Mutex::new(HashMap::new()),
            series: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a quote for later replay.
    pub fn push_quote(&self, quote: Quote) {
        let mut guard = self.quotes.lock().expect("replay quotes poisoned");
        guard.entry(quote.asset.clone()).or_default().push_back(quote);
    }

    /// Install a full series snapshot.
    pub fn set_series(&self, series: Series) {
        let mut guard = self.series.lock().expect("replay series poisoned");
        guard.insert((series.asset.clone(), series.bar_width), series);
    }
}

#[async_trait]
impl MarketData for ReplayAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn native_currency(&self) -> &str {
        &self.currency
    }

    fn supports(&self, asset: &AssetId) -> bool {
        let scripted = self
            .quotes
            .lock()
            .expect("replay quotes poisoned")
            .contains_key(asset);
        scripted
            || self
                .last
                .lock()
                .expect("replay last poisoned")
                .contains_key(asset)
    }

    async fn quote(&self, asset: &AssetId) -> MarketResult<Quote> {
        let next = {
            let mut guard = self.quotes.lock().expect("replay quotes poisoned");
            guard.get_mut(asset).and_then(VecDeque::pop_front)
        };
        if let Some(quote) = next {
            let mut last = self.last.lock().expect("replay last poisoned");
            last.insert(asset.clone(), quote.clone());
            return Ok(quote);
        }
        let last = self.last.lock().expect("replay last poisoned");
        last.get(asset).cloned().ok_or(MarketError::Transport {
            adapter: self.name.clone(),
            detail: "replay script exhausted".into(),
        })
    }

    async fn series(
        &self,
        asset: &AssetId,
        width: BarWidth,
        count: usize,
    ) -> MarketResult<Series> {
        let guard = self.series.lock().expect("replay series poisoned");
        let series = guard
            .get(&(asset.clone(), width))
            .cloned()
            .ok_or_else(|| MarketError::Unsupported {
                adapter: self.name.clone(),
                asset: asset.clone(),
            })?;
        if series.len() <= count {
            return Ok(series);
        }
        let mut trimmed = Series::new(asset.clone(), width, count.max(1));
        for bar in series.bars().iter().skip(series.len() - count) {
            trimmed.push(bar.clone());
        }
        Ok(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn quote(price: i64) -> Quote {
        Quote {
            asset: AssetId::crypto("KRW-BTC"),
            timestamp: Utc::now(),
            price: Decimal::from(price),
            volume: Decimal::ONE,
            change_pct_24h: 0.0,
            currency: "KRW".into(),
            source: "replay".into(),
            age: None,
        }
    }

    #[tokio::test]
    async fn replays_in_order_then_repeats_last() {
        let adapter = ReplayAdapter::new("replay", "KRW");
        adapter.push_quote(quote(100));
        adapter.push_quote(quote(101));
        let asset = AssetId::crypto("KRW-BTC");
        assert_eq!(adapter.quote(&asset).await.unwrap().price, Decimal::from(100));
        assert_eq!(adapter.quote(&asset).await.unwrap().price, Decimal::from(101));
        assert_eq!(adapter.quote(&asset).await.unwrap().price, Decimal::from(101));
    }

    #[tokio::test]
    async fn unknown_asset_fails() {
        let adapter = ReplayAdapter::new("replay", "KRW");
        assert!(adapter.quote(&AssetId::equity("005930")).await.is_err());
    }
}
