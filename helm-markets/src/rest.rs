//! Vendor-neutral REST adapter speaking a small JSON quote/kline schema.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use helm_core::{AssetClass, AssetId, Bar, BarWidth, Quote, Series};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::{MarketData, MarketError, MarketResult};

/// REST client for upstream services exposing `/quote/{code}` and
/// `/klines/{code}` endpoints. One instance serves one asset class.
pub struct RestAdapter {
    name: String,
    base_url: String,
    currency: String,
    class: AssetClass,
    client: Client,
}

#[derive(Deserialize)]
struct QuotePayload {
    price: Decimal,
    #[serde(default)]
    volume: Decimal,
    #[serde(default)]
    change_pct_24h: f64,
    timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct KlinePayload {
    timestamp: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

impl RestAdapter {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        currency: impl Into<String>,
        class: AssetClass,
    ) -> MarketResult<Self> {
        let name = name.into();
        let client = Client::builder().build().map_err(|err| MarketError::Transport {
            adapter: name.clone(),
            detail: err.to_string(),
        })?;
        Ok(Self {
            name,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            currency: currency.into(),
            class,
            client,
        })
    }

    fn transport(&self, err: impl std::fmt::Display) -> MarketError {
        MarketError::Transport {
            adapter: self.name.clone(),
            detail: err.to_string(),
        }
    }

    fn schema(&self, err: impl std::fmt::Display) -> MarketError {
        MarketError::Schema {
            adapter: self.name.clone(),
            detail: err.to_string(),
        }
    }
}

#[async_trait]
impl MarketData for RestAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn native_currency(&self) -> &str {
        &self.currency
    }

    fn supports(&self, asset: &AssetId) -> bool {
        asset.class == self.class
    }

    async fn quote(&self, asset: &AssetId) -> MarketResult<Quote> {
        let url = format!("{}/quote/{}", self.base_url, asset.code);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| self.transport(err))?;
        if response.status().as_u16() == 429 {
            return Err(MarketError::RateLimited {
                adapter: self.name.clone(),
            });
        }
        let response = response
            .error_for_status()
            .map_err(|err| self.transport(err))?;
        let payload: QuotePayload = response.json().await.map_err(|err| self.schema(err))?;
        Ok(Quote {
            asset: asset.clone(),
            timestamp: payload.timestamp,
            price: payload.price,
            volume: payload.volume,
            change_pct_24h: payload.change_pct_24h,
            currency: self.currency.clone(),
            source: self.name.clone(),
            age: None,
        })
    }

    async fn series(
        &self,
        asset: &AssetId,
        width: BarWidth,
        count: usize,
    ) -> MarketResult<Series> {
        let url = format!(
            "{}/klines/{}?width={}&count={}",
            self.base_url,
            asset.code,
            width.label(),
            count
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| self.transport(err))?
            .error_for_status()
            .map_err(|err| self.transport(err))?;
        let rows: Vec<KlinePayload> = response.json().await.map_err(|err| self.schema(err))?;
        let mut series = Series::new(asset.clone(), width, count.max(rows.len()).max(1));
        let mut sorted = rows;
        sorted.sort_by_key(|row| row.timestamp);
        for row in sorted {
            series.push(Bar {
                timestamp: row.timestamp,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            });
        }
        Ok(series)
    }
}
