//! Uniform quote/series interface over per-asset-class adapter chains with
//! automatic failover, rate limiting, and staleness handling.

pub mod currency;
pub mod limiter;
mod replay;
mod rest;

pub use currency::{Converted, CurrencyConverter, RateSource};
pub use limiter::{RateLimitExceeded, RateLimiter};
pub use replay::ReplayAdapter;
pub use rest::RestAdapter;

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use helm_config::AdapterConfig;
use helm_core::{AssetClass, AssetId, BarWidth, Quote, Series};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Convenience alias for market data results.
pub type MarketResult<T> = Result<T, MarketError>;

/// Failure classes surfaced by adapters and the hub. Transport, rate-limit,
/// staleness, and schema failures all count as ordinary failover triggers.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("transport error from '{adapter}': {detail}")]
    Transport { adapter: String, detail: String },
    #[error("rate limit exhausted for '{adapter}'")]
    RateLimited { adapter: String },
    #[error("'{adapter}' served data {age_secs}s old (bound {bound_secs}s)")]
    Stale {
        adapter: String,
        age_secs: i64,
        bound_secs: i64,
    },
    #[error("schema error from '{adapter}': {detail}")]
    Schema { adapter: String, detail: String },
    #[error("asset '{asset}' is not served by adapter '{adapter}'")]
    Unsupported { adapter: String, asset: AssetId },
    #[error("no source available for '{0}'")]
    SourceUnavailable(AssetId),
    #[error("no rate known for currency '{0}'")]
    UnknownCurrency(String),
}

impl MarketError {
    /// Adapter tag associated with the failure, when one applies.
    #[must_use]
    pub fn adapter(&self) -> Option<&str> {
        match self {
            Self::Transport { adapter, .. }
            | Self::RateLimited { adapter }
            | Self::Stale { adapter, .. }
            | Self::Schema { adapter, .. }
            | Self::Unsupported { adapter, .. } => Some(adapter),
            _ => None,
        }
    }
}

/// One upstream market data source.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Tag used in logs and in `Quote::source`.
    fn name(&self) -> &str;

    /// Currency this adapter's prices are denominated in.
    fn native_currency(&self) -> &str;

    /// Whether the adapter serves the given instrument.
    fn supports(&self, asset: &AssetId) -> bool;

    /// Fetch the latest quote.
    async fn quote(&self, asset: &AssetId) -> MarketResult<Quote>;

    /// Fetch up to `count` bars at the requested width, oldest first.
    async fn series(&self, asset: &AssetId, width: BarWidth, count: usize)
        -> MarketResult<Series>;
}

struct AdapterSlot {
    adapter: Box<dyn MarketData>,
    limiter: RateLimiter,
    staleness_bound: Duration,
    request_timeout: StdDuration,
}

/// Dispatches quote/series calls across ordered adapter chains per asset
/// class, serving a last-known-good quote when every adapter fails.
pub struct MarketHub {
    chains: HashMap<AssetClass, Vec<AdapterSlot>>,
    cache: RwLock<HashMap<AssetId, Quote>>,
    cache_limit: Duration,
    subscribers: Mutex<HashMap<AssetId, broadcast::Sender<Quote>>>,
}

impl MarketHub {
    /// Create a hub that serves cached quotes up to `cache_limit` old.
    #[must_use]
    pub fn new(cache_limit: Duration) -> Self {
        Self {
            chains: HashMap::new(),
            cache: RwLock::new(HashMap::new()),
            cache_limit,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Append an adapter to the failover chain of `class`. Chain order is
    /// attempt order.
    pub fn register(
        &mut self,
        class: AssetClass,
        adapter: Box<dyn MarketData>,
        config: &AdapterConfig,
    ) {
        let slot = AdapterSlot {
            limiter: RateLimiter::per_minute(
                config.quota_per_minute,
                config.quota_margin,
                StdDuration::from_secs(config.request_timeout_secs),
            ),
            staleness_bound: Duration::seconds(config.staleness_secs),
            request_timeout: StdDuration::from_secs(config.request_timeout_secs),
            adapter,
        };
        self.chains.entry(class).or_default().push(slot);
    }

    /// Fetch a quote, walking the adapter chain in order. When every adapter
    /// fails, a cached quote within the staleness limit is returned with its
    /// age tag; otherwise `SourceUnavailable`.
    pub async fn quote(&self, asset: &AssetId) -> MarketResult<Quote> {
        let chain = self
            .chains
            .get(&asset.class)
            .ok_or_else(|| MarketError::SourceUnavailable(asset.clone()))?;
        for slot in chain {
            match self.try_slot_quote(slot, asset).await {
                Ok(mut quote) => {
                    quote.source = slot.adapter.name().to_string();
                    quote.age = None;
                    self.store(quote.clone());
                    return Ok(quote);
                }
                Err(err) => {
                    warn!(
                        asset = %asset,
                        adapter = err.adapter().unwrap_or("?"),
                        error = %err,
                        "adapter failed; trying next"
                    );
                }
            }
        }
        self.cached(asset)
            .ok_or_else(|| MarketError::SourceUnavailable(asset.clone()))
    }

    async fn try_slot_quote(&self, slot: &AdapterSlot, asset: &AssetId) -> MarketResult<Quote> {
        let name = slot.adapter.name().to_string();
        if !slot.adapter.supports(asset) {
            return Err(MarketError::Unsupported {
                adapter: name,
                asset: asset.clone(),
            });
        }
        slot.limiter
            .acquire()
            .await
            .map_err(|_| MarketError::RateLimited {
                adapter: name.clone(),
            })?;
        let quote = tokio::time::timeout(slot.request_timeout, slot.adapter.quote(asset))
            .await
            .map_err(|_| MarketError::Transport {
                adapter: name.clone(),
                detail: "request deadline exceeded".into(),
            })??;
        let age = Utc::now() - quote.timestamp;
        if age > slot.staleness_bound {
            return Err(MarketError::Stale {
                adapter: name,
                age_secs: age.num_seconds(),
                bound_secs: slot.staleness_bound.num_seconds(),
            });
        }
        Ok(quote)
    }

    /// Fetch a series with the same failover semantics as [`quote`].
    ///
    /// [`quote`]: MarketHub::quote
    pub async fn series(
        &self,
        asset: &AssetId,
        width: BarWidth,
        count: usize,
    ) -> MarketResult<Series> {
        let chain = self
            .chains
            .get(&asset.class)
            .ok_or_else(|| MarketError::SourceUnavailable(asset.clone()))?;
        for slot in chain {
            let name = slot.adapter.name().to_string();
            if !slot.adapter.supports(asset) {
                continue;
            }
            if slot.limiter.acquire().await.is_err() {
                warn!(asset = %asset, adapter = %name, "series call rate limited");
                continue;
            }
            match tokio::time::timeout(
                slot.request_timeout,
                slot.adapter.series(asset, width, count),
            )
            .await
            {
                Ok(Ok(series)) => return Ok(series),
                Ok(Err(err)) => {
                    warn!(asset = %asset, adapter = %name, error = %err, "series call failed")
                }
                Err(_) => {
                    warn!(asset = %asset, adapter = %name, "series call timed out")
                }
            }
        }
        Err(MarketError::SourceUnavailable(asset.clone()))
    }

    /// Subscribe to quotes the hub observes for `asset`. Slow receivers drop
    /// the oldest buffered entries.
    pub fn subscribe(&self, asset: &AssetId) -> broadcast::Receiver<Quote> {
        let mut guard = self.subscribers.lock().expect("subscriber map poisoned");
        guard
            .entry(asset.clone())
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe()
    }

    fn store(&self, quote: Quote) {
        {
            let mut cache = self.cache.write().expect("quote cache poisoned");
            cache.insert(quote.asset.clone(), quote.clone());
        }
        let guard = self.subscribers.lock().expect("subscriber map poisoned");
        if let Some(tx) = guard.get(&quote.asset) {
            // Send failures only mean nobody is currently listening.
            let _ = tx.send(quote);
        }
    }

    fn cached(&self, asset: &AssetId) -> Option<Quote> {
        let cache = self.cache.read().expect("quote cache poisoned");
        let quote = cache.get(asset)?;
        let age = Utc::now() - quote.timestamp;
        if age > self.cache_limit {
            return None;
        }
        debug!(asset = %asset, age_secs = age.num_seconds(), "serving last-known-good quote");
        let mut stale = quote.clone();
        stale.age = Some(age.num_seconds());
        Some(stale)
    }
}
