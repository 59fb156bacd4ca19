//! Runtime wiring: builds the hub, router, tracker, and supervised units
//! out of the loaded configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Duration;
use helm_chat::{run_chat_loop, ChatError, ChatService, ChatTransport, InboundMessage};
use helm_config::AppConfig;
use helm_core::{AssetClass, AssetId, CurrencyCode};
use helm_llm::{CompletionClient, HttpCompletionClient, LlmRouter, TaskClass};
use helm_markets::{CurrencyConverter, MarketHub, MarketResult, RateSource, RestAdapter};
use helm_pipeline::{AssetMonitor, PipelineContext};
use helm_positions::{AlertKind, PositionBook, TrackerEvent};
use helm_supervisor::{Notifier, Unit};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// The asset identifiers configured for monitoring.
#[must_use]
pub fn monitored_assets(config: &AppConfig) -> Vec<AssetId> {
    let mut assets = Vec::new();
    for code in &config.assets.equities {
        assets.push(AssetId::equity(code));
    }
    for code in &config.assets.cryptos {
        assets.push(AssetId::crypto(code));
    }
    assets
}

/// Build the market hub from the configured adapter chains.
pub fn build_market_hub(config: &AppConfig) -> Result<MarketHub> {
    let mut hub = MarketHub::new(Duration::seconds(config.markets.quote_staleness_secs));
    let mut registered = 0usize;
    for (class_name, chain) in &config.markets.adapters {
        let class = match class_name.as_str() {
            "equity" => AssetClass::Equity,
            "crypto" => AssetClass::Crypto,
            other => {
                warn!(class = other, "ignoring adapter chain for unknown asset class");
                continue;
            }
        };
        for adapter in chain {
            let Some(base_url) = adapter.base_url.as_ref() else {
                warn!(adapter = %adapter.name, "adapter has no base_url; skipped");
                continue;
            };
            let rest = RestAdapter::new(
                adapter.name.clone(),
                base_url.clone(),
                class.native_currency(),
                class,
            )
            .with_context(|| format!("failed to build adapter '{}'", adapter.name))?;
            hub.register(class, Box::new(rest), adapter);
            registered += 1;
        }
    }
    if registered == 0 {
        anyhow::bail!("no market data adapters could be constructed");
    }
    Ok(hub)
}

/// Build the model router from the task map. Providers whose API key is not
/// in the environment are skipped with a warning; an empty chain simply
/// leaves that task class on the rule path.
#[must_use]
pub fn build_llm_router(config: &AppConfig) -> LlmRouter {
    let mut router = LlmRouter::new(
        StdDuration::from_secs(config.llm.budget_secs),
        config.llm.max_concurrency,
    );
    for (class_name, provider_names) in &config.llm.task_map {
        let Ok(class) = TaskClass::from_str(class_name) else {
            warn!(class = %class_name, "unknown task class in llm.task_map");
            continue;
        };
        let mut chain: Vec<Arc<dyn CompletionClient>> = Vec::new();
        for name in provider_names {
            let Some(provider) = config.llm.providers.get(name) else {
                warn!(provider = %name, "provider listed in task_map but not defined");
                continue;
            };
            match HttpCompletionClient::new(
                name.clone(),
                provider.base_url.clone(),
                provider.model.clone(),
                &provider.api_key_env,
                vec![class],
            ) {
                Ok(client) => chain.push(Arc::new(client)),
                Err(err) => warn!(provider = %name, error = %err, "provider unavailable"),
            }
        }
        if chain.is_empty() {
            warn!(class = %class_name, "no usable providers; rule fallback will serve this class");
        } else {
            router = router.with_route(class, chain);
        }
    }
    router
}

/// Rate source reading a flat JSON object of currency -> rate.
pub struct HttpRateSource {
    url: String,
    client: reqwest::Client,
}

impl HttpRateSource {
    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RateSource for HttpRateSource {
    async fn fetch(&self, _display: &str) -> MarketResult<HashMap<CurrencyCode, Decimal>> {
        let value: Value = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| helm_markets::MarketError::Transport {
                adapter: "rate-source".into(),
                detail: err.to_string(),
            })?
            .json()
            .await
            .map_err(|err| helm_markets::MarketError::Schema {
                adapter: "rate-source".into(),
                detail: err.to_string(),
            })?;
        let mut rates = HashMap::new();
        if let Some(object) = value.as_object() {
            for (currency, rate) in object {
                if let Some(rate) = rate.as_f64().and_then(Decimal::from_f64_retain) {
                    rates.insert(currency.clone(), rate);
                }
            }
        }
        Ok(rates)
    }
}

/// Supervised unit driving one asset's analysis loop.
pub struct MonitorUnit {
    pub name: String,
    pub ctx: Arc<PipelineContext>,
    pub asset: AssetId,
    pub cadence: StdDuration,
}

#[async_trait]
impl Unit for MonitorUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        // A fresh monitor per (re)start keeps series state consistent.
        let monitor = AssetMonitor::new(self.ctx.clone(), self.asset.clone());
        helm_pipeline::run_monitor_loop(monitor, self.asset.clone(), self.cadence, shutdown).await;
        Ok(())
    }
}

/// Supervised unit marking tracked positions on every quote the hub serves.
pub struct TrackerUnit {
    pub book: Arc<Mutex<PositionBook>>,
    pub hub: Arc<MarketHub>,
    pub assets: Vec<AssetId>,
    pub notifier: Notifier,
}

#[async_trait]
impl Unit for TrackerUnit {
    fn name(&self) -> &str {
        "position-tracker"
    }

    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut tasks = JoinSet::new();
        for asset in &self.assets {
            let mut quotes = self.hub.subscribe(asset);
            let book = self.book.clone();
            let notifier = self.notifier.clone();
            let asset = asset.clone();
            let mut shutdown = shutdown.clone();
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        quote = quotes.recv() => {
                            let quote = match quote {
                                Ok(quote) => quote,
                                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                    warn!(asset = %asset, skipped, "tracker lagged behind quotes");
                                    continue;
                                }
                                Err(broadcast::error::RecvError::Closed) => return,
                            };
                            let events = {
                                let mut book = book.lock().await;
                                book.mark(&asset, quote.price, quote.timestamp)
                            };
                            for event in events {
                                report_tracker_event(&notifier, &asset, &event).await;
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

async fn report_tracker_event(notifier: &Notifier, asset: &AssetId, event: &TrackerEvent) {
    match event {
        TrackerEvent::Alert {
            kind,
            unrealized_return,
            ..
        } => {
            let title = match kind {
                AlertKind::StopLossWarning => "Stop-loss warning",
                AlertKind::MajorGain => "Major gain",
            };
            notifier
                .alert(
                    title,
                    &format!("{asset}: unrealized {:.2}%", unrealized_return * 100.0),
                )
                .await;
        }
        TrackerEvent::ForcedClose { record } => {
            notifier
                .alert(
                    "Position force-closed",
                    &format!(
                        "{asset}: {} {} @ {} ({})",
                        record.side, record.quantity, record.price, record.cause
                    ),
                )
                .await;
        }
        TrackerEvent::TierExit { record, tier } => {
            info!(asset = %asset, tier, price = %record.price, "tier exit filled");
        }
    }
}

/// Supervised unit refreshing the currency-rate cache on its period.
pub struct RatesUnit {
    pub converter: Arc<CurrencyConverter>,
    pub source: HttpRateSource,
    pub period: StdDuration,
}

#[async_trait]
impl Unit for RatesUnit {
    fn name(&self) -> &str {
        "currency-rates"
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut interval = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.converter.refresh(&self.source).await {
                        warn!(error = %err, "currency rate refresh failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Interactive transport reading operator messages from stdin.
pub struct StdinTransport {
    user_id: i64,
    reader: BufReader<tokio::io::Stdin>,
}

impl StdinTransport {
    #[must_use]
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id,
            reader: BufReader::new(tokio::io::stdin()),
        }
    }
}

#[async_trait]
impl ChatTransport for StdinTransport {
    async fn send(&self, _recipient: i64, text: &str) -> Result<(), ChatError> {
        println!("{text}");
        Ok(())
    }

    async fn next_message(&mut self) -> Option<InboundMessage> {
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {
                    let text = line.trim().to_string();
                    if text.is_empty() {
                        continue;
                    }
                    return Some(InboundMessage {
                        user_id: self.user_id,
                        text,
                    });
                }
            }
        }
    }
}

/// Supervised unit answering operator messages on stdin.
pub struct ChatUnit {
    pub service: Arc<ChatService>,
    pub user_id: i64,
}

#[async_trait]
impl Unit for ChatUnit {
    fn name(&self) -> &str {
        "chat"
    }

    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let transport = StdinTransport::new(self.user_id);
        run_chat_loop(transport, self.service.clone(), shutdown).await;
        Ok(())
    }
}

/// The effective cadence for the configured trading mode.
#[must_use]
pub fn cadence_for(config: &AppConfig) -> StdDuration {
    StdDuration::from_secs(config.trading.cadence_secs())
}

/// Write a JSON + human-readable report pair named by timestamp.
pub fn write_report_pair(
    dir: &Path,
    stem: &str,
    json: &Value,
    text: &str,
) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create reports directory {}", dir.display()))?;
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let json_path = dir.join(format!("{stem}_{timestamp}.json"));
    let text_path = dir.join(format!("{stem}_{timestamp}.txt"));
    std::fs::write(&json_path, serde_json::to_string_pretty(json)?)
        .with_context(|| format!("failed to write {}", json_path.display()))?;
    std::fs::write(&text_path, text)
        .with_context(|| format!("failed to write {}", text_path.display()))?;
    Ok((json_path, text_path))
}
