//! Per-asset analysis loop: quote → indicators → anomaly scan → conditional
//! language-model escalation → advice emission.

mod strategy;

pub use strategy::{
    aggregate, builtin_strategies, AggregateSignal, SignalStrategy, StrategyInputs, Vote,
};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{Duration as StdDuration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use helm_anomaly::{AnomalyDetector, Metric, Observation};
use helm_config::{AnomalyConfig, TradingConfig};
use helm_core::{
    Advice, AdviceAction, AdviceSource, AnomalyEvent, AssetId, BarWidth, Quote, Series, Severity,
};
use helm_indicators::{IndicatorConfig, IndicatorSnapshot};
use helm_llm::{
    ContextBlock, EscalationSignals, LlmRouter, NewsDigest, PromptSpec, TaskClass,
};
use helm_markets::MarketHub;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// How long advice entries stay queryable.
const ADVICE_RETENTION_HOURS: i64 = 24;
/// Hard cap per asset underneath the time horizon.
const ADVICE_RING_CAP: usize = 512;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("market data unavailable: {0}")]
    Market(#[from] helm_markets::MarketError),
}

/// Optional source of aggregated headlines. The default implementation
/// reports nothing; real feed scrapers plug in from outside.
#[async_trait]
pub trait NewsFeed: Send + Sync {
    async fn digest(&self, asset: &AssetId) -> NewsDigest;
}

/// A feed that never has news.
pub struct NoNews;

#[async_trait]
impl NewsFeed for NoNews {
    async fn digest(&self, _asset: &AssetId) -> NewsDigest {
        NewsDigest::default()
    }
}

/// Bounded, time-expiring advice history shared read-many/write-one.
#[derive(Default)]
pub struct AdviceStore {
    rings: RwLock<HashMap<AssetId, VecDeque<Advice>>>,
}

impl AdviceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an advice entry, expiring anything beyond the retention
    /// horizon or the ring cap.
    pub fn record(&self, advice: Advice) {
        let mut rings = self.rings.write().expect("advice store poisoned");
        let ring = rings.entry(advice.asset.clone()).or_default();
        let horizon = Utc::now() - Duration::hours(ADVICE_RETENTION_HOURS);
        while matches!(ring.front(), Some(entry) if entry.generated_at < horizon) {
            ring.pop_front();
        }
        if ring.len() >= ADVICE_RING_CAP {
            ring.pop_front();
        }
        ring.push_back(advice);
    }

    /// Latest advice for an asset, if still within retention.
    #[must_use]
    pub fn latest(&self, asset: &AssetId) -> Option<Advice> {
        let rings = self.rings.read().expect("advice store poisoned");
        rings.get(asset).and_then(|ring| ring.back().cloned())
    }

    /// All advice for an asset newer than `since`.
    #[must_use]
    pub fn since(&self, asset: &AssetId, since: DateTime<Utc>) -> Vec<Advice> {
        let rings = self.rings.read().expect("advice store poisoned");
        rings
            .get(asset)
            .map(|ring| {
                ring.iter()
                    .filter(|advice| advice.generated_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Shared wiring handed to every asset monitor.
pub struct PipelineContext {
    pub markets: Arc<MarketHub>,
    pub router: Arc<LlmRouter>,
    pub news: Arc<dyn NewsFeed>,
    pub advice: Arc<AdviceStore>,
    pub trading: TradingConfig,
    pub indicator_config: IndicatorConfig,
    pub anomaly_config: AnomalyConfig,
    advice_tx: broadcast::Sender<Advice>,
    anomaly_tx: broadcast::Sender<AnomalyEvent>,
}

impl PipelineContext {
    #[must_use]
    pub fn new(
        markets: Arc<MarketHub>,
        router: Arc<LlmRouter>,
        news: Arc<dyn NewsFeed>,
        trading: TradingConfig,
        anomaly_config: AnomalyConfig,
    ) -> Self {
        Self {
            markets,
            router,
            news,
            advice: Arc::new(AdviceStore::new()),
            trading,
            indicator_config: IndicatorConfig::default(),
            anomaly_config,
            advice_tx: broadcast::channel(128).0,
            anomaly_tx: broadcast::channel(128).0,
        }
    }

    /// Subscribe to every advice entry the pipeline emits.
    #[must_use]
    pub fn subscribe_advice(&self) -> broadcast::Receiver<Advice> {
        self.advice_tx.subscribe()
    }

    /// Subscribe to anomaly events that survived debouncing.
    #[must_use]
    pub fn subscribe_anomalies(&self) -> broadcast::Receiver<AnomalyEvent> {
        self.anomaly_tx.subscribe()
    }
}

/// What one tick produced; returned for tests and logging.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub anomalies: Vec<AnomalyEvent>,
    pub advice: Option<Advice>,
}

/// Serial per-asset monitor. One instance owns its series tail; ticks never
/// overlap for the same asset.
pub struct AssetMonitor {
    ctx: Arc<PipelineContext>,
    asset: AssetId,
    series: Series,
    detector: AnomalyDetector,
    strategies: Vec<SignalStrategy>,
}

impl AssetMonitor {
    #[must_use]
    pub fn new(ctx: Arc<PipelineContext>, asset: AssetId) -> Self {
        let series = Series::new(
            asset.clone(),
            BarWidth::OneMinute,
            ctx.trading.history_bars,
        );
        let detector = AnomalyDetector::new(ctx.anomaly_config.clone());
        Self {
            ctx,
            asset,
            series,
            detector,
            strategies: builtin_strategies(),
        }
    }

    /// Execute one tick: pull a quote, refresh the series tail, score
    /// anomalies, and escalate to the model when warranted.
    pub async fn tick(&mut self) -> Result<TickOutcome, PipelineError> {
        let quote = self.ctx.markets.quote(&self.asset).await?;
        let prev_close = self.series.last().map(|bar| bar.close);
        self.series.apply_quote(&quote);
        let snapshot = IndicatorSnapshot::compute(&self.series, &self.ctx.indicator_config);

        let mut anomalies = Vec::new();
        let now = quote.timestamp;

        if let Some(prev) = prev_close.filter(|prev| !prev.is_zero()) {
            let ret = ((quote.price - prev) / prev).to_f64().unwrap_or(0.0);
            if let Some(event) = self.detector.observe(
                &self.asset,
                Observation {
                    metric: Metric::Return1m,
                    value: ret,
                    timestamp: now,
                },
            ) {
                anomalies.push(event);
            }
            if let Some(event) = self.detector.observe_volume_print(
                &self.asset,
                now,
                ret,
                snapshot.volume.and_then(|v| v.ratio),
            ) {
                anomalies.push(event);
            }
        }
        if let Some(volume_z) = snapshot.volume.and_then(|v| v.z_score) {
            if let Some(event) = self.detector.observe(
                &self.asset,
                Observation {
                    metric: Metric::VolumeZ5m,
                    value: volume_z.to_f64().unwrap_or(0.0),
                    timestamp: now,
                },
            ) {
                anomalies.push(event);
            }
        }
        if let Some(range) = self.hourly_range() {
            if let Some(event) = self.detector.observe(
                &self.asset,
                Observation {
                    metric: Metric::Range1h,
                    value: range,
                    timestamp: now,
                },
            ) {
                anomalies.push(event);
            }
        }
        if let Some(direction) = snapshot.session_break {
            if let Some(event) =
                self.detector
                    .observe_breakout(&self.asset, now, format!("{direction:?}"))
            {
                anomalies.push(event);
            }
        }

        for event in &anomalies {
            let _ = self.ctx.anomaly_tx.send(event.clone());
        }

        let news = self.ctx.news.digest(&self.asset).await;
        let inputs = StrategyInputs {
            snapshot: &snapshot,
            quote: &quote,
            book_imbalance: None,
            news: Some(&news),
        };
        let signal = aggregate(
            &self.strategies,
            &self.ctx.trading.strategy_weights,
            &inputs,
            self.ctx.trading.min_confidence,
        );

        let worst = anomalies.iter().map(|event| event.severity).max();
        let advice = if worst >= Some(Severity::Warn) {
            Some(
                self.escalate(&quote, &snapshot, &anomalies, &news, &signal)
                    .await,
            )
        } else if signal.action != AdviceAction::Hold {
            Some(self.rules_advice(&quote, &signal))
        } else {
            None
        };

        if let Some(advice) = &advice {
            self.ctx.advice.record(advice.clone());
            let _ = self.ctx.advice_tx.send(advice.clone());
        }

        Ok(TickOutcome { anomalies, advice })
    }

    /// High-low range over the trailing hour as a fraction of the last close.
    fn hourly_range(&self) -> Option<f64> {
        let last = self.series.last()?;
        let cutoff = last.timestamp - Duration::hours(1);
        let mut high: Option<Decimal> = None;
        let mut low: Option<Decimal> = None;
        for bar in self.series.bars().iter().filter(|bar| bar.timestamp >= cutoff) {
            high = Some(high.map_or(bar.high, |h| h.max(bar.high)));
            low = Some(low.map_or(bar.low, |l| l.min(bar.low)));
        }
        let (high, low) = (high?, low?);
        if last.close.is_zero() {
            return None;
        }
        ((high - low) / last.close).to_f64()
    }

    async fn escalate(
        &self,
        quote: &Quote,
        snapshot: &IndicatorSnapshot,
        anomalies: &[AnomalyEvent],
        news: &NewsDigest,
        fallback: &AggregateSignal,
    ) -> Advice {
        let worst = anomalies
            .iter()
            .max_by_key(|event| event.severity)
            .expect("escalation requires at least one anomaly");
        let change_5m = self.change_over(Duration::minutes(5));
        let class = TaskClass::for_analysis(&EscalationSignals {
            severity: Some(worst.severity),
            change_5m,
            relevant_news: news.relevant_count,
            market_overview: false,
        });
        let mut spec = PromptSpec::new(
            "You are a trading analyst. Reply with a single JSON object: \
             {\"action\": \"buy|sell|hold\", \"confidence\": 0.0-1.0, \
             \"entry\": number|null, \"stop_loss\": number|null, \
             \"take_profit_tiers\": [], \"reasoning\": \"...\"}.",
            format!(
                "An anomaly fired for {}. Decide whether to buy, sell, or hold.",
                self.asset
            ),
        )
        .with_context(ContextBlock::Quote(quote.clone()))
        .with_context(ContextBlock::Indicators(snapshot.clone()));
        for event in anomalies {
            spec = spec.with_context(ContextBlock::Anomaly(event.clone()));
        }
        if news.relevant_count > 0 {
            spec = spec.with_context(ContextBlock::News(news.clone()));
        }

        match self.ctx.router.advise(class, &spec).await {
            Ok(payload) => {
                let mut advice = Advice::new(
                    self.asset.clone(),
                    payload.action_enum(),
                    payload.confidence,
                    AdviceSource::Llm,
                );
                advice.entry = payload.entry.or(Some(quote.price));
                advice.stop_loss = payload.stop_loss;
                advice.take_profit_tiers = payload.take_profit_tiers;
                advice.reasoning = payload.reasoning;
                advice
            }
            Err(err) => {
                warn!(asset = %self.asset, error = %err, "model escalation failed; using rule advice");
                self.rules_advice(quote, fallback)
            }
        }
    }

    fn rules_advice(&self, quote: &Quote, signal: &AggregateSignal) -> Advice {
        let mut advice = Advice::new(
            self.asset.clone(),
            signal.action,
            signal.confidence,
            AdviceSource::Rules,
        );
        advice.entry = Some(quote.price);
        if signal.action != AdviceAction::Hold {
            let stop = Decimal::from_f64(1.0 + signal.stop_pct).unwrap_or(Decimal::ONE);
            advice.stop_loss = Some(quote.price * stop);
            advice.take_profit_tiers = signal.take_profit_tiers.clone();
        }
        advice.reasoning = if signal.contributors.is_empty() {
            "no strategy consensus".to_string()
        } else {
            format!("strategy consensus: {}", signal.contributors.join(", "))
        };
        advice
    }

    /// Price change over the trailing window as a fraction.
    fn change_over(&self, window: Duration) -> f64 {
        let Some(last) = self.series.last() else {
            return 0.0;
        };
        let cutoff = last.timestamp - window;
        let base = self
            .series
            .bars()
            .iter()
            .find(|bar| bar.timestamp >= cutoff)
            .map(|bar| bar.close);
        match base {
            Some(base) if !base.is_zero() => {
                ((last.close - base) / base).to_f64().unwrap_or(0.0)
            }
            _ => 0.0,
        }
    }
}

/// Drive an asset monitor at the configured cadence until shutdown.
///
/// Ticks are serial per asset: an overrun delays the next tick and the
/// overdue ticks are skipped with a warning, never overlapped.
pub async fn run_monitor_loop(
    mut monitor: AssetMonitor,
    asset: AssetId,
    cadence: StdDuration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(cadence);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(asset = %asset, cadence_secs = cadence.as_secs(), "asset monitor started");
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(asset = %asset, "asset monitor stopping");
                    return;
                }
                continue;
            }
        }
        let started = Instant::now();
        match monitor.tick().await {
            Ok(outcome) => {
                if !outcome.anomalies.is_empty() {
                    debug!(
                        asset = %asset,
                        anomalies = outcome.anomalies.len(),
                        advice = outcome.advice.is_some(),
                        "tick produced events"
                    );
                }
            }
            Err(err) => {
                // Transient upstream failures retry at the next tick.
                warn!(asset = %asset, error = %err, "tick failed; retrying next tick");
            }
        }
        let elapsed = started.elapsed();
        if elapsed > cadence {
            warn!(
                asset = %asset,
                elapsed_ms = elapsed.as_millis() as u64,
                cadence_ms = cadence.as_millis() as u64,
                "tick overran cadence; overdue ticks will be skipped"
            );
        }
    }
}
