//! Conversation router: authorization, hybrid intent classification, and
//! dispatch onto the pipeline, tracker, and backtester.

mod intent;
pub mod render;

pub use intent::{Classified, IntentClassifier};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use helm_backtester::{BacktestConfig, Backtester, SignalAction, SignalRecord};
use helm_config::{AppConfig, RiskConfig};
use helm_core::{
    AdviceAction, AssetId, BarWidth, Intent, PositionSide, Price, Quantity, Quote, Series,
    TradeCause,
};
use helm_indicators::{IndicatorConfig, IndicatorSnapshot};
use helm_llm::{ContextBlock, EscalationSignals, LlmRouter, PromptSpec, ResponseSchema, TaskClass};
use helm_markets::MarketHub;
use helm_pipeline::{builtin_strategies, AdviceStore, SignalStrategy, StrategyInputs};
use helm_positions::{ExitPlan, PositionBook, PositionError};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("transport closed")]
    TransportClosed,
}

/// An inbound chat message tagged with its sender.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub user_id: i64,
    pub text: String,
}

/// Abstract chat transport; the concrete messenger client plugs in from
/// outside.
#[async_trait]
pub trait ChatTransport: Send {
    async fn send(&self, recipient: i64, text: &str) -> Result<(), ChatError>;
    async fn next_message(&mut self) -> Option<InboundMessage>;
}

/// In-process transport over channels, used by tests and local sessions.
pub struct ChannelTransport {
    inbound: mpsc::Receiver<InboundMessage>,
    outbound: mpsc::Sender<(i64, String)>,
}

impl ChannelTransport {
    #[must_use]
    pub fn new(
        inbound: mpsc::Receiver<InboundMessage>,
        outbound: mpsc::Sender<(i64, String)>,
    ) -> Self {
        Self { inbound, outbound }
    }
}

#[async_trait]
impl ChatTransport for ChannelTransport {
    async fn send(&self, recipient: i64, text: &str) -> Result<(), ChatError> {
        self.outbound
            .send((recipient, text.to_string()))
            .await
            .map_err(|_| ChatError::TransportClosed)
    }

    async fn next_message(&mut self) -> Option<InboundMessage> {
        self.inbound.recv().await
    }
}

/// Everything the router needs to execute commands.
pub struct ChatService {
    classifier: IntentClassifier,
    allowed: HashSet<i64>,
    markets: Arc<MarketHub>,
    router: Arc<LlmRouter>,
    advice: Arc<AdviceStore>,
    book: Arc<Mutex<PositionBook>>,
    risk: RiskConfig,
    monitored: Vec<AssetId>,
    strategies: Vec<SignalStrategy>,
}

impl ChatService {
    #[must_use]
    pub fn new(
        config: &AppConfig,
        markets: Arc<MarketHub>,
        router: Arc<LlmRouter>,
        advice: Arc<AdviceStore>,
        book: Arc<Mutex<PositionBook>>,
    ) -> Self {
        let mut monitored = Vec::new();
        for code in &config.assets.equities {
            monitored.push(AssetId::equity(code));
        }
        for code in &config.assets.cryptos {
            monitored.push(AssetId::crypto(code));
        }
        Self {
            classifier: IntentClassifier::new(config.assets.aliases.clone()),
            allowed: config.auth.users.iter().copied().collect(),
            markets,
            router,
            advice,
            book,
            risk: config.risk.clone(),
            monitored,
            strategies: builtin_strategies(),
        }
    }

    /// Handle one message end to end and produce the reply text.
    pub async fn handle(&self, message: &InboundMessage) -> String {
        if !self.allowed.contains(&message.user_id) {
            warn!(user = message.user_id, "unauthorized chat attempt");
            return render::REFUSAL.to_string();
        }
        let classified = self.classifier.classify(&self.router, &message.text).await;
        info!(
            user = message.user_id,
            intent = classified.intent.label(),
            confidence = classified.confidence,
            via_model = classified.via_model,
            "message classified"
        );
        match classified.intent {
            Intent::Buy {
                asset,
                quantity,
                price,
            } => self.execute_trade(asset, quantity, price, PositionSide::Long).await,
            Intent::Sell {
                asset,
                quantity,
                price,
            } => self.execute_close(asset, quantity, price).await,
            Intent::AskAdvice { asset } => self.answer_advice(asset).await,
            Intent::CheckPosition { asset } => {
                let book = self.book.lock().await;
                render::positions(&book.query(asset.as_ref()), self.risk.max_hold_hours)
            }
            Intent::PortfolioAdjust => {
                let book = self.book.lock().await;
                let mut reply = render::portfolio(&book.portfolio());
                reply.push_str("\n_rebalancing suggestions follow the next analysis pass_");
                reply
            }
            Intent::MarketAnalysis => self.market_analysis().await,
            Intent::RunBacktest {
                strategy,
                days,
                initial_capital,
            } => self.run_backtest(strategy, days, initial_capital).await,
            Intent::Chat { text } => self.small_talk(&text).await,
        }
    }

    async fn current_price(&self, asset: &AssetId) -> Result<Quote, String> {
        self.markets.quote(asset).await.map_err(|err| {
            format!("I could not fetch a price for {asset} ({err}); give an explicit price.")
        })
    }

    async fn execute_trade(
        &self,
        asset: Option<AssetId>,
        quantity: Option<Quantity>,
        price: Option<Price>,
        side: PositionSide,
    ) -> String {
        let Some(asset) = asset else {
            return render::clarify("asset");
        };
        let Some(quantity) = quantity else {
            return render::clarify("quantity");
        };
        let price = match price {
            Some(price) => price,
            None => match self.current_price(&asset).await {
                Ok(quote) => quote.price,
                Err(reply) => return reply,
            },
        };
        let mut book = self.book.lock().await;
        match book.open(
            asset,
            quantity,
            price,
            side,
            TradeCause::User,
            ExitPlan::default(),
            Utc::now(),
        ) {
            Ok(_) => {
                let record = book.trade_log().last().expect("open appends a record");
                render::trade_result(record, self.risk.max_hold_hours)
            }
            Err(err) => reject_text(&err),
        }
    }

    async fn execute_close(
        &self,
        asset: Option<AssetId>,
        quantity: Option<Quantity>,
        price: Option<Price>,
    ) -> String {
        let Some(asset) = asset else {
            return render::clarify("asset");
        };
        let Some(quantity) = quantity else {
            return render::clarify("quantity");
        };
        let price = match price {
            Some(price) => price,
            None => match self.current_price(&asset).await {
                Ok(quote) => quote.price,
                Err(reply) => return reply,
            },
        };
        let mut book = self.book.lock().await;
        match book.close(
            &asset,
            PositionSide::Long,
            quantity,
            price,
            TradeCause::User,
            Utc::now(),
        ) {
            Ok(_) => {
                let record = book.trade_log().last().expect("close appends a record");
                render::trade_result(record, self.risk.max_hold_hours)
            }
            Err(err) => reject_text(&err),
        }
    }

    async fn answer_advice(&self, asset: Option<AssetId>) -> String {
        let Some(asset) = asset else {
            return render::clarify("asset");
        };
        match self.advice.latest(&asset) {
            Some(entry) => render::advice(&entry, self.risk.max_hold_hours),
            None => format!(
                "No analysis for {asset} in the last 24 hours; the monitor will pick it up on \
                 the next anomaly."
            ),
        }
    }

    async fn market_analysis(&self) -> String {
        let mut quotes = Vec::new();
        for asset in &self.monitored {
            if let Ok(quote) = self.markets.quote(asset).await {
                quotes.push(quote);
            }
        }
        let class = TaskClass::for_analysis(&EscalationSignals {
            market_overview: true,
            ..Default::default()
        });
        if self.router.has_route(class) {
            let mut spec = PromptSpec::new(
                "You are a market analyst. Reply with one JSON object \
                 {\"reply\": \"<concise market overview>\"}.",
                "Summarize current conditions across the monitored assets.",
            );
            for quote in &quotes {
                spec = spec.with_context(ContextBlock::Quote(quote.clone()));
            }
            if let Ok(value) = self.router.complete(class, &spec, ResponseSchema::Object).await {
                if let Some(reply) = value["reply"].as_str() {
                    return reply.to_string();
                }
            }
        }
        // Rule fallback: latest advice entries plus raw quotes.
        let mut lines = vec!["*Market overview*".to_string()];
        for quote in &quotes {
            let advice_note = self
                .advice
                .latest(&quote.asset)
                .map(|entry| format!("{} ({:.0}%)", entry.action, entry.confidence * 100.0))
                .unwrap_or_else(|| "no recent analysis".to_string());
            lines.push(format!(
                "{}: {} ({:+.2}% 24h) — {advice_note}",
                quote.asset, quote.price, quote.change_pct_24h
            ));
        }
        if lines.len() == 1 {
            lines.push("no market data available".to_string());
        }
        lines.join("\n")
    }

    async fn run_backtest(
        &self,
        strategy: Option<String>,
        days: Option<i64>,
        initial_capital: Option<Price>,
    ) -> String {
        let Some(asset) = self.monitored.first().cloned() else {
            return "No monitored assets configured.".to_string();
        };
        let strategy_name = strategy.unwrap_or_else(|| "ma-cross-rsi".to_string());
        let Some(strategy) = self
            .strategies
            .iter()
            .find(|record| record.name == strategy_name)
        else {
            return format!(
                "Unknown strategy '{strategy_name}'. Available: {}.",
                self.strategies
                    .iter()
                    .map(|record| record.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        };
        let days = days.unwrap_or(30).clamp(1, 365);
        let bars = (days * 24) as usize;
        let series = match self.markets.series(&asset, BarWidth::OneHour, bars).await {
            Ok(series) => series,
            Err(err) => return format!("Could not load history for {asset}: {err}"),
        };
        if series.is_empty() {
            return format!("No history available for {asset}.");
        }
        let signals = replay_strategy_signals(strategy, &series);
        let config = BacktestConfig {
            initial_capital: initial_capital.unwrap_or(Decimal::from(10_000_000)),
            risk: self.risk.clone(),
            slippage: Decimal::new(1, 3),
        };
        let mut map = HashMap::new();
        map.insert(asset.clone(), series);
        match Backtester::new(config).run(map, signals) {
            Ok(report) => render::backtest(&asset, &report),
            Err(err) => format!("Backtest failed: {err}"),
        }
    }

    async fn small_talk(&self, text: &str) -> String {
        if self.router.has_route(TaskClass::Standard) {
            let spec = PromptSpec::new(
                "You are a concise trading assistant. Reply with one JSON object \
                 {\"reply\": \"<answer>\"}.",
                text.to_string(),
            );
            if let Ok(value) = self
                .router
                .complete(TaskClass::Standard, &spec, ResponseSchema::Object)
                .await
            {
                if let Some(reply) = value["reply"].as_str() {
                    return reply.to_string();
                }
            }
        }
        "I track your watchlist, open and close simulated positions, and run backtests. \
         Try \"buy 005930 10 shares\" or \"market overview\"."
            .to_string()
    }
}

fn reject_text(err: &PositionError) -> String {
    match err {
        PositionError::Validation(reason) => format!("Cannot do that: {reason}."),
        PositionError::RiskViolation(reason) => {
            format!("Refused by risk limits: {reason}.")
        }
        PositionError::NotFound { asset, side } => {
            format!("There is no open {side} position for {asset}.")
        }
    }
}

/// Replay a single strategy over a series, producing the timestamped entry
/// and exit stream consumed by the backtester.
#[must_use]
pub fn replay_strategy_signals(strategy: &SignalStrategy, series: &Series) -> Vec<SignalRecord> {
    let config = IndicatorConfig::default();
    let mut signals = Vec::new();
    let mut long_open = false;
    let mut prefix = Series::new(series.asset.clone(), series.bar_width, series.len().max(1));
    for bar in series.bars() {
        prefix.push(bar.clone());
        let snapshot = IndicatorSnapshot::compute(&prefix, &config);
        let quote = Quote {
            asset: series.asset.clone(),
            timestamp: bar.timestamp,
            price: bar.close,
            volume: bar.volume,
            change_pct_24h: 0.0,
            currency: series.asset.class.native_currency().to_string(),
            source: "backtest".into(),
            age: None,
        };
        let inputs = StrategyInputs {
            snapshot: &snapshot,
            quote: &quote,
            book_imbalance: None,
            news: None,
        };
        let Some(vote) = (strategy.signal_fn)(&inputs) else {
            continue;
        };
        match vote.action {
            AdviceAction::Buy if !long_open => {
                signals.push(SignalRecord {
                    timestamp: bar.timestamp,
                    asset: series.asset.clone(),
                    action: SignalAction::EnterLong,
                    entry: Some(bar.close),
                    exit_plan: ExitPlan {
                        tiers: strategy.take_profit_tiers.clone(),
                        max_hold: Some(strategy.max_hold),
                    },
                });
                long_open = true;
            }
            AdviceAction::Sell if long_open => {
                signals.push(SignalRecord {
                    timestamp: bar.timestamp,
                    asset: series.asset.clone(),
                    action: SignalAction::ExitLong,
                    entry: Some(bar.close),
                    exit_plan: ExitPlan::default(),
                });
                long_open = false;
            }
            _ => {}
        }
    }
    signals
}

/// Pump the transport until shutdown, answering each message in turn.
pub async fn run_chat_loop(
    mut transport: impl ChatTransport,
    service: Arc<ChatService>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            message = transport.next_message() => {
                let Some(message) = message else {
                    info!("chat transport closed");
                    return;
                };
                let reply = service.handle(&message).await;
                if let Err(err) = transport.send(message.user_id, &reply).await {
                    warn!(error = %err, "failed to deliver chat reply");
                    return;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("chat loop stopping");
                    return;
                }
            }
        }
    }
}
