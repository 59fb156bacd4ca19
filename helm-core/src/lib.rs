//! Fundamental data types shared across the entire workspace.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Quantity = Decimal;
/// ISO-4217 style currency code (e.g., `KRW`, `USD`).
pub type CurrencyCode = String;

/// Errors raised when parsing core identifiers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unrecognized asset code '{0}'")]
    UnknownAsset(String),
    #[error("unsupported bar width '{0}'")]
    UnknownBarWidth(String),
}

/// Enumerates the supported asset families.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Equity,
    Crypto,
}

impl AssetClass {
    /// The currency quotes in this class are natively denominated in.
    #[must_use]
    pub fn native_currency(self) -> &'static str {
        match self {
            Self::Equity => "KRW",
            Self::Crypto => "KRW",
        }
    }

    /// Smallest tradable quantity increment for the class.
    #[must_use]
    pub fn quantity_step(self) -> Quantity {
        match self {
            Self::Equity => Decimal::ONE,
            Self::Crypto => Decimal::new(1, 8),
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equity => write!(f, "equity"),
            Self::Crypto => write!(f, "crypto"),
        }
    }
}

/// Identifier plus asset class; the class determines which adapter, currency,
/// and tick rules apply.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct AssetId {
    pub class: AssetClass,
    pub code: String,
}

impl AssetId {
    /// Build an equity identifier from a numeric exchange code.
    #[must_use]
    pub fn equity(code: impl Into<String>) -> Self {
        Self {
            class: AssetClass::Equity,
            code: code.into(),
        }
    }

    /// Build a crypto identifier from a market pair (e.g., `KRW-BTC`).
    #[must_use]
    pub fn crypto(code: impl Into<String>) -> Self {
        Self {
            class: AssetClass::Crypto,
            code: code.into(),
        }
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)
    }
}

impl FromStr for AssetId {
    type Err = ParseError;

    /// Infer the asset class from the identifier scheme: six-digit numeric
    /// codes are equities, `XXX-YYY` pairs and short upper-case tickers are
    /// crypto.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.len() == 6 && trimmed.chars().all(|c| c.is_ascii_digit()) {
            return Ok(Self::equity(trimmed));
        }
        if trimmed.contains('-') {
            let upper = trimmed.to_ascii_uppercase();
            let mut parts = upper.splitn(2, '-');
            let (quote, base) = (parts.next().unwrap_or(""), parts.next().unwrap_or(""));
            if !quote.is_empty() && !base.is_empty() {
                return Ok(Self::crypto(upper));
            }
        }
        if (2..=6).contains(&trimmed.len())
            && trimmed.chars().all(|c| c.is_ascii_alphabetic())
        {
            return Ok(Self::crypto(format!(
                "KRW-{}",
                trimmed.to_ascii_uppercase()
            )));
        }
        Err(ParseError::UnknownAsset(trimmed.to_string()))
    }
}

/// Bar granularity used when aggregating quotes into series.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BarWidth {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    OneHour,
    OneDay,
}

impl BarWidth {
    /// Convert the width into a chrono `Duration`.
    #[must_use]
    pub fn as_duration(self) -> Duration {
        match self {
            Self::OneMinute => Duration::minutes(1),
            Self::FiveMinutes => Duration::minutes(5),
            Self::FifteenMinutes => Duration::minutes(15),
            Self::OneHour => Duration::hours(1),
            Self::OneDay => Duration::days(1),
        }
    }

    /// Short label used in logs and file names.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::OneHour => "1h",
            Self::OneDay => "1d",
        }
    }
}

impl FromStr for BarWidth {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "1m" | "1min" | "1minute" => Ok(Self::OneMinute),
            "5m" | "5min" | "5minutes" => Ok(Self::FiveMinutes),
            "15m" | "15min" | "15minutes" => Ok(Self::FifteenMinutes),
            "1h" | "60m" | "1hour" => Ok(Self::OneHour),
            "1d" | "day" | "d" => Ok(Self::OneDay),
            other => Err(ParseError::UnknownBarWidth(other.to_string())),
        }
    }
}

/// Point-in-time price observation served by a market data adapter.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Quote {
    pub asset: AssetId,
    pub timestamp: DateTime<Utc>,
    pub price: Price,
    /// Traded volume over the adapter's reporting window.
    pub volume: Quantity,
    /// 24-hour change as a decimal percentage (-3.2 means -3.2%).
    pub change_pct_24h: f64,
    pub currency: CurrencyCode,
    /// Tag of the adapter that served this quote.
    pub source: String,
    /// Set when the quote was served from the last-known-good cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<i64>,
}

impl Quote {
    /// Whether the quote was served from cache rather than a live adapter.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.age.is_some()
    }
}

/// Aggregated OHLCV bar.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Quantity,
}

impl Bar {
    /// Close-to-open change for the bar as a fraction.
    #[must_use]
    pub fn change_fraction(&self) -> f64 {
        if self.open.is_zero() {
            return 0.0;
        }
        use rust_decimal::prelude::ToPrimitive;
        ((self.close - self.open) / self.open).to_f64().unwrap_or(0.0)
    }
}

/// Ordered, bounded sequence of bars at a stated width. The cap guards the
/// in-memory horizon; pushing past it drops the oldest bar.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Series {
    pub asset: AssetId,
    pub bar_width: BarWidth,
    bars: VecDeque<Bar>,
    max_bars: usize,
}

impl Series {
    /// Create an empty series retaining at most `max_bars` entries.
    #[must_use]
    pub fn new(asset: AssetId, bar_width: BarWidth, max_bars: usize) -> Self {
        let cap = max_bars.max(1);
        Self {
            asset,
            bar_width,
            bars: VecDeque::with_capacity(cap),
            max_bars: cap,
        }
    }

    /// Append a bar, evicting the oldest when the horizon is exceeded.
    pub fn push(&mut self, bar: Bar) {
        if self.bars.len() >= self.max_bars {
            self.bars.pop_front();
        }
        self.bars.push_back(bar);
    }

    /// Merge a quote into the series tail, opening a new bar when the quote
    /// falls past the current bar's window.
    pub fn apply_quote(&mut self, quote: &Quote) {
        let width = self.bar_width.as_duration();
        match self.bars.back_mut() {
            Some(last) if quote.timestamp - last.timestamp < width => {
                last.high = last.high.max(quote.price);
                last.low = last.low.min(quote.price);
                last.close = quote.price;
                last.volume += quote.volume;
            }
            _ => {
                self.push(Bar {
                    timestamp: quote.timestamp,
                    open: quote.price,
                    high: quote.price,
                    low: quote.price,
                    close: quote.price,
                    volume: quote.volume,
                });
            }
        }
    }

    #[must_use]
    pub fn bars(&self) -> &VecDeque<Bar> {
        &self.bars
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Closing prices oldest-first, a convenience for indicator warm-up.
    #[must_use]
    pub fn closes(&self) -> Vec<Price> {
        self.bars.iter().map(|bar| bar.close).collect()
    }

    #[must_use]
    pub fn last(&self) -> Option<&Bar> {
        self.bars.back()
    }
}

/// Severity ladder attached to anomaly events. Ordering is meaningful:
/// `Critical > High > Warn > Info`.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// The statistical or rule-based condition that produced an anomaly event.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    PriceJump,
    VolumeSpike,
    IndicatorDivergence,
    Breakout,
    SentimentShift,
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::PriceJump => "price_jump",
            Self::VolumeSpike => "volume_spike",
            Self::IndicatorDivergence => "indicator_divergence",
            Self::Breakout => "breakout",
            Self::SentimentShift => "sentiment_shift",
        };
        write!(f, "{label}")
    }
}

/// Event emitted when an observation clears its per-kind threshold.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AnomalyEvent {
    pub asset: AssetId,
    pub timestamp: DateTime<Utc>,
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub score: f64,
    pub context: String,
}

/// Directional recommendation attached to advice.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviceAction {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for AdviceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Hold => write!(f, "hold"),
        }
    }
}

/// Whether advice came from the rule aggregator or a language model.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviceSource {
    Rules,
    Llm,
}

/// Partial exit level expressed as (gain fraction, portion of position).
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct ProfitTier {
    /// Unrealized return at which the tier triggers (0.015 = +1.5%).
    pub trigger_pct: f64,
    /// Fraction of the original quantity to close (0.33 = one third).
    pub portion: f64,
}

/// Structured trading recommendation produced by the analysis pipeline.
///
/// `confidence` is a monotone derived score in `[0, 1]`, not a probability.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Advice {
    pub id: Uuid,
    pub asset: AssetId,
    pub action: AdviceAction,
    pub confidence: f64,
    pub entry: Option<Price>,
    pub stop_loss: Option<Price>,
    pub take_profit_tiers: Vec<ProfitTier>,
    pub reasoning: String,
    pub source: AdviceSource,
    pub generated_at: DateTime<Utc>,
}

impl Advice {
    /// Convenience constructor clamping confidence into `[0, 1]`.
    #[must_use]
    pub fn new(asset: AssetId, action: AdviceAction, confidence: f64, source: AdviceSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            asset,
            action,
            confidence: confidence.clamp(0.0, 1.0),
            entry: None,
            stop_loss: None,
            take_profit_tiers: Vec::new(),
            reasoning: String::new(),
            source,
            generated_at: Utc::now(),
        }
    }
}

/// The side of a simulated position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Signed direction used in P&L arithmetic (long +1, short -1).
    #[must_use]
    pub fn direction(self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// A tracked simulated position.
///
/// Invariants: `quantity_remaining >= 0`; `closed` holds exactly when
/// `quantity_remaining` is zero; `stop_loss_price` and `take_profit_price`
/// are derived from the entry at open time and never recomputed afterwards.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Position {
    pub id: Uuid,
    pub asset: AssetId,
    pub side: PositionSide,
    pub quantity_remaining: Quantity,
    pub original_quantity: Quantity,
    pub entry_price: Price,
    pub entry_time: DateTime<Utc>,
    pub stop_loss_price: Price,
    pub take_profit_price: Price,
    pub realized_pnl: Price,
    pub closed: bool,
}

impl Position {
    /// Signed unrealized return at `mark` as a fraction of entry.
    #[must_use]
    pub fn unrealized_return(&self, mark: Price) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        if self.entry_price.is_zero() {
            return 0.0;
        }
        let delta = (mark - self.entry_price) / self.entry_price;
        (delta * self.side.direction()).to_f64().unwrap_or(0.0)
    }

    /// Signed unrealized P&L over the remaining quantity.
    #[must_use]
    pub fn unrealized_pnl(&self, mark: Price) -> Price {
        (mark - self.entry_price) * self.side.direction() * self.quantity_remaining
    }
}

/// Why an open/adjust/close event happened.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeCause {
    User,
    StopLoss,
    TakeProfit,
    Timeout,
    StrategySignal,
    BacktestEnd,
}

impl fmt::Display for TradeCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::User => "user",
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::Timeout => "timeout",
            Self::StrategySignal => "strategy_signal",
            Self::BacktestEnd => "backtest_end",
        };
        write!(f, "{label}")
    }
}

/// Discriminates entries in the trade log.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeKind {
    Open,
    Adjust,
    Close,
}

/// Immutable entry in the append-only trade log.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TradeRecord {
    pub position_id: Uuid,
    pub asset: AssetId,
    pub kind: TradeKind,
    pub side: PositionSide,
    pub quantity: Quantity,
    pub price: Price,
    pub cause: TradeCause,
    pub realized_pnl: Price,
    pub fee: Price,
    pub timestamp: DateTime<Utc>,
}

/// Per-class aggregate inside a portfolio snapshot.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ClassBreakdown {
    pub open_positions: usize,
    pub market_value: Price,
    pub unrealized_pnl: Price,
}

/// Derived portfolio view grouped by asset class.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PortfolioSnapshot {
    pub equity: std::collections::HashMap<String, ClassBreakdown>,
    pub total_unrealized_pnl: Price,
    pub total_realized_pnl: Price,
    pub closed_trades: usize,
    pub win_rate: f64,
    pub generated_at: DateTime<Utc>,
}

/// Closed set of conversational intents with their typed slots.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Intent {
    Buy {
        asset: Option<AssetId>,
        quantity: Option<Quantity>,
        price: Option<Price>,
    },
    Sell {
        asset: Option<AssetId>,
        quantity: Option<Quantity>,
        price: Option<Price>,
    },
    AskAdvice {
        asset: Option<AssetId>,
    },
    CheckPosition {
        asset: Option<AssetId>,
    },
    PortfolioAdjust,
    MarketAnalysis,
    RunBacktest {
        strategy: Option<String>,
        days: Option<i64>,
        initial_capital: Option<Price>,
    },
    Chat {
        text: String,
    },
}

impl Intent {
    /// Stable label used for logging and the LLM classification contract.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Buy { .. } => "buy",
            Self::Sell { .. } => "sell",
            Self::AskAdvice { .. } => "ask_advice",
            Self::CheckPosition { .. } => "check_position",
            Self::PortfolioAdjust => "portfolio_adjust",
            Self::MarketAnalysis => "market_analysis",
            Self::RunBacktest { .. } => "run_backtest",
            Self::Chat { .. } => "chat",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::FromPrimitive;

    fn bar(ts_offset_min: i64, close: i64) -> Bar {
        let close = Decimal::from(close);
        Bar {
            timestamp: Utc::now() + Duration::minutes(ts_offset_min),
            open: close,
            high: close,
            low: close,
            close,
            volume: Decimal::ONE,
        }
    }

    #[test]
    fn bar_width_round_trips_labels() {
        for width in [
            BarWidth::OneMinute,
            BarWidth::FiveMinutes,
            BarWidth::FifteenMinutes,
            BarWidth::OneHour,
            BarWidth::OneDay,
        ] {
            assert_eq!(width.label().parse::<BarWidth>().unwrap(), width);
        }
    }

    #[test]
    fn asset_id_parses_class_from_scheme() {
        assert_eq!(
            "005930".parse::<AssetId>().unwrap(),
            AssetId::equity("005930")
        );
        assert_eq!(
            "krw-btc".parse::<AssetId>().unwrap(),
            AssetId::crypto("KRW-BTC")
        );
        assert_eq!("BTC".parse::<AssetId>().unwrap(), AssetId::crypto("KRW-BTC"));
        assert!("12345".parse::<AssetId>().is_err());
    }

    #[test]
    fn series_respects_history_cap() {
        let mut series = Series::new(AssetId::crypto("KRW-BTC"), BarWidth::OneMinute, 3);
        for i in 0..5 {
            series.push(bar(i, 100 + i));
        }
        assert_eq!(series.len(), 3);
        assert_eq!(series.bars().front().unwrap().close, Decimal::from(102));
    }

    #[test]
    fn apply_quote_extends_or_opens_bars() {
        let asset = AssetId::crypto("KRW-BTC");
        let mut series = Series::new(asset.clone(), BarWidth::OneMinute, 16);
        let base = Utc::now();
        let quote = |secs: i64, price: i64| Quote {
            asset: asset.clone(),
            timestamp: base + Duration::seconds(secs),
            price: Decimal::from(price),
            volume: Decimal::ONE,
            change_pct_24h: 0.0,
            currency: "KRW".into(),
            source: "test".into(),
            age: None,
        };
        series.apply_quote(&quote(0, 100));
        series.apply_quote(&quote(30, 105));
        assert_eq!(series.len(), 1);
        assert_eq!(series.last().unwrap().high, Decimal::from(105));
        series.apply_quote(&quote(90, 101));
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn severity_orders_by_escalation() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Warn);
        assert!(Severity::Warn > Severity::Info);
    }

    #[test]
    fn unrealized_return_is_signed_by_side() {
        let position = Position {
            id: Uuid::new_v4(),
            asset: AssetId::equity("005930"),
            side: PositionSide::Short,
            quantity_remaining: Decimal::from(10),
            original_quantity: Decimal::from(10),
            entry_price: Decimal::from(100),
            entry_time: Utc::now(),
            stop_loss_price: Decimal::from(110),
            take_profit_price: Decimal::from(80),
            realized_pnl: Decimal::ZERO,
            closed: false,
        };
        let ret = position.unrealized_return(Decimal::from_f64(90.0).unwrap());
        assert!((ret - 0.10).abs() < 1e-9);
        assert_eq!(
            position.unrealized_pnl(Decimal::from(90)),
            Decimal::from(100)
        );
    }
}
