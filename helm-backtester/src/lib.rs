//! Backtesting harness that replays historical series through the same
//! [`PositionBook`] rules used for live tracking.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use helm_config::RiskConfig;
use helm_core::{
    AssetId, Position, PositionSide, Price, Quantity, Series, TradeCause, TradeKind, TradeRecord,
};
use helm_positions::{ExitPlan, PositionBook, PositionError};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Per-run cap on the retained trade log; older entries are dropped and
/// counted.
const TRADE_LOG_CAP: usize = 10_000;

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("no bars available to replay")]
    EmptyData,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// What a timestamped signal instructs the replay to do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignalAction {
    EnterLong,
    ExitLong,
    EnterShort,
    ExitShort,
}

/// One record of the historical signal stream.
#[derive(Clone, Debug)]
pub struct SignalRecord {
    pub timestamp: DateTime<Utc>,
    pub asset: AssetId,
    pub action: SignalAction,
    /// Preferred entry price; the bar close is used when absent.
    pub entry: Option<Price>,
    pub exit_plan: ExitPlan,
}

/// Inputs governing one backtest run.
#[derive(Clone, Debug)]
pub struct BacktestConfig {
    pub initial_capital: Price,
    pub risk: RiskConfig,
    /// Symmetric slippage applied to signal entries, as a fraction
    /// (0.001 = 0.1%).
    pub slippage: Decimal,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: Decimal::from(10_000_000),
            risk: RiskConfig::default(),
            slippage: Decimal::new(1, 3),
        }
    }
}

/// Exit-cause tally for closed positions.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ExitCounts {
    pub stop_loss: usize,
    pub take_profit: usize,
    pub timeout: usize,
    pub signal: usize,
    pub backtest_end: usize,
}

/// Summary produced after a run completes.
#[derive(Clone, Debug, Serialize)]
pub struct BacktestReport {
    pub initial_capital: f64,
    pub final_equity: f64,
    pub total_return_pct: f64,
    pub win_rate_pct: f64,
    pub avg_hold_secs: f64,
    pub median_hold_secs: f64,
    pub exits: ExitCounts,
    pub sharpe_ratio: f64,
    pub max_drawdown_pct: f64,
    pub trade_log: Vec<TradeRecord>,
    pub dropped_records: usize,
}

impl fmt::Display for BacktestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Backtest Report")?;
        writeln!(f, "------------------------------------")?;
        writeln!(f, "{:<24} {:.2}", "Initial Capital", self.initial_capital)?;
        writeln!(f, "{:<24} {:.2}", "Final Equity", self.final_equity)?;
        writeln!(f, "{:<24} {:.2}%", "Total Return", self.total_return_pct)?;
        writeln!(f, "{:<24} {:.2}%", "Win Rate", self.win_rate_pct)?;
        writeln!(f, "{:<24} {:.0}s", "Avg Hold", self.avg_hold_secs)?;
        writeln!(f, "{:<24} {:.0}s", "Median Hold", self.median_hold_secs)?;
        writeln!(f, "{:<24} {:.2}", "Sharpe", self.sharpe_ratio)?;
        writeln!(f, "{:<24} {:.2}%", "Max Drawdown", self.max_drawdown_pct)?;
        writeln!(
            f,
            "{:<24} stop={} target={} timeout={} signal={} forced={}",
            "Exits",
            self.exits.stop_loss,
            self.exits.take_profit,
            self.exits.timeout,
            self.exits.signal,
            self.exits.backtest_end
        )?;
        if self.dropped_records > 0 {
            writeln!(
                f,
                "{:<24} {} (cap {})",
                "Dropped Records", self.dropped_records, TRADE_LOG_CAP
            )?;
        }
        writeln!(f, "------------------------------------")
    }
}

struct TimedBar {
    timestamp: DateTime<Utc>,
    asset: AssetId,
    close: Price,
}

/// Replays a series map and signal stream through the risk engine.
pub struct Backtester {
    config: BacktestConfig,
    book: PositionBook,
}

impl Backtester {
    #[must_use]
    pub fn new(config: BacktestConfig) -> Self {
        let book = PositionBook::new(config.risk.clone(), config.initial_capital);
        Self { config, book }
    }

    /// Run the replay to completion.
    pub fn run(
        mut self,
        series_map: HashMap<AssetId, Series>,
        mut signals: Vec<SignalRecord>,
    ) -> Result<BacktestReport, BacktestError> {
        if self.config.initial_capital <= Decimal::ZERO {
            return Err(BacktestError::InvalidConfig(
                "initial capital must be positive".into(),
            ));
        }
        let mut bars: Vec<TimedBar> = series_map
            .iter()
            .flat_map(|(asset, series)| {
                series.bars().iter().map(move |bar| TimedBar {
                    timestamp: bar.timestamp,
                    asset: asset.clone(),
                    close: bar.close,
                })
            })
            .collect();
        if bars.is_empty() {
            return Err(BacktestError::EmptyData);
        }
        bars.sort_by_key(|bar| bar.timestamp);
        signals.sort_by_key(|signal| signal.timestamp);

        let mut pending = signals.into_iter().peekable();
        let mut last_price: HashMap<AssetId, Price> = HashMap::new();
        let mut equity_curve: Vec<f64> = Vec::with_capacity(bars.len());

        for bar in &bars {
            while pending
                .peek()
                .is_some_and(|signal| signal.timestamp <= bar.timestamp)
            {
                let signal = pending.next().expect("peeked signal present");
                self.apply_signal(&signal, bar, &last_price);
            }
            last_price.insert(bar.asset.clone(), bar.close);
            let events = self.book.mark(&bar.asset, bar.close, bar.timestamp);
            for event in events {
                debug!(?event, "risk event during replay");
            }
            equity_curve.push(self.equity(&last_price));
        }

        // Anything still open is force-closed at the final observed price.
        let final_ts = bars.last().map(|bar| bar.timestamp).unwrap_or_else(Utc::now);
        for position in self.book.open_positions() {
            let price = last_price
                .get(&position.asset)
                .copied()
                .unwrap_or(position.entry_price);
            if let Err(err) = self.book.close(
                &position.asset,
                position.side,
                position.quantity_remaining,
                price,
                TradeCause::BacktestEnd,
                final_ts,
            ) {
                warn!(asset = %position.asset, error = %err, "end-of-run close failed");
            }
        }
        equity_curve.push(self.equity(&last_price));

        Ok(self.report(equity_curve))
    }

    fn apply_signal(
        &mut self,
        signal: &SignalRecord,
        bar: &TimedBar,
        last_price: &HashMap<AssetId, Price>,
    ) {
        let reference = signal
            .entry
            .or_else(|| last_price.get(&signal.asset).copied())
            .unwrap_or(bar.close);
        match signal.action {
            SignalAction::EnterLong | SignalAction::EnterShort => {
                let side = if signal.action == SignalAction::EnterLong {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                };
                let slip = reference * self.config.slippage * side.direction();
                let entry = reference + slip;
                let quantity = self.position_size(&signal.asset, entry);
                if quantity <= Decimal::ZERO {
                    warn!(asset = %signal.asset, "signal skipped; sized to zero");
                    return;
                }
                match self.book.open(
                    signal.asset.clone(),
                    quantity,
                    entry,
                    side,
                    TradeCause::StrategySignal,
                    signal.exit_plan.clone(),
                    signal.timestamp,
                ) {
                    Ok(_) => {}
                    Err(PositionError::RiskViolation(reason)) => {
                        debug!(asset = %signal.asset, %reason, "entry refused by risk limits");
                    }
                    Err(err) => {
                        debug!(asset = %signal.asset, error = %err, "entry rejected");
                    }
                }
            }
            SignalAction::ExitLong | SignalAction::ExitShort => {
                let side = if signal.action == SignalAction::ExitLong {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                };
                let Some(position) = self
                    .book
                    .open_positions()
                    .into_iter()
                    .find(|p| p.asset == signal.asset && p.side == side)
                else {
                    return;
                };
                let slip = reference * self.config.slippage * side.direction();
                let exit = reference - slip;
                if let Err(err) = self.book.close(
                    &signal.asset,
                    side,
                    position.quantity_remaining,
                    exit,
                    TradeCause::StrategySignal,
                    signal.timestamp,
                ) {
                    debug!(asset = %signal.asset, error = %err, "exit signal rejected");
                }
            }
        }
    }

    fn position_size(&self, asset: &AssetId, entry: Price) -> Quantity {
        if entry <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let budget = self.config.initial_capital
            * Decimal::from_f64(self.config.risk.max_position_pct).unwrap_or(Decimal::ZERO);
        let raw = budget / entry;
        let step = asset.class.quantity_step();
        if step.is_zero() {
            return raw;
        }
        (raw / step).floor() * step
    }

    fn equity(&self, last_price: &HashMap<AssetId, Price>) -> f64 {
        let realized: Price = self
            .book
            .trade_log()
            .iter()
            .map(|record| record.realized_pnl)
            .sum();
        let unrealized: Price = self
            .book
            .open_positions()
            .iter()
            .map(|position: &Position| {
                let mark = last_price
                    .get(&position.asset)
                    .copied()
                    .unwrap_or(position.entry_price);
                position.unrealized_pnl(mark)
            })
            .sum();
        (self.config.initial_capital + realized + unrealized)
            .to_f64()
            .unwrap_or(0.0)
    }

    fn report(self, equity_curve: Vec<f64>) -> BacktestReport {
        let initial = self.config.initial_capital.to_f64().unwrap_or(0.0);
        let final_equity = equity_curve.last().copied().unwrap_or(initial);

        let log = self.book.trade_log();
        let mut open_info: HashMap<uuid::Uuid, (DateTime<Utc>, Price, Quantity)> = HashMap::new();
        let mut trades: Vec<(f64, f64)> = Vec::new(); // (return, hold seconds)
        let mut pnl_by_position: HashMap<uuid::Uuid, Price> = HashMap::new();
        let mut exits = ExitCounts::default();

        for record in log {
            *pnl_by_position.entry(record.position_id).or_default() += record.realized_pnl;
            match record.kind {
                TradeKind::Open => {
                    open_info.insert(
                        record.position_id,
                        (record.timestamp, record.price, record.quantity),
                    );
                }
                TradeKind::Adjust => {}
                TradeKind::Close => {
                    match record.cause {
                        TradeCause::StopLoss => exits.stop_loss += 1,
                        TradeCause::TakeProfit => exits.take_profit += 1,
                        TradeCause::Timeout => exits.timeout += 1,
                        TradeCause::BacktestEnd => exits.backtest_end += 1,
                        TradeCause::User | TradeCause::StrategySignal => exits.signal += 1,
                    }
                    if let Some((opened_at, entry, quantity)) =
                        open_info.get(&record.position_id)
                    {
                        let basis = (*entry * *quantity).to_f64().unwrap_or(0.0);
                        let pnl = pnl_by_position
                            .get(&record.position_id)
                            .copied()
                            .unwrap_or_default()
                            .to_f64()
                            .unwrap_or(0.0);
                        let ret = if basis.abs() > f64::EPSILON {
                            pnl / basis
                        } else {
                            0.0
                        };
                        let hold = (record.timestamp - *opened_at).num_seconds() as f64;
                        trades.push((ret, hold));
                    }
                }
            }
        }

        let closed = trades.len();
        let wins = trades.iter().filter(|(ret, _)| *ret > 0.0).count();
        let win_rate_pct = if closed > 0 {
            wins as f64 / closed as f64 * 100.0
        } else {
            0.0
        };
        let avg_hold_secs = if closed > 0 {
            trades.iter().map(|(_, hold)| hold).sum::<f64>() / closed as f64
        } else {
            0.0
        };
        let median_hold_secs = median(trades.iter().map(|(_, hold)| *hold).collect());
        let sharpe_ratio = sharpe(&trades.iter().map(|(ret, _)| *ret).collect::<Vec<_>>());
        let max_drawdown_pct = max_drawdown(&equity_curve) * 100.0;
        let total_return_pct = if initial.abs() > f64::EPSILON {
            (final_equity / initial - 1.0) * 100.0
        } else {
            0.0
        };

        let mut trade_log: Vec<TradeRecord> = log.to_vec();
        let dropped_records = trade_log.len().saturating_sub(TRADE_LOG_CAP);
        if dropped_records > 0 {
            trade_log.drain(..dropped_records);
        }

        BacktestReport {
            initial_capital: initial,
            final_equity,
            total_return_pct,
            win_rate_pct,
            avg_hold_secs,
            median_hold_secs,
            exits,
            sharpe_ratio,
            max_drawdown_pct,
            trade_log,
            dropped_records,
        }
    }
}

fn median(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

fn sharpe(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std = variance.sqrt();
    if std <= 1e-12 {
        0.0
    } else {
        mean / std
    }
}

fn max_drawdown(curve: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0f64;
    for &equity in curve {
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            let drawdown = (peak - equity) / peak;
            if drawdown > worst {
                worst = drawdown;
            }
        }
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use helm_core::{Bar, BarWidth};

    fn series_from_closes(asset: &AssetId, start: DateTime<Utc>, closes: &[i64]) -> Series {
        let mut series = Series::new(asset.clone(), BarWidth::OneMinute, closes.len().max(1));
        for (i, close) in closes.iter().enumerate() {
            let close = Decimal::from(*close);
            series.push(Bar {
                timestamp: start + Duration::minutes(i as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume: Decimal::from(1_000),
            });
        }
        series
    }

    fn zero_friction_config() -> BacktestConfig {
        let mut config = BacktestConfig::default();
        config.risk.fee_rate = Decimal::ZERO;
        config.risk.min_open_gap_secs = 0;
        config.slippage = Decimal::ZERO;
        config
    }

    fn enter_long(asset: &AssetId, at: DateTime<Utc>, entry: i64) -> SignalRecord {
        SignalRecord {
            timestamp: at,
            asset: asset.clone(),
            action: SignalAction::EnterLong,
            entry: Some(Decimal::from(entry)),
            exit_plan: ExitPlan::default(),
        }
    }

    #[test]
    fn empty_data_is_an_error() {
        let result = Backtester::new(BacktestConfig::default()).run(HashMap::new(), Vec::new());
        assert!(matches!(result, Err(BacktestError::EmptyData)));
    }

    #[test]
    fn ten_percent_drop_exits_via_stop_loss() {
        let asset = AssetId::crypto("KRW-BTC");
        let start = Utc::now() - Duration::hours(2);
        let series = series_from_closes(&asset, start, &[100, 99, 95, 90, 89, 88]);
        let mut map = HashMap::new();
        map.insert(asset.clone(), series);

        let report = Backtester::new(zero_friction_config())
            .run(map, vec![enter_long(&asset, start, 100)])
            .unwrap();
        assert_eq!(report.exits.stop_loss, 1);
        assert_eq!(report.exits.backtest_end, 0);
        assert!(report.final_equity < report.initial_capital);
    }

    #[test]
    fn flat_series_closes_at_backtest_end() {
        let asset = AssetId::crypto("KRW-BTC");
        let start = Utc::now() - Duration::hours(2);
        let series = series_from_closes(&asset, start, &[100, 100, 100, 100]);
        let mut map = HashMap::new();
        map.insert(asset.clone(), series);

        let report = Backtester::new(zero_friction_config())
            .run(map, vec![enter_long(&asset, start, 100)])
            .unwrap();
        assert_eq!(report.exits.backtest_end, 1);
        assert!((report.final_equity - report.initial_capital).abs() < 1e-6);
    }

    #[test]
    fn live_and_backtest_agree_on_stop_exit() {
        // Same drop replayed through the book directly and through the
        // backtester must produce the same exit price, cause, and P&L.
        let asset = AssetId::crypto("KRW-BTC");
        let start = Utc::now() - Duration::hours(2);
        let closes = [100i64, 97, 93, 90, 88];

        let config = zero_friction_config();
        let mut live = PositionBook::new(config.risk.clone(), config.initial_capital);
        let quantity = {
            let budget = config.initial_capital
                * Decimal::from_f64(config.risk.max_position_pct).unwrap();
            let step = asset.class.quantity_step();
            ((budget / Decimal::from(100)) / step).floor() * step
        };
        live.open(
            asset.clone(),
            quantity,
            Decimal::from(100),
            PositionSide::Long,
            TradeCause::StrategySignal,
            ExitPlan::default(),
            start,
        )
        .unwrap();
        let mut live_close = None;
        for (i, close) in closes.iter().enumerate() {
            for event in live.mark(
                &asset,
                Decimal::from(*close),
                start + Duration::minutes(i as i64),
            ) {
                if let helm_positions::TrackerEvent::ForcedClose { record } = event {
                    live_close = Some(record);
                }
            }
        }
        let live_close = live_close.expect("live replay hit the stop");

        let mut map = HashMap::new();
        map.insert(asset.clone(), series_from_closes(&asset, start, &closes));
        let report = Backtester::new(config)
            .run(map, vec![enter_long(&asset, start, 100)])
            .unwrap();
        let bt_close = report
            .trade_log
            .iter()
            .find(|record| record.kind == TradeKind::Close)
            .expect("backtest closed the position");

        assert_eq!(bt_close.cause, live_close.cause);
        assert_eq!(bt_close.price, live_close.price);
        assert_eq!(bt_close.realized_pnl, live_close.realized_pnl);
    }

    #[test]
    fn report_statistics_are_internally_consistent() {
        let asset = AssetId::crypto("KRW-BTC");
        let start = Utc::now() - Duration::hours(3);
        let series = series_from_closes(&asset, start, &[100, 104, 108, 112, 116, 121]);
        let mut map = HashMap::new();
        map.insert(asset.clone(), series);

        let report = Backtester::new(zero_friction_config())
            .run(map, vec![enter_long(&asset, start, 100)])
            .unwrap();
        assert_eq!(report.exits.take_profit, 1);
        assert_eq!(report.win_rate_pct, 100.0);
        assert!(report.total_return_pct > 0.0);
        assert!(report.max_drawdown_pct >= 0.0);
        assert_eq!(report.dropped_records, 0);
    }
}
