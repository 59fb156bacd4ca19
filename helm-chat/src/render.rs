//! Reply rendering with a consistent layout: symbol header, metrics block,
//! risk-note footer.

use helm_backtester::BacktestReport;
use helm_core::{Advice, AdviceSource, AssetId, PortfolioSnapshot, Price, TradeRecord};
use helm_positions::PositionView;

/// Fixed reply sent to users outside the allow-list.
pub const REFUSAL: &str = "You are not authorized to use this assistant.";

fn header(asset: &AssetId) -> String {
    format!("*{}* ({})", asset.code, asset.class)
}

fn risk_footer(stop: Option<Price>, target: Option<Price>, max_hold_hours: i64) -> String {
    let stop = stop.map_or("-".to_string(), |price| price.to_string());
    let target = target.map_or("-".to_string(), |price| price.to_string());
    format!("_risk: stop {stop} | target {target} | max hold {max_hold_hours}h_")
}

/// Render a successful open/close execution.
#[must_use]
pub fn trade_result(record: &TradeRecord, max_hold_hours: i64) -> String {
    let mut lines = vec![header(&record.asset)];
    lines.push(format!(
        "{:?} {} {} @ {}",
        record.kind, record.side, record.quantity, record.price
    ));
    if !record.realized_pnl.is_zero() {
        lines.push(format!("realized P&L: {}", record.realized_pnl));
    }
    if !record.fee.is_zero() {
        lines.push(format!("fee: {}", record.fee));
    }
    lines.push(risk_footer(None, None, max_hold_hours));
    lines.join("\n")
}

/// Render current positions with their marks.
#[must_use]
pub fn positions(views: &[PositionView], max_hold_hours: i64) -> String {
    if views.is_empty() {
        return "No open positions.".to_string();
    }
    let mut lines = Vec::new();
    for view in views {
        lines.push(header(&view.position.asset));
        lines.push(format!(
            "{} {} @ {} | mark {} | unrealized {} ({:+.2}%)",
            view.position.side,
            view.position.quantity_remaining,
            view.position.entry_price,
            view.mark_price,
            view.unrealized_pnl,
            view.unrealized_return * 100.0,
        ));
        lines.push(risk_footer(
            Some(view.position.stop_loss_price),
            Some(view.position.take_profit_price),
            max_hold_hours,
        ));
    }
    lines.join("\n")
}

/// Render the grouped portfolio snapshot.
#[must_use]
pub fn portfolio(snapshot: &PortfolioSnapshot) -> String {
    let mut lines = vec!["*Portfolio*".to_string()];
    if snapshot.equity.is_empty() {
        lines.push("no open positions".to_string());
    }
    for (class, breakdown) in &snapshot.equity {
        lines.push(format!(
            "{class}: {} open | value {} | unrealized {}",
            breakdown.open_positions, breakdown.market_value, breakdown.unrealized_pnl
        ));
    }
    lines.push(format!(
        "closed trades: {} | win rate {:.1}% | realized {}",
        snapshot.closed_trades,
        snapshot.win_rate * 100.0,
        snapshot.total_realized_pnl
    ));
    lines.join("\n")
}

/// Render one advice entry.
#[must_use]
pub fn advice(advice: &Advice, max_hold_hours: i64) -> String {
    let source = match advice.source {
        AdviceSource::Rules => "rules",
        AdviceSource::Llm => "model",
    };
    let mut lines = vec![header(&advice.asset)];
    lines.push(format!(
        "{} (confidence {:.0}%, via {source})",
        advice.action,
        advice.confidence * 100.0
    ));
    if !advice.reasoning.is_empty() {
        lines.push(advice.reasoning.clone());
    }
    lines.push(risk_footer(advice.stop_loss, None, max_hold_hours));
    lines.join("\n")
}

/// Render a finished backtest.
#[must_use]
pub fn backtest(asset: &AssetId, report: &BacktestReport) -> String {
    format!("{}\n{report}", header(asset))
}

/// Targeted clarification for a missing slot.
#[must_use]
pub fn clarify(slot: &str) -> String {
    match slot {
        "asset" => "Which asset do you mean? Give a code (e.g. 005930) or a pair (e.g. KRW-BTC)."
            .to_string(),
        "quantity" => "How many units? e.g. \"10 shares\" or \"0.5 coins\".".to_string(),
        other => format!("I need '{other}' to proceed."),
    }
}
