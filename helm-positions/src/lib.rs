//! Position accounting and risk-rule enforcement.
//!
//! The [`PositionBook`] is the single owner of all position state. Every
//! mutation flows through it, the trade log is append-only, and the same
//! rules drive both live tracking and backtests.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use helm_config::RiskConfig;
use helm_core::{
    AssetId, ClassBreakdown, PortfolioSnapshot, Position, PositionSide, Price, ProfitTier,
    Quantity, TradeCause, TradeKind, TradeRecord,
};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Result alias for tracker operations.
pub type PositionResult<T> = Result<T, PositionError>;

/// Failure variants surfaced by the tracker.
#[derive(Debug, Error)]
pub enum PositionError {
    /// Malformed command input; nothing was mutated.
    #[error("validation failed: {0}")]
    Validation(String),
    /// A risk limit refused the operation; nothing was mutated.
    #[error("risk limit: {0}")]
    RiskViolation(String),
    /// The referenced position does not exist or is closed.
    #[error("no open {side} position for {asset}")]
    NotFound { asset: AssetId, side: PositionSide },
}

/// Threshold alerts raised while marking. Each fires at most once per
/// position.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlertKind {
    StopLossWarning,
    MajorGain,
}

/// Event produced by [`PositionBook::mark`].
#[derive(Clone, Debug)]
pub enum TrackerEvent {
    Alert {
        kind: AlertKind,
        position_id: Uuid,
        asset: AssetId,
        unrealized_return: f64,
    },
    ForcedClose {
        record: TradeRecord,
    },
    TierExit {
        record: TradeRecord,
        tier: usize,
    },
}

/// Per-strategy exit plan attached at open time.
#[derive(Clone, Debug, Default)]
pub struct ExitPlan {
    pub tiers: Vec<ProfitTier>,
    pub max_hold: Option<Duration>,
}

#[derive(Clone, Copy, Debug, Default)]
struct AlertFlags {
    loss_warned: bool,
    gain_warned: bool,
}

#[derive(Clone, Debug, Default)]
struct TierState {
    tiers: Vec<ProfitTier>,
    fired: usize,
}

#[derive(Clone, Copy, Debug)]
struct DayState {
    date: NaiveDate,
    closed_trades: u32,
    consecutive_losses: u32,
}

impl DayState {
    fn for_date(date: NaiveDate) -> Self {
        Self {
            date,
            closed_trades: 0,
            consecutive_losses: 0,
        }
    }
}

/// Owner of all simulated positions for one account.
pub struct PositionBook {
    risk: RiskConfig,
    capital: Price,
    fee_rate: Decimal,
    positions: HashMap<(AssetId, PositionSide), Position>,
    trade_log: Vec<TradeRecord>,
    alert_flags: HashMap<Uuid, AlertFlags>,
    tier_state: HashMap<Uuid, TierState>,
    max_hold: HashMap<Uuid, Duration>,
    last_open_at: HashMap<AssetId, DateTime<Utc>>,
    last_mark: HashMap<AssetId, (DateTime<Utc>, Price)>,
    day: DayState,
}

impl PositionBook {
    /// Build a book over `capital` units of the display currency.
    #[must_use]
    pub fn new(risk: RiskConfig, capital: Price) -> Self {
        let fee_rate = risk.fee_rate;
        Self {
            risk,
            capital,
            fee_rate,
            positions: HashMap::new(),
            trade_log: Vec::new(),
            alert_flags: HashMap::new(),
            tier_state: HashMap::new(),
            max_hold: HashMap::new(),
            last_open_at: HashMap::new(),
            last_mark: HashMap::new(),
            day: DayState::for_date(Utc::now().date_naive()),
        }
    }

    /// Open a new position. Stop-loss and take-profit prices are derived from
    /// the entry here and never recomputed during the position's life.
    pub fn open(
        &mut self,
        asset: AssetId,
        quantity: Quantity,
        entry_price: Price,
        side: PositionSide,
        cause: TradeCause,
        plan: ExitPlan,
        now: DateTime<Utc>,
    ) -> PositionResult<Position> {
        if quantity <= Decimal::ZERO {
            return Err(PositionError::Validation(
                "quantity must be greater than zero".into(),
            ));
        }
        if entry_price <= Decimal::ZERO {
            return Err(PositionError::Validation(
                "entry price must be greater than zero".into(),
            ));
        }
        let key = (asset.clone(), side);
        if self
            .positions
            .get(&key)
            .is_some_and(|position| !position.closed)
        {
            return Err(PositionError::Validation(format!(
                "an open {side} position for {asset} already exists"
            )));
        }
        self.roll_day(now.date_naive());
        if self.day.closed_trades >= self.risk.max_trades_per_day {
            return Err(PositionError::RiskViolation(format!(
                "daily trade cap of {} reached",
                self.risk.max_trades_per_day
            )));
        }
        if self.day.consecutive_losses >= self.risk.max_consecutive_losses {
            return Err(PositionError::RiskViolation(format!(
                "{} consecutive losses; new opens locked until tomorrow",
                self.day.consecutive_losses
            )));
        }
        if let Some(last) = self.last_open_at.get(&asset) {
            let gap = now - *last;
            if gap < Duration::seconds(self.risk.min_open_gap_secs) {
                return Err(PositionError::RiskViolation(format!(
                    "only {}s since the last open on {asset}; minimum gap is {}s",
                    gap.num_seconds(),
                    self.risk.min_open_gap_secs
                )));
            }
        }
        let notional = quantity * entry_price;
        let limit = self.capital * decimal_from_f64(self.risk.max_position_pct);
        if notional > limit {
            return Err(PositionError::RiskViolation(format!(
                "notional {notional} exceeds {}% of capital",
                self.risk.max_position_pct * 100.0
            )));
        }

        let direction = side.direction();
        let stop_loss_price =
            entry_price * (Decimal::ONE + decimal_from_f64(self.risk.stop_loss_pct) * direction);
        let take_profit_price =
            entry_price * (Decimal::ONE + decimal_from_f64(self.risk.take_profit_pct) * direction);
        let open_fee = notional * self.fee_rate;

        let position = Position {
            id: Uuid::new_v4(),
            asset: asset.clone(),
            side,
            quantity_remaining: quantity,
            original_quantity: quantity,
            entry_price,
            entry_time: now,
            stop_loss_price,
            take_profit_price,
            realized_pnl: -open_fee,
            closed: false,
        };
        self.trade_log.push(TradeRecord {
            position_id: position.id,
            asset: asset.clone(),
            kind: TradeKind::Open,
            side,
            quantity,
            price: entry_price,
            cause,
            realized_pnl: -open_fee,
            fee: open_fee,
            timestamp: now,
        });
        self.alert_flags.insert(position.id, AlertFlags::default());
        if !plan.tiers.is_empty() {
            self.tier_state.insert(
                position.id,
                TierState {
                    tiers: plan.tiers,
                    fired: 0,
                },
            );
        }
        let hold = plan
            .max_hold
            .unwrap_or_else(|| Duration::hours(self.risk.max_hold_hours));
        self.max_hold.insert(position.id, hold);
        self.last_open_at.insert(asset, now);
        self.positions.insert(key, position.clone());
        info!(
            asset = %position.asset,
            side = %side,
            %quantity,
            entry = %entry_price,
            stop = %stop_loss_price,
            target = %take_profit_price,
            "position opened"
        );
        Ok(position)
    }

    /// Close up to `quantity` of an open position at `exit_price`, returning
    /// the realized P&L net of the closing fee. Requesting more than the
    /// remaining quantity is a validation error, never a silent clamp.
    pub fn close(
        &mut self,
        asset: &AssetId,
        side: PositionSide,
        quantity: Quantity,
        exit_price: Price,
        cause: TradeCause,
        now: DateTime<Utc>,
    ) -> PositionResult<Price> {
        if quantity <= Decimal::ZERO {
            return Err(PositionError::Validation(
                "close quantity must be greater than zero".into(),
            ));
        }
        self.roll_day(now.date_naive());
        let key = (asset.clone(), side);
        let position = self
            .positions
            .get_mut(&key)
            .filter(|position| !position.closed)
            .ok_or_else(|| PositionError::NotFound {
                asset: asset.clone(),
                side,
            })?;
        if quantity > position.quantity_remaining {
            return Err(PositionError::Validation(format!(
                "close quantity {quantity} exceeds remaining {}",
                position.quantity_remaining
            )));
        }
        let fee = exit_price * quantity * self.fee_rate;
        let gross = (exit_price - position.entry_price) * side.direction() * quantity;
        let realized = gross - fee;
        position.realized_pnl += realized;
        position.quantity_remaining -= quantity;
        let fully_closed = position.quantity_remaining.is_zero();
        position.closed = fully_closed;
        let record = TradeRecord {
            position_id: position.id,
            asset: asset.clone(),
            kind: if fully_closed {
                TradeKind::Close
            } else {
                TradeKind::Adjust
            },
            side,
            quantity,
            price: exit_price,
            cause,
            realized_pnl: realized,
            fee,
            timestamp: now,
        };
        let total_pnl = position.realized_pnl;
        self.trade_log.push(record);
        if fully_closed {
            self.day.closed_trades += 1;
            if total_pnl < Decimal::ZERO {
                self.day.consecutive_losses += 1;
            } else {
                self.day.consecutive_losses = 0;
            }
            info!(
                asset = %asset,
                side = %side,
                %cause,
                pnl = %total_pnl,
                "position fully closed"
            );
        }
        Ok(realized)
    }

    /// Refresh the in-memory mark for an asset and enforce exit rules.
    /// Idempotent for a repeated `(asset, timestamp)` pair.
    pub fn mark(
        &mut self,
        asset: &AssetId,
        price: Price,
        timestamp: DateTime<Utc>,
    ) -> Vec<TrackerEvent> {
        if let Some((last_ts, _)) = self.last_mark.get(asset) {
            if *last_ts == timestamp {
                return Vec::new();
            }
        }
        self.last_mark.insert(asset.clone(), (timestamp, price));

        let mut events = Vec::new();
        for side in [PositionSide::Long, PositionSide::Short] {
            let key = (asset.clone(), side);
            let Some(position) = self.positions.get(&key) else {
                continue;
            };
            if position.closed {
                continue;
            }
            let id = position.id;
            let ret = position.unrealized_return(price);
            let held = timestamp - position.entry_time;
            let max_hold = self
                .max_hold
                .get(&id)
                .copied()
                .unwrap_or_else(|| Duration::hours(self.risk.max_hold_hours));

            if ret <= self.risk.stop_loss_pct {
                events.push(self.force_close(asset, side, price, TradeCause::StopLoss, timestamp));
                continue;
            }
            if held >= max_hold {
                events.push(self.force_close(asset, side, price, TradeCause::Timeout, timestamp));
                continue;
            }
            if ret >= self.risk.take_profit_pct {
                events.push(self.force_close(
                    asset,
                    side,
                    price,
                    TradeCause::TakeProfit,
                    timestamp,
                ));
                continue;
            }

            let flags = self.alert_flags.entry(id).or_default();
            if ret <= self.risk.stop_warning_pct && !flags.loss_warned {
                flags.loss_warned = true;
                warn!(asset = %asset, ret, "stop-loss warning threshold crossed");
                events.push(TrackerEvent::Alert {
                    kind: AlertKind::StopLossWarning,
                    position_id: id,
                    asset: asset.clone(),
                    unrealized_return: ret,
                });
            } else if ret >= self.risk.major_gain_pct && !flags.gain_warned {
                flags.gain_warned = true;
                events.push(TrackerEvent::Alert {
                    kind: AlertKind::MajorGain,
                    position_id: id,
                    asset: asset.clone(),
                    unrealized_return: ret,
                });
            }

            events.extend(self.fire_tiers(asset, side, price, ret, timestamp));
        }
        events
    }

    fn fire_tiers(
        &mut self,
        asset: &AssetId,
        side: PositionSide,
        price: Price,
        ret: f64,
        timestamp: DateTime<Utc>,
    ) -> Vec<TrackerEvent> {
        let key = (asset.clone(), side);
        let Some(position) = self.positions.get(&key) else {
            return Vec::new();
        };
        let id = position.id;
        let original = position.original_quantity;
        let Some(state) = self.tier_state.get(&id) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        let tiers = state.tiers.clone();
        let mut fired = state.fired;
        while fired < tiers.len() {
            let tier = tiers[fired];
            if ret < tier.trigger_pct {
                break;
            }
            let remaining = self
                .positions
                .get(&key)
                .map(|p| p.quantity_remaining)
                .unwrap_or(Decimal::ZERO);
            if remaining.is_zero() {
                break;
            }
            let is_last = fired + 1 == tiers.len();
            let quantity = if is_last {
                remaining
            } else {
                (original * decimal_from_f64(tier.portion)).min(remaining)
            };
            match self.close(asset, side, quantity, price, TradeCause::TakeProfit, timestamp) {
                Ok(_) => {
                    let record = self
                        .trade_log
                        .last()
                        .cloned()
                        .expect("close just appended a record");
                    events.push(TrackerEvent::TierExit {
                        record,
                        tier: fired,
                    });
                }
                Err(err) => {
                    warn!(asset = %asset, error = %err, "tier exit close failed");
                    break;
                }
            }
            fired += 1;
        }
        if let Some(state) = self.tier_state.get_mut(&id) {
            state.fired = fired;
        }
        events
    }

    fn force_close(
        &mut self,
        asset: &AssetId,
        side: PositionSide,
        price: Price,
        cause: TradeCause,
        timestamp: DateTime<Utc>,
    ) -> TrackerEvent {
        let key = (asset.clone(), side);
        let quantity = self
            .positions
            .get(&key)
            .map(|position| position.quantity_remaining)
            .unwrap_or(Decimal::ZERO);
        // The quantity was read from the live position, so close cannot
        // reject it.
        let _ = self.close(asset, side, quantity, price, cause, timestamp);
        let record = self
            .trade_log
            .last()
            .cloned()
            .expect("force close appended a record");
        warn!(asset = %asset, side = %side, %cause, price = %price, "position force-closed");
        TrackerEvent::ForcedClose { record }
    }

    /// Current positions, optionally filtered by asset, with their last mark.
    #[must_use]
    pub fn query(&self, asset: Option<&AssetId>) -> Vec<PositionView> {
        self.positions
            .values()
            .filter(|position| !position.closed)
            .filter(|position| asset.map_or(true, |wanted| &position.asset == wanted))
            .map(|position| {
                let mark = self
                    .last_mark
                    .get(&position.asset)
                    .map(|(_, price)| *price)
                    .unwrap_or(position.entry_price);
                PositionView {
                    unrealized_pnl: position.unrealized_pnl(mark),
                    unrealized_return: position.unrealized_return(mark),
                    mark_price: mark,
                    position: position.clone(),
                }
            })
            .collect()
    }

    /// Grouped snapshot across asset classes with win-rate statistics.
    #[must_use]
    pub fn portfolio(&self) -> PortfolioSnapshot {
        let mut snapshot = PortfolioSnapshot {
            generated_at: Utc::now(),
            ..PortfolioSnapshot::default()
        };
        for view in self.query(None) {
            let entry = snapshot
                .equity
                .entry(view.position.asset.class.to_string())
                .or_insert_with(ClassBreakdown::default);
            entry.open_positions += 1;
            entry.market_value += view.mark_price * view.position.quantity_remaining;
            entry.unrealized_pnl += view.unrealized_pnl;
            snapshot.total_unrealized_pnl += view.unrealized_pnl;
        }
        let mut closed = 0usize;
        let mut wins = 0usize;
        let mut closed_pnl: HashMap<Uuid, Price> = HashMap::new();
        for record in &self.trade_log {
            *closed_pnl.entry(record.position_id).or_default() += record.realized_pnl;
            if record.kind == TradeKind::Close {
                closed += 1;
                if closed_pnl.get(&record.position_id).copied().unwrap_or_default()
                    > Decimal::ZERO
                {
                    wins += 1;
                }
            }
            snapshot.total_realized_pnl += record.realized_pnl;
        }
        snapshot.closed_trades = closed;
        snapshot.win_rate = if closed > 0 {
            wins as f64 / closed as f64
        } else {
            0.0
        };
        snapshot
    }

    /// The append-only trade log, oldest first.
    #[must_use]
    pub fn trade_log(&self) -> &[TradeRecord] {
        &self.trade_log
    }

    /// Remaining open positions regardless of asset.
    #[must_use]
    pub fn open_positions(&self) -> Vec<Position> {
        self.positions
            .values()
            .filter(|position| !position.closed)
            .cloned()
            .collect()
    }

    fn roll_day(&mut self, date: NaiveDate) {
        if self.day.date != date {
            self.day = DayState::for_date(date);
        }
    }
}

/// A position joined with its latest mark.
#[derive(Clone, Debug)]
pub struct PositionView {
    pub position: Position,
    pub mark_price: Price,
    pub unrealized_pnl: Price,
    pub unrealized_return: f64,
}

fn decimal_from_f64(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> PositionBook {
        let mut risk = RiskConfig::default();
        risk.fee_rate = Decimal::ZERO;
        risk.min_open_gap_secs = 0;
        PositionBook::new(risk, Decimal::from(1_000_000))
    }

    fn asset() -> AssetId {
        AssetId::equity("005930")
    }

    fn open_long(book: &mut PositionBook, entry: i64, qty: i64, at: DateTime<Utc>) -> Position {
        book.open(
            asset(),
            Decimal::from(qty),
            Decimal::from(entry),
            PositionSide::Long,
            TradeCause::User,
            ExitPlan::default(),
            at,
        )
        .expect("open must succeed")
    }

    #[test]
    fn open_derives_frozen_stop_and_target() {
        let mut book = book();
        let now = Utc::now();
        let position = open_long(&mut book, 100, 10, now);
        assert_eq!(position.stop_loss_price, Decimal::from(90));
        assert_eq!(position.take_profit_price, Decimal::from(120));
        // Marks do not recompute the thresholds.
        book.mark(&asset(), Decimal::from(95), now + Duration::seconds(5));
        let views = book.query(Some(&asset()));
        assert_eq!(views[0].position.stop_loss_price, Decimal::from(90));
    }

    #[test]
    fn duplicate_open_same_side_is_rejected() {
        let mut book = book();
        let now = Utc::now();
        open_long(&mut book, 100, 10, now);
        let err = book
            .open(
                asset(),
                Decimal::ONE,
                Decimal::from(100),
                PositionSide::Long,
                TradeCause::User,
                ExitPlan::default(),
                now + Duration::seconds(90),
            )
            .unwrap_err();
        assert!(matches!(err, PositionError::Validation(_)));
    }

    #[test]
    fn oversized_open_is_a_risk_violation() {
        let mut book = book();
        let err = book
            .open(
                asset(),
                Decimal::from(10_000),
                Decimal::from(100),
                PositionSide::Long,
                TradeCause::User,
                ExitPlan::default(),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, PositionError::RiskViolation(_)));
    }

    #[test]
    fn over_quantity_close_is_validation_not_clamp() {
        let mut book = book();
        let now = Utc::now();
        open_long(&mut book, 100, 10, now);
        let err = book
            .close(
                &asset(),
                PositionSide::Long,
                Decimal::from(11),
                Decimal::from(100),
                TradeCause::User,
                now,
            )
            .unwrap_err();
        assert!(matches!(err, PositionError::Validation(_)));
        // State untouched.
        assert_eq!(
            book.query(Some(&asset()))[0].position.quantity_remaining,
            Decimal::from(10)
        );
    }

    #[test]
    fn stop_loss_scenario_warns_then_force_closes() {
        let mut book = book();
        let start = Utc::now();
        open_long(&mut book, 100, 10, start);
        let mut warned = 0;
        let mut forced = Vec::new();
        for (i, price) in [99, 95, 92, 91, 90].iter().enumerate() {
            let at = start + Duration::seconds((i as i64 + 1) * 5);
            for event in book.mark(&asset(), Decimal::from(*price), at) {
                match event {
                    TrackerEvent::Alert {
                        kind: AlertKind::StopLossWarning,
                        ..
                    } => warned += 1,
                    TrackerEvent::ForcedClose { record } => forced.push(record),
                    _ => {}
                }
            }
        }
        assert_eq!(warned, 1, "warning fires exactly once");
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].cause, TradeCause::StopLoss);
        assert_eq!(forced[0].price, Decimal::from(90));
        assert_eq!(forced[0].realized_pnl, Decimal::from(-100));
        assert!(book.query(Some(&asset())).is_empty());
    }

    #[test]
    fn take_profit_scenario_alerts_then_closes() {
        let mut book = book();
        let start = Utc::now();
        open_long(&mut book, 100, 10, start);
        let mut gains = 0;
        let mut forced = Vec::new();
        for (i, price) in [108, 115, 118, 120].iter().enumerate() {
            let at = start + Duration::seconds((i as i64 + 1) * 5);
            for event in book.mark(&asset(), Decimal::from(*price), at) {
                match event {
                    TrackerEvent::Alert {
                        kind: AlertKind::MajorGain,
                        ..
                    } => gains += 1,
                    TrackerEvent::ForcedClose { record } => forced.push(record),
                    _ => {}
                }
            }
        }
        assert_eq!(gains, 1);
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].cause, TradeCause::TakeProfit);
        assert_eq!(forced[0].realized_pnl, Decimal::from(200));
    }

    #[test]
    fn timeout_fires_on_first_mark_past_max_hold() {
        let mut book = book();
        let start = Utc::now();
        open_long(&mut book, 100, 1, start);
        let mut cause = None;
        for hour in 1..=11 {
            let price = if hour % 2 == 0 { 101 } else { 99 };
            let events = book.mark(
                &asset(),
                Decimal::from(price),
                start + Duration::hours(hour),
            );
            for event in events {
                if let TrackerEvent::ForcedClose { record } = event {
                    cause = Some((record.cause, hour));
                }
            }
            if cause.is_some() {
                break;
            }
        }
        assert_eq!(cause, Some((TradeCause::Timeout, 10)));
    }

    #[test]
    fn mark_is_idempotent_per_timestamp() {
        let mut book = book();
        let start = Utc::now();
        open_long(&mut book, 100, 10, start);
        let at = start + Duration::seconds(5);
        let first = book.mark(&asset(), Decimal::from(92), at);
        let second = book.mark(&asset(), Decimal::from(92), at);
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn short_side_stop_loss_triggers_on_rally() {
        let mut book = book();
        let start = Utc::now();
        book.open(
            asset(),
            Decimal::from(10),
            Decimal::from(100),
            PositionSide::Short,
            TradeCause::User,
            ExitPlan::default(),
            start,
        )
        .unwrap();
        let events = book.mark(&asset(), Decimal::from(111), start + Duration::seconds(5));
        let forced: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                TrackerEvent::ForcedClose { record } => Some(record),
                _ => None,
            })
            .collect();
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].cause, TradeCause::StopLoss);
        assert_eq!(forced[0].realized_pnl, Decimal::from(-110));
    }

    #[test]
    fn tiered_exits_fire_in_order_and_only_when_declared() {
        let mut book = book();
        let start = Utc::now();
        let plan = ExitPlan {
            tiers: vec![
                ProfitTier {
                    trigger_pct: 0.015,
                    portion: 0.33,
                },
                ProfitTier {
                    trigger_pct: 0.025,
                    portion: 0.33,
                },
                ProfitTier {
                    trigger_pct: 0.05,
                    portion: 1.0,
                },
            ],
            max_hold: None,
        };
        book.open(
            asset(),
            Decimal::from(100),
            Decimal::from(100),
            PositionSide::Long,
            TradeCause::StrategySignal,
            plan,
            start,
        )
        .unwrap();

        let events = book.mark(&asset(), Decimal::from(102), start + Duration::seconds(5));
        let tiers: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                TrackerEvent::TierExit { tier, .. } => Some(*tier),
                _ => None,
            })
            .collect();
        assert_eq!(tiers, vec![0]);
        assert_eq!(
            book.query(Some(&asset()))[0].position.quantity_remaining,
            Decimal::from(67)
        );

        let events = book.mark(&asset(), Decimal::from(106), start + Duration::seconds(10));
        let tiers: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                TrackerEvent::TierExit { tier, .. } => Some(*tier),
                _ => None,
            })
            .collect();
        assert_eq!(tiers, vec![1, 2]);
        assert!(book.query(Some(&asset())).is_empty());
    }

    #[test]
    fn trade_log_is_append_only_and_ordered() {
        let mut book = book();
        let start = Utc::now();
        open_long(&mut book, 100, 10, start);
        book.close(
            &asset(),
            PositionSide::Long,
            Decimal::from(4),
            Decimal::from(105),
            TradeCause::User,
            start + Duration::seconds(10),
        )
        .unwrap();
        book.close(
            &asset(),
            PositionSide::Long,
            Decimal::from(6),
            Decimal::from(106),
            TradeCause::User,
            start + Duration::seconds(20),
        )
        .unwrap();
        let log = book.trade_log();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].kind, TradeKind::Open);
        assert_eq!(log[1].kind, TradeKind::Adjust);
        assert_eq!(log[2].kind, TradeKind::Close);
        assert!(log.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn full_close_realizes_expected_pnl_with_fees() {
        let mut risk = RiskConfig::default();
        risk.min_open_gap_secs = 0;
        // 0.1% per side
        let mut book = PositionBook::new(risk, Decimal::from(1_000_000));
        let start = Utc::now();
        book.open(
            asset(),
            Decimal::from(10),
            Decimal::from(100),
            PositionSide::Long,
            TradeCause::User,
            ExitPlan::default(),
            start,
        )
        .unwrap();
        book.close(
            &asset(),
            PositionSide::Long,
            Decimal::from(10),
            Decimal::from(110),
            TradeCause::User,
            start + Duration::seconds(30),
        )
        .unwrap();
        let snapshot = book.portfolio();
        // (110 - 100) * 10 - open fee 1.0 - close fee 1.1
        assert_eq!(snapshot.total_realized_pnl, Decimal::new(979, 1));
        assert_eq!(snapshot.closed_trades, 1);
        assert_eq!(snapshot.win_rate, 1.0);
    }

    #[test]
    fn consecutive_losses_lock_out_new_opens() {
        let mut risk = RiskConfig::default();
        risk.fee_rate = Decimal::ZERO;
        risk.min_open_gap_secs = 0;
        risk.max_consecutive_losses = 2;
        risk.max_trades_per_day = 10;
        let mut book = PositionBook::new(risk, Decimal::from(1_000_000));
        let start = Utc::now();
        for i in 0..2 {
            let at = start + Duration::seconds(i * 100);
            book.open(
                asset(),
                Decimal::ONE,
                Decimal::from(100),
                PositionSide::Long,
                TradeCause::User,
                ExitPlan::default(),
                at,
            )
            .unwrap();
            book.close(
                &asset(),
                PositionSide::Long,
                Decimal::ONE,
                Decimal::from(95),
                TradeCause::User,
                at + Duration::seconds(10),
            )
            .unwrap();
        }
        let err = book
            .open(
                asset(),
                Decimal::ONE,
                Decimal::from(100),
                PositionSide::Long,
                TradeCause::User,
                ExitPlan::default(),
                start + Duration::seconds(300),
            )
            .unwrap_err();
        assert!(matches!(err, PositionError::RiskViolation(_)));
        // A new calendar day clears the lockout.
        assert!(book
            .open(
                asset(),
                Decimal::ONE,
                Decimal::from(100),
                PositionSide::Long,
                TradeCause::User,
                ExitPlan::default(),
                start + Duration::days(1),
            )
            .is_ok());
    }

    #[test]
    fn daily_trade_cap_blocks_further_opens() {
        let mut risk = RiskConfig::default();
        risk.fee_rate = Decimal::ZERO;
        risk.min_open_gap_secs = 0;
        risk.max_trades_per_day = 1;
        let mut book = PositionBook::new(risk, Decimal::from(1_000_000));
        let start = Utc::now();
        book.open(
            asset(),
            Decimal::ONE,
            Decimal::from(100),
            PositionSide::Long,
            TradeCause::User,
            ExitPlan::default(),
            start,
        )
        .unwrap();
        book.close(
            &asset(),
            PositionSide::Long,
            Decimal::ONE,
            Decimal::from(105),
            TradeCause::User,
            start + Duration::seconds(10),
        )
        .unwrap();
        assert!(book
            .open(
                asset(),
                Decimal::ONE,
                Decimal::from(100),
                PositionSide::Long,
                TradeCause::User,
                ExitPlan::default(),
                start + Duration::seconds(120),
            )
            .is_err());
    }
}
