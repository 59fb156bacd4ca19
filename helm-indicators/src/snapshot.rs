//! Derived indicator snapshot over a series tail.

use std::collections::BTreeMap;

use helm_core::{Price, Quantity, Series};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::indicators::{
    BreakDirection, Macd, MacdOutput, Rsi, SessionBreak, Sma, VolumeSnapshot, VolumeStats,
};
use crate::Indicator;

/// Periods and windows used when computing a snapshot.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IndicatorConfig {
    pub ma_periods: Vec<usize>,
    pub fast_rsi: usize,
    pub standard_rsi: usize,
    pub fast_macd: (usize, usize, usize),
    pub standard_macd: (usize, usize, usize),
    pub volume_window: usize,
    /// Fractional margin required beyond the prior-session extreme.
    pub breakout_epsilon: Decimal,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            ma_periods: vec![5, 10, 15, 20, 30, 50],
            fast_rsi: 5,
            standard_rsi: 14,
            fast_macd: (5, 10, 5),
            standard_macd: (12, 26, 9),
            volume_window: 20,
            breakout_epsilon: Decimal::new(1, 3),
        }
    }
}

/// Deterministic value derived from a series tail. Snapshots carry no
/// identity and may be recomputed freely; every field is absent until its
/// indicator's warm-up window is filled.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct IndicatorSnapshot {
    pub moving_averages: BTreeMap<usize, Price>,
    pub rsi_fast: Option<Decimal>,
    pub rsi_standard: Option<Decimal>,
    pub macd_fast: Option<MacdOutput>,
    pub macd_standard: Option<MacdOutput>,
    pub volume: Option<VolumeSnapshot>,
    pub session_break: Option<BreakDirection>,
    pub last_close: Option<Price>,
}

impl IndicatorSnapshot {
    /// Compute a snapshot by replaying the series tail through fresh
    /// indicator instances. Pure and deterministic for a given input.
    #[must_use]
    pub fn compute(series: &Series, config: &IndicatorConfig) -> Self {
        let mut snapshot = Self {
            last_close: series.last().map(|bar| bar.close),
            ..Self::default()
        };
        if series.is_empty() {
            return snapshot;
        }

        let mut mas: Vec<(usize, Sma)> = config
            .ma_periods
            .iter()
            .filter_map(|&period| Sma::new(period).ok().map(|sma| (period, sma)))
            .collect();
        let mut rsi_fast = Rsi::new(config.fast_rsi).ok();
        let mut rsi_standard = Rsi::new(config.standard_rsi).ok();
        let (ff, fs, fg) = config.fast_macd;
        let (sf, ss, sg) = config.standard_macd;
        let mut macd_fast = Macd::new(ff, fs, fg).ok();
        let mut macd_standard = Macd::new(sf, ss, sg).ok();
        let mut volume = VolumeStats::new(config.volume_window).ok();
        let mut session_break = SessionBreak::new(config.breakout_epsilon);

        for bar in series.bars() {
            for (period, sma) in mas.iter_mut() {
                if let Some(value) = sma.next(bar.close) {
                    snapshot.moving_averages.insert(*period, value);
                }
            }
            if let Some(rsi) = rsi_fast.as_mut() {
                snapshot.rsi_fast = rsi.next(bar.close).or(snapshot.rsi_fast.take());
            }
            if let Some(rsi) = rsi_standard.as_mut() {
                snapshot.rsi_standard = rsi.next(bar.close).or(snapshot.rsi_standard.take());
            }
            if let Some(macd) = macd_fast.as_mut() {
                snapshot.macd_fast = macd.next(bar.close).or(snapshot.macd_fast.take());
            }
            if let Some(macd) = macd_standard.as_mut() {
                snapshot.macd_standard = macd.next(bar.close).or(snapshot.macd_standard.take());
            }
            if let Some(stats) = volume.as_mut() {
                snapshot.volume = stats.next(bar.volume).or(snapshot.volume.take());
            }
            snapshot.session_break = session_break
                .next(bar.clone())
                .or(snapshot.session_break.take());
        }
        snapshot
    }
}

/// Share of bid depth within the top `depth` levels of both sides. Returns
/// `None` when the visible book is empty.
#[must_use]
pub fn book_imbalance(
    bids: &[(Price, Quantity)],
    asks: &[(Price, Quantity)],
    depth: usize,
) -> Option<Decimal> {
    let depth = depth.max(1);
    let bid_vol: Decimal = bids.iter().take(depth).map(|(_, size)| *size).sum();
    let ask_vol: Decimal = asks.iter().take(depth).map(|(_, size)| *size).sum();
    let total = bid_vol + ask_vol;
    if total.is_zero() {
        None
    } else {
        Some(bid_vol / total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use helm_core::{AssetId, Bar, BarWidth};

    fn series_of(closes: &[i64]) -> Series {
        let mut series = Series::new(AssetId::crypto("KRW-BTC"), BarWidth::OneMinute, 256);
        let start = Utc::now() - Duration::minutes(closes.len() as i64);
        for (i, close) in closes.iter().enumerate() {
            let close = Decimal::from(*close);
            series.push(Bar {
                timestamp: start + Duration::minutes(i as i64),
                open: close,
                high: close + Decimal::ONE,
                low: close - Decimal::ONE,
                close,
                volume: Decimal::from(100 + i as i64),
            });
        }
        series
    }

    #[test]
    fn snapshot_is_deterministic() {
        let series = series_of(&[100, 101, 99, 102, 104, 103, 105, 107, 106, 108]);
        let config = IndicatorConfig::default();
        let a = IndicatorSnapshot::compute(&series, &config);
        let b = IndicatorSnapshot::compute(&series, &config);
        assert_eq!(a.moving_averages, b.moving_averages);
        assert_eq!(a.rsi_fast, b.rsi_fast);
        assert_eq!(a.volume, b.volume);
    }

    #[test]
    fn short_series_leaves_slow_fields_absent() {
        let series = series_of(&[100, 101, 102, 103, 104, 105]);
        let snapshot = IndicatorSnapshot::compute(&series, &IndicatorConfig::default());
        assert!(snapshot.moving_averages.contains_key(&5));
        assert!(!snapshot.moving_averages.contains_key(&50));
        assert!(snapshot.rsi_fast.is_some());
        assert!(snapshot.rsi_standard.is_none());
        assert!(snapshot.volume.is_none());
    }

    #[test]
    fn imbalance_is_bid_share_of_top_depth() {
        let bids = vec![(Decimal::from(100), Decimal::from(30))];
        let asks = vec![(Decimal::from(101), Decimal::from(10))];
        assert_eq!(
            book_imbalance(&bids, &asks, 5),
            Some(Decimal::from(3) / Decimal::from(4))
        );
        assert_eq!(book_imbalance(&[], &[], 5), None);
    }
}
