//! Individual streaming indicator implementations.

use std::collections::VecDeque;

use chrono::{DateTime, NaiveDate, Utc};
use helm_core::{Bar, Price, Quantity};
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};

use crate::{Indicator, IndicatorError, Input};

fn decimal_from_usize(value: usize) -> Decimal {
    Decimal::from(value as u64)
}

/// Simple moving average over a fixed window.
#[derive(Clone, Debug)]
pub struct Sma {
    period: usize,
    window: VecDeque<Decimal>,
    sum: Decimal,
}

impl Sma {
    pub fn new(period: usize) -> Result<Self, IndicatorError> {
        if period == 0 {
            return Err(IndicatorError::InvalidPeriod {
                name: "Sma",
                period,
            });
        }
        Ok(Self {
            period,
            window: VecDeque::with_capacity(period),
            sum: Decimal::ZERO,
        })
    }
}

impl Indicator for Sma {
    type Input = Decimal;
    type Output = Decimal;

    fn next(&mut self, input: Decimal) -> Option<Decimal> {
        self.window.push_back(input);
        self.sum += input;
        if self.window.len() > self.period {
            if let Some(evicted) = self.window.pop_front() {
                self.sum -= evicted;
            }
        }
        if self.window.len() == self.period {
            Some(self.sum / decimal_from_usize(self.period))
        } else {
            None
        }
    }

    fn reset(&mut self) {
        self.window.clear();
        self.sum = Decimal::ZERO;
    }
}

/// Exponential moving average seeded with the first observation.
#[derive(Clone, Debug)]
pub struct Ema {
    period: usize,
    alpha: Decimal,
    current: Option<Decimal>,
    samples: usize,
}

impl Ema {
    pub fn new(period: usize) -> Result<Self, IndicatorError> {
        if period == 0 {
            return Err(IndicatorError::InvalidPeriod {
                name: "Ema",
                period,
            });
        }
        let alpha = Decimal::TWO / decimal_from_usize(period + 1);
        Ok(Self {
            period,
            alpha,
            current: None,
            samples: 0,
        })
    }
}

impl Indicator for Ema {
    type Input = Decimal;
    type Output = Decimal;

    fn next(&mut self, input: Decimal) -> Option<Decimal> {
        self.samples += 1;
        let next = match self.current {
            Some(prev) => prev + self.alpha * (input - prev),
            None => input,
        };
        self.current = Some(next);
        if self.samples >= self.period {
            Some(next)
        } else {
            None
        }
    }

    fn reset(&mut self) {
        self.current = None;
        self.samples = 0;
    }
}

/// Relative Strength Index using Wilder smoothing.
#[derive(Clone, Debug)]
pub struct Rsi {
    period: usize,
    prev_close: Option<Decimal>,
    avg_gain: Decimal,
    avg_loss: Decimal,
    samples: usize,
}

impl Rsi {
    pub fn new(period: usize) -> Result<Self, IndicatorError> {
        if period == 0 {
            return Err(IndicatorError::InvalidPeriod {
                name: "Rsi",
                period,
            });
        }
        Ok(Self {
            period,
            prev_close: None,
            avg_gain: Decimal::ZERO,
            avg_loss: Decimal::ZERO,
            samples: 0,
        })
    }
}

impl Indicator for Rsi {
    type Input = Decimal;
    type Output = Decimal;

    fn next(&mut self, input: Decimal) -> Option<Decimal> {
        let prev = match self.prev_close.replace(input) {
            Some(prev) => prev,
            None => return None,
        };
        let change = input - prev;
        let (gain, loss) = if change >= Decimal::ZERO {
            (change, Decimal::ZERO)
        } else {
            (Decimal::ZERO, -change)
        };
        self.samples += 1;
        let period = decimal_from_usize(self.period);
        if self.samples <= self.period {
            self.avg_gain += gain / period;
            self.avg_loss += loss / period;
            if self.samples < self.period {
                return None;
            }
        } else {
            self.avg_gain = (self.avg_gain * (period - Decimal::ONE) + gain) / period;
            self.avg_loss = (self.avg_loss * (period - Decimal::ONE) + loss) / period;
        }
        if self.avg_loss.is_zero() {
            return Some(Decimal::ONE_HUNDRED);
        }
        let rs = self.avg_gain / self.avg_loss;
        Some(Decimal::ONE_HUNDRED - Decimal::ONE_HUNDRED / (Decimal::ONE + rs))
    }

    fn reset(&mut self) {
        self.prev_close = None;
        self.avg_gain = Decimal::ZERO;
        self.avg_loss = Decimal::ZERO;
        self.samples = 0;
    }
}

/// Output triplet produced by [`Macd`].
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct MacdOutput {
    pub macd: Decimal,
    pub signal: Decimal,
    pub histogram: Decimal,
}

/// Moving Average Convergence/Divergence with a signal line.
#[derive(Clone, Debug)]
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal: Ema,
}

impl Macd {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Result<Self, IndicatorError> {
        if fast >= slow {
            return Err(IndicatorError::InvalidSpan {
                name: "Macd",
                fast,
                slow,
            });
        }
        Ok(Self {
            fast: Ema::new(fast)?,
            slow: Ema::new(slow)?,
            signal: Ema::new(signal)?,
        })
    }
}

impl Indicator for Macd {
    type Input = Decimal;
    type Output = MacdOutput;

    fn next(&mut self, input: Decimal) -> Option<MacdOutput> {
        let fast = self.fast.next(input);
        let slow = self.slow.next(input)?;
        let macd = fast? - slow;
        let signal = self.signal.next(macd)?;
        Some(MacdOutput {
            macd,
            signal,
            histogram: macd - signal,
        })
    }

    fn reset(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.signal.reset();
    }
}

/// Rolling volume statistics for one window.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct VolumeSnapshot {
    pub mean: Quantity,
    /// Latest volume over the rolling mean; absent when the mean is zero.
    pub ratio: Option<Decimal>,
    /// Standard score of the latest volume; absent under zero variance.
    pub z_score: Option<Decimal>,
}

/// Rolling mean and z-score of traded volume.
#[derive(Clone, Debug)]
pub struct VolumeStats {
    period: usize,
    window: VecDeque<Decimal>,
}

impl VolumeStats {
    pub fn new(period: usize) -> Result<Self, IndicatorError> {
        if period == 0 {
            return Err(IndicatorError::InvalidPeriod {
                name: "VolumeStats",
                period,
            });
        }
        Ok(Self {
            period,
            window: VecDeque::with_capacity(period),
        })
    }
}

impl Indicator for VolumeStats {
    type Input = Decimal;
    type Output = VolumeSnapshot;

    fn next(&mut self, input: Decimal) -> Option<VolumeSnapshot> {
        self.window.push_back(input);
        if self.window.len() > self.period {
            self.window.pop_front();
        }
        if self.window.len() < self.period {
            return None;
        }
        let len = decimal_from_usize(self.window.len());
        let mean = self.window.iter().copied().sum::<Decimal>() / len;
        let variance = self
            .window
            .iter()
            .map(|value| {
                let diff = *value - mean;
                diff * diff
            })
            .sum::<Decimal>()
            / len;
        let std = variance.sqrt().unwrap_or(Decimal::ZERO);
        let ratio = if mean.is_zero() {
            None
        } else {
            Some(input / mean)
        };
        let z_score = if std.is_zero() {
            None
        } else {
            Some((input - mean) / std)
        };
        Some(VolumeSnapshot {
            mean,
            ratio,
            z_score,
        })
    }

    fn reset(&mut self) {
        self.window.clear();
    }
}

/// Direction of an intraday extreme break.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakDirection {
    AboveHigh,
    BelowLow,
}

/// Flags prices clearing the prior session's high or low by at least
/// `epsilon` (a fraction of the extreme).
#[derive(Clone, Debug)]
pub struct SessionBreak {
    epsilon: Decimal,
    current_day: Option<NaiveDate>,
    current_high: Price,
    current_low: Price,
    prior_high: Option<Price>,
    prior_low: Option<Price>,
}

impl SessionBreak {
    #[must_use]
    pub fn new(epsilon: Decimal) -> Self {
        Self {
            epsilon: epsilon.max(Decimal::ZERO),
            current_day: None,
            current_high: Decimal::MIN,
            current_low: Decimal::MAX,
            prior_high: None,
            prior_low: None,
        }
    }

    fn roll_session(&mut self, day: NaiveDate) {
        if let Some(current) = self.current_day {
            if current == day {
                return;
            }
            self.prior_high = Some(self.current_high);
            self.prior_low = Some(self.current_low);
        }
        self.current_day = Some(day);
        self.current_high = Decimal::MIN;
        self.current_low = Decimal::MAX;
    }

    fn classify(&self, price: Price) -> Option<BreakDirection> {
        let high = self.prior_high?;
        let low = self.prior_low?;
        if price >= high * (Decimal::ONE + self.epsilon) {
            return Some(BreakDirection::AboveHigh);
        }
        if price <= low * (Decimal::ONE - self.epsilon) {
            return Some(BreakDirection::BelowLow);
        }
        None
    }

    /// Observe a timestamped price; returns the break direction when the
    /// prior session's extreme is cleared.
    pub fn observe(
        &mut self,
        timestamp: DateTime<Utc>,
        price: Price,
    ) -> Option<BreakDirection> {
        self.roll_session(timestamp.date_naive());
        let flag = self.classify(price);
        self.current_high = self.current_high.max(price);
        self.current_low = self.current_low.min(price);
        flag
    }
}

impl Indicator for SessionBreak {
    type Input = Bar;
    type Output = BreakDirection;

    fn next(&mut self, input: Bar) -> Option<BreakDirection> {
        self.observe(input.timestamp, input.close)
    }

    fn reset(&mut self) {
        self.current_day = None;
        self.current_high = Decimal::MIN;
        self.current_low = Decimal::MAX;
        self.prior_high = None;
        self.prior_low = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn sma_warms_up_before_emitting() {
        let mut sma = Sma::new(3).unwrap();
        assert_eq!(sma.next(Decimal::from(1)), None);
        assert_eq!(sma.next(Decimal::from(2)), None);
        assert_eq!(sma.next(Decimal::from(3)), Some(Decimal::from(2)));
        assert_eq!(sma.next(Decimal::from(6)), Some(Decimal::from(11) / Decimal::from(3)));
    }

    #[test]
    fn rsi_saturates_on_monotone_gains() {
        let mut rsi = Rsi::new(5).unwrap();
        let mut last = None;
        for i in 0..10 {
            last = rsi.next(Decimal::from(100 + i));
        }
        assert_eq!(last, Some(Decimal::ONE_HUNDRED));
    }

    #[test]
    fn rsi_is_deterministic() {
        let prices: Vec<Decimal> = [10, 12, 11, 13, 15, 14, 16, 18, 17, 19]
            .iter()
            .map(|v| Decimal::from(*v))
            .collect();
        let run = |prices: &[Decimal]| {
            let mut rsi = Rsi::new(5).unwrap();
            prices.iter().filter_map(|p| rsi.next(*p)).collect::<Vec<_>>()
        };
        assert_eq!(run(&prices), run(&prices));
    }

    #[test]
    fn macd_requires_fast_below_slow() {
        assert!(Macd::new(26, 12, 9).is_err());
        assert!(Macd::new(5, 10, 5).is_ok());
    }

    #[test]
    fn volume_stats_absent_on_zero_variance() {
        let mut stats = VolumeStats::new(4).unwrap();
        let mut out = None;
        for _ in 0..4 {
            out = stats.next(Decimal::from(100));
        }
        let snapshot = out.unwrap();
        assert_eq!(snapshot.z_score, None);
        assert_eq!(snapshot.ratio, Some(Decimal::ONE));
    }

    #[test]
    fn volume_ratio_absent_on_zero_mean() {
        let mut stats = VolumeStats::new(3).unwrap();
        let mut out = None;
        for _ in 0..3 {
            out = stats.next(Decimal::ZERO);
        }
        assert_eq!(out.unwrap().ratio, None);
    }

    #[test]
    fn session_break_fires_after_prior_session_exists() {
        let mut detector = SessionBreak::new(Decimal::new(1, 3)); // 0.1%
        let day_one = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        assert_eq!(detector.observe(day_one, Decimal::from(100)), None);
        assert_eq!(
            detector.observe(day_one + Duration::hours(1), Decimal::from(110)),
            None
        );
        let day_two = day_one + Duration::days(1);
        assert_eq!(detector.observe(day_two, Decimal::from(105)), None);
        assert_eq!(
            detector.observe(day_two + Duration::hours(1), Decimal::from(112)),
            Some(BreakDirection::AboveHigh)
        );
    }
}
