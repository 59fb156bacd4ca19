//! Pure, deterministic indicator computations over price/volume series.
//!
//! All indicators are streaming: they consume one observation at a time and
//! return `None` until their warm-up window is filled. Callers must treat
//! `None` as "inconclusive", never as zero.

mod indicators;
mod snapshot;

pub use indicators::{
    BreakDirection, Ema, Macd, MacdOutput, Rsi, SessionBreak, Sma, VolumeSnapshot, VolumeStats,
};
pub use snapshot::{book_imbalance, IndicatorConfig, IndicatorSnapshot};

use helm_core::Bar;
use rust_decimal::Decimal;
use thiserror::Error;

/// Provides a uniform way to extract a `Decimal` value from different inputs.
pub trait Input {
    /// Returns the canonical decimal representation for the input.
    fn value(&self) -> Decimal;
}

impl Input for Decimal {
    fn value(&self) -> Decimal {
        *self
    }
}

impl Input for Bar {
    fn value(&self) -> Decimal {
        self.close
    }
}

impl<T> Input for &T
where
    T: Input + ?Sized,
{
    fn value(&self) -> Decimal {
        T::value(self)
    }
}

/// Common configuration errors emitted by indicators.
#[derive(Debug, Error, PartialEq)]
pub enum IndicatorError {
    /// Returned when a period of zero is provided.
    #[error("{name} requires period > 0 (got {period})")]
    InvalidPeriod { name: &'static str, period: usize },
    /// Returned when a fast period is not shorter than its slow counterpart.
    #[error("{name} requires fast < slow (got {fast}/{slow})")]
    InvalidSpan {
        name: &'static str,
        fast: usize,
        slow: usize,
    },
}

/// Core abstraction implemented by every indicator in the library.
pub trait Indicator {
    /// Input type accepted by the indicator.
    type Input: Input;
    /// Value produced after each update.
    type Output;

    /// Consumes a new data point and returns the most recent value, if any.
    fn next(&mut self, input: Self::Input) -> Option<Self::Output>;

    /// Resets the indicator to its initial state.
    fn reset(&mut self);
}
