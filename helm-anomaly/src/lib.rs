//! Scores observations against rolling per-asset baselines and emits
//! severity-tagged anomaly events.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use helm_config::AnomalyConfig;
use helm_core::{AnomalyEvent, AnomalyKind, AssetId, Severity};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

/// Single-bar move that forces at least `High` regardless of the baseline.
const HARD_MOVE_FRACTION: f64 = 0.05;
/// Consecutive same-direction large-volume prints that force `High`.
const VOLUME_RUN_LENGTH: usize = 3;
/// Volume multiple of the rolling mean counted as "large" for run detection.
const LARGE_VOLUME_RATIO: f64 = 2.0;

/// One observation of a tracked metric for an asset.
#[derive(Clone, Copy, Debug)]
pub struct Observation {
    pub metric: Metric,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Metrics maintained per asset.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Metric {
    /// One-minute return as a fraction.
    Return1m,
    /// Five-minute volume z-score.
    VolumeZ5m,
    /// One-hour high-low range as a fraction of price.
    Range1h,
}

impl Metric {
    fn config_key(self) -> &'static str {
        match self {
            Self::Return1m => "return_1m",
            Self::VolumeZ5m => "volume_z_5m",
            Self::Range1h => "range_1h",
        }
    }

    fn kind(self) -> AnomalyKind {
        match self {
            Self::Return1m => AnomalyKind::PriceJump,
            Self::VolumeZ5m => AnomalyKind::VolumeSpike,
            Self::Range1h => AnomalyKind::IndicatorDivergence,
        }
    }
}

/// Incremental mean/std over a bounded, time-windowed sample.
#[derive(Clone, Debug)]
pub struct RollingBaseline {
    horizon: Duration,
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl RollingBaseline {
    #[must_use]
    pub fn new(horizon: Duration) -> Self {
        Self {
            horizon,
            samples: VecDeque::new(),
        }
    }

    /// Absorb a sample, evicting everything older than the horizon.
    pub fn push(&mut self, timestamp: DateTime<Utc>, value: f64) {
        self.samples.push_back((timestamp, value));
        let cutoff = timestamp - self.horizon;
        while matches!(self.samples.front(), Some((ts, _)) if *ts < cutoff) {
            self.samples.pop_front();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean and standard deviation of the current window.
    #[must_use]
    pub fn stats(&self) -> Option<(f64, f64)> {
        if self.samples.len() < 2 {
            return None;
        }
        let n = self.samples.len() as f64;
        let mean = self.samples.iter().map(|(_, v)| v).sum::<f64>() / n;
        let variance = self
            .samples
            .iter()
            .map(|(_, v)| (v - mean).powi(2))
            .sum::<f64>()
            / n;
        Some((mean, variance.sqrt()))
    }

    /// Standard score of `value` against the window, absent until the window
    /// has variance.
    #[must_use]
    pub fn z_score(&self, value: f64) -> Option<f64> {
        let (mean, std) = self.stats()?;
        if std <= f64::EPSILON {
            return None;
        }
        Some((value - mean) / std)
    }
}

fn severity_for_z(z: f64) -> Option<Severity> {
    let magnitude = z.abs();
    if magnitude >= 4.5 {
        Some(Severity::Critical)
    } else if magnitude >= 3.0 {
        Some(Severity::High)
    } else if magnitude >= 2.0 {
        Some(Severity::Warn)
    } else {
        None
    }
}

#[derive(Clone, Copy, Debug)]
struct Fired {
    at: DateTime<Utc>,
    severity: Severity,
}

/// Per-asset anomaly detector with debounced emission.
///
/// A given `(asset, kind)` that fired within its debounce window is
/// suppressed at the same or lower severity but re-fires immediately on
/// strict escalation.
pub struct AnomalyDetector {
    config: AnomalyConfig,
    baselines: HashMap<(AssetId, Metric), RollingBaseline>,
    fired: HashMap<(AssetId, AnomalyKind), Fired>,
    volume_runs: HashMap<AssetId, VolumeRun>,
}

#[derive(Clone, Copy, Debug, Default)]
struct VolumeRun {
    direction: i8,
    length: usize,
}

impl AnomalyDetector {
    #[must_use]
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            baselines: HashMap::new(),
            fired: HashMap::new(),
            volume_runs: HashMap::new(),
        }
    }

    /// Feed one metric observation; returns an event when the score clears
    /// its threshold and survives debouncing.
    pub fn observe(&mut self, asset: &AssetId, obs: Observation) -> Option<AnomalyEvent> {
        let horizon = Duration::minutes(
            self.config.horizon_minutes(obs.metric.config_key()) as i64
        );
        let baseline = self
            .baselines
            .entry((asset.clone(), obs.metric))
            .or_insert_with(|| RollingBaseline::new(horizon));

        let z = baseline.z_score(obs.value);
        baseline.push(obs.timestamp, obs.value);

        let mut severity = z.and_then(severity_for_z);
        let mut score = z.unwrap_or(0.0);

        // Hard rule: a single-bar move of 5% or more is at least High even
        // when the baseline is too young to score it.
        if obs.metric == Metric::Return1m && obs.value.abs() >= HARD_MOVE_FRACTION {
            severity = Some(severity.map_or(Severity::High, |s| s.max(Severity::High)));
            if score == 0.0 {
                score = obs.value.abs() / HARD_MOVE_FRACTION;
            }
        }

        let severity = severity?;
        self.emit(
            asset,
            obs.metric.kind(),
            severity,
            score,
            obs.timestamp,
            format!("{:?}={:.4}", obs.metric, obs.value),
        )
    }

    /// Feed a volume print with its direction sign; sustains the
    /// consecutive-run rule trigger.
    pub fn observe_volume_print(
        &mut self,
        asset: &AssetId,
        timestamp: DateTime<Utc>,
        signed_change: f64,
        volume_ratio: Option<Decimal>,
    ) -> Option<AnomalyEvent> {
        let large = volume_ratio
            .and_then(|ratio| ratio.to_f64())
            .map_or(false, |ratio| ratio >= LARGE_VOLUME_RATIO);
        let direction = if signed_change > 0.0 {
            1
        } else if signed_change < 0.0 {
            -1
        } else {
            0
        };
        let run = self.volume_runs.entry(asset.clone()).or_default();
        if large && direction != 0 && direction == run.direction {
            run.length += 1;
        } else if large && direction != 0 {
            run.direction = direction;
            run.length = 1;
        } else {
            run.direction = 0;
            run.length = 0;
        }
        if run.length >= VOLUME_RUN_LENGTH {
            let length = run.length;
            return self.emit(
                asset,
                AnomalyKind::VolumeSpike,
                Severity::High,
                length as f64,
                timestamp,
                format!("{length} consecutive large prints"),
            );
        }
        None
    }

    /// Report a breakout flag coming from the indicator engine.
    pub fn observe_breakout(
        &mut self,
        asset: &AssetId,
        timestamp: DateTime<Utc>,
        context: String,
    ) -> Option<AnomalyEvent> {
        self.emit(asset, AnomalyKind::Breakout, Severity::Warn, 1.0, timestamp, context)
    }

    fn emit(
        &mut self,
        asset: &AssetId,
        kind: AnomalyKind,
        severity: Severity,
        score: f64,
        timestamp: DateTime<Utc>,
        context: String,
    ) -> Option<AnomalyEvent> {
        let window = Duration::seconds(self.config.debounce_for(&kind.to_string()));
        let key = (asset.clone(), kind);
        if let Some(last) = self.fired.get(&key) {
            let inside_window = timestamp - last.at < window;
            if inside_window && severity <= last.severity {
                debug!(asset = %asset, kind = %kind, %severity, "anomaly suppressed by debounce");
                return None;
            }
        }
        self.fired.insert(
            key,
            Fired {
                at: timestamp,
                severity,
            },
        );
        Some(AnomalyEvent {
            asset: asset.clone(),
            timestamp,
            kind,
            severity,
            score,
            context,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> AnomalyDetector {
        AnomalyDetector::new(AnomalyConfig::default())
    }

    fn asset() -> AssetId {
        AssetId::crypto("KRW-BTC")
    }

    fn obs(metric: Metric, value: f64, at: DateTime<Utc>) -> Observation {
        Observation {
            metric,
            value,
            timestamp: at,
        }
    }

    fn feed_baseline(det: &mut AnomalyDetector, asset: &AssetId, start: DateTime<Utc>) {
        // Alternating returns give the baseline a stdev of 0.015, placing a
        // 5% move a little over three sigmas out.
        for i in 0..30 {
            let value = if i % 2 == 0 { 0.015 } else { -0.015 };
            det.observe(
                asset,
                obs(Metric::Return1m, value, start + Duration::minutes(i)),
            );
        }
    }

    #[test]
    fn large_move_escalates_against_quiet_baseline() {
        let mut det = detector();
        let asset = asset();
        let start = Utc::now() - Duration::minutes(40);
        feed_baseline(&mut det, &asset, start);
        let event = det
            .observe(
                &asset,
                obs(Metric::Return1m, 0.05, start + Duration::minutes(31)),
            )
            .expect("5% move must fire");
        assert!(event.severity >= Severity::High);
        assert_eq!(event.kind, AnomalyKind::PriceJump);
    }

    #[test]
    fn hard_rule_fires_without_baseline() {
        let mut det = detector();
        let event = det
            .observe(&asset(), obs(Metric::Return1m, -0.06, Utc::now()))
            .expect("hard move rule fires cold");
        assert_eq!(event.severity, Severity::High);
    }

    #[test]
    fn repeated_events_inside_window_emit_exactly_once() {
        let mut det = detector();
        let asset = asset();
        let now = Utc::now();
        let first = det.observe(&asset, obs(Metric::Return1m, 0.06, now));
        assert!(first.is_some());
        let mut emitted = 0;
        for i in 1..5 {
            if det
                .observe(
                    &asset,
                    obs(Metric::Return1m, 0.06, now + Duration::seconds(i * 30)),
                )
                .is_some()
            {
                emitted += 1;
            }
        }
        assert_eq!(emitted, 0);
    }

    #[test]
    fn strict_escalation_refires_inside_window() {
        let mut det = detector();
        let asset = asset();
        let start = Utc::now() - Duration::minutes(40);
        feed_baseline(&mut det, &asset, start);
        let now = start + Duration::minutes(31);
        let first = det.observe(&asset, obs(Metric::Return1m, 0.05, now));
        assert_eq!(first.map(|e| e.severity), Some(Severity::High));
        // A much larger move pushes the z-score past 4.5 -> Critical refire.
        let second = det.observe(&asset, obs(Metric::Return1m, 0.20, now + Duration::seconds(60)));
        assert_eq!(second.map(|e| e.severity), Some(Severity::Critical));
    }

    #[test]
    fn volume_run_requires_three_large_prints() {
        let mut det = detector();
        let asset = asset();
        let now = Utc::now();
        let ratio = Some(Decimal::from(3));
        assert!(det
            .observe_volume_print(&asset, now, 1.0, ratio)
            .is_none());
        assert!(det
            .observe_volume_print(&asset, now + Duration::seconds(5), 1.0, ratio)
            .is_none());
        let third = det.observe_volume_print(&asset, now + Duration::seconds(10), 1.0, ratio);
        assert_eq!(third.map(|e| e.severity), Some(Severity::High));
    }

    #[test]
    fn volume_run_resets_on_direction_flip() {
        let mut det = detector();
        let asset = asset();
        let now = Utc::now();
        let ratio = Some(Decimal::from(3));
        det.observe_volume_print(&asset, now, 1.0, ratio);
        det.observe_volume_print(&asset, now, -1.0, ratio);
        det.observe_volume_print(&asset, now, -1.0, ratio);
        assert!(det
            .observe_volume_print(&asset, now, 1.0, ratio)
            .is_none());
    }
}
