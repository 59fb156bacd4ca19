//! Signal strategies as capability records and their weighted aggregation.
//!
//! Strategies are pure functions over indicator snapshots. Each record also
//! declares the exit parameters the tracker should apply when its signal
//! wins the vote.

use chrono::Duration;
use helm_core::{AdviceAction, ProfitTier, Quote};
use helm_indicators::{BreakDirection, IndicatorSnapshot};
use helm_llm::NewsDigest;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Everything a strategy may look at for one vote.
pub struct StrategyInputs<'a> {
    pub snapshot: &'a IndicatorSnapshot,
    pub quote: &'a Quote,
    /// Bid share of top-of-book depth, when a book snapshot is available.
    pub book_imbalance: Option<Decimal>,
    pub news: Option<&'a NewsDigest>,
}

/// One strategy's weighted opinion.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Vote {
    pub action: AdviceAction,
    /// Strength of the opinion in `[0, 1]` before the registry weight.
    pub confidence: f64,
}

/// Capability record registered at startup; the aggregator folds over the
/// enabled set.
pub struct SignalStrategy {
    pub name: &'static str,
    pub signal_fn: fn(&StrategyInputs<'_>) -> Option<Vote>,
    /// Stop-loss distance for positions opened on this strategy's signal.
    pub stop_pct: f64,
    pub take_profit_tiers: Vec<ProfitTier>,
    pub max_hold: Duration,
}

/// The built-in strategy set.
#[must_use]
pub fn builtin_strategies() -> Vec<SignalStrategy> {
    vec![
        SignalStrategy {
            name: "intraday-breakout",
            signal_fn: intraday_breakout,
            stop_pct: -0.03,
            take_profit_tiers: vec![
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
            max_hold: Duration::hours(6),
        },
        SignalStrategy {
            name: "ma-cross-rsi",
            signal_fn: ma_cross_rsi,
            stop_pct: -0.04,
            take_profit_tiers: Vec::new(),
            max_hold: Duration::hours(10),
        },
        SignalStrategy {
            name: "momentum-reversal",
            signal_fn: momentum_reversal,
            stop_pct: -0.025,
            take_profit_tiers: Vec::new(),
            max_hold: Duration::hours(4),
        },
        SignalStrategy {
            name: "order-flow",
            signal_fn: order_flow,
            stop_pct: -0.02,
            take_profit_tiers: Vec::new(),
            max_hold: Duration::hours(2),
        },
        SignalStrategy {
            name: "news-momentum",
            signal_fn: news_momentum,
            stop_pct: -0.05,
            take_profit_tiers: Vec::new(),
            max_hold: Duration::hours(12),
        },
    ]
}

fn intraday_breakout(inputs: &StrategyInputs<'_>) -> Option<Vote> {
    let direction = inputs.snapshot.session_break?;
    let volume_ok = inputs
        .snapshot
        .volume
        .and_then(|v| v.ratio)
        .map_or(false, |ratio| ratio >= Decimal::new(15, 1));
    if !volume_ok {
        return None;
    }
    let action = match direction {
        BreakDirection::AboveHigh => AdviceAction::Buy,
        BreakDirection::BelowLow => AdviceAction::Sell,
    };
    Some(Vote {
        action,
        confidence: 0.8,
    })
}

fn ma_cross_rsi(inputs: &StrategyInputs<'_>) -> Option<Vote> {
    let fast = inputs.snapshot.moving_averages.get(&5)?;
    let slow = inputs.snapshot.moving_averages.get(&20)?;
    let rsi = inputs.snapshot.rsi_fast?.to_f64()?;
    if fast > slow && rsi < 70.0 {
        Some(Vote {
            action: AdviceAction::Buy,
            confidence: 0.7,
        })
    } else if fast < slow && rsi > 30.0 {
        Some(Vote {
            action: AdviceAction::Sell,
            confidence: 0.7,
        })
    } else {
        None
    }
}

fn momentum_reversal(inputs: &StrategyInputs<'_>) -> Option<Vote> {
    let rsi = inputs.snapshot.rsi_fast?.to_f64()?;
    let surge = inputs
        .snapshot
        .volume
        .and_then(|v| v.ratio)
        .map_or(false, |ratio| ratio >= Decimal::TWO);
    if rsi <= 30.0 && surge {
        Some(Vote {
            action: AdviceAction::Buy,
            confidence: 0.75,
        })
    } else if rsi >= 70.0 && surge {
        Some(Vote {
            action: AdviceAction::Sell,
            confidence: 0.65,
        })
    } else {
        None
    }
}

fn order_flow(inputs: &StrategyInputs<'_>) -> Option<Vote> {
    let imbalance = inputs.book_imbalance?.to_f64()?;
    if imbalance >= 0.65 {
        Some(Vote {
            action: AdviceAction::Buy,
            confidence: 0.6,
        })
    } else if imbalance <= 0.35 {
        Some(Vote {
            action: AdviceAction::Sell,
            confidence: 0.6,
        })
    } else {
        None
    }
}

fn news_momentum(inputs: &StrategyInputs<'_>) -> Option<Vote> {
    let news = inputs.news?;
    if news.relevant_count < 10 {
        return None;
    }
    let action = if inputs.quote.change_pct_24h >= 0.0 {
        AdviceAction::Buy
    } else {
        AdviceAction::Sell
    };
    Some(Vote {
        action,
        confidence: 0.55,
    })
}

/// Outcome of the weighted fold over enabled strategies.
#[derive(Clone, Debug)]
pub struct AggregateSignal {
    pub action: AdviceAction,
    pub confidence: f64,
    /// Exit parameters of the strongest contributor to the winning side.
    pub stop_pct: f64,
    pub take_profit_tiers: Vec<ProfitTier>,
    pub max_hold: Duration,
    pub contributors: Vec<&'static str>,
}

impl AggregateSignal {
    fn hold() -> Self {
        Self {
            action: AdviceAction::Hold,
            confidence: 0.0,
            stop_pct: 0.0,
            take_profit_tiers: Vec::new(),
            max_hold: Duration::hours(10),
            contributors: Vec::new(),
        }
    }
}

/// Weighted fold over the enabled strategy records.
///
/// A strategy's effective contribution is `weight * confidence`. The winning
/// direction's share of all cast votes becomes the aggregate confidence;
/// anything below `min_confidence` collapses to Hold.
#[must_use]
pub fn aggregate(
    strategies: &[SignalStrategy],
    weights: &std::collections::HashMap<String, f64>,
    inputs: &StrategyInputs<'_>,
    min_confidence: f64,
) -> AggregateSignal {
    let mut buy_score = 0.0;
    let mut sell_score = 0.0;
    let mut best_buy: Option<(f64, &SignalStrategy)> = None;
    let mut best_sell: Option<(f64, &SignalStrategy)> = None;
    let mut buy_names = Vec::new();
    let mut sell_names = Vec::new();

    for strategy in strategies {
        let Some(weight) = weights.get(strategy.name).copied() else {
            continue;
        };
        if weight <= 0.0 {
            continue;
        }
        let Some(vote) = (strategy.signal_fn)(inputs) else {
            continue;
        };
        let effective = weight * vote.confidence;
        match vote.action {
            AdviceAction::Buy => {
                buy_score += effective;
                buy_names.push(strategy.name);
                if best_buy.map_or(true, |(score, _)| effective > score) {
                    best_buy = Some((effective, strategy));
                }
            }
            AdviceAction::Sell => {
                sell_score += effective;
                sell_names.push(strategy.name);
                if best_sell.map_or(true, |(score, _)| effective > score) {
                    best_sell = Some((effective, strategy));
                }
            }
            AdviceAction::Hold => {}
        }
    }

    let voted = buy_score + sell_score;
    if voted <= 0.0 {
        return AggregateSignal::hold();
    }
    let (action, score, leader, names) = if buy_score > sell_score {
        (AdviceAction::Buy, buy_score, best_buy, buy_names)
    } else if sell_score > buy_score {
        (AdviceAction::Sell, sell_score, best_sell, sell_names)
    } else {
        return AggregateSignal::hold();
    };
    let confidence = (score / voted).clamp(0.0, 1.0);
    if confidence < min_confidence {
        return AggregateSignal::hold();
    }
    let Some((_, strategy)) = leader else {
        return AggregateSignal::hold();
    };
    AggregateSignal {
        action,
        confidence,
        stop_pct: strategy.stop_pct,
        take_profit_tiers: strategy.take_profit_tiers.clone(),
        max_hold: strategy.max_hold,
        contributors: names,
    }
}
