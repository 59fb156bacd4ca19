//! Structured prompt assembly rendered into provider-specific requests.

use helm_core::{AnomalyEvent, Position, Quote};
use helm_indicators::IndicatorSnapshot;
use serde::{Deserialize, Serialize};

/// Aggregated headline context attached to analysis prompts.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NewsDigest {
    /// Count of headlines judged relevant to the asset; feeds escalation.
    pub relevant_count: usize,
    pub headlines: Vec<String>,
}

/// One block of context handed to the model.
#[derive(Clone, Debug)]
pub enum ContextBlock {
    Quote(Quote),
    Indicators(IndicatorSnapshot),
    Anomaly(AnomalyEvent),
    News(NewsDigest),
    Positions(Vec<Position>),
}

impl ContextBlock {
    fn render(&self) -> String {
        match self {
            Self::Quote(quote) => format!(
                "[quote] {} price={} change_24h={:.2}% volume={} currency={} source={}",
                quote.asset,
                quote.price,
                quote.change_pct_24h,
                quote.volume,
                quote.currency,
                quote.source,
            ),
            Self::Indicators(snapshot) => {
                let mut parts = Vec::new();
                for (period, value) in &snapshot.moving_averages {
                    parts.push(format!("ma{period}={value}"));
                }
                if let Some(rsi) = snapshot.rsi_fast {
                    parts.push(format!("rsi5={rsi:.1}"));
                }
                if let Some(rsi) = snapshot.rsi_standard {
                    parts.push(format!("rsi14={rsi:.1}"));
                }
                if let Some(macd) = snapshot.macd_standard {
                    parts.push(format!("macd_hist={}", macd.histogram));
                }
                if let Some(volume) = snapshot.volume {
                    if let Some(ratio) = volume.ratio {
                        parts.push(format!("volume_ratio={ratio:.2}"));
                    }
                }
                if let Some(direction) = snapshot.session_break {
                    parts.push(format!("session_break={direction:?}"));
                }
                format!("[indicators] {}", parts.join(" "))
            }
            Self::Anomaly(event) => format!(
                "[anomaly] kind={} severity={} score={:.2} context={}",
                event.kind, event.severity, event.score, event.context,
            ),
            Self::News(digest) => {
                let mut lines = vec![format!(
                    "[news] {} relevant headlines",
                    digest.relevant_count
                )];
                for headline in digest.headlines.iter().take(10) {
                    lines.push(format!("- {headline}"));
                }
                lines.join("\n")
            }
            Self::Positions(positions) => {
                let mut lines = vec![format!("[positions] {} open", positions.len())];
                for position in positions {
                    lines.push(format!(
                        "- {} {} qty={} entry={} realized={}",
                        position.asset,
                        position.side,
                        position.quantity_remaining,
                        position.entry_price,
                        position.realized_pnl,
                    ));
                }
                lines.join("\n")
            }
        }
    }
}

/// Provider-agnostic prompt: system role, task description, context blocks.
#[derive(Clone, Debug, Default)]
pub struct PromptSpec {
    pub system: String,
    pub task: String,
    pub context: Vec<ContextBlock>,
}

impl PromptSpec {
    #[must_use]
    pub fn new(system: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            task: task.into(),
            context: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_context(mut self, block: ContextBlock) -> Self {
        self.context.push(block);
        self
    }

    /// Render the user-facing message body: task first, context after.
    #[must_use]
    pub fn render_user_message(&self) -> String {
        let mut sections = vec![self.task.clone()];
        for block in &self.context {
            sections.push(block.render());
        }
        sections.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use helm_core::AssetId;
    use rust_decimal::Decimal;

    #[test]
    fn render_orders_task_before_context() {
        let quote = Quote {
            asset: AssetId::crypto("KRW-BTC"),
            timestamp: Utc::now(),
            price: Decimal::from(50_000_000),
            volume: Decimal::ONE,
            change_pct_24h: 2.5,
            currency: "KRW".into(),
            source: "replay".into(),
            age: None,
        };
        let spec = PromptSpec::new("You are a trading analyst.", "Assess KRW-BTC.")
            .with_context(ContextBlock::Quote(quote));
        let rendered = spec.render_user_message();
        assert!(rendered.starts_with("Assess KRW-BTC."));
        assert!(rendered.contains("[quote] KRW-BTC"));
    }
}
