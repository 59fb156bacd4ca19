//! Hybrid rule + model intent classification with typed slot extraction.

use std::collections::HashMap;
use std::str::FromStr;

use helm_core::{AssetId, Intent, Price, Quantity};
use helm_llm::{LlmRouter, PromptSpec, ResponseSchema, TaskClass};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use tracing::debug;

/// Rule confidence below which the model pass is consulted.
const RULE_CONFIDENCE_FLOOR: f64 = 0.7;

// CJK characters count as word characters, so `\b` misses codes glued to
// Hangul/Han text; explicit non-digit boundaries are used instead.
static EQUITY_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^0-9])(\d{6})(?:[^0-9]|$)").expect("static regex"));
static CRYPTO_PAIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(KRW-[A-Z]{2,6})\b").expect("static regex"));
static CRYPTO_TICKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(BTC|ETH|XRP|SOL|ADA|DOGE|BNB|USDT|MATIC|LINK|DOT|AVAX|LTC|ETC|BCH)\b")
        .expect("static regex")
});
static QUANTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)\s*(?:股|주|shares?|coins?|개)").expect("static regex")
});
static PRICE_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:价格|가격|price|at|@)\s*(\d+(?:\.\d+)?)").expect("static regex")
});
static BARE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)").expect("static regex"));
static DAYS_RANGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:last|最近|지난)\s*(\d+)\s*(?:days?|天|일)").expect("static regex")
});

const BUY_WORDS: &[&str] = &["买入", "买", "购买", "建仓", "buy", "매수", "입수"];
const SELL_WORDS: &[&str] = &["卖出", "卖", "平仓", "sell", "매도", "short"];
const ADVICE_WORDS: &[&str] = &["建议", "推荐", "分析一下", "看法", "advice", "추천", "분석"];
const POSITION_WORDS: &[&str] = &["持仓", "仓位", "position", "포지션", "my holdings"];
const ADJUST_WORDS: &[&str] = &["调仓", "再平衡", "rebalance", "조정", "optimize portfolio"];
const ANALYSIS_WORDS: &[&str] = &["市场", "行情", "大盘", "market", "시장", "overview"];
const BACKTEST_WORDS: &[&str] = &["回测", "backtest", "백테스트", "策略测试"];

/// Classification outcome: the intent plus the classifier's confidence.
#[derive(Clone, Debug)]
pub struct Classified {
    pub intent: Intent,
    pub confidence: f64,
    /// Which pass produced the final decision.
    pub via_model: bool,
}

/// Hybrid classifier. The rule pass is pure; the model pass runs only when
/// rule confidence is below the floor.
pub struct IntentClassifier {
    aliases: HashMap<String, String>,
}

impl IntentClassifier {
    /// `aliases` maps display names (any language) onto asset codes.
    #[must_use]
    pub fn new(aliases: HashMap<String, String>) -> Self {
        Self { aliases }
    }

    /// Run the rule pass alone. Returns the candidate intent and confidence.
    #[must_use]
    pub fn rule_pass(&self, text: &str) -> Classified {
        let lowered = text.to_lowercase();
        let asset = self.extract_asset(text);
        let quantity = extract_quantity(text);
        let price = extract_price(text);

        if contains_any(&lowered, BUY_WORDS) {
            let confidence = if asset.is_some() && quantity.is_some() {
                0.95
            } else {
                0.9
            };
            return Classified {
                intent: Intent::Buy {
                    asset,
                    quantity,
                    price,
                },
                confidence,
                via_model: false,
            };
        }
        if contains_any(&lowered, SELL_WORDS) {
            let confidence = if asset.is_some() && quantity.is_some() {
                0.95
            } else {
                0.9
            };
            return Classified {
                intent: Intent::Sell {
                    asset,
                    quantity,
                    price,
                },
                confidence,
                via_model: false,
            };
        }
        if contains_any(&lowered, BACKTEST_WORDS) {
            return Classified {
                intent: Intent::RunBacktest {
                    strategy: extract_strategy(&lowered),
                    days: extract_days(text),
                    initial_capital: None,
                },
                confidence: 0.85,
                via_model: false,
            };
        }
        if contains_any(&lowered, ADVICE_WORDS) {
            return Classified {
                intent: Intent::AskAdvice { asset },
                confidence: 0.85,
                via_model: false,
            };
        }
        if contains_any(&lowered, POSITION_WORDS) {
            return Classified {
                intent: Intent::CheckPosition { asset },
                confidence: 0.85,
                via_model: false,
            };
        }
        if contains_any(&lowered, ADJUST_WORDS) {
            return Classified {
                intent: Intent::PortfolioAdjust,
                confidence: 0.8,
                via_model: false,
            };
        }
        if contains_any(&lowered, ANALYSIS_WORDS) {
            return Classified {
                intent: Intent::MarketAnalysis,
                confidence: 0.75,
                via_model: false,
            };
        }
        // A bare symbol mention without verbs reads as an advice request.
        if let Some(asset) = asset {
            return Classified {
                intent: Intent::AskAdvice { asset: Some(asset) },
                confidence: 0.6,
                via_model: false,
            };
        }
        Classified {
            intent: Intent::Chat {
                text: text.to_string(),
            },
            confidence: 0.5,
            via_model: false,
        }
    }

    /// Full hybrid classification: rule pass, then the model at the
    /// lightweight class when the rules are unsure. Model output outside
    /// the closed set coerces to `chat`.
    pub async fn classify(&self, router: &LlmRouter, text: &str) -> Classified {
        let ruled = self.rule_pass(text);
        if ruled.confidence >= RULE_CONFIDENCE_FLOOR {
            return ruled;
        }
        if !router.has_route(TaskClass::Lightweight) {
            return ruled;
        }
        let spec = PromptSpec::new(
            "Classify a trading-assistant message. Reply with one JSON object \
             {\"intent\": <one of buy, sell, ask_advice, check_position, \
             portfolio_adjust, market_analysis, run_backtest, chat>, \
             \"confidence\": 0.0-1.0}.",
            format!("Message: {text:?}"),
        );
        match router
            .complete(TaskClass::Lightweight, &spec, ResponseSchema::Intent)
            .await
        {
            Ok(value) => {
                let label = value["intent"].as_str().unwrap_or("chat").to_string();
                let confidence = value["confidence"].as_f64().unwrap_or(0.5);
                let intent = self.intent_from_label(&label, text);
                debug!(%label, confidence, "model pass classified intent");
                Classified {
                    intent,
                    confidence,
                    via_model: true,
                }
            }
            Err(err) => {
                debug!(error = %err, "model pass unavailable; keeping rule result");
                ruled
            }
        }
    }

    fn intent_from_label(&self, label: &str, text: &str) -> Intent {
        let asset = self.extract_asset(text);
        match label {
            "buy" => Intent::Buy {
                asset,
                quantity: extract_quantity(text),
                price: extract_price(text),
            },
            "sell" => Intent::Sell {
                asset,
                quantity: extract_quantity(text),
                price: extract_price(text),
            },
            "ask_advice" => Intent::AskAdvice { asset },
            "check_position" => Intent::CheckPosition { asset },
            "portfolio_adjust" => Intent::PortfolioAdjust,
            "market_analysis" => Intent::MarketAnalysis,
            "run_backtest" => Intent::RunBacktest {
                strategy: None,
                days: extract_days(text),
                initial_capital: None,
            },
            // Anything outside the closed set coerces to chat.
            _ => Intent::Chat {
                text: text.to_string(),
            },
        }
    }

    /// Resolve an asset mention: explicit codes and pairs first, then the
    /// alias table.
    #[must_use]
    pub fn extract_asset(&self, text: &str) -> Option<AssetId> {
        if let Some(captures) = EQUITY_CODE.captures(text) {
            return AssetId::from_str(&captures[1]).ok();
        }
        let upper = text.to_uppercase();
        if let Some(captures) = CRYPTO_PAIR.captures(&upper) {
            return Some(AssetId::crypto(&captures[1]));
        }
        if let Some(captures) = CRYPTO_TICKER.captures(&upper) {
            return Some(AssetId::crypto(format!("KRW-{}", &captures[1])));
        }
        for (name, code) in &self.aliases {
            if text.contains(name.as_str()) {
                return AssetId::from_str(code).ok();
            }
        }
        None
    }
}

fn contains_any(text: &str, words: &[&str]) -> bool {
    words.iter().any(|word| text.contains(word))
}

fn extract_quantity(text: &str) -> Option<Quantity> {
    if let Some(captures) = QUANTITY.captures(text) {
        return Decimal::from_str(&captures[1]).ok();
    }
    // Fall back to a bare number that is not a price tag or asset code.
    let without_price = PRICE_TAG.replace_all(text, "");
    let without_codes = EQUITY_CODE.replace_all(&without_price, "");
    BARE_NUMBER
        .captures(&without_codes)
        .and_then(|captures| Decimal::from_str(&captures[1]).ok())
}

fn extract_price(text: &str) -> Option<Price> {
    PRICE_TAG
        .captures(text)
        .and_then(|captures| Decimal::from_str(&captures[1]).ok())
}

fn extract_days(text: &str) -> Option<i64> {
    DAYS_RANGE
        .captures(text)
        .and_then(|captures| captures[1].parse().ok())
}

fn extract_strategy(lowered: &str) -> Option<String> {
    for name in [
        "intraday-breakout",
        "ma-cross-rsi",
        "momentum-reversal",
        "order-flow",
        "news-momentum",
    ] {
        if lowered.contains(name) {
            return Some(name.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> IntentClassifier {
        let mut aliases = HashMap::new();
        aliases.insert("三星电子".to_string(), "005930".to_string());
        aliases.insert("Samsung Electronics".to_string(), "005930".to_string());
        aliases.insert("삼성전자".to_string(), "005930".to_string());
        IntentClassifier::new(aliases)
    }

    #[test]
    fn cjk_buy_order_extracts_all_slots() {
        let result = classifier().rule_pass("买入三星电子 10股 价格75000");
        assert!(result.confidence >= 0.7, "rule pass alone must be confident");
        match result.intent {
            Intent::Buy {
                asset,
                quantity,
                price,
            } => {
                assert_eq!(asset, Some(AssetId::equity("005930")));
                assert_eq!(quantity, Some(Decimal::from(10)));
                assert_eq!(price, Some(Decimal::from(75_000)));
            }
            other => panic!("expected buy, got {other:?}"),
        }
    }

    #[test]
    fn english_buy_with_ticker() {
        let result = classifier().rule_pass("buy 0.5 coins of BTC at 50000000");
        match result.intent {
            Intent::Buy {
                asset, quantity, ..
            } => {
                assert_eq!(asset, Some(AssetId::crypto("KRW-BTC")));
                assert_eq!(quantity, Some(Decimal::new(5, 1)));
            }
            other => panic!("expected buy, got {other:?}"),
        }
        assert!(result.confidence >= 0.9);
    }

    #[test]
    fn sell_keywords_classify_sell() {
        let result = classifier().rule_pass("평가 손익 보고 매도 BTC 2개");
        assert_eq!(result.intent.label(), "sell");
    }

    #[test]
    fn position_query_without_asset() {
        let result = classifier().rule_pass("show my position");
        assert_eq!(result.intent.label(), "check_position");
        assert!(result.confidence >= 0.8);
    }

    #[test]
    fn backtest_with_day_range() {
        let result = classifier().rule_pass("run a backtest with ma-cross-rsi last 30 days");
        match result.intent {
            Intent::RunBacktest {
                strategy, days, ..
            } => {
                assert_eq!(strategy.as_deref(), Some("ma-cross-rsi"));
                assert_eq!(days, Some(30));
            }
            other => panic!("expected backtest, got {other:?}"),
        }
    }

    #[test]
    fn small_talk_falls_to_chat_with_low_confidence() {
        let result = classifier().rule_pass("how was your day?");
        assert_eq!(result.intent.label(), "chat");
        assert!(result.confidence < RULE_CONFIDENCE_FLOOR);
    }

    #[test]
    fn bare_symbol_reads_as_advice_request() {
        let result = classifier().rule_pass("005930?");
        assert_eq!(result.intent.label(), "ask_advice");
    }
}
