//! Task-class routed language model access with ordered provider fallback.
//!
//! A single logical call walks the provider chain for its task class until
//! one returns a schema-valid response, under one total wall-clock budget.

mod prompt;
mod provider;

pub use prompt::{ContextBlock, NewsDigest, PromptSpec};
pub use provider::{CompletionClient, HttpCompletionClient};

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use helm_core::{AdviceAction, Price, ProfitTier, Severity};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::warn;

/// Convenience alias for router results.
pub type LlmResult<T> = Result<T, LlmError>;

/// Failure variants surfaced by providers and the router.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transport error from '{provider}': {detail}")]
    Transport { provider: String, detail: String },
    #[error("provider '{provider}' rejected the call on quota")]
    Quota { provider: String },
    #[error("provider '{provider}' refused to answer")]
    Refusal { provider: String },
    #[error("malformed output from '{provider}': {detail}")]
    Malformed { provider: String, detail: String },
    #[error("provider '{provider}' misconfigured: {detail}")]
    Configuration { provider: String, detail: String },
    #[error("no provider registered for task class {0:?}")]
    NoProvider(TaskClass),
    #[error("every provider for {0:?} failed within budget")]
    Exhausted(TaskClass),
    #[error("analysis exceeded its wall-clock budget")]
    AnalysisTimeout,
}

/// Abstract model workload size. Selects intended model strength and cost.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TaskClass {
    /// Cheapest and fastest; intent classification, keyword extraction.
    Lightweight,
    /// Default conversational strength; single-asset advice.
    Standard,
    /// Strongest reasoning; market-wide and critical-anomaly analysis.
    Complex,
}

impl FromStr for TaskClass {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "lightweight" => Ok(Self::Lightweight),
            "standard" => Ok(Self::Standard),
            "complex" => Ok(Self::Complex),
            other => Err(format!("unknown task class '{other}'")),
        }
    }
}

/// Conditions that upgrade an analysis call from Standard to Complex.
#[derive(Clone, Copy, Debug, Default)]
pub struct EscalationSignals {
    pub severity: Option<Severity>,
    /// Price change over the last five minutes, as a fraction.
    pub change_5m: f64,
    pub relevant_news: usize,
    pub market_overview: bool,
}

impl TaskClass {
    /// Pick the class for an analysis call given the current conditions.
    #[must_use]
    pub fn for_analysis(signals: &EscalationSignals) -> Self {
        let escalate = signals.severity >= Some(Severity::Critical)
            || signals.change_5m.abs() >= 0.05
            || signals.relevant_news >= 50
            || signals.market_overview;
        if escalate {
            Self::Complex
        } else {
            Self::Standard
        }
    }
}

/// Shape the router requires of a provider reply.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResponseSchema {
    /// Trading advice object (see [`AdvicePayload`]).
    Advice,
    /// Closed-set intent classification object.
    Intent,
    /// Any JSON object.
    Object,
}

impl ResponseSchema {
    fn validate(self, value: &Value) -> Result<(), String> {
        let object = value
            .as_object()
            .ok_or_else(|| "reply is not a JSON object".to_string())?;
        match self {
            Self::Object => Ok(()),
            Self::Intent => {
                let intent = object
                    .get("intent")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "missing string field 'intent'".to_string())?;
                if intent.is_empty() {
                    return Err("empty 'intent' field".to_string());
                }
                Ok(())
            }
            Self::Advice => {
                let action = object
                    .get("action")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "missing string field 'action'".to_string())?;
                if !matches!(action, "buy" | "sell" | "hold") {
                    return Err(format!("action '{action}' is not buy/sell/hold"));
                }
                let confidence = object
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| "missing numeric field 'confidence'".to_string())?;
                if !(0.0..=1.0).contains(&confidence) {
                    return Err(format!("confidence {confidence} outside [0, 1]"));
                }
                Ok(())
            }
        }
    }
}

/// Validated advice body returned by a model.
#[derive(Clone, Debug, Deserialize)]
pub struct AdvicePayload {
    pub action: String,
    pub confidence: f64,
    #[serde(default)]
    pub entry: Option<Price>,
    #[serde(default)]
    pub stop_loss: Option<Price>,
    #[serde(default)]
    pub take_profit_tiers: Vec<ProfitTier>,
    #[serde(default)]
    pub reasoning: String,
}

impl AdvicePayload {
    /// Decode a schema-validated advice reply.
    pub fn from_value(value: Value) -> Result<Self, String> {
        serde_json::from_value(value).map_err(|err| err.to_string())
    }

    /// Map the textual action onto the typed enum.
    #[must_use]
    pub fn action_enum(&self) -> AdviceAction {
        match self.action.as_str() {
            "buy" => AdviceAction::Buy,
            "sell" => AdviceAction::Sell,
            _ => AdviceAction::Hold,
        }
    }
}

/// Routes completions to providers by task class with ordered fallback.
///
/// Constructed once at startup and passed explicitly to its consumers.
pub struct LlmRouter {
    routes: HashMap<TaskClass, Vec<Arc<dyn CompletionClient>>>,
    budget: Duration,
    permits: Arc<Semaphore>,
}

impl LlmRouter {
    /// Create an empty router with the given total budget per logical call
    /// and worker-pool size.
    #[must_use]
    pub fn new(budget: Duration, concurrency: usize) -> Self {
        Self {
            routes: HashMap::new(),
            budget,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Register the ordered provider chain for a task class.
    #[must_use]
    pub fn with_route(
        mut self,
        class: TaskClass,
        providers: Vec<Arc<dyn CompletionClient>>,
    ) -> Self {
        self.routes.insert(class, providers);
        self
    }

    /// Whether any provider is registered for the class.
    #[must_use]
    pub fn has_route(&self, class: TaskClass) -> bool {
        self.routes
            .get(&class)
            .is_some_and(|chain| !chain.is_empty())
    }

    /// Run one logical completion: providers are tried in order, any provider
    /// error or schema violation moves to the next, and the shared wall-clock
    /// budget bounds the whole attempt chain.
    pub async fn complete(
        &self,
        class: TaskClass,
        spec: &PromptSpec,
        schema: ResponseSchema,
    ) -> LlmResult<Value> {
        let chain = self
            .routes
            .get(&class)
            .filter(|chain| !chain.is_empty())
            .ok_or(LlmError::NoProvider(class))?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LlmError::Exhausted(class))?;
        let started = Instant::now();
        for provider in chain {
            let Some(remaining) = self.budget.checked_sub(started.elapsed()) else {
                return Err(LlmError::AnalysisTimeout);
            };
            match tokio::time::timeout(remaining, provider.complete(spec, remaining)).await {
                Ok(Ok(value)) => match schema.validate(&value) {
                    Ok(()) => return Ok(value),
                    Err(detail) => {
                        warn!(
                            provider = provider.name(),
                            %detail,
                            "provider reply failed schema validation; falling back"
                        );
                    }
                },
                Ok(Err(err)) => {
                    warn!(provider = provider.name(), error = %err, "provider failed; falling back");
                }
                Err(_) => return Err(LlmError::AnalysisTimeout),
            }
        }
        if started.elapsed() >= self.budget {
            Err(LlmError::AnalysisTimeout)
        } else {
            Err(LlmError::Exhausted(class))
        }
    }

    /// Convenience wrapper returning a decoded advice payload.
    pub async fn advise(&self, class: TaskClass, spec: &PromptSpec) -> LlmResult<AdvicePayload> {
        let value = self.complete(class, spec, ResponseSchema::Advice).await?;
        AdvicePayload::from_value(value).map_err(|detail| LlmError::Malformed {
            provider: "router".into(),
            detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubProvider {
        name: String,
        replies: Vec<LlmResult<Value>>,
        cursor: AtomicUsize,
    }

    impl StubProvider {
        fn new(name: &str, replies: Vec<LlmResult<Value>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                replies,
                cursor: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CompletionClient for StubProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn supports(&self, _class: TaskClass) -> bool {
            true
        }

        async fn complete(&self, _spec: &PromptSpec, _deadline: Duration) -> LlmResult<Value> {
            let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
            match self.replies.get(idx.min(self.replies.len() - 1)) {
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err(_)) | None => Err(LlmError::Transport {
                    provider: self.name.clone(),
                    detail: "stubbed failure".into(),
                }),
            }
        }
    }

    fn advice_value() -> Value {
        json!({"action": "buy", "confidence": 0.8, "reasoning": "momentum"})
    }

    #[tokio::test]
    async fn fallback_reaches_second_provider() {
        let failing = StubProvider::new(
            "first",
            vec![Err(LlmError::Quota {
                provider: "first".into(),
            })],
        );
        let healthy = StubProvider::new("second", vec![Ok(advice_value())]);
        let router = LlmRouter::new(Duration::from_secs(5), 2)
            .with_route(TaskClass::Standard, vec![failing, healthy]);
        let payload = router
            .advise(TaskClass::Standard, &PromptSpec::default())
            .await
            .unwrap();
        assert_eq!(payload.action_enum(), AdviceAction::Buy);
    }

    #[tokio::test]
    async fn malformed_reply_triggers_fallback() {
        let malformed = StubProvider::new("bad", vec![Ok(json!({"action": "yolo"}))]);
        let healthy = StubProvider::new("good", vec![Ok(advice_value())]);
        let router = LlmRouter::new(Duration::from_secs(5), 2)
            .with_route(TaskClass::Standard, vec![malformed, healthy]);
        assert!(router
            .advise(TaskClass::Standard, &PromptSpec::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn exhausted_chain_is_reported() {
        let failing = StubProvider::new(
            "down",
            vec![Err(LlmError::Transport {
                provider: "down".into(),
                detail: "boom".into(),
            })],
        );
        let router = LlmRouter::new(Duration::from_secs(5), 1)
            .with_route(TaskClass::Lightweight, vec![failing]);
        let err = router
            .complete(
                TaskClass::Lightweight,
                &PromptSpec::default(),
                ResponseSchema::Object,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Exhausted(TaskClass::Lightweight)));
    }

    #[tokio::test]
    async fn missing_route_is_no_provider() {
        let router = LlmRouter::new(Duration::from_secs(5), 1);
        let err = router
            .complete(
                TaskClass::Complex,
                &PromptSpec::default(),
                ResponseSchema::Object,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::NoProvider(TaskClass::Complex)));
    }

    #[test]
    fn escalation_rules_upgrade_to_complex() {
        assert_eq!(
            TaskClass::for_analysis(&EscalationSignals::default()),
            TaskClass::Standard
        );
        assert_eq!(
            TaskClass::for_analysis(&EscalationSignals {
                severity: Some(Severity::Critical),
                ..Default::default()
            }),
            TaskClass::Complex
        );
        assert_eq!(
            TaskClass::for_analysis(&EscalationSignals {
                change_5m: -0.06,
                ..Default::default()
            }),
            TaskClass::Complex
        );
        assert_eq!(
            TaskClass::for_analysis(&EscalationSignals {
                relevant_news: 64,
                ..Default::default()
            }),
            TaskClass::Complex
        );
        assert_eq!(
            TaskClass::for_analysis(&EscalationSignals {
                market_overview: true,
                ..Default::default()
            }),
            TaskClass::Complex
        );
    }
}
