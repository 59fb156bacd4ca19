#![allow(ambiguous_glob_reexports)]

//! Helm aggregate crate that re-exports the main components for downstream
//! users.

pub use helm_anomaly as anomaly;
pub use helm_backtester as backtester;
pub use helm_chat as chat;
pub use helm_config as config;
pub use helm_core as core;
pub use helm_indicators as indicators;
pub use helm_llm as llm;
pub use helm_markets as markets;
pub use helm_pipeline as pipeline;
pub use helm_positions as positions;
pub use helm_supervisor as supervisor;

/// Convenience prelude to pull commonly used items into scope.
pub mod prelude {
    pub use helm_anomaly::{AnomalyDetector, Metric, Observation};
    pub use helm_backtester::{BacktestConfig, BacktestReport, Backtester, SignalRecord};
    pub use helm_chat::{ChatService, ChatTransport, InboundMessage};
    pub use helm_config::{load_config, AppConfig, RiskConfig, TradingMode};
    pub use helm_core::*;
    pub use helm_indicators::{Indicator, IndicatorConfig, IndicatorSnapshot};
    pub use helm_llm::{LlmRouter, PromptSpec, TaskClass};
    pub use helm_markets::{MarketData, MarketHub};
    pub use helm_pipeline::{AdviceStore, AssetMonitor, PipelineContext};
    pub use helm_positions::{ExitPlan, PositionBook, TrackerEvent};
    pub use helm_supervisor::{Supervisor, Unit};
}
