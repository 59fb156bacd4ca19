//! Layered configuration loading utilities.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised when configuration cannot be loaded or fails validation. The
/// supervisor refuses to start on any variant.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Tick cadence profile for the analysis pipeline.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    ShortTerm,
    LongTerm,
}

impl TradingMode {
    /// Monitor cadence in seconds for the mode.
    #[must_use]
    pub fn cadence_secs(self) -> u64 {
        match self {
            Self::ShortTerm => 5,
            Self::LongTerm => 15,
        }
    }
}

/// Root application configuration deserialized from layered sources.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub assets: AssetsConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub markets: MarketsConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_trading_mode")]
    pub mode: TradingMode,
    /// Overrides the mode's built-in cadence when set.
    #[serde(default)]
    pub cadence_secs: Option<u64>,
    #[serde(default = "default_history_bars")]
    pub history_bars: usize,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Strategy weight map; strategies absent from the map stay disabled.
    #[serde(default = "default_strategy_weights")]
    pub strategy_weights: HashMap<String, f64>,
}

impl TradingConfig {
    /// Effective cadence, preferring an explicit override.
    #[must_use]
    pub fn cadence_secs(&self) -> u64 {
        self.cadence_secs.unwrap_or_else(|| self.mode.cadence_secs())
    }
}

/// Per-asset-class lists of monitored instruments.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AssetsConfig {
    #[serde(default)]
    pub equities: Vec<String>,
    #[serde(default)]
    pub cryptos: Vec<String>,
    /// Name → code alias table consulted during slot extraction.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

/// Risk thresholds enforced identically in live tracking and backtests.
///
/// Percentages are decimal fractions; loss thresholds are negative.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: f64,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_stop_warning_pct")]
    pub stop_warning_pct: f64,
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
    #[serde(default = "default_major_gain_pct")]
    pub major_gain_pct: f64,
    #[serde(default = "default_max_hold_hours")]
    pub max_hold_hours: i64,
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_min_open_gap_secs")]
    pub min_open_gap_secs: i64,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MarketsConfig {
    /// Ordered adapter chains keyed by asset class ("equity", "crypto").
    #[serde(default)]
    pub adapters: HashMap<String, Vec<AdapterConfig>>,
    /// Endpoint serving a JSON rate table; static fallback only when absent.
    #[serde(default)]
    pub rate_url: Option<String>,
    #[serde(default = "default_rate_refresh_secs")]
    pub currency_refresh_secs: u64,
    #[serde(default = "default_rate_max_age_secs")]
    pub currency_max_age_secs: u64,
    #[serde(default = "default_display_currency")]
    pub display_currency: String,
    /// Serve cached quotes up to this age before SourceUnavailable.
    #[serde(default = "default_quote_staleness_secs")]
    pub quote_staleness_secs: i64,
}

/// Declares one upstream data source inside a failover chain.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AdapterConfig {
    pub name: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Documented request quota per minute; the token bucket is sized from
    /// this minus `quota_margin`.
    #[serde(default = "default_quota_per_minute")]
    pub quota_per_minute: u32,
    #[serde(default = "default_quota_margin")]
    pub quota_margin: u32,
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: i64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AnomalyConfig {
    /// Rolling baseline horizon per metric, in minutes.
    #[serde(default = "default_baseline_minutes")]
    pub baseline_minutes: HashMap<String, u64>,
    /// Debounce window per anomaly kind, in seconds.
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: HashMap<String, i64>,
}

impl AnomalyConfig {
    /// Baseline horizon for a metric, defaulting to 60 minutes.
    #[must_use]
    pub fn horizon_minutes(&self, metric: &str) -> u64 {
        self.baseline_minutes.get(metric).copied().unwrap_or(60)
    }

    /// Debounce window for a kind, defaulting to 300 seconds.
    #[must_use]
    pub fn debounce_for(&self, kind: &str) -> i64 {
        self.debounce_secs.get(kind).copied().unwrap_or(300)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LlmConfig {
    /// Task class → ordered provider names.
    #[serde(default = "default_task_map")]
    pub task_map: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default = "default_llm_budget_secs")]
    pub budget_secs: u64,
    #[serde(default = "default_llm_concurrency")]
    pub max_concurrency: usize,
}

/// Connection profile for one LLM provider. The API key is *not* part of the
/// config file; it is read from the environment variable named here.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProviderConfig {
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
    #[serde(default = "default_llm_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Allow-listed chat users and outbound recipients.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub users: Vec<i64>,
    #[serde(default)]
    pub recipients: Vec<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_pid_path")]
    pub pid_path: PathBuf,
    #[serde(default = "default_drain_secs")]
    pub drain_secs: u64,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_log_path")]
    pub log_path: Option<PathBuf>,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            mode: default_trading_mode(),
            cadence_secs: None,
            history_bars: default_history_bars(),
            min_confidence: default_min_confidence(),
            strategy_weights: default_strategy_weights(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_pct: default_max_position_pct(),
            stop_loss_pct: default_stop_loss_pct(),
            stop_warning_pct: default_stop_warning_pct(),
            take_profit_pct: default_take_profit_pct(),
            major_gain_pct: default_major_gain_pct(),
            max_hold_hours: default_max_hold_hours(),
            max_trades_per_day: default_max_trades_per_day(),
            max_consecutive_losses: default_max_consecutive_losses(),
            min_open_gap_secs: default_min_open_gap_secs(),
            fee_rate: default_fee_rate(),
        }
    }
}

impl Default for MarketsConfig {
    fn default() -> Self {
        Self {
            adapters: HashMap::new(),
            rate_url: None,
            currency_refresh_secs: default_rate_refresh_secs(),
            currency_max_age_secs: default_rate_max_age_secs(),
            display_currency: default_display_currency(),
            quote_staleness_secs: default_quote_staleness_secs(),
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            baseline_minutes: default_baseline_minutes(),
            debounce_secs: default_debounce_secs(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            task_map: default_task_map(),
            providers: HashMap::new(),
            budget_secs: default_llm_budget_secs(),
            max_concurrency: default_llm_concurrency(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            pid_path: default_pid_path(),
            drain_secs: default_drain_secs(),
            webhook_url: None,
            log_path: default_log_path(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("./reports")
}

fn default_trading_mode() -> TradingMode {
    TradingMode::ShortTerm
}

fn default_history_bars() -> usize {
    512
}

fn default_min_confidence() -> f64 {
    0.6
}

fn default_strategy_weights() -> HashMap<String, f64> {
    let mut weights = HashMap::new();
    weights.insert("intraday-breakout".to_string(), 1.0);
    weights.insert("ma-cross-rsi".to_string(), 1.0);
    weights.insert("momentum-reversal".to_string(), 0.8);
    weights.insert("order-flow".to_string(), 0.6);
    weights.insert("news-momentum".to_string(), 0.6);
    weights
}

fn default_max_position_pct() -> f64 {
    0.15
}

fn default_stop_loss_pct() -> f64 {
    -0.10
}

fn default_stop_warning_pct() -> f64 {
    -0.08
}

fn default_take_profit_pct() -> f64 {
    0.20
}

fn default_major_gain_pct() -> f64 {
    0.15
}

fn default_max_hold_hours() -> i64 {
    10
}

fn default_max_trades_per_day() -> u32 {
    3
}

fn default_max_consecutive_losses() -> u32 {
    3
}

fn default_min_open_gap_secs() -> i64 {
    60
}

fn default_fee_rate() -> Decimal {
    Decimal::new(1, 3) // 0.1% per side
}

fn default_rate_refresh_secs() -> u64 {
    3600
}

fn default_rate_max_age_secs() -> u64 {
    7200
}

fn default_display_currency() -> String {
    "KRW".to_string()
}

fn default_quote_staleness_secs() -> i64 {
    120
}

fn default_quota_per_minute() -> u32 {
    60
}

fn default_quota_margin() -> u32 {
    5
}

fn default_staleness_secs() -> i64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_baseline_minutes() -> HashMap<String, u64> {
    let mut map = HashMap::new();
    map.insert("return_1m".to_string(), 60);
    map.insert("volume_z_5m".to_string(), 60);
    map.insert("range_1h".to_string(), 240);
    map
}

fn default_debounce_secs() -> HashMap<String, i64> {
    HashMap::new()
}

fn default_task_map() -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    map.insert("lightweight".to_string(), vec!["gemini-flash".to_string()]);
    map.insert(
        "standard".to_string(),
        vec!["gemini-flash".to_string(), "deepseek".to_string()],
    );
    map.insert(
        "complex".to_string(),
        vec!["gemini-pro".to_string(), "deepseek".to_string()],
    );
    map
}

fn default_llm_budget_secs() -> u64 {
    30
}

fn default_llm_concurrency() -> usize {
    4
}

fn default_llm_request_timeout_secs() -> u64 {
    30
}

fn default_pid_path() -> PathBuf {
    PathBuf::from("./helm.pid")
}

fn default_drain_secs() -> u64 {
    5
}

fn default_log_path() -> Option<PathBuf> {
    Some(PathBuf::from("./logs/helm.json"))
}

impl AppConfig {
    /// Reject configurations that cannot produce a working runtime.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.assets.equities.is_empty() && self.assets.cryptos.is_empty() {
            return Err(ConfigurationError::Invalid(
                "no monitored assets configured under [assets]".into(),
            ));
        }
        if self.risk.stop_loss_pct >= 0.0 || self.risk.stop_warning_pct >= 0.0 {
            return Err(ConfigurationError::Invalid(
                "loss thresholds must be negative fractions".into(),
            ));
        }
        if self.risk.stop_warning_pct <= self.risk.stop_loss_pct {
            return Err(ConfigurationError::Invalid(
                "risk.stop_warning_pct must sit above risk.stop_loss_pct".into(),
            ));
        }
        if self.risk.take_profit_pct <= self.risk.major_gain_pct {
            return Err(ConfigurationError::Invalid(
                "risk.take_profit_pct must sit above risk.major_gain_pct".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.risk.max_position_pct) {
            return Err(ConfigurationError::Invalid(
                "risk.max_position_pct must be within [0, 1]".into(),
            ));
        }
        for (class, chain) in &self.markets.adapters {
            if chain.is_empty() {
                return Err(ConfigurationError::Invalid(format!(
                    "adapter chain for '{class}' is empty"
                )));
            }
            for adapter in chain {
                if adapter.quota_margin >= adapter.quota_per_minute {
                    return Err(ConfigurationError::Invalid(format!(
                        "adapter '{}' margin consumes the whole quota",
                        adapter.name
                    )));
                }
            }
        }
        for (class, providers) in &self.llm.task_map {
            if providers.is_empty() {
                return Err(ConfigurationError::Invalid(format!(
                    "llm.task_map entry '{class}' lists no providers"
                )));
            }
        }
        Ok(())
    }
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `{dir}/default.toml`
/// 2. `{dir}/{environment}.toml` (if `environment` is Some)
/// 3. `{dir}/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `HELM__`
pub fn load_config(dir: &Path, env: Option<&str>) -> Result<AppConfig, ConfigurationError> {
    let mut builder =
        Config::builder().add_source(File::from(dir.join("default.toml")).required(true));
    if let Some(env_name) = env {
        builder =
            builder.add_source(File::from(dir.join(format!("{env_name}.toml"))).required(false));
    }
    builder = builder.add_source(File::from(dir.join("local.toml")).required(false));
    builder = builder.add_source(
        Environment::with_prefix("HELM")
            .separator("__")
            .ignore_empty(true),
    );

    let config: AppConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> AppConfig {
        AppConfig {
            assets: AssetsConfig {
                equities: vec!["005930".into()],
                ..AssetsConfig::default()
            },
            ..AppConfig::default()
        }
    }

    #[test]
    fn defaults_adopt_conservative_risk_values() {
        let risk = RiskConfig::default();
        assert_eq!(risk.max_position_pct, 0.15);
        assert_eq!(risk.max_trades_per_day, 3);
        assert_eq!(risk.stop_loss_pct, -0.10);
        assert_eq!(risk.max_hold_hours, 10);
    }

    #[test]
    fn validation_requires_assets() {
        let config = AppConfig::default();
        assert!(config.validate().is_err());
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn validation_rejects_inverted_thresholds() {
        let mut config = minimal();
        config.risk.stop_warning_pct = -0.12;
        assert!(config.validate().is_err());
    }

    #[test]
    fn cadence_override_beats_mode() {
        let mut trading = TradingConfig::default();
        assert_eq!(trading.cadence_secs(), 5);
        trading.mode = TradingMode::LongTerm;
        assert_eq!(trading.cadence_secs(), 15);
        trading.cadence_secs = Some(30);
        assert_eq!(trading.cadence_secs(), 30);
    }

    #[test]
    fn load_config_layers_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            r#"
log_level = "debug"

[assets]
cryptos = ["KRW-BTC"]

[risk]
max_trades_per_day = 5
"#,
        )
        .unwrap();
        let config = load_config(dir.path(), None).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.risk.max_trades_per_day, 5);
        assert_eq!(config.assets.cryptos, vec!["KRW-BTC".to_string()]);
    }
}
