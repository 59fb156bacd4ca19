use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{Args, Parser, Subcommand};
use helm_backtester::{BacktestConfig, Backtester};
use helm_chat::{replay_strategy_signals, ChatService};
use helm_cli::app::{
    build_llm_router, build_market_hub, cadence_for, monitored_assets, write_report_pair,
    ChatUnit, HttpRateSource, MonitorUnit, RatesUnit, TrackerUnit,
};
use helm_cli::telemetry::init_tracing;
use helm_config::{load_config, AppConfig};
use helm_core::{AssetId, Bar, BarWidth, Series};
use helm_llm::TaskClass;
use helm_markets::CurrencyConverter;
use helm_pipeline::{builtin_strategies, NoNews, PipelineContext};
use helm_positions::PositionBook;
use helm_supervisor::{Notifier, Supervisor};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about = "Helm trading assistant")]
struct Cli {
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Selects which configuration environment to load (maps to
    /// {config_dir}/{env}.toml)
    #[arg(long)]
    env: Option<String>,
    /// Directory holding default.toml and overrides
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the supervised monitor, tracker, and chat loops
    Run,
    /// Replay historical candles through the risk engine
    Backtest(BacktestArgs),
    /// Answer operator messages on stdin without the monitor loops
    Chat,
    /// List the monitored assets and their classes
    Assets,
}

#[derive(Args)]
struct BacktestArgs {
    /// One or more CSV files with historical candles
    /// (timestamp,open,high,low,close,volume)
    #[arg(long = "data", value_name = "PATH", num_args = 1.., action = clap::ArgAction::Append)]
    data_paths: Vec<PathBuf>,
    /// Asset the candles belong to (code or pair)
    #[arg(long)]
    asset: String,
    /// Strategy driving entries and exits
    #[arg(long, default_value = "ma-cross-rsi")]
    strategy: String,
    /// Starting capital in the display currency
    #[arg(long)]
    capital: Option<Decimal>,
    /// Skip writing the JSON/text report pair
    #[arg(long)]
    no_report: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match load_config(&cli.config_dir, cli.env.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(1);
        }
    };

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| match cli.verbose {
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    });
    let log_path = config.supervisor.log_path.clone();
    if let Err(err) = init_tracing(&filter, log_path.as_deref()) {
        eprintln!("failed to initialize logging: {err}");
        return ExitCode::from(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return ExitCode::from(2);
        }
    };
    let result = runtime.block_on(async {
        match cli.command {
            Commands::Run => run(&config).await,
            Commands::Backtest(args) => backtest(&config, &args),
            Commands::Chat => chat(&config).await,
            Commands::Assets => {
                for asset in monitored_assets(&config) {
                    println!("{} ({})", asset.code, asset.class);
                }
                Ok(())
            }
        }
    });
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fatal: {err:#}");
            ExitCode::from(2)
        }
    }
}

/// Shared wiring for `run` and `chat`.
struct Wired {
    ctx: Arc<PipelineContext>,
    service: Arc<ChatService>,
    book: Arc<Mutex<PositionBook>>,
}

fn wire(config: &AppConfig) -> Result<Wired> {
    let hub = Arc::new(build_market_hub(config).context("market data layer unavailable")?);
    let router = Arc::new(build_llm_router(config));
    if !router.has_route(TaskClass::Standard) {
        warn!("no standard-class model provider; analysis will stay on the rule path");
    }
    let ctx = Arc::new(PipelineContext::new(
        hub.clone(),
        router.clone(),
        Arc::new(NoNews),
        config.trading.clone(),
        config.anomaly.clone(),
    ));
    let book = Arc::new(Mutex::new(PositionBook::new(
        config.risk.clone(),
        initial_capital(config),
    )));
    let service = Arc::new(ChatService::new(
        config,
        hub,
        router,
        ctx.advice.clone(),
        book.clone(),
    ));
    Ok(Wired { ctx, service, book })
}

fn initial_capital(_config: &AppConfig) -> Decimal {
    Decimal::from(10_000_000)
}

async fn run(config: &AppConfig) -> Result<()> {
    let wired = wire(config)?;
    let mut supervisor = Supervisor::new(config.supervisor.clone());
    let cadence = cadence_for(config);
    for asset in monitored_assets(config) {
        supervisor.register(Arc::new(MonitorUnit {
            name: format!("monitor-{}", asset.code),
            ctx: wired.ctx.clone(),
            asset,
            cadence,
        }));
    }
    supervisor.register(Arc::new(TrackerUnit {
        book: wired.book.clone(),
        hub: wired.ctx.markets.clone(),
        assets: monitored_assets(config),
        notifier: Notifier::new(config.supervisor.webhook_url.clone()),
    }));
    if let Some(rate_url) = config.markets.rate_url.clone() {
        supervisor.register(Arc::new(RatesUnit {
            converter: Arc::new(CurrencyConverter::new(
                config.markets.display_currency.clone(),
                chrono::Duration::seconds(config.markets.currency_max_age_secs as i64),
            )),
            source: HttpRateSource::new(rate_url),
            period: StdDuration::from_secs(config.markets.currency_refresh_secs),
        }));
    }
    supervisor.register(Arc::new(ChatUnit {
        service: wired.service.clone(),
        user_id: operator_id(config),
    }));
    info!(
        assets = config.assets.equities.len() + config.assets.cryptos.len(),
        cadence_secs = cadence.as_secs(),
        "starting supervised session"
    );
    supervisor.run().await
}

async fn chat(config: &AppConfig) -> Result<()> {
    let wired = wire(config)?;
    let supervisor = Supervisor::new(config.supervisor.clone());
    let shutdown = supervisor.shutdown_receiver();
    let transport = helm_cli::app::StdinTransport::new(operator_id(config));
    println!("helm chat ready; type a message (ctrl-d to exit)");
    helm_chat::run_chat_loop(transport, wired.service, shutdown).await;
    Ok(())
}

fn operator_id(config: &AppConfig) -> i64 {
    config.auth.users.first().copied().unwrap_or(0)
}

fn backtest(config: &AppConfig, args: &BacktestArgs) -> Result<()> {
    let asset = AssetId::from_str(&args.asset)
        .map_err(|err| anyhow!("unrecognized asset '{}': {err}", args.asset))?;
    let candles = load_candles_from_paths(&args.data_paths)?;
    if candles.is_empty() {
        anyhow::bail!("no candles loaded; provide at least one --data file");
    }
    let mut series = Series::new(asset.clone(), BarWidth::OneHour, candles.len());
    for bar in candles {
        series.push(bar);
    }
    let strategies = builtin_strategies();
    let strategy = strategies
        .iter()
        .find(|record| record.name == args.strategy)
        .ok_or_else(|| {
            anyhow!(
                "unknown strategy '{}'; available: {}",
                args.strategy,
                strategies
                    .iter()
                    .map(|record| record.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })?;
    let signals = replay_strategy_signals(strategy, &series);
    info!(
        asset = %asset,
        strategy = strategy.name,
        signals = signals.len(),
        bars = series.len(),
        "running backtest"
    );
    let backtest_config = BacktestConfig {
        initial_capital: args.capital.unwrap_or_else(|| initial_capital(config)),
        risk: config.risk.clone(),
        slippage: Decimal::new(1, 3),
    };
    let mut map = HashMap::new();
    map.insert(asset.clone(), series);
    let report = Backtester::new(backtest_config)
        .run(map, signals)
        .context("backtest failed")?;
    println!("{report}");
    if !args.no_report {
        let json = serde_json::to_value(&report)?;
        let (json_path, text_path) = write_report_pair(
            &config.reports_dir,
            &format!("backtest_{}", asset.code),
            &json,
            &report.to_string(),
        )?;
        println!(
            "report written to {} and {}",
            json_path.display(),
            text_path.display()
        );
    }
    Ok(())
}

#[derive(Deserialize)]
struct CandleCsvRow {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

fn load_candles_from_paths(paths: &[PathBuf]) -> Result<Vec<Bar>> {
    let mut bars = Vec::new();
    for path in paths {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        for record in reader.deserialize::<CandleCsvRow>() {
            let row = record.with_context(|| format!("invalid row in {}", path.display()))?;
            bars.push(Bar {
                timestamp: parse_datetime(&row.timestamp)?,
                open: decimal(row.open, "open", path)?,
                high: decimal(row.high, "high", path)?,
                low: decimal(row.low, "low", path)?,
                close: decimal(row.close, "close", path)?,
                volume: decimal(row.volume, "volume", path)?,
            });
        }
    }
    bars.sort_by_key(|bar| bar.timestamp);
    Ok(bars)
}

fn decimal(value: f64, field: &str, path: &Path) -> Result<Decimal> {
    Decimal::from_f64(value)
        .ok_or_else(|| anyhow!("invalid {field} value '{value}' in {}", path.display()))
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let dt = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| anyhow!("invalid date"))?;
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    }
    Err(anyhow!("unable to parse datetime '{value}'"))
}
