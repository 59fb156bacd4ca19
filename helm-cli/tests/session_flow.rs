//! End-to-end flows across the chat router, market hub, tracker, and
//! analysis pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use helm_chat::{ChatService, InboundMessage};
use helm_cli::app::TrackerUnit;
use helm_config::{AdapterConfig, AppConfig, AssetsConfig, AuthConfig};
use helm_core::{AssetClass, AssetId, Quote, TradeCause, TradeKind};
use helm_llm::LlmRouter;
use helm_markets::{MarketHub, ReplayAdapter};
use helm_pipeline::AdviceStore;
use helm_positions::PositionBook;
use helm_supervisor::{Notifier, Unit};
use rust_decimal::Decimal;
use tokio::sync::{watch, Mutex};

const OPERATOR: i64 = 7;

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.assets = AssetsConfig {
        equities: vec!["005930".into()],
        cryptos: Vec::new(),
        aliases: HashMap::from([("Samsung".to_string(), "005930".to_string())]),
    };
    config.auth = AuthConfig {
        users: vec![OPERATOR],
        recipients: vec![OPERATOR],
    };
    config.risk.fee_rate = Decimal::ZERO;
    config.risk.min_open_gap_secs = 0;
    config
}

fn adapter_config() -> AdapterConfig {
    AdapterConfig {
        name: "replay".into(),
        base_url: None,
        quota_per_minute: 6_000,
        quota_margin: 0,
        staleness_secs: 3_600,
        request_timeout_secs: 2,
    }
}

fn quote(price: i64, offset_secs: i64) -> Quote {
    Quote {
        asset: AssetId::equity("005930"),
        timestamp: Utc::now() + Duration::seconds(offset_secs),
        price: Decimal::from(price),
        volume: Decimal::from(1_000),
        change_pct_24h: 0.0,
        currency: "KRW".into(),
        source: "replay".into(),
        age: None,
    }
}

struct Session {
    hub: Arc<MarketHub>,
    service: ChatService,
    book: Arc<Mutex<PositionBook>>,
}

fn session(adapter: ReplayAdapter) -> Session {
    let config = test_config();
    let mut hub = MarketHub::new(Duration::seconds(600));
    hub.register(AssetClass::Equity, Box::new(adapter), &adapter_config());
    let hub = Arc::new(hub);
    let book = Arc::new(Mutex::new(PositionBook::new(
        config.risk.clone(),
        Decimal::from(100_000_000),
    )));
    let service = ChatService::new(
        &config,
        hub.clone(),
        Arc::new(LlmRouter::new(StdDuration::from_secs(2), 1)),
        Arc::new(AdviceStore::new()),
        book.clone(),
    );
    Session { hub, service, book }
}

/// Scenario: a chat buy is opened, then declining quotes flowing through the
/// hub drive the tracker to warn at -8% and force-close at -10%.
#[tokio::test]
async fn chat_buy_then_stop_loss_fires_through_tracker() {
    let adapter = ReplayAdapter::new("replay", "KRW");
    // First quote backs the buy; the rest walk the price down.
    adapter.push_quote(quote(100_000, 0));
    for (i, price) in [99_000, 95_000, 92_000, 91_000, 90_000].iter().enumerate() {
        adapter.push_quote(quote(*price, (i as i64 + 1) * 5));
    }
    let session = session(adapter);

    let reply = session
        .service
        .handle(&InboundMessage {
            user_id: OPERATOR,
            text: "buy 005930 10 shares".into(),
        })
        .await;
    assert!(reply.contains("005930"), "buy reply: {reply}");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tracker = TrackerUnit {
        book: session.book.clone(),
        hub: session.hub.clone(),
        assets: vec![AssetId::equity("005930")],
        notifier: Notifier::new(None),
    };
    let handle = tokio::spawn(async move { tracker.run(shutdown_rx).await });
    // Let the tracker subscribe before quotes start flowing.
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    let asset = AssetId::equity("005930");
    for _ in 0..5 {
        session.hub.quote(&asset).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }

    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(2);
    loop {
        {
            let book = session.book.lock().await;
            if book.query(Some(&asset)).is_empty() {
                let close = book
                    .trade_log()
                    .iter()
                    .find(|record| record.kind == TradeKind::Close)
                    .cloned()
                    .expect("close record exists");
                assert_eq!(close.cause, TradeCause::StopLoss);
                assert_eq!(close.price, Decimal::from(90_000));
                assert_eq!(close.realized_pnl, Decimal::from(-100_000));
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "stop-loss did not fire in time"
        );
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }

    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(StdDuration::from_secs(1), handle).await;
}

/// Scenario: open then fully close through chat; the portfolio reflects the
/// realized result and the position is gone.
#[tokio::test]
async fn chat_round_trip_restores_flat_portfolio() {
    let adapter = ReplayAdapter::new("replay", "KRW");
    adapter.push_quote(quote(70_000, 0));
    adapter.push_quote(quote(71_000, 5));
    let session = session(adapter);

    session
        .service
        .handle(&InboundMessage {
            user_id: OPERATOR,
            text: "buy 005930 10 shares".into(),
        })
        .await;
    let reply = session
        .service
        .handle(&InboundMessage {
            user_id: OPERATOR,
            text: "sell 005930 10 shares".into(),
        })
        .await;
    assert!(reply.contains("realized"), "sell reply: {reply}");

    let book = session.book.lock().await;
    assert!(book.query(None).is_empty());
    let snapshot = book.portfolio();
    assert_eq!(snapshot.closed_trades, 1);
    assert_eq!(snapshot.total_realized_pnl, Decimal::from(10_000));
    assert_eq!(snapshot.win_rate, 1.0);
}

/// Scenario: an unauthorized sender is refused with the fixed message and no
/// state changes.
#[tokio::test]
async fn unauthorized_messages_never_mutate_state() {
    let adapter = ReplayAdapter::new("replay", "KRW");
    adapter.push_quote(quote(70_000, 0));
    let session = session(adapter);
    let reply = session
        .service
        .handle(&InboundMessage {
            user_id: 1234,
            text: "buy 005930 10 shares".into(),
        })
        .await;
    assert_eq!(reply, helm_chat::render::REFUSAL);
    assert!(session.book.lock().await.trade_log().is_empty());
}
