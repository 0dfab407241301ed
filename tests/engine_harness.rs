//! End-to-end engine test harness
//!
//! Validates the trading loop against a scripted venue:
//! settings → strategy → intent → submit (retried) → confirm → state + events


use async_trait::async_trait;
use mock_venue::MockVenue;
use pair_bot::{
    config::{AveragingSettings, Settings, SignalSettings},
    decision::{CompletionRequest, DecisionService},
    error::{DecisionError, StrategyError, VenueError},
    execution::ConfirmPolicy,
    journal::JsonlJournal,
    ports::DecisionLog,
    retry::RetryPolicy,
    runner::BotRunner,
    shutdown::{self, CancelToken},
    state::StateStore,
    strategy::{self, AveragingPhase, AveragingStrategy, DecisionParams, SignalStrategy, Strategy, StrategyDeps, TickOutcome},
    types::{Action, DecisionRecord, MarketKind, Pair, Timeframe},
    venue::{VenueFactory, VenuePorts},
};
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn pair() -> Pair {
    Pair::new("BTC", "USDT").unwrap()
}

fn dec(value: &str) -> Decimal {
    value.parse().unwrap()
}

/// 3 attempts in total, no jitter
fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(50))
        .with_max_retries(2)
        .with_jitter(0.0)
}

fn averaging_params() -> AveragingSettings {
    AveragingSettings {
        percent: Decimal::from(10),
        buy_threshold_percent: Decimal::from(3),
        sell_threshold_percent: Decimal::from(7),
        max_dca_trades: 3,
    }
}

fn deps(venue: Arc<MockVenue>, store: Option<StateStore>) -> StrategyDeps {
    StrategyDeps {
        ports: VenuePorts::from_adapter(venue),
        retry: fast_retry(),
        confirm: ConfirmPolicy {
            poll_interval: Duration::from_millis(10),
            max_polls: 3,
        },
        store,
    }
}

fn averaging(venue: &Arc<MockVenue>, store: Option<StateStore>) -> AveragingStrategy {
    AveragingStrategy::new("dca", pair(), averaging_params(), deps(venue.clone(), store))
}

/// Venue already holding 10 BTC entered at 100, with 1000 USDT free
fn holding_venue() -> Arc<MockVenue> {
    Arc::new(
        MockVenue::new(pair(), Decimal::from(100))
            .with_balance("USDT", Decimal::from(1000))
            .with_position(Decimal::from(10), Decimal::from(100)),
    )
}

fn flat_venue() -> Arc<MockVenue> {
    Arc::new(MockVenue::new(pair(), Decimal::from(100)).with_balance("USDT", Decimal::from(1000)))
}

// ============================================================================
// Averaging strategy
// ============================================================================

/// Test: reference 100, drop to 96 buys, rise to 103 exits, then stays flat
#[tokio::test(start_paused = true)]
async fn test_averaging_full_cycle() {
    let venue = holding_venue();
    let mut strategy = averaging(&venue, None);
    let cancel = CancelToken::never();

    let entry = assert_ok!(strategy.initialize(&cancel).await);
    assert!(entry.is_none(), "existing position must not trigger an entry buy");
    assert_eq!(strategy.phase(), AveragingPhase::Holding(1));
    assert_eq!(strategy.state().reference_price, Decimal::from(100));

    // 4% drop: buy 10% of 1000 USDT at 96
    venue.set_price(Decimal::from(96));
    let TickOutcome::Traded(buy) = strategy.tick(&cancel).await.unwrap() else {
        panic!("expected a buy at 96");
    };
    assert_eq!(buy.action, Action::Buy);
    assert_eq!(buy.amount, dec("1.04166666"));
    assert_eq!(buy.price, Decimal::from(96));
    assert_eq!(strategy.phase(), AveragingPhase::Holding(2));
    assert_eq!(strategy.state().reference_price, Decimal::from(96));

    // 7.29% rise from 96: sell everything the venue holds
    venue.set_price(Decimal::from(103));
    let TickOutcome::Traded(sell) = strategy.tick(&cancel).await.unwrap() else {
        panic!("expected the exit at 103");
    };
    assert_eq!(sell.action, Action::Sell);
    assert_eq!(sell.amount, dec("11.04166666"));
    assert_eq!(strategy.phase(), AveragingPhase::Flat);
    assert_eq!(strategy.state().trade_count, 0);
    assert_eq!(venue.held(), Decimal::ZERO);

    // After the exit no new position is opened until restart, even on a deep drop
    venue.set_price(Decimal::from(80));
    assert_eq!(
        strategy.tick(&cancel).await.unwrap(),
        TickOutcome::no_data("flat, waiting for restart")
    );
    assert_eq!(venue.accepted().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_entry_buy_on_initialize() {
    let venue = flat_venue();
    let mut strategy = averaging(&venue, None);

    let entry = strategy
        .initialize(&CancelToken::never())
        .await
        .unwrap()
        .expect("entry buy");

    assert_eq!(entry.action, Action::Buy);
    assert_eq!(entry.amount, Decimal::ONE);
    assert_eq!(strategy.phase(), AveragingPhase::Holding(1));
    assert_eq!(venue.balance("USDT"), Decimal::from(900));
}

#[tokio::test(start_paused = true)]
async fn test_no_funds_stays_flat() {
    let venue = Arc::new(MockVenue::new(pair(), Decimal::from(100)));
    let mut strategy = averaging(&venue, None);

    let entry = strategy.initialize(&CancelToken::never()).await.unwrap();
    assert!(entry.is_none());
    assert_eq!(strategy.phase(), AveragingPhase::Flat);
    assert!(venue.submissions().is_empty());
}

/// Test: a buy-in that sizes below one base unit is skipped, not submitted
#[tokio::test(start_paused = true)]
async fn test_dust_buy_in_is_skipped() {
    let venue = Arc::new(
        MockVenue::new(pair(), dec("1000000000"))
            .with_balance("USDT", Decimal::ONE)
            .with_position(Decimal::ONE, dec("1000000000")),
    );
    let mut strategy = averaging(&venue, None);
    let cancel = CancelToken::never();
    strategy.initialize(&cancel).await.unwrap();
    assert_eq!(strategy.phase(), AveragingPhase::Holding(1));

    // 4% drop: 0.1 USDT buys less than 0.00000001 BTC
    venue.set_price(dec("960000000"));
    assert_eq!(
        strategy.tick(&cancel).await.unwrap(),
        TickOutcome::no_data("nothing to allocate")
    );
    assert!(venue.submissions().is_empty());
    assert_eq!(strategy.phase(), AveragingPhase::Holding(1));
    assert_eq!(strategy.state().reference_price, dec("1000000000"));
}

/// Test: buy-ins never exceed max_dca_trades, entry included
#[tokio::test(start_paused = true)]
async fn test_trade_count_bound() {
    let venue = holding_venue();
    let mut strategy = averaging(&venue, None);
    let cancel = CancelToken::never();
    strategy.initialize(&cancel).await.unwrap();

    let mut price = Decimal::from(100);
    for _ in 0..5 {
        price = price * dec("0.95");
        venue.set_price(price);
        strategy.tick(&cancel).await.unwrap();
    }

    assert_eq!(strategy.phase(), AveragingPhase::Holding(3));
    assert_eq!(venue.accepted().len(), 2);
}

// ============================================================================
// Idempotent execution
// ============================================================================

/// Test: a transport error then a lost response still yield exactly one order
#[tokio::test(start_paused = true)]
async fn test_idempotent_retry() {
    let venue = flat_venue();
    venue.fail_submissions(1);
    venue.lose_responses(1);
    let mut strategy = averaging(&venue, None);

    let entry = strategy
        .initialize(&CancelToken::never())
        .await
        .unwrap()
        .expect("entry buy");

    let submissions = venue.submissions();
    assert_eq!(submissions.len(), 3);
    assert!(submissions
        .iter()
        .all(|s| s.client_order_id == entry.client_order_id));
    assert_eq!(venue.accepted().len(), 1);
    assert_eq!(venue.held(), Decimal::ONE);
    assert_eq!(venue.balance("USDT"), Decimal::from(900));
}

/// Test: 3 failed attempts leave state untouched; the next tick reuses the token
#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_keeps_state_and_token() {
    let venue = holding_venue();
    let mut strategy = averaging(&venue, None);
    let cancel = CancelToken::never();
    strategy.initialize(&cancel).await.unwrap();

    venue.set_price(Decimal::from(96));
    venue.fail_submissions(3);
    match assert_err!(strategy.tick(&cancel).await) {
        StrategyError::Venue { attempts, source, .. } => {
            assert_eq!(attempts, 3);
            assert!(matches!(source, VenueError::Transport(_)));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(strategy.phase(), AveragingPhase::Holding(1));
    assert_eq!(strategy.state().reference_price, Decimal::from(100));
    assert!(venue.accepted().is_empty());

    let first_token = venue.submissions()[0].client_order_id.clone();
    let TickOutcome::Traded(buy) = strategy.tick(&cancel).await.unwrap() else {
        panic!("expected the retried buy");
    };
    assert_eq!(buy.client_order_id, first_token);
    assert_eq!(venue.submissions().len(), 4);
    assert_eq!(venue.accepted().len(), 1);
    assert_eq!(strategy.phase(), AveragingPhase::Holding(2));
}

/// Test: a venue rejection is not retried and the next attempt gets a fresh token
#[tokio::test(start_paused = true)]
async fn test_rejection_issues_fresh_token() {
    let venue = holding_venue();
    let mut strategy = averaging(&venue, None);
    let cancel = CancelToken::never();
    strategy.initialize(&cancel).await.unwrap();

    venue.set_price(Decimal::from(96));
    venue.reject_submissions(1);
    match assert_err!(strategy.tick(&cancel).await) {
        StrategyError::Venue { attempts, source, .. } => {
            assert_eq!(attempts, 1);
            assert!(matches!(source, VenueError::Rejected { .. }));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(venue.submissions().len(), 1);

    let TickOutcome::Traded(buy) = strategy.tick(&cancel).await.unwrap() else {
        panic!("expected a buy with a new token");
    };
    assert_ne!(buy.client_order_id, venue.submissions()[0].client_order_id);
    assert_eq!(venue.accepted().len(), 1);
}

// ============================================================================
// Restart resume
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_restart_resumes_saved_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path());
    let venue = flat_venue();
    let cancel = CancelToken::never();

    let mut first = averaging(&venue, Some(store.clone()));
    first.initialize(&cancel).await.unwrap();
    venue.set_price(Decimal::from(96));
    first.tick(&cancel).await.unwrap();
    first.close().await.unwrap();
    assert_eq!(first.phase(), AveragingPhase::Holding(2));

    let mut second = averaging(&venue, Some(store));
    let entry = second.initialize(&cancel).await.unwrap();

    assert!(entry.is_none());
    assert_eq!(second.phase(), AveragingPhase::Holding(2));
    assert_eq!(second.state().reference_price, Decimal::from(96));
    assert_eq!(venue.accepted().len(), 2);
}

/// Test: a position closed outside the bot gets a fresh entry after restart
#[tokio::test(start_paused = true)]
async fn test_restart_after_external_close_enters_again() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path());
    let venue = flat_venue();
    let cancel = CancelToken::never();

    let mut first = averaging(&venue, Some(store.clone()));
    let first_entry = first.initialize(&cancel).await.unwrap().expect("entry buy");
    first.close().await.unwrap();

    venue.clear_position();

    let mut second = averaging(&venue, Some(store));
    let second_entry = second.initialize(&cancel).await.unwrap().expect("new entry buy");

    assert_ne!(second_entry.client_order_id, first_entry.client_order_id);
    assert_eq!(second.phase(), AveragingPhase::Holding(1));
    assert_eq!(second.state().cycle, 1);
    assert_eq!(venue.accepted().len(), 2);
}

/// Test: a pending order from before a restart is resubmitted with its original token
#[tokio::test(start_paused = true)]
async fn test_pending_intent_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path());
    let venue = holding_venue();
    let cancel = CancelToken::never();

    let mut first = averaging(&venue, Some(store.clone()));
    first.initialize(&cancel).await.unwrap();
    venue.set_price(Decimal::from(96));
    venue.fail_submissions(3);
    assert!(first.tick(&cancel).await.is_err());
    let pending_token = venue.submissions()[0].client_order_id.clone();
    drop(first);

    let mut second = averaging(&venue, Some(store));
    second.initialize(&cancel).await.unwrap();
    assert_eq!(second.phase(), AveragingPhase::Holding(1));

    let TickOutcome::Traded(buy) = second.tick(&cancel).await.unwrap() else {
        panic!("expected the pending buy");
    };
    assert_eq!(buy.client_order_id, pending_token);
    assert_eq!(venue.accepted().len(), 1);
}

// ============================================================================
// Signal strategy
// ============================================================================

struct Scripted(Mutex<Vec<String>>);

impl Scripted {
    fn new(answers: &[&str]) -> Arc<Self> {
        Arc::new(Self(Mutex::new(answers.iter().map(|a| a.to_string()).collect())))
    }
}

#[async_trait]
impl DecisionService for Scripted {
    async fn complete(&self, _request: &CompletionRequest) -> Result<String, DecisionError> {
        let mut answers = self.0.lock().unwrap();
        Ok(if answers.is_empty() { "HOLD".to_string() } else { answers.remove(0) })
    }
}

fn signal_params() -> SignalSettings {
    SignalSettings {
        position_percent: Decimal::from(10),
        max_leverage: 3,
        primary_timeframe: Timeframe::Minute15,
        primary_lookback: 20,
        higher_timeframe: Timeframe::Hour4,
        higher_lookback: 10,
        take_profit_percent: None,
        stop_loss_percent: None,
    }
}

fn decision_params() -> DecisionParams {
    DecisionParams {
        model: "test-model".to_string(),
        max_tokens: 128,
        timeout: Duration::from_secs(5),
        retry: fast_retry(),
    }
}

/// Test: executed decisions land in the journal with the raw response
#[tokio::test(start_paused = true)]
async fn test_signal_decisions_are_journaled() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal").join("decisions.jsonl");
    let journal: Arc<dyn DecisionLog> = Arc::new(JsonlJournal::new(&path));
    let venue = flat_venue();
    let decision = Scripted::new(&[
        "ACTION: BUY\nLEVERAGE: 10\nTAKE_PROFIT: 110\nSTOP_LOSS: 95\nREASON: breakout",
        "HOLD",
        "SELL",
    ]);

    let mut strategy = SignalStrategy::new(
        "sig",
        pair(),
        MarketKind::Margin,
        1,
        signal_params(),
        deps(venue.clone(), None),
        decision,
        decision_params(),
    )
    .unwrap()
    .with_journal(Some(journal));
    let cancel = CancelToken::never();
    strategy.initialize(&cancel).await.unwrap();

    let TickOutcome::Traded(open) = strategy.tick(&cancel).await.unwrap() else {
        panic!("expected the long entry");
    };
    // 10% of 1000 at 3x (clamped from 10x) and price 100
    assert_eq!(open.amount, Decimal::from(3));
    assert_eq!(venue.leverage(), Some(3));

    assert_eq!(strategy.tick(&cancel).await.unwrap(), TickOutcome::no_data("hold"));

    venue.set_price(Decimal::from(105));
    let TickOutcome::Traded(close) = strategy.tick(&cancel).await.unwrap() else {
        panic!("expected the exit");
    };
    assert_eq!(close.action, Action::Sell);
    assert_eq!(close.amount, Decimal::from(3));

    let contents = std::fs::read_to_string(&path).unwrap();
    let records: Vec<DecisionRecord> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 2);

    assert_eq!(records[0].action, Action::Buy);
    assert_eq!(records[0].leverage, 3);
    assert_eq!(records[0].take_profit, Some(Decimal::from(110)));
    assert_eq!(records[0].stop_loss, Some(Decimal::from(95)));
    assert_eq!(records[0].rationale.as_deref(), Some("breakout"));
    assert_eq!(records[0].client_order_id, open.client_order_id);
    assert!(records[0].raw_response.contains("LEVERAGE: 10"));

    assert_eq!(records[1].action, Action::Sell);
    assert_eq!(records[1].price, Decimal::from(105));
    assert_eq!(records[1].client_order_id, close.client_order_id);
}

// ============================================================================
// Runner
// ============================================================================

/// Test: the runner performs the entry, ticks on schedule and reports a summary
#[tokio::test(start_paused = true)]
async fn test_runner_drives_averaging_bot() {
    let venue = flat_venue();
    let strategy = averaging(&venue, None);
    let runner = BotRunner::new(Box::new(strategy), Duration::from_secs(60));
    let (handle, token) = shutdown::channel();
    let task = tokio::spawn(runner.run(token));

    // Let initialization buy at 100, then drop the price before the first tick
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(venue.accepted().len(), 1);
    venue.set_price(Decimal::from(96));

    tokio::time::sleep(Duration::from_secs(90)).await;
    handle.cancel();
    let summary = assert_ok!(task.await.unwrap());

    assert_eq!(summary.ticks, 1);
    assert_eq!(summary.trades, 2);
    assert_eq!(summary.failed_ticks, 0);
    assert_eq!(venue.accepted().len(), 2);
}

// ============================================================================
// Shipped configuration
// ============================================================================

/// Test: the example config validates and builds one strategy per bot
#[tokio::test]
async fn test_example_config_builds_every_bot() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/bot.toml");
    let settings = assert_ok!(Settings::load(&path));
    assert_ok!(settings.validate());
    assert!(settings.has_signal_bots());

    let factory = VenueFactory::new(settings.paper.clone());
    let decision: Arc<dyn DecisionService> = Scripted::new(&[]);
    for bot in &settings.bots {
        let deps = StrategyDeps {
            ports: assert_ok!(factory.ports(&bot.venue).await),
            retry: settings.retry,
            confirm: settings.confirm_policy(),
            store: None,
        };
        let built = assert_ok!(strategy::build(bot, &settings, deps, Some(decision.clone()), None));
        assert_eq!(built.name(), bot.name);
        assert_eq!(built.pair(), &bot.pair);
    }
}
