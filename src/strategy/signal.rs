//! Signal-driven strategy
//!
//! Asks a text-completion service for BUY / SELL / HOLD on every tick and
//! keeps sizing, leverage bounds and execution local. Long-only, margin pairs only.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{StrategyDeps, Strategy, TickOutcome};
use crate::amount::{allocate_leveraged, offset_price};
use crate::config::SignalSettings;
use crate::decision::{clamp_leverage, parse_decision, CompletionRequest, Decision, DecisionService};
use crate::error::{DecisionError, StrategyError};
use crate::execution::{Fill, OrderExecutor};
use crate::intent::IntentRegistry;
use crate::ports::{DecisionLog, MarketDataSource, PriceSource};
use crate::prompt;
use crate::retry::RetryPolicy;
use crate::shutdown::CancelToken;
use crate::state::StateStore;
use crate::types::{Action, DecisionRecord, MarketCandle, MarketContext, MarketKind, Pair, Position, Timeframe, TradeEvent};

/// Decision request parameters
#[derive(Debug, Clone)]
pub struct DecisionParams {
    pub model: String,
    pub max_tokens: u32,
    /// Per-attempt timeout
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalState {
    pub holding: bool,
    pub entry_price: Decimal,
    pub leverage: u32,
    /// Completed round trips, part of every decision key
    pub cycle: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSignal {
    state: SignalState,
    intents: IntentRegistry,
}

pub struct SignalStrategy {
    bot: String,
    pair: Pair,
    params: SignalSettings,
    default_leverage: u32,
    prices: Arc<dyn PriceSource>,
    market: Arc<dyn MarketDataSource>,
    retry: RetryPolicy,
    orders: OrderExecutor,
    store: Option<StateStore>,
    decision: Arc<dyn DecisionService>,
    request: DecisionParams,
    journal: Option<Arc<dyn DecisionLog>>,
    state: SignalState,
}

impl SignalStrategy {
    /// Fails for spot pairs
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bot: &str,
        pair: Pair,
        market: MarketKind,
        leverage: u32,
        params: SignalSettings,
        deps: StrategyDeps,
        decision: Arc<dyn DecisionService>,
        request: DecisionParams,
    ) -> Result<Self, StrategyError> {
        if market == MarketKind::Spot {
            return Err(StrategyError::Config(format!(
                "{}: the signal strategy only trades margin pairs, {} is spot",
                bot, pair
            )));
        }

        Ok(Self {
            bot: bot.to_string(),
            pair,
            params,
            default_leverage: clamp_leverage(leverage, params.max_leverage),
            prices: deps.ports.prices,
            market: deps.ports.market,
            retry: deps.retry,
            orders: OrderExecutor::new(deps.ports.trade, deps.retry, deps.confirm),
            store: deps.store,
            decision,
            request,
            journal: None,
            state: SignalState::default(),
        })
    }

    pub fn with_journal(mut self, journal: Option<Arc<dyn DecisionLog>>) -> Self {
        self.journal = journal;
        self
    }

    pub fn state(&self) -> &SignalState {
        &self.state
    }

    async fn current_price(&self, cancel: &CancelToken) -> Result<Decimal, StrategyError> {
        let prices = &self.prices;
        let pair = &self.pair;
        self.retry
            .execute(cancel, || prices.current_price(pair))
            .await
            .map_err(|e| StrategyError::venue("read price", e))
    }

    /// Candles for `timeframe`, at most `lookback` of them
    async fn candles(
        &self,
        timeframe: Timeframe,
        lookback: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<MarketCandle>, StrategyError> {
        let market = &self.market;
        let pair = &self.pair;
        let mut candles = self
            .retry
            .execute(cancel, || market.candles(pair, timeframe, lookback))
            .await
            .map_err(|e| StrategyError::venue("read candles", e))?;
        if candles.len() > lookback {
            let excess = candles.len() - lookback;
            candles.drain(..excess);
        }
        Ok(candles)
    }

    /// Call the decision service, each attempt bounded by the request timeout
    async fn ask(&self, request: &CompletionRequest, cancel: &CancelToken) -> Result<String, StrategyError> {
        let decision = &self.decision;
        let timeout = self.request.timeout;
        let raw = self
            .request
            .retry
            .execute(cancel, move || async move {
                match tokio::time::timeout(timeout, decision.complete(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(DecisionError::Timeout(timeout)),
                }
            })
            .await?;
        Ok(raw)
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = PersistedSignal {
            state: self.state.clone(),
            intents: self.orders.intents().clone(),
        };
        if let Err(e) = store.save(&self.bot, &snapshot).await {
            warn!("[{}] Failed to persist state: {}", self.bot, e);
        }
    }

    /// Align bookkeeping with the venue, e.g. after a stop closed the position
    async fn reconcile(&mut self, position: Option<&Position>) {
        match (self.state.holding, position) {
            (true, None) => {
                warn!("[{}] Position on {} closed by the venue", self.bot, self.pair);
                self.state = SignalState {
                    cycle: self.state.cycle + 1,
                    ..SignalState::default()
                };
                self.persist().await;
            }
            (false, Some(position)) => {
                info!(
                    "[{}] Adopting venue position of {} @ {}",
                    self.bot, position.quantity, position.entry_price
                );
                self.state.holding = true;
                self.state.entry_price = position.entry_price;
                self.state.leverage = position.leverage;
                self.persist().await;
            }
            _ => {}
        }
    }

    /// Take-profit and stop-loss for a long entered at `price`
    fn stop_levels(&self, decision: &Decision, price: Decimal) -> (Option<Decimal>, Option<Decimal>) {
        let take_profit = decision
            .take_profit
            .filter(|tp| *tp > price)
            .or_else(|| self.params.take_profit_percent.map(|pct| offset_price(price, pct)));
        let stop_loss = decision
            .stop_loss
            .filter(|sl| *sl < price)
            .or_else(|| self.params.stop_loss_percent.map(|pct| offset_price(price, -pct)));
        (take_profit, stop_loss)
    }

    fn event(&self, fill: &Fill, price: Decimal) -> TradeEvent {
        TradeEvent {
            bot: self.bot.clone(),
            pair: self.pair.clone(),
            action: fill.action,
            amount: fill.filled_amount,
            price,
            client_order_id: fill.client_order_id.clone(),
            timestamp: Utc::now(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn journal(
        &self,
        decision: &Decision,
        raw: &str,
        fill: &Fill,
        price: Decimal,
        leverage: u32,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) {
        let Some(journal) = &self.journal else {
            return;
        };
        let record = DecisionRecord {
            timestamp: Utc::now(),
            bot: self.bot.clone(),
            pair: self.pair.clone(),
            action: fill.action,
            leverage,
            amount: fill.filled_amount,
            price,
            take_profit,
            stop_loss,
            rationale: decision.rationale.clone(),
            client_order_id: fill.client_order_id.clone(),
            raw_response: raw.to_string(),
        };
        if let Err(e) = journal.append(&record).await {
            warn!("[{}] Failed to journal decision: {}", self.bot, e);
        }
    }

    async fn open_long(
        &mut self,
        decision: &Decision,
        raw: &str,
        price: Decimal,
        balance: Decimal,
        cancel: &CancelToken,
    ) -> Result<TickOutcome, StrategyError> {
        let leverage = clamp_leverage(
            decision.leverage.unwrap_or(self.default_leverage),
            self.params.max_leverage,
        );
        let percent = decision
            .size_percent
            .filter(|pct| *pct <= Decimal::ONE_HUNDRED)
            .unwrap_or(self.params.position_percent);
        let (_, amount) = allocate_leveraged(balance, price, percent, leverage);
        if amount <= Decimal::ZERO {
            return Ok(TickOutcome::no_data("nothing to allocate"));
        }

        self.orders.set_leverage(&self.pair, leverage, cancel).await?;
        let key = format!("{}:{}:open", self.bot, self.state.cycle);
        let result = self.orders.execute(&key, &self.pair, Action::Buy, amount, cancel).await;
        self.persist().await;
        let fill = result?;

        self.state.holding = true;
        self.state.entry_price = price;
        self.state.leverage = leverage;

        let (take_profit, stop_loss) = self.stop_levels(decision, price);
        if take_profit.is_some() || stop_loss.is_some() {
            if let Err(e) = self.orders.set_stops(&self.pair, take_profit, stop_loss, cancel).await {
                warn!("[{}] Failed to set protective stops: {}", self.bot, e);
            }
        }
        self.persist().await;
        self.journal(decision, raw, &fill, price, leverage, take_profit, stop_loss)
            .await;

        Ok(TickOutcome::Traded(self.event(&fill, price)))
    }

    async fn close_long(
        &mut self,
        decision: &Decision,
        raw: &str,
        price: Decimal,
        held: Decimal,
        cancel: &CancelToken,
    ) -> Result<TickOutcome, StrategyError> {
        let key = format!("{}:{}:close", self.bot, self.state.cycle);
        let result = self.orders.execute(&key, &self.pair, Action::Sell, held, cancel).await;
        self.persist().await;
        let fill = result?;

        let leverage = self.state.leverage;
        self.state = SignalState {
            cycle: self.state.cycle + 1,
            ..SignalState::default()
        };
        self.persist().await;
        self.journal(decision, raw, &fill, price, leverage, None, None).await;

        Ok(TickOutcome::Traded(self.event(&fill, price)))
    }
}

#[async_trait]
impl Strategy for SignalStrategy {
    fn name(&self) -> &str {
        &self.bot
    }

    fn pair(&self) -> &Pair {
        &self.pair
    }

    async fn initialize(&mut self, cancel: &CancelToken) -> Result<Option<TradeEvent>, StrategyError> {
        let restored: Option<PersistedSignal> = match &self.store {
            Some(store) => store
                .load(&self.bot)
                .await
                .map_err(|e| StrategyError::State(e.to_string()))?,
            None => None,
        };
        if let Some(persisted) = restored {
            self.orders.set_intents(persisted.intents);
            self.state = persisted.state;
        }

        let position = self.orders.position(&self.pair, cancel).await?;
        self.reconcile(position.as_ref()).await;
        info!(
            "[{}] Signal strategy ready on {} ({}, max leverage {}x)",
            self.bot,
            self.pair,
            if self.state.holding { "long" } else { "flat" },
            self.params.max_leverage
        );
        Ok(None)
    }

    async fn tick(&mut self, cancel: &CancelToken) -> Result<TickOutcome, StrategyError> {
        let price = self.current_price(cancel).await?;
        if price <= Decimal::ZERO {
            return Ok(TickOutcome::no_data("no valid price"));
        }

        let primary = self
            .candles(self.params.primary_timeframe, self.params.primary_lookback, cancel)
            .await?;
        let higher = self
            .candles(self.params.higher_timeframe, self.params.higher_lookback, cancel)
            .await?;
        let balance = self.orders.balance(self.pair.to(), cancel).await?;
        let position = self.orders.position(&self.pair, cancel).await?;
        self.reconcile(position.as_ref()).await;

        let held = position.as_ref().map(|p| p.quantity).unwrap_or_default();
        let ctx = MarketContext {
            pair: self.pair.clone(),
            timestamp: Utc::now(),
            current_price: price,
            primary_timeframe: self.params.primary_timeframe,
            primary,
            higher_timeframe: self.params.higher_timeframe,
            higher,
            position,
            quote_balance: balance,
            max_leverage: self.params.max_leverage,
        };
        let request = CompletionRequest {
            system: prompt::SYSTEM_INSTRUCTIONS.to_string(),
            prompt: prompt::render(&ctx),
            model: self.request.model.clone(),
            temperature: 0.0,
            max_tokens: self.request.max_tokens,
        };

        let raw = match self.ask(&request, cancel).await {
            Ok(raw) => raw,
            Err(StrategyError::Decision {
                source: DecisionError::InvalidResponse(reason),
                ..
            }) => {
                warn!("[{}] Unreadable decision response: {}", self.bot, reason);
                return Ok(TickOutcome::no_data("unreadable decision response"));
            }
            Err(e) => return Err(e),
        };

        let Some(decision) = parse_decision(&raw) else {
            warn!("[{}] Unrecognized decision, holding: {:?}", self.bot, raw);
            return Ok(TickOutcome::no_data("unrecognized decision"));
        };
        debug!("[{}] Decision: {:?}", self.bot, decision);

        match (decision.action(), self.state.holding) {
            (Action::Buy, false) => self.open_long(&decision, &raw, price, balance, cancel).await,
            (Action::Sell, true) => self.close_long(&decision, &raw, price, held, cancel).await,
            (Action::Buy, true) => Ok(TickOutcome::no_data("buy signal while already long")),
            (Action::Sell, false) => Ok(TickOutcome::no_data("sell signal while flat")),
            (Action::None, _) => Ok(TickOutcome::no_data("hold")),
        }
    }

    async fn close(&mut self) -> Result<(), StrategyError> {
        self.orders.cleanup_intents();
        self.persist().await;
        Ok(())
    }
}
