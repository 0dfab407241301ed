//! Averaging (DCA) strategy
//!
//! Enters once at startup, buys more each time the price drops by the buy
//! threshold from the last reference price, and sells the whole position once
//! the price rises by the sell threshold. A full exit leaves the strategy flat
//! until the next restart.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{StrategyDeps, Strategy, TickOutcome};
use crate::amount::{allocate, dropped_by, percent_change, rose_by};
use crate::config::AveragingSettings;
use crate::error::StrategyError;
use crate::execution::{Fill, OrderExecutor};
use crate::intent::IntentRegistry;
use crate::ports::PriceSource;
use crate::retry::RetryPolicy;
use crate::shutdown::CancelToken;
use crate::state::StateStore;
use crate::types::{Action, Pair, TradeEvent};

/// Where the strategy is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AveragingPhase {
    Uninitialized,
    Flat,
    /// Holding after `n` buy-ins, entry included
    Holding(u32),
}

/// Bookkeeping, persisted after every change
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AveragingState {
    pub trade_count: u32,
    pub reference_price: Decimal,
    pub holding: bool,
    /// Completed exits, part of every decision key
    pub cycle: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedAveraging {
    state: AveragingState,
    intents: IntentRegistry,
}

pub struct AveragingStrategy {
    bot: String,
    pair: Pair,
    params: AveragingSettings,
    prices: Arc<dyn PriceSource>,
    retry: RetryPolicy,
    orders: OrderExecutor,
    store: Option<StateStore>,
    state: AveragingState,
    initialized: bool,
}

impl AveragingStrategy {
    pub fn new(bot: &str, pair: Pair, params: AveragingSettings, deps: StrategyDeps) -> Self {
        Self {
            bot: bot.to_string(),
            pair,
            params,
            prices: deps.ports.prices,
            retry: deps.retry,
            orders: OrderExecutor::new(deps.ports.trade, deps.retry, deps.confirm),
            store: deps.store,
            state: AveragingState::default(),
            initialized: false,
        }
    }

    pub fn phase(&self) -> AveragingPhase {
        if !self.initialized {
            AveragingPhase::Uninitialized
        } else if self.state.holding {
            AveragingPhase::Holding(self.state.trade_count)
        } else {
            AveragingPhase::Flat
        }
    }

    pub fn state(&self) -> &AveragingState {
        &self.state
    }

    fn buy_key(&self, buy_in: u32) -> String {
        format!("{}:{}:buy:{}", self.bot, self.state.cycle, buy_in)
    }

    fn sell_key(&self) -> String {
        format!("{}:{}:sell", self.bot, self.state.cycle)
    }

    async fn current_price(&self, cancel: &CancelToken) -> Result<Decimal, StrategyError> {
        let prices = &self.prices;
        let pair = &self.pair;
        self.retry
            .execute(cancel, || prices.current_price(pair))
            .await
            .map_err(|e| StrategyError::venue("read price", e))
    }

    async fn restore(&self) -> Result<Option<PersistedAveraging>, StrategyError> {
        match &self.store {
            Some(store) => store
                .load(&self.bot)
                .await
                .map_err(|e| StrategyError::State(e.to_string())),
            None => Ok(None),
        }
    }

    /// Save state and intents. A failed write is logged, never fatal.
    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = PersistedAveraging {
            state: self.state.clone(),
            intents: self.orders.intents().clone(),
        };
        if let Err(e) = store.save(&self.bot, &snapshot).await {
            warn!("[{}] Failed to persist state: {}", self.bot, e);
        }
    }

    fn reset(&mut self) {
        self.state = AveragingState {
            cycle: self.state.cycle + 1,
            ..AveragingState::default()
        };
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

    /// Buy `percent` of the quote balance as buy-in number `buy_in`
    async fn buy(&mut self, buy_in: u32, price: Decimal, cancel: &CancelToken) -> Result<Option<TradeEvent>, StrategyError> {
        let balance = self.orders.balance(self.pair.to(), cancel).await?;
        let (value, amount) = allocate(balance, price, self.params.percent);
        if amount <= Decimal::ZERO {
            return Ok(None);
        }

        debug!(
            "[{}] Buy-in {}: {} {} -> {} {}",
            self.bot, buy_in, value, self.pair.to(), amount, self.pair.from()
        );
        let key = self.buy_key(buy_in);
        let result = self.orders.execute(&key, &self.pair, Action::Buy, amount, cancel).await;
        self.persist().await;
        let fill = result?;

        self.state.trade_count = buy_in;
        self.state.reference_price = price;
        self.state.holding = true;
        self.persist().await;

        Ok(Some(self.event(&fill, price)))
    }
}

#[async_trait]
impl Strategy for AveragingStrategy {
    fn name(&self) -> &str {
        &self.bot
    }

    fn pair(&self) -> &Pair {
        &self.pair
    }

    async fn initialize(&mut self, cancel: &CancelToken) -> Result<Option<TradeEvent>, StrategyError> {
        let restored = self.restore().await?;
        let position = self.orders.position(&self.pair, cancel).await?;

        let mut saved_state = None;
        if let Some(persisted) = restored {
            self.orders.set_intents(persisted.intents);
            saved_state = Some(persisted.state);
        }
        // A saved holding with no venue position was closed outside the bot,
        // so the next entry starts a new cycle
        let cycle = match (&saved_state, &position) {
            (Some(state), None) if state.holding => state.cycle + 1,
            (Some(state), _) => state.cycle,
            (None, _) => 0,
        };

        if let Some(position) = position {
            match saved_state.filter(|state| state.holding && state.trade_count > 0) {
                Some(state) => {
                    info!(
                        "[{}] Resuming {} with {} buy-in(s), reference {}",
                        self.bot, self.pair, state.trade_count, state.reference_price
                    );
                    self.state = state;
                }
                None => {
                    let price = self.current_price(cancel).await?;
                    info!(
                        "[{}] Found existing {} position of {}, reference {}",
                        self.bot, self.pair, position.quantity, price
                    );
                    self.state = AveragingState {
                        trade_count: 1,
                        reference_price: price,
                        holding: true,
                        cycle,
                    };
                }
            }
            self.initialized = true;
            self.persist().await;
            return Ok(None);
        }

        self.state = AveragingState {
            cycle,
            ..AveragingState::default()
        };
        let price = self.current_price(cancel).await?;
        if price <= Decimal::ZERO {
            return Err(StrategyError::Config(format!("no valid price for {}", self.pair)));
        }

        let event = self.buy(1, price, cancel).await?;
        if event.is_none() {
            warn!(
                "[{}] No {} available for the entry buy, staying flat",
                self.bot,
                self.pair.to()
            );
        }
        self.initialized = true;
        self.persist().await;
        Ok(event)
    }

    async fn tick(&mut self, cancel: &CancelToken) -> Result<TickOutcome, StrategyError> {
        if !self.state.holding {
            return Ok(TickOutcome::no_data("flat, waiting for restart"));
        }

        let price = self.current_price(cancel).await?;
        if price <= Decimal::ZERO {
            return Ok(TickOutcome::no_data("no valid price"));
        }
        let reference = self.state.reference_price;

        if dropped_by(reference, price, self.params.buy_threshold_percent) {
            if self.state.trade_count >= self.params.max_dca_trades {
                return Ok(TickOutcome::no_data(format!(
                    "max buy-ins reached ({}/{})",
                    self.state.trade_count, self.params.max_dca_trades
                )));
            }
            let next = self.state.trade_count + 1;
            return Ok(match self.buy(next, price, cancel).await? {
                Some(event) => TickOutcome::Traded(event),
                None => TickOutcome::no_data("nothing to allocate"),
            });
        }

        if rose_by(reference, price, self.params.sell_threshold_percent) {
            let held = self
                .orders
                .position(&self.pair, cancel)
                .await?
                .map(|position| position.quantity)
                .unwrap_or_default();

            if held <= Decimal::ZERO {
                warn!(
                    "[{}] Venue reports no {} holdings, resetting to flat",
                    self.bot,
                    self.pair.from()
                );
                self.reset();
                self.persist().await;
                return Ok(TickOutcome::no_data("no holdings to sell"));
            }

            let key = self.sell_key();
            let result = self.orders.execute(&key, &self.pair, Action::Sell, held, cancel).await;
            self.persist().await;
            let fill = result?;

            let event = self.event(&fill, price);
            self.reset();
            self.persist().await;
            return Ok(TickOutcome::Traded(event));
        }

        let change = percent_change(reference, price).unwrap_or_default();
        Ok(TickOutcome::no_data(format!(
            "{}% from reference {}",
            change.round_dp(2),
            reference
        )))
    }

    async fn close(&mut self) -> Result<(), StrategyError> {
        self.orders.cleanup_intents();
        self.persist().await;
        Ok(())
    }
}
