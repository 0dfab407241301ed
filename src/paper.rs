//! Paper venue - in-memory balances, positions and prices
//!
//! Implements every port so the engine runs end-to-end without a real venue.
//! Orders fill immediately at the last price; each client order id is
//! executed at most once.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::amount::truncate_amount;
use crate::error::VenueError;
use crate::ports::{MarketDataSource, PriceSource, TradeExecutor};
use crate::types::{Action, MarketCandle, OrderFill, Pair, Position, PositionSide, Timeframe};

/// Price samples kept per pair
const HISTORY_LIMIT: usize = 5_000;

/// Executed orders are remembered this long for resubmission checks.
/// Longer than the intent retention window.
fn order_retention() -> Duration {
    Duration::days(7)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaperOrder {
    pub pair: Pair,
    pub action: Action,
    pub amount: Decimal,
    pub price: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct PaperPosition {
    quantity: Decimal,
    avg_entry: Decimal,
    margin: Decimal,
    leverage: u32,
    take_profit: Option<Decimal>,
    stop_loss: Option<Decimal>,
}

#[derive(Debug, Default)]
struct PaperBook {
    balances: HashMap<String, Decimal>,
    positions: HashMap<Pair, PaperPosition>,
    prices: HashMap<Pair, VecDeque<(DateTime<Utc>, Decimal)>>,
    leverage: HashMap<Pair, u32>,
    orders: HashMap<String, PaperOrder>,
}

impl PaperBook {
    /// Forget orders executed before `cutoff`
    fn prune_orders(&mut self, cutoff: DateTime<Utc>) {
        let before = self.orders.len();
        self.orders.retain(|_, order| order.created_at > cutoff);
        let pruned = before - self.orders.len();
        if pruned > 0 {
            debug!("Pruned {} paper order(s) past retention", pruned);
        }
    }

    fn last_price(&self, pair: &Pair) -> Option<Decimal> {
        self.prices
            .get(pair)
            .and_then(|history| history.back())
            .map(|(_, price)| *price)
    }

    fn record_price(&mut self, pair: &Pair, price: Decimal) {
        let history = self.prices.entry(pair.clone()).or_default();
        history.push_back((Utc::now(), price));
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
    }

    fn buy(&mut self, pair: &Pair, amount: Decimal, price: Decimal, client_order_id: &str) -> Result<(), VenueError> {
        let leverage = self.leverage.get(pair).copied().unwrap_or(1).max(1);
        let margin = amount * price / Decimal::from(leverage);
        let available = self.balances.get(pair.to()).copied().unwrap_or_default();
        if margin > available {
            return Err(VenueError::rejected(
                client_order_id,
                format!("insufficient {} balance: need {}, have {}", pair.to(), margin, available),
            ));
        }
        self.balances.insert(pair.to().to_string(), available - margin);

        match self.positions.get_mut(pair) {
            Some(position) => {
                // Adding to position - compute new average entry
                let total_cost = position.quantity * position.avg_entry + amount * price;
                position.quantity += amount;
                position.avg_entry = total_cost / position.quantity;
                position.margin += margin;
                debug!(
                    "Paper position {} increased to {} (avg {})",
                    pair, position.quantity, position.avg_entry
                );
            }
            None => {
                self.positions.insert(
                    pair.clone(),
                    PaperPosition {
                        quantity: amount,
                        avg_entry: price,
                        margin,
                        leverage,
                        take_profit: None,
                        stop_loss: None,
                    },
                );
            }
        }
        Ok(())
    }

    fn sell(&mut self, pair: &Pair, amount: Decimal, price: Decimal, client_order_id: &str) -> Result<(), VenueError> {
        let position = match self.positions.get_mut(pair) {
            Some(position) if position.quantity >= amount => position,
            Some(position) => {
                return Err(VenueError::rejected(
                    client_order_id,
                    format!("sell of {} exceeds position of {}", amount, position.quantity),
                ))
            }
            None => return Err(VenueError::rejected(client_order_id, format!("no open position on {}", pair))),
        };

        let released = position.margin * amount / position.quantity;
        let pnl = amount * (price - position.avg_entry);
        position.quantity -= amount;
        position.margin -= released;
        let closed = position.quantity.is_zero();

        *self.balances.entry(pair.to().to_string()).or_default() += released + pnl;
        if closed {
            self.positions.remove(pair);
        }
        debug!("Paper sell {} {} realized pnl {}", amount, pair, pnl);
        Ok(())
    }
}

/// In-memory venue shared by every paper bot
#[derive(Debug)]
pub struct PaperVenue {
    book: Mutex<PaperBook>,
    volatility: f64,
}

impl Default for PaperVenue {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl PaperVenue {
    /// `volatility` is the max relative move applied on each price read
    pub fn new(volatility: f64) -> Self {
        Self {
            book: Mutex::new(PaperBook::default()),
            volatility: volatility.max(0.0),
        }
    }

    pub fn with_balance(self, currency: &str, amount: Decimal) -> Self {
        if let Ok(mut book) = self.book.lock() {
            book.balances.insert(currency.to_uppercase(), amount);
        }
        self
    }

    pub fn with_price(self, pair: &Pair, price: Decimal) -> Self {
        self.set_price(pair, price);
        self
    }

    /// Move the market for `pair`
    pub fn set_price(&self, pair: &Pair, price: Decimal) {
        if let Ok(mut book) = self.book.lock() {
            book.record_price(pair, price);
        }
    }

    /// Executed orders, by client order id
    pub fn orders(&self) -> HashMap<String, PaperOrder> {
        self.book
            .lock()
            .map(|book| book.orders.clone())
            .unwrap_or_default()
    }

    fn book(&self) -> Result<MutexGuard<'_, PaperBook>, VenueError> {
        self.book
            .lock()
            .map_err(|_| VenueError::Transport("paper book lock poisoned".to_string()))
    }

    fn random_step(&self, price: Decimal) -> Decimal {
        if self.volatility <= 0.0 {
            return price;
        }
        let step = rand::thread_rng().gen_range(-self.volatility..=self.volatility);
        let factor = Decimal::from_f64(1.0 + step).unwrap_or(Decimal::ONE);
        truncate_amount(price * factor)
    }
}

#[async_trait]
impl TradeExecutor for PaperVenue {
    fn name(&self) -> &str {
        "paper"
    }

    async fn execute_action(
        &self,
        pair: &Pair,
        action: Action,
        amount: Decimal,
        client_order_id: &str,
    ) -> Result<(), VenueError> {
        let mut book = self.book()?;

        if book.orders.contains_key(client_order_id) {
            debug!("Paper order {} already executed, ignoring resubmission", client_order_id);
            return Ok(());
        }
        if amount <= Decimal::ZERO {
            return Err(VenueError::rejected(client_order_id, "amount must be positive"));
        }
        let price = book
            .last_price(pair)
            .ok_or_else(|| VenueError::Unsupported(format!("no paper market for {}", pair)))?;

        match action {
            Action::Buy => book.buy(pair, amount, price, client_order_id)?,
            Action::Sell => book.sell(pair, amount, price, client_order_id)?,
            Action::None => return Err(VenueError::rejected(client_order_id, "nothing to execute")),
        }

        info!("📄 Paper {} {} {} @ {} ({})", action, amount, pair, price, client_order_id);
        let now = Utc::now();
        book.prune_orders(now - order_retention());
        book.orders.insert(
            client_order_id.to_string(),
            PaperOrder {
                pair: pair.clone(),
                action,
                amount,
                price,
                created_at: now,
            },
        );
        Ok(())
    }

    async fn order_filled(&self, client_order_id: &str) -> Result<OrderFill, VenueError> {
        let book = self.book()?;
        match book.orders.get(client_order_id) {
            Some(order) => Ok(OrderFill {
                filled: true,
                filled_amount: order.amount,
            }),
            None => Err(VenueError::rejected(client_order_id, "unknown order")),
        }
    }

    async fn get_balance(&self, currency: &str) -> Result<Decimal, VenueError> {
        let book = self.book()?;
        Ok(book
            .balances
            .get(&currency.to_uppercase())
            .copied()
            .unwrap_or_default())
    }

    async fn get_position(&self, pair: &Pair) -> Result<Option<Position>, VenueError> {
        let book = self.book()?;
        Ok(book.positions.get(pair).map(|position| Position {
            pair: pair.clone(),
            side: PositionSide::Long,
            quantity: position.quantity,
            entry_price: position.avg_entry,
            leverage: position.leverage,
            take_profit: position.take_profit,
            stop_loss: position.stop_loss,
        }))
    }

    async fn set_position_stops(
        &self,
        pair: &Pair,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) -> Result<(), VenueError> {
        let mut book = self.book()?;
        let position = book
            .positions
            .get_mut(pair)
            .ok_or_else(|| VenueError::rejected("", format!("no open position on {}", pair)))?;
        position.take_profit = take_profit;
        position.stop_loss = stop_loss;
        Ok(())
    }

    async fn set_leverage(&self, pair: &Pair, leverage: u32) -> Result<(), VenueError> {
        let mut book = self.book()?;
        book.leverage.insert(pair.clone(), leverage.max(1));
        Ok(())
    }
}

#[async_trait]
impl PriceSource for PaperVenue {
    async fn current_price(&self, pair: &Pair) -> Result<Decimal, VenueError> {
        let mut book = self.book()?;
        let last = book
            .last_price(pair)
            .ok_or_else(|| VenueError::Unsupported(format!("no paper market for {}", pair)))?;
        let price = self.random_step(last);
        if price != last {
            book.record_price(pair, price);
        }
        Ok(price)
    }
}

#[async_trait]
impl MarketDataSource for PaperVenue {
    /// Candles synthesized from recorded price samples, one sample per minute
    async fn candles(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<MarketCandle>, VenueError> {
        let book = self.book()?;
        let history = book
            .prices
            .get(pair)
            .ok_or_else(|| VenueError::Unsupported(format!("no paper market for {}", pair)))?;

        let per_candle = (timeframe.to_seconds() / 60).max(1) as usize;
        let wanted = limit.saturating_mul(per_candle);
        let samples: Vec<_> = history
            .iter()
            .skip(history.len().saturating_sub(wanted))
            .collect();

        Ok(samples
            .chunks(per_candle)
            .filter_map(|chunk| {
                let (open_time, open) = *chunk.first()?;
                let (_, close) = *chunk.last()?;
                let high = chunk.iter().map(|(_, p)| *p).max()?;
                let low = chunk.iter().map(|(_, p)| *p).min()?;
                Some(MarketCandle {
                    open_time: *open_time,
                    open: *open,
                    high,
                    low,
                    close: *close,
                    volume: Decimal::ZERO,
                })
            })
            .collect())
    }
}
