//! Venue-agnostic ports implemented by trading venue adapters

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::VenueError;
use crate::types::{Action, DecisionRecord, MarketCandle, OrderFill, Pair, Position, Timeframe};

/// Order placement and account reads for one venue.
///
/// `execute_action` MUST be idempotent per `client_order_id`: a second call
/// with an id the venue has already accepted returns success without a
/// second side effect.
#[async_trait]
pub trait TradeExecutor: Send + Sync {
    /// Venue name for logging
    fn name(&self) -> &str;

    /// Submit a buy or sell of `amount` base units
    async fn execute_action(
        &self,
        pair: &Pair,
        action: Action,
        amount: Decimal,
        client_order_id: &str,
    ) -> Result<(), VenueError>;

    /// Fill status of a previously submitted order
    async fn order_filled(&self, client_order_id: &str) -> Result<OrderFill, VenueError>;

    /// Free balance of a single currency
    async fn get_balance(&self, currency: &str) -> Result<Decimal, VenueError>;

    /// Current position on `pair`, `None` when flat
    async fn get_position(&self, pair: &Pair) -> Result<Option<Position>, VenueError>;

    /// Attach protective take-profit / stop-loss prices to the open position
    async fn set_position_stops(
        &self,
        pair: &Pair,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) -> Result<(), VenueError>;

    /// Configure leverage before opening a margin position.
    /// Venues without per-pair leverage ignore it.
    async fn set_leverage(&self, _pair: &Pair, _leverage: u32) -> Result<(), VenueError> {
        Ok(())
    }
}

/// Last traded price source
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn current_price(&self, pair: &Pair) -> Result<Decimal, VenueError>;
}

/// Historical candles, ascending by open time, at most `limit` entries
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn candles(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<MarketCandle>, VenueError>;
}

/// Append-only audit sink for executed signal decisions
#[async_trait]
pub trait DecisionLog: Send + Sync {
    async fn append(&self, record: &DecisionRecord) -> anyhow::Result<()>;
}
