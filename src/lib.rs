//! Pair Bot Library
//!
//! Strategy execution engine: per-pair strategies ticked on a fixed interval,
//! venue ports with idempotent order submission, and a retry executor.

pub mod amount;
pub mod config;
pub mod decision;
pub mod error;
pub mod execution;
pub mod intent;
pub mod journal;
pub mod paper;
pub mod ports;
pub mod prompt;
pub mod retry;
pub mod runner;
pub mod shutdown;
pub mod state;
pub mod strategy;
pub mod types;
pub mod venue;

// Re-export main types for convenience
pub use config::{BotSettings, Settings, StrategySettings};
pub use error::{ConfigError, DecisionError, Retryable, RunnerError, StrategyError, VenueError};
pub use execution::{ConfirmPolicy, OrderExecutor};
pub use intent::{IntentRegistry, TradeIntent, TradeIntentState};
pub use ports::{DecisionLog, MarketDataSource, PriceSource, TradeExecutor};
pub use retry::{RetryError, RetryPolicy};
pub use runner::{run_bots, BotRunner, RunSummary, RunnerStatus};
pub use strategy::{Strategy, TickOutcome};
pub use types::{Action, MarketCandle, MarketKind, Pair, Position, PositionSide, TradeEvent};
