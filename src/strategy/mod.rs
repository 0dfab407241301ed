//! Strategies - one instance per configured bot, driven by the runner

pub mod averaging;
pub mod signal;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{BotSettings, Settings, StrategySettings};
use crate::decision::DecisionService;
use crate::error::StrategyError;
use crate::execution::ConfirmPolicy;
use crate::ports::DecisionLog;
use crate::retry::RetryPolicy;
use crate::shutdown::CancelToken;
use crate::state::StateStore;
use crate::types::{Pair, TradeEvent};
use crate::venue::VenuePorts;

pub use averaging::{AveragingPhase, AveragingState, AveragingStrategy};
pub use signal::{DecisionParams, SignalState, SignalStrategy};

/// Result of one tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing to do this tick; not an error
    NoData(String),
    /// An order was executed
    Traded(TradeEvent),
}

impl TickOutcome {
    pub fn no_data(reason: impl Into<String>) -> Self {
        TickOutcome::NoData(reason.into())
    }
}

/// A trading strategy bound to one pair.
///
/// # Lifecycle
///
/// 1. `initialize` - called once before the first tick; a failure is fatal
/// 2. `tick` - called on every scheduler interval, never concurrently
/// 3. `close` - called once when the runner stops
#[async_trait]
pub trait Strategy: Send {
    /// Bot name, unique across the engine
    fn name(&self) -> &str;

    fn pair(&self) -> &Pair;

    /// Read venue state and perform any entry trade
    async fn initialize(&mut self, cancel: &CancelToken) -> Result<Option<TradeEvent>, StrategyError>;

    /// One decide-and-act step
    async fn tick(&mut self, cancel: &CancelToken) -> Result<TickOutcome, StrategyError>;

    /// Flush state before shutdown
    async fn close(&mut self) -> Result<(), StrategyError> {
        Ok(())
    }
}

pub type BoxedStrategy = Box<dyn Strategy>;

/// Collaborators shared by every strategy kind
#[derive(Clone)]
pub struct StrategyDeps {
    pub ports: VenuePorts,
    pub retry: RetryPolicy,
    pub confirm: ConfirmPolicy,
    pub store: Option<StateStore>,
}

/// Build the strategy configured for `bot`
pub fn build(
    bot: &BotSettings,
    settings: &Settings,
    deps: StrategyDeps,
    decision: Option<Arc<dyn DecisionService>>,
    journal: Option<Arc<dyn DecisionLog>>,
) -> Result<BoxedStrategy, StrategyError> {
    match &bot.strategy {
        StrategySettings::Averaging(params) => Ok(Box::new(AveragingStrategy::new(
            &bot.name,
            bot.pair.clone(),
            *params,
            deps,
        ))),
        StrategySettings::Signal(params) => {
            let decision = decision.ok_or_else(|| {
                StrategyError::Config(format!("{}: signal strategy needs a decision service", bot.name))
            })?;
            let llm = settings.llm.as_ref().ok_or_else(|| {
                StrategyError::Config(format!("{}: signal strategy needs [llm] settings", bot.name))
            })?;
            let request = DecisionParams {
                model: llm.model.clone(),
                max_tokens: llm.max_tokens,
                timeout: llm.timeout(),
                retry: llm.retry,
            };
            let strategy = SignalStrategy::new(
                &bot.name,
                bot.pair.clone(),
                bot.market,
                bot.leverage,
                *params,
                deps,
                decision,
                request,
            )?
            .with_journal(journal);
            Ok(Box::new(strategy))
        }
    }
}
