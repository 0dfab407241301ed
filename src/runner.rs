//! Bot Runner - per-bot tick loop and the supervisor that runs every bot

use std::fmt;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{RunnerError, StrategyError};
use crate::shutdown::{CancelHandle, CancelToken};
use crate::strategy::{BoxedStrategy, TickOutcome};
use crate::types::TradeEvent;

/// Runner lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    Created,
    Initialized,
    Running,
    Stopped,
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerStatus::Created => write!(f, "created"),
            RunnerStatus::Initialized => write!(f, "initialized"),
            RunnerStatus::Running => write!(f, "running"),
            RunnerStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Tick counters reported when a runner stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub trades: u64,
    pub idle_ticks: u64,
    pub failed_ticks: u64,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ticks, {} trades, {} idle, {} failed",
            self.ticks, self.trades, self.idle_ticks, self.failed_ticks
        )
    }
}

/// Drives one strategy: initialize once, tick on a fixed interval, close on cancellation
pub struct BotRunner {
    strategy: BoxedStrategy,
    poll_interval: Duration,
    status: RunnerStatus,
    summary: RunSummary,
}

impl BotRunner {
    pub fn new(strategy: BoxedStrategy, poll_interval: Duration) -> Self {
        Self {
            strategy,
            poll_interval,
            status: RunnerStatus::Created,
            summary: RunSummary::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.strategy.name()
    }

    pub fn status(&self) -> RunnerStatus {
        self.status
    }

    fn set_status(&mut self, status: RunnerStatus) {
        debug!("[{}] Runner {} -> {}", self.strategy.name(), self.status, status);
        self.status = status;
    }

    /// Run until `cancel` fires. Only an initialization failure is an error.
    ///
    /// Ticks run sequentially inside this task, so a slow tick delays the
    /// next one instead of overlapping it.
    pub async fn run(mut self, cancel: CancelToken) -> Result<RunSummary, RunnerError> {
        let bot = self.strategy.name().to_string();
        info!("[{}] Initializing on {}", bot, self.strategy.pair());

        match self.strategy.initialize(&cancel).await {
            Ok(entry) => {
                if let Some(event) = entry {
                    self.summary.trades += 1;
                    log_trade(&event);
                }
            }
            Err(StrategyError::Cancelled) => {
                info!("[{}] Cancelled during initialization", bot);
                self.shutdown().await;
                return Ok(self.summary);
            }
            Err(e) => {
                error!("[{}] Initialization failed: {}", bot, e);
                self.set_status(RunnerStatus::Stopped);
                return Err(RunnerError::Initialization { bot, source: e });
            }
        }
        self.set_status(RunnerStatus::Initialized);

        // First tick one full interval after initialization
        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.set_status(RunnerStatus::Running);
        info!("[{}] Running, ticking every {:?}", bot, self.poll_interval);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick(&cancel).await,
            }
        }

        self.shutdown().await;
        Ok(self.summary)
    }

    async fn tick(&mut self, cancel: &CancelToken) {
        self.summary.ticks += 1;
        let outcome = self.strategy.tick(cancel).await;
        let bot = self.strategy.name();

        match outcome {
            Ok(TickOutcome::NoData(reason)) => {
                self.summary.idle_ticks += 1;
                debug!("[{}] No action: {}", bot, reason);
            }
            Ok(TickOutcome::Traded(event)) => {
                self.summary.trades += 1;
                log_trade(&event);
            }
            Err(StrategyError::Cancelled) => {
                debug!("[{}] Tick cancelled", bot);
            }
            Err(e) => {
                self.summary.failed_ticks += 1;
                warn!("[{}] Tick failed: {}", bot, e);
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.strategy.close().await {
            warn!("[{}] Close failed: {}", self.strategy.name(), e);
        }
        self.set_status(RunnerStatus::Stopped);
        info!("[{}] Stopped: {}", self.strategy.name(), self.summary);
    }
}

fn log_trade(event: &TradeEvent) {
    info!(
        bot = %event.bot,
        pair = %event.pair,
        action = %event.action,
        amount = %event.amount,
        price = %event.price,
        client_order_id = %event.client_order_id,
        timestamp = %event.timestamp,
        "💹 Trade executed"
    );
}

/// Run every bot until `handle` is cancelled.
///
/// The first initialization failure cancels the remaining bots and is returned
/// once all of them have stopped.
pub async fn run_bots(
    runners: Vec<BotRunner>,
    handle: CancelHandle,
) -> Result<Vec<(String, RunSummary)>, RunnerError> {
    let mut tasks = JoinSet::new();
    for runner in runners {
        let name = runner.name().to_string();
        let token = handle.token();
        tasks.spawn(async move { (name, runner.run(token).await) });
    }

    let mut summaries = Vec::new();
    let mut failure = None;

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(summary))) => summaries.push((name, summary)),
            Ok((_, Err(e))) => {
                if failure.is_none() {
                    error!("Stopping all bots: {}", e);
                    handle.cancel();
                    failure = Some(e);
                }
            }
            Err(e) => {
                if failure.is_none() {
                    error!("Bot task aborted: {}", e);
                    handle.cancel();
                    failure = Some(RunnerError::Aborted(e.to_string()));
                }
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(summaries),
    }
}
