//! Order execution - idempotent submission, fill confirmation and retried venue reads

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Retryable, StrategyError, VenueError};
use crate::intent::{IntentRegistry, TradeIntentState};
use crate::ports::TradeExecutor;
use crate::retry::{RetryError, RetryPolicy};
use crate::shutdown::CancelToken;
use crate::types::{Action, Pair, Position};

/// How long to wait for a submitted order to fill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmPolicy {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for ConfirmPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_polls: 10,
        }
    }
}

/// A confirmed order
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub client_order_id: String,
    pub action: Action,
    pub filled_amount: Decimal,
}

/// Wraps a venue's [`TradeExecutor`] with retries and the intent registry
pub struct OrderExecutor {
    venue: Arc<dyn TradeExecutor>,
    retry: RetryPolicy,
    confirm: ConfirmPolicy,
    intents: IntentRegistry,
}

impl OrderExecutor {
    pub fn new(venue: Arc<dyn TradeExecutor>, retry: RetryPolicy, confirm: ConfirmPolicy) -> Self {
        Self {
            venue,
            retry,
            confirm,
            intents: IntentRegistry::new(),
        }
    }

    /// Replace the registry, e.g. with one restored from disk
    pub fn set_intents(&mut self, intents: IntentRegistry) {
        self.intents = intents;
    }

    pub fn intents(&self) -> &IntentRegistry {
        &self.intents
    }

    pub fn cleanup_intents(&mut self) {
        self.intents.cleanup();
    }

    /// Execute the decision identified by `decision_key`.
    ///
    /// Every submission of the same pending decision carries the same client
    /// order id, so retries and restarts never place a second order.
    pub async fn execute(
        &mut self,
        decision_key: &str,
        pair: &Pair,
        action: Action,
        amount: Decimal,
        cancel: &CancelToken,
    ) -> Result<Fill, StrategyError> {
        let intent = self.intents.open(decision_key, pair, action, amount);
        let client_order_id = intent.client_order_id.to_string();

        if let TradeIntentState::Confirmed { filled_amount } = intent.state {
            debug!("Intent {} already confirmed", client_order_id);
            return Ok(Fill {
                client_order_id,
                action: intent.action,
                filled_amount,
            });
        }

        if intent.state != TradeIntentState::Submitted {
            info!(
                "Submitting {} {} {} via {} (client order id {})",
                intent.action,
                intent.amount,
                pair,
                self.venue.name(),
                client_order_id
            );
            let venue = &self.venue;
            let submitted = self
                .retry
                .execute(cancel, || {
                    venue.execute_action(pair, intent.action, intent.amount, &client_order_id)
                })
                .await;

            if let Err(err) = submitted {
                self.record_failure(decision_key, "submit", &err);
                return Err(StrategyError::venue("submit order", err));
            }
            self.set_state(decision_key, TradeIntentState::Submitted);
        }

        self.await_fill(decision_key, &client_order_id, intent.action, cancel)
            .await
    }

    async fn await_fill(
        &mut self,
        decision_key: &str,
        client_order_id: &str,
        action: Action,
        cancel: &CancelToken,
    ) -> Result<Fill, StrategyError> {
        let max_polls = self.confirm.max_polls.max(1);

        for poll in 1..=max_polls {
            let venue = &self.venue;
            let status = self
                .retry
                .execute(cancel, || venue.order_filled(client_order_id))
                .await;

            match status {
                Ok(fill) if fill.filled => {
                    self.set_state(
                        decision_key,
                        TradeIntentState::Confirmed {
                            filled_amount: fill.filled_amount,
                        },
                    );
                    return Ok(Fill {
                        client_order_id: client_order_id.to_string(),
                        action,
                        filled_amount: fill.filled_amount,
                    });
                }
                Ok(_) => debug!("Order {} not filled yet (poll {}/{})", client_order_id, poll, max_polls),
                Err(err) => {
                    // A rejection here is terminal, anything else leaves the order pending
                    if let RetryError::Failed { error, .. } = &err {
                        if !error.is_retryable() {
                            self.set_state(
                                decision_key,
                                TradeIntentState::Rejected {
                                    reason: error.to_string(),
                                },
                            );
                        }
                    }
                    return Err(StrategyError::venue("confirm fill", err));
                }
            }

            if poll < max_polls {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(StrategyError::Cancelled),
                    _ = tokio::time::sleep(self.confirm.poll_interval) => {}
                }
            }
        }

        warn!("Order {} still unfilled after {} polls", client_order_id, max_polls);
        Err(StrategyError::Unfilled {
            client_order_id: client_order_id.to_string(),
            polls: max_polls,
        })
    }

    fn record_failure(&mut self, decision_key: &str, stage: &str, err: &RetryError<VenueError>) {
        let state = match err {
            RetryError::Failed { error, .. } if !error.is_retryable() => {
                warn!("Order for {} rejected: {}", decision_key, error);
                TradeIntentState::Rejected {
                    reason: error.to_string(),
                }
            }
            other => TradeIntentState::Failed {
                stage: stage.to_string(),
                error: other.to_string(),
            },
        };
        self.set_state(decision_key, state);
    }

    fn set_state(&mut self, decision_key: &str, state: TradeIntentState) {
        if let Err(e) = self.intents.update_state(decision_key, state) {
            warn!("Failed to update intent: {}", e);
        }
    }

    pub async fn balance(&self, currency: &str, cancel: &CancelToken) -> Result<Decimal, StrategyError> {
        let venue = &self.venue;
        self.retry
            .execute(cancel, || venue.get_balance(currency))
            .await
            .map_err(|e| StrategyError::venue("read balance", e))
    }

    pub async fn position(&self, pair: &Pair, cancel: &CancelToken) -> Result<Option<Position>, StrategyError> {
        let venue = &self.venue;
        self.retry
            .execute(cancel, || venue.get_position(pair))
            .await
            .map(|position| position.filter(Position::is_open))
            .map_err(|e| StrategyError::venue("read position", e))
    }

    pub async fn set_stops(
        &self,
        pair: &Pair,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
        cancel: &CancelToken,
    ) -> Result<(), StrategyError> {
        let venue = &self.venue;
        self.retry
            .execute(cancel, || venue.set_position_stops(pair, take_profit, stop_loss))
            .await
            .map_err(|e| StrategyError::venue("set position stops", e))
    }

    pub async fn set_leverage(&self, pair: &Pair, leverage: u32, cancel: &CancelToken) -> Result<(), StrategyError> {
        let venue = &self.venue;
        self.retry
            .execute(cancel, || venue.set_leverage(pair, leverage))
            .await
            .map_err(|e| StrategyError::venue("set leverage", e))
    }
}
