//! Trade intent tracking for idempotency
//!
//! One intent exists per logical decision key. Its client order id is reused
//! for every submission of that decision until the venue terminally rejects it.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{Action, Pair};

/// Trade intent states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TradeIntentState {
    Created,
    /// Accepted by the venue, fill not yet confirmed
    Submitted,
    Confirmed { filled_amount: Decimal },
    /// Terminal venue rejection; the next attempt gets a fresh id
    Rejected { reason: String },
    /// Transient failure; the next attempt reuses the same id
    Failed { stage: String, error: String },
}

/// Trade intent for idempotency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub client_order_id: Uuid,
    pub decision_key: String,
    pub pair: Pair,
    pub action: Action,
    /// Base amount of the original decision
    pub amount: Decimal,
    pub state: TradeIntentState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// Intent registry keyed by decision key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRegistry {
    intents: HashMap<String, TradeIntent>,
    #[serde(skip, default = "default_max_age")]
    max_age: Duration,
}

fn default_max_age() -> Duration {
    Duration::hours(24)
}

impl Default for IntentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentRegistry {
    pub fn new() -> Self {
        Self {
            intents: HashMap::new(),
            max_age: default_max_age(),
        }
    }

    /// Open (or resume) the intent for a decision.
    ///
    /// A pending intent for the same key is reused along with its client
    /// order id and original amount. A rejected one is replaced.
    pub fn open(&mut self, decision_key: &str, pair: &Pair, action: Action, amount: Decimal) -> TradeIntent {
        if let Some(existing) = self.intents.get_mut(decision_key) {
            if !matches!(existing.state, TradeIntentState::Rejected { .. }) {
                existing.attempts += 1;
                debug!(
                    "Reusing intent {} for {} (attempt {}, state {:?})",
                    existing.client_order_id, decision_key, existing.attempts, existing.state
                );
                return existing.clone();
            }
            debug!(
                "Previous intent {} for {} was rejected, issuing a new id",
                existing.client_order_id, decision_key
            );
        }

        let intent = TradeIntent {
            client_order_id: Uuid::new_v4(),
            decision_key: decision_key.to_string(),
            pair: pair.clone(),
            action,
            amount,
            state: TradeIntentState::Created,
            attempts: 1,
            created_at: Utc::now(),
        };
        debug!("Created trade intent {} for {}", intent.client_order_id, decision_key);
        self.intents.insert(decision_key.to_string(), intent.clone());
        intent
    }

    /// Get intent by decision key
    pub fn get(&self, decision_key: &str) -> Option<&TradeIntent> {
        self.intents.get(decision_key)
    }

    /// Update intent state
    pub fn update_state(&mut self, decision_key: &str, state: TradeIntentState) -> anyhow::Result<()> {
        if let Some(intent) = self.intents.get_mut(decision_key) {
            debug!(
                "Intent {} state: {:?} -> {:?}",
                intent.client_order_id, intent.state, state
            );
            intent.state = state;
            Ok(())
        } else {
            Err(anyhow::anyhow!("Intent not found: {}", decision_key))
        }
    }

    /// Intents that have not reached a terminal state
    pub fn pending(&self) -> impl Iterator<Item = &TradeIntent> {
        self.intents
            .values()
            .filter(|intent| !finalization_of(&intent.state).is_finalized())
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    /// Drop finalized intents older than the retention window
    pub fn cleanup(&mut self) {
        let cutoff = Utc::now() - self.max_age;
        let before = self.intents.len();
        self.intents.retain(|_, intent| {
            intent.created_at > cutoff || !finalization_of(&intent.state).is_finalized()
        });
        let stale_pending = self
            .intents
            .values()
            .filter(|intent| intent.created_at <= cutoff)
            .count();
        if stale_pending > 0 {
            warn!("{} pending intent(s) older than the retention window", stale_pending);
        }
        let after = self.intents.len();
        if before != after {
            debug!("Cleaned up {} old intents", before - after);
        }
    }

    /// Get finalization status for an intent
    pub fn finalization(&self, decision_key: &str) -> Option<TradeIntentFinalization> {
        self.intents
            .get(decision_key)
            .map(|intent| finalization_of(&intent.state))
    }
}

fn finalization_of(state: &TradeIntentState) -> TradeIntentFinalization {
    match state {
        TradeIntentState::Confirmed { filled_amount } => TradeIntentFinalization::Confirmed {
            filled_amount: *filled_amount,
        },
        TradeIntentState::Rejected { reason } => TradeIntentFinalization::Rejected {
            reason: reason.clone(),
        },
        _ => TradeIntentFinalization::Pending,
    }
}

/// Finalization status for an intent
#[derive(Debug, Clone, PartialEq)]
pub enum TradeIntentFinalization {
    Pending,
    Confirmed { filled_amount: Decimal },
    Rejected { reason: String },
}

impl TradeIntentFinalization {
    pub fn is_finalized(&self) -> bool {
        !matches!(self, TradeIntentFinalization::Pending)
    }
}
