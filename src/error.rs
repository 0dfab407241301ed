//! Error types for venue adapters, the decision service and strategies

use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryError;

/// Classifies failures as transient (worth retrying) or terminal
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Failure reported by a trading venue adapter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VenueError {
    #[error("venue transport error: {0}")]
    Transport(String),

    #[error("venue rate limited: {0}")]
    RateLimited(String),

    #[error("order {client_order_id} rejected: {reason}")]
    Rejected {
        client_order_id: String,
        reason: String,
    },

    #[error("unsupported by venue: {0}")]
    Unsupported(String),
}

impl VenueError {
    pub fn rejected(client_order_id: impl Into<String>, reason: impl Into<String>) -> Self {
        VenueError::Rejected {
            client_order_id: client_order_id.into(),
            reason: reason.into(),
        }
    }
}

impl Retryable for VenueError {
    fn is_retryable(&self) -> bool {
        matches!(self, VenueError::Transport(_) | VenueError::RateLimited(_))
    }
}

/// Failure talking to the decision service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecisionError {
    #[error("decision service transport error: {0}")]
    Transport(String),

    #[error("decision service timed out after {0:?}")]
    Timeout(Duration),

    #[error("decision service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid decision service response: {0}")]
    InvalidResponse(String),
}

impl Retryable for DecisionError {
    fn is_retryable(&self) -> bool {
        match self {
            DecisionError::Transport(_) | DecisionError::Timeout(_) => true,
            DecisionError::Status { status, .. } => *status == 429 || *status >= 500,
            DecisionError::InvalidResponse(_) => false,
        }
    }
}

/// Configuration problems, all fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid pair: {0}")]
    InvalidPair(String),

    #[error("unknown venue '{0}'")]
    UnknownVenue(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Failure of a strategy operation (initialize or tick)
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Venue {
        operation: &'static str,
        attempts: u32,
        source: VenueError,
    },

    #[error("decision request failed after {attempts} attempt(s): {source}")]
    Decision {
        attempts: u32,
        source: DecisionError,
    },

    #[error("order {client_order_id} not filled after {polls} poll(s)")]
    Unfilled { client_order_id: String, polls: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid strategy configuration: {0}")]
    Config(String),

    #[error("state persistence failed: {0}")]
    State(String),
}

impl StrategyError {
    /// Convert an exhausted venue retry into a strategy error
    pub fn venue(operation: &'static str, err: RetryError<VenueError>) -> Self {
        match err {
            RetryError::Cancelled => StrategyError::Cancelled,
            RetryError::Failed { attempts, error } => StrategyError::Venue {
                operation,
                attempts,
                source: error,
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StrategyError::Cancelled)
    }
}

impl From<RetryError<DecisionError>> for StrategyError {
    fn from(err: RetryError<DecisionError>) -> Self {
        match err {
            RetryError::Cancelled => StrategyError::Cancelled,
            RetryError::Failed { attempts, error } => StrategyError::Decision {
                attempts,
                source: error,
            },
        }
    }
}

/// Failure that stops the whole engine
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("bot '{bot}' failed to initialize: {source}")]
    Initialization {
        bot: String,
        source: StrategyError,
    },

    #[error("bot task aborted: {0}")]
    Aborted(String),
}
