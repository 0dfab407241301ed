//! Core types shared by the strategies, the venue ports and the runner.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Trading pair: base asset ("from") priced in the quote asset ("to")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pair {
    from: String,
    to: String,
}

impl Pair {
    /// Build a pair from two asset symbols, normalized to upper case
    pub fn new(from: &str, to: &str) -> Result<Self, ConfigError> {
        let from = normalize_asset(from)?;
        let to = normalize_asset(to)?;
        if from == to {
            return Err(ConfigError::InvalidPair(format!(
                "{}/{}: base and quote must differ",
                from, to
            )));
        }
        Ok(Self { from, to })
    }

    /// Base asset
    pub fn from(&self) -> &str {
        &self.from
    }

    /// Quote asset
    pub fn to(&self) -> &str {
        &self.to
    }

    /// Venue-style concatenated symbol, e.g. `BTCUSDT`
    pub fn symbol(&self) -> String {
        format!("{}{}", self.from, self.to)
    }
}

fn normalize_asset(raw: &str) -> Result<String, ConfigError> {
    let asset = raw.trim().to_uppercase();
    if asset.is_empty() || !asset.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ConfigError::InvalidPair(format!(
            "invalid asset symbol '{}'",
            raw
        )));
    }
    Ok(asset)
}

impl FromStr for Pair {
    type Err = ConfigError;

    /// Accepts `BTC/USDT`, `BTC-USDT` and `BTC_USDT`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(['/', '-', '_']);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(from), Some(to), None) => Pair::new(from, to),
            _ => Err(ConfigError::InvalidPair(format!(
                "'{}' is not of the form BASE/QUOTE",
                s
            ))),
        }
    }
}

impl TryFrom<String> for Pair {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Pair> for String {
    fn from(pair: Pair) -> Self {
        pair.to_string()
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.from, self.to)
    }
}

/// Market type of a configured pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    #[default]
    Spot,
    Margin,
}

impl fmt::Display for MarketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketKind::Spot => write!(f, "spot"),
            MarketKind::Margin => write!(f, "margin"),
        }
    }
}

/// Tick-level decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    None,
    Buy,
    Sell,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::None => write!(f, "none"),
            Action::Buy => write!(f, "buy"),
            Action::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Flat,
    Short,
}

/// Venue-reported position snapshot. Read-only for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub pair: Pair,
    pub side: PositionSide,
    /// Quantity of the base asset
    pub quantity: Decimal,
    /// Average entry price in the quote asset
    pub entry_price: Decimal,
    pub leverage: u32,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.side != PositionSide::Flat && self.quantity > Decimal::ZERO
    }
}

/// Fill status of a submitted order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFill {
    pub filled: bool,
    pub filled_amount: Decimal,
}

/// Record of one executed action, reported to the runner for logging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub bot: String,
    pub pair: Pair,
    pub action: Action,
    /// Filled base amount
    pub amount: Decimal,
    /// Market price observed when the decision was taken
    pub price: Decimal,
    pub client_order_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Candle interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "30m")]
    Minute30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Day1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Minute1 => "1m",
            Timeframe::Minute5 => "5m",
            Timeframe::Minute15 => "15m",
            Timeframe::Minute30 => "30m",
            Timeframe::Hour1 => "1h",
            Timeframe::Hour4 => "4h",
            Timeframe::Day1 => "1d",
        }
    }

    pub fn to_seconds(&self) -> i64 {
        match self {
            Timeframe::Minute1 => 60,
            Timeframe::Minute5 => 300,
            Timeframe::Minute15 => 900,
            Timeframe::Minute30 => 1800,
            Timeframe::Hour1 => 3600,
            Timeframe::Hour4 => 14400,
            Timeframe::Day1 => 86400,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One OHLCV sample. Sequences are ordered by ascending `open_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketCandle {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Market snapshot handed to the decision service
#[derive(Debug, Clone, Serialize)]
pub struct MarketContext {
    pub pair: Pair,
    pub timestamp: DateTime<Utc>,
    pub current_price: Decimal,
    pub primary_timeframe: Timeframe,
    pub primary: Vec<MarketCandle>,
    pub higher_timeframe: Timeframe,
    pub higher: Vec<MarketCandle>,
    pub position: Option<Position>,
    pub quote_balance: Decimal,
    pub max_leverage: u32,
}

/// Audit record for one executed signal decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    pub bot: String,
    pub pair: Pair,
    pub action: Action,
    pub leverage: u32,
    pub amount: Decimal,
    pub price: Decimal,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub rationale: Option<String>,
    pub client_order_id: String,
    /// Raw text returned by the decision service
    pub raw_response: String,
}
