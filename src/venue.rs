//! Venue factory - resolves a venue identifier to its port set

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

use crate::config::PaperSettings;
use crate::error::ConfigError;
use crate::paper::PaperVenue;
use crate::ports::{MarketDataSource, PriceSource, TradeExecutor};
use crate::types::Pair;

/// Supported venues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueKind {
    Paper,
}

impl FromStr for VenueKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "paper" => Ok(VenueKind::Paper),
            _ => Err(ConfigError::UnknownVenue(s.to_string())),
        }
    }
}

impl fmt::Display for VenueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VenueKind::Paper => write!(f, "paper"),
        }
    }
}

/// Ports a strategy needs from one venue
#[derive(Clone)]
pub struct VenuePorts {
    pub trade: Arc<dyn TradeExecutor>,
    pub prices: Arc<dyn PriceSource>,
    pub market: Arc<dyn MarketDataSource>,
}

impl VenuePorts {
    /// All three ports backed by one adapter
    pub fn from_adapter<V>(adapter: Arc<V>) -> Self
    where
        V: TradeExecutor + PriceSource + MarketDataSource + 'static,
    {
        Self {
            trade: adapter.clone(),
            prices: adapter.clone(),
            market: adapter,
        }
    }
}

/// Builds venue adapters once and shares them between bots
pub struct VenueFactory {
    paper_settings: PaperSettings,
    paper: OnceCell<Arc<PaperVenue>>,
}

impl VenueFactory {
    pub fn new(paper_settings: PaperSettings) -> Self {
        Self {
            paper_settings,
            paper: OnceCell::new(),
        }
    }

    pub async fn ports(&self, venue: &str) -> Result<VenuePorts, ConfigError> {
        match venue.parse::<VenueKind>()? {
            VenueKind::Paper => {
                let paper = self
                    .paper
                    .get_or_try_init(|| async { self.build_paper().map(Arc::new) })
                    .await?;
                Ok(VenuePorts::from_adapter(Arc::clone(paper)))
            }
        }
    }

    fn build_paper(&self) -> Result<PaperVenue, ConfigError> {
        let mut venue = PaperVenue::new(self.paper_settings.volatility);
        for (currency, amount) in &self.paper_settings.balances {
            venue = venue.with_balance(currency, *amount);
        }
        for (pair, price) in &self.paper_settings.prices {
            let pair: Pair = pair.parse()?;
            if *price <= Decimal::ZERO {
                return Err(ConfigError::Invalid(format!("paper price for {} must be positive", pair)));
            }
            venue = venue.with_price(&pair, *price);
        }
        info!(
            "Paper venue ready with {} balance(s) and {} market(s)",
            self.paper_settings.balances.len(),
            self.paper_settings.prices.len()
        );
        Ok(venue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings() -> PaperSettings {
        PaperSettings {
            balances: HashMap::from([("usdt".to_string(), Decimal::from(500))]),
            prices: HashMap::from([("btc/usdt".to_string(), Decimal::from(100))]),
            volatility: 0.0,
        }
    }

    #[tokio::test]
    async fn test_paper_ports_are_shared() {
        let factory = VenueFactory::new(settings());
        let first = factory.ports("paper").await.unwrap();
        let second = factory.ports("PAPER").await.unwrap();

        let pair: Pair = "BTC/USDT".parse().unwrap();
        first
            .trade
            .execute_action(&pair, crate::types::Action::Buy, Decimal::ONE, "shared")
            .await
            .unwrap();

        // Both bots see the same book
        assert_eq!(second.trade.get_balance("USDT").await.unwrap(), Decimal::from(400));
        assert_eq!(second.prices.current_price(&pair).await.unwrap(), Decimal::from(100));
    }

    #[tokio::test]
    async fn test_unknown_venue() {
        let factory = VenueFactory::new(settings());
        assert!(matches!(
            factory.ports("binance").await,
            Err(ConfigError::UnknownVenue(_))
        ));
    }
}
