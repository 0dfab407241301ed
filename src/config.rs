//! Engine configuration - file + environment, validated once at startup

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

use crate::error::ConfigError;
use crate::execution::ConfirmPolicy;
use crate::retry::RetryPolicy;
use crate::types::{MarketKind, Pair, Timeframe};
use crate::venue::VenueKind;

/// Default config file when neither a CLI argument nor `PAIR_BOT_CONFIG` is given
pub const DEFAULT_CONFIG_PATH: &str = "config/bot.toml";

/// Environment variable prefix, nesting separated by `__`
pub const ENV_PREFIX: &str = "PAIR_BOT";

/// Top-level settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineSettings,
    /// Retry policy for venue calls
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub llm: Option<LlmSettings>,
    #[serde(default)]
    pub paper: PaperSettings,
    #[serde(default)]
    pub bots: Vec<BotSettings>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineSettings {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub journal_path: Option<PathBuf>,
    #[serde(default = "default_confirm_poll_interval_ms")]
    pub confirm_poll_interval_ms: u64,
    #[serde(default = "default_confirm_max_polls")]
    pub confirm_max_polls: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            log_level: default_log_level(),
            state_dir: None,
            journal_path: None,
            confirm_poll_interval_ms: default_confirm_poll_interval_ms(),
            confirm_max_polls: default_confirm_max_polls(),
        }
    }
}

fn default_poll_interval_secs() -> u64 { 60 }
fn default_log_level() -> String { "info".to_string() }
fn default_confirm_poll_interval_ms() -> u64 { 1000 }
fn default_confirm_max_polls() -> u32 { 10 }

/// OpenAI-compatible decision service
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmSettings {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_llm_base_url() -> String { "https://api.openai.com/v1".to_string() }
fn default_llm_timeout_secs() -> u64 { 60 }
fn default_llm_max_tokens() -> u32 { 512 }

impl LlmSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Local endpoints (localhost, 127.0.0.1) may run without a key
    fn requires_api_key(&self) -> bool {
        !(self.base_url.contains("localhost") || self.base_url.contains("127.0.0.1"))
    }
}

/// In-memory paper venue
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaperSettings {
    /// Starting balances by currency
    #[serde(default = "default_paper_balances")]
    pub balances: HashMap<String, Decimal>,
    /// Starting prices by pair (`BASE/QUOTE`)
    #[serde(default)]
    pub prices: HashMap<String, Decimal>,
    /// Max relative move per price read, 0 disables the random walk
    #[serde(default)]
    pub volatility: f64,
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self {
            balances: default_paper_balances(),
            prices: HashMap::new(),
            volatility: 0.0,
        }
    }
}

fn default_paper_balances() -> HashMap<String, Decimal> {
    HashMap::from([("USDT".to_string(), Decimal::from(10_000))])
}

/// One configured bot
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BotSettings {
    pub name: String,
    #[serde(default = "default_venue")]
    pub venue: String,
    pub pair: Pair,
    #[serde(default)]
    pub market: MarketKind,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    pub strategy: StrategySettings,
}

fn default_venue() -> String { "paper".to_string() }
fn default_leverage() -> u32 { 1 }

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategySettings {
    Averaging(AveragingSettings),
    Signal(SignalSettings),
}

impl StrategySettings {
    pub fn kind(&self) -> &'static str {
        match self {
            StrategySettings::Averaging(_) => "averaging",
            StrategySettings::Signal(_) => "signal",
        }
    }
}

/// Dollar-cost averaging parameters
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct AveragingSettings {
    /// Share of the quote balance per buy, in percent
    pub percent: Decimal,
    /// Drop from the reference price that triggers another buy, in percent
    pub buy_threshold_percent: Decimal,
    /// Rise from the reference price that triggers the full exit, in percent
    pub sell_threshold_percent: Decimal,
    /// Buy-ins per cycle, the entry included
    pub max_dca_trades: u32,
}

/// Signal-driven strategy parameters
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct SignalSettings {
    /// Share of the quote balance committed as margin, in percent
    pub position_percent: Decimal,
    pub max_leverage: u32,
    #[serde(default = "default_primary_timeframe")]
    pub primary_timeframe: Timeframe,
    #[serde(default = "default_primary_lookback")]
    pub primary_lookback: usize,
    #[serde(default = "default_higher_timeframe")]
    pub higher_timeframe: Timeframe,
    #[serde(default = "default_higher_lookback")]
    pub higher_lookback: usize,
    #[serde(default)]
    pub take_profit_percent: Option<Decimal>,
    #[serde(default)]
    pub stop_loss_percent: Option<Decimal>,
}

fn default_primary_timeframe() -> Timeframe { Timeframe::Minute15 }
fn default_primary_lookback() -> usize { 100 }
fn default_higher_timeframe() -> Timeframe { Timeframe::Hour4 }
fn default_higher_lookback() -> usize { 50 }

impl Settings {
    /// Load from `path`, then overlay `PAIR_BOT__*` environment variables
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Resolve the config path from CLI argument, then `PAIR_BOT_CONFIG`, then the default
    pub fn resolve_path(cli_arg: Option<String>) -> PathBuf {
        cli_arg
            .or_else(|| std::env::var(format!("{}_CONFIG", ENV_PREFIX)).ok())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.engine.poll_interval_secs)
    }

    pub fn confirm_policy(&self) -> ConfirmPolicy {
        ConfirmPolicy {
            poll_interval: Duration::from_millis(self.engine.confirm_poll_interval_ms),
            max_polls: self.engine.confirm_max_polls,
        }
    }

    pub fn log_level(&self) -> Level {
        self.engine.log_level.parse().unwrap_or(Level::INFO)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.engine.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|dir| dir.join("pair-bot"))
                .unwrap_or_else(|| PathBuf::from("state"))
        })
    }

    pub fn has_signal_bots(&self) -> bool {
        self.bots
            .iter()
            .any(|bot| matches!(bot.strategy, StrategySettings::Signal(_)))
    }

    /// Reject configurations that could not run correctly
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.poll_interval_secs == 0 {
            return invalid("engine.poll_interval_secs must be greater than zero");
        }
        if self.engine.log_level.parse::<Level>().is_err() {
            return invalid(format!("unknown log level '{}'", self.engine.log_level));
        }
        if self.engine.confirm_max_polls == 0 {
            return invalid("engine.confirm_max_polls must be at least 1");
        }
        validate_retry("retry", &self.retry)?;
        if self.paper.volatility < 0.0 || self.paper.volatility >= 1.0 {
            return invalid("paper.volatility must be in [0, 1)");
        }
        for pair in self.paper.prices.keys() {
            pair.parse::<Pair>()?;
        }

        if self.bots.is_empty() {
            return invalid("no bots configured");
        }

        let mut names = HashSet::new();
        let mut markets = HashSet::new();
        for bot in &self.bots {
            if bot.name.trim().is_empty() {
                return invalid("bot name must not be empty");
            }
            if !names.insert(bot.name.as_str()) {
                return invalid(format!("duplicate bot name '{}'", bot.name));
            }
            let venue = bot.venue.parse::<VenueKind>()?;
            if !markets.insert((venue.to_string(), bot.pair.clone())) {
                return invalid(format!(
                    "{}: duplicate pair {} on venue {}",
                    bot.name, bot.pair, venue
                ));
            }
            if bot.leverage == 0 {
                return invalid(format!("{}: leverage must be at least 1", bot.name));
            }
            if bot.market == MarketKind::Spot && bot.leverage != 1 {
                return invalid(format!("{}: spot pairs cannot use leverage", bot.name));
            }
            match &bot.strategy {
                StrategySettings::Averaging(averaging) => validate_averaging(&bot.name, averaging)?,
                StrategySettings::Signal(signal) => validate_signal(bot, signal)?,
            }
        }

        if self.has_signal_bots() {
            let llm = match &self.llm {
                Some(llm) => llm,
                None => return invalid("signal bots require an [llm] section"),
            };
            if llm.model.trim().is_empty() {
                return invalid("llm.model must not be empty");
            }
            if llm.timeout_secs == 0 {
                return invalid("llm.timeout_secs must be greater than zero");
            }
            let has_key = llm.api_key.as_deref().map_or(false, |key| !key.trim().is_empty());
            if llm.requires_api_key() && !has_key {
                return invalid("llm.api_key is required (set PAIR_BOT__LLM__API_KEY)");
            }
            validate_retry("llm.retry", &llm.retry)?;
        }

        Ok(())
    }
}

fn invalid<T>(message: impl Into<String>) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid(message.into()))
}

fn validate_retry(section: &str, retry: &RetryPolicy) -> Result<(), ConfigError> {
    if retry.initial_interval_ms == 0 || retry.max_interval_ms < retry.initial_interval_ms {
        return invalid(format!("{}: need 0 < initial_interval_ms <= max_interval_ms", section));
    }
    if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
        return invalid(format!("{}: multiplier must be >= 1.0", section));
    }
    if !(0.0..=1.0).contains(&retry.jitter) {
        return invalid(format!("{}: jitter must be in [0, 1]", section));
    }
    Ok(())
}

fn validate_averaging(bot: &str, settings: &AveragingSettings) -> Result<(), ConfigError> {
    if settings.percent <= Decimal::ZERO || settings.percent > Decimal::ONE_HUNDRED {
        return invalid(format!("{}: percent must be in (0, 100]", bot));
    }
    if settings.buy_threshold_percent <= Decimal::ZERO || settings.sell_threshold_percent <= Decimal::ZERO {
        return invalid(format!("{}: thresholds must be positive", bot));
    }
    if settings.max_dca_trades == 0 {
        return invalid(format!("{}: max_dca_trades must be at least 1", bot));
    }
    Ok(())
}

fn validate_signal(bot: &BotSettings, settings: &SignalSettings) -> Result<(), ConfigError> {
    if bot.market == MarketKind::Spot {
        return invalid(format!("{}: the signal strategy requires a margin market", bot.name));
    }
    if settings.max_leverage < 1 {
        return invalid(format!("{}: max_leverage must be at least 1", bot.name));
    }
    if bot.leverage > settings.max_leverage {
        return invalid(format!(
            "{}: leverage {} exceeds max_leverage {}",
            bot.name, bot.leverage, settings.max_leverage
        ));
    }
    if settings.position_percent <= Decimal::ZERO || settings.position_percent > Decimal::ONE_HUNDRED {
        return invalid(format!("{}: position_percent must be in (0, 100]", bot.name));
    }
    if settings.primary_lookback == 0 || settings.higher_lookback == 0 {
        return invalid(format!("{}: lookbacks must be at least 1", bot.name));
    }
    for percent in [settings.take_profit_percent, settings.stop_loss_percent].into_iter().flatten() {
        if percent <= Decimal::ZERO {
            return invalid(format!("{}: stop percentages must be positive", bot.name));
        }
    }
    if settings.stop_loss_percent.map_or(false, |sl| sl >= Decimal::ONE_HUNDRED) {
        return invalid(format!("{}: stop_loss_percent must be below 100", bot.name));
    }
    Ok(())
}
