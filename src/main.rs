//! Pair Bot - runs one strategy per configured trading pair
//!
//! 1. Loads and validates settings (file + `PAIR_BOT__*` environment)
//! 2. Builds venue ports and one strategy per bot
//! 3. Ticks every bot until Ctrl-C

use anyhow::Context;
use std::sync::Arc;
use tracing::{error, info};

use pair_bot::config::Settings;
use pair_bot::decision::{ChatCompletionsClient, DecisionService};
use pair_bot::journal::JsonlJournal;
use pair_bot::ports::DecisionLog;
use pair_bot::runner::{run_bots, BotRunner};
use pair_bot::shutdown;
use pair_bot::state::StateStore;
use pair_bot::strategy::{self, StrategyDeps};
use pair_bot::venue::VenueFactory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = Settings::resolve_path(std::env::args().nth(1));
    let settings = Settings::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(settings.log_level())
        .init();

    settings.validate().context("invalid configuration")?;
    info!(
        "Starting Pair Bot with {} bot(s) from {}",
        settings.bots.len(),
        config_path.display()
    );

    let store = StateStore::new(settings.state_dir());
    store.init().await.context("creating state directory")?;
    info!("State directory: {}", store.state_dir().display());

    let journal: Option<Arc<dyn DecisionLog>> = settings
        .engine
        .journal_path
        .as_ref()
        .map(|path| Arc::new(JsonlJournal::new(path)) as Arc<dyn DecisionLog>);

    let decision: Option<Arc<dyn DecisionService>> = match &settings.llm {
        Some(llm) if settings.has_signal_bots() => Some(Arc::new(ChatCompletionsClient::new(
            &llm.base_url,
            llm.api_key.clone(),
            llm.timeout(),
        )?)),
        _ => None,
    };

    let factory = VenueFactory::new(settings.paper.clone());
    let mut runners = Vec::with_capacity(settings.bots.len());
    for bot in &settings.bots {
        let deps = StrategyDeps {
            ports: factory.ports(&bot.venue).await?,
            retry: settings.retry,
            confirm: settings.confirm_policy(),
            store: Some(store.clone()),
        };
        let strategy = strategy::build(bot, &settings, deps, decision.clone(), journal.clone())
            .with_context(|| format!("building bot '{}'", bot.name))?;
        info!(
            "📝 {} [{}] {} on {} ({}, {}x)",
            bot.name,
            bot.strategy.kind(),
            bot.pair,
            bot.venue,
            bot.market,
            bot.leverage
        );
        runners.push(BotRunner::new(strategy, settings.poll_interval()));
    }

    let (handle, _token) = shutdown::channel();
    let ctrl_c = handle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        ctrl_c.cancel();
    });

    let summaries = run_bots(runners, handle).await?;
    for (bot, summary) in summaries {
        info!("[{}] {}", bot, summary);
    }
    info!("Pair Bot stopped");
    Ok(())
}
