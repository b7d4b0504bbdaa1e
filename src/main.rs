mod config;
mod dispatcher;
mod error;
mod meal;
mod platform;
mod update;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{BotMode, Config};
use crate::dispatcher::{Dispatcher, HandlerRegistry};
use crate::meal::{Ledger, MealBook};
use crate::platform::telegram::{self, TelegramTransport};
use crate::platform::webhook;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional; real environment variables win
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mealbot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    match &config_path {
        Some(path) => info!("Loading configuration from: {}", path.display()),
        None => info!("Loading configuration from environment"),
    }
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;

    info!("Configuration loaded successfully");
    info!("  Mode: {}", config.telegram.mode);
    info!("  Dedup window: {}", config.dispatcher.dedup_window);
    info!("  Ledger: {}", config.ledger.path.display());

    let bot = telegram::build_bot(&config.telegram)?;
    let transport = Arc::new(TelegramTransport::new(bot.clone()));

    let ledger = Ledger::open(&config.ledger.path)?;
    let book = MealBook::new(ledger);

    let mut registry = HandlerRegistry::with_defaults();
    meal::register(&mut registry, &book)?;

    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        &config.dispatcher,
        config.delivery.clone(),
        transport,
    )?);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    info!("Bot is starting...");
    let intake = match config.telegram.mode {
        BotMode::Polling => {
            telegram::run_polling(
                bot,
                dispatcher.clone(),
                config.telegram.poll_timeout_secs,
                shutdown,
            )
            .await
        }
        BotMode::Webhook => {
            if let Some(url) = &config.server.webhook_url {
                telegram::register_webhook(&bot, url, config.server.webhook_secret.as_deref())
                    .await?;
            }
            let app = webhook::router(dispatcher.clone(), config.server.webhook_secret.clone());
            webhook::serve(config.server.listen_addr(), app, shutdown).await
        }
    };

    // Drain in-flight work even if intake failed
    if !dispatcher.shutdown(config.dispatcher.shutdown_grace()).await {
        warn!("Exiting with updates still in flight");
    }

    intake?;
    info!("Bot stopped");
    Ok(())
}
