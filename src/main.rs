//! Feed runner
//!
//! Loads config.toml (or `CONFIG_PATH`), opens every configured feed and
//! logs their output until Ctrl-C.

use anyhow::Context;
use exchange_ws::infrastructure::logging::init_logging;
use exchange_ws::{Config, FeedEngine, FeedEventKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;
    let _guards = init_logging(&config.logging).context("initializing logging")?;

    if config.feeds.is_empty() {
        tracing::warn!("No feeds configured, nothing to do");
        return Ok(());
    }

    let (mut engine, mut events) = FeedEngine::new(config.transport.clone(), config.engine.clone());
    engine.start(&config.feeds).await?;
    tracing::info!("Running {} feeds", engine.feed_names().len());

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event.kind {
                    FeedEventKind::Text(text) => tracing::info!(feed = %event.feed, "{}", text),
                    FeedEventKind::Binary(data) => {
                        tracing::info!(feed = %event.feed, len = data.len(), "Binary message")
                    }
                    FeedEventKind::Error(e) => tracing::error!(feed = %event.feed, "{}", e),
                    FeedEventKind::Closed => tracing::warn!(feed = %event.feed, "Feed closed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received");
                break;
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
