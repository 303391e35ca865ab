//! Pong Game Server
//!
//! Standalone server with an in-memory record store.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pong_server::{AppConfig, GameServer, InMemoryGateway, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pong_server=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    info!("Pong Server v{}", VERSION);
    info!(
        "Tick Rate: {} Hz, first to {} wins",
        config.session.tick_rate, config.session.win_score
    );
    if !config.auth.is_configured() {
        warn!("No AUTH_SECRET or AUTH_PUBLIC_KEY_PEM set; every connection is anonymous");
    }

    let server = Arc::new(GameServer::new(config, Arc::new(InMemoryGateway::new())));

    let runner = server.clone();
    let mut serve = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut serve => {
            result.context("server task failed")??;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("Shutting down");
            server.shutdown();
            serve.await.context("server task failed")??;
        }
    }

    Ok(())
}
