//! MixedWorld sync peer agent.
//!
//! Connects to the broker, announces itself in the shared peer registry and
//! tracks the liveness of every other peer.

mod config;
mod directory;
mod runtime;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting MixedWorld sync agent");

    let config = config::AgentConfig::from_env()?;
    tracing::info!(main_topic = %config.sync.main_topic, tick = ?config.sync.tick, "Loaded configuration");

    let agent = runtime::Agent::new(config);
    agent.run().await?;

    Ok(())
}
