//! Reference sync backend.
//!
//! Configuration comes from `ENTSYNC_*` environment variables, logging
//! from `RUST_LOG` (default `info`).

use entsync_channel::server::{ServerConfig, SyncServer};
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    info!(
        "Starting entsync server on {} (topics: {})",
        config.bind_addr,
        config
            .allowed_topics
            .as_ref()
            .map_or_else(|| "any".to_string(), |topics| topics.join(", "))
    );

    SyncServer::new(config).run().await?;
    Ok(())
}
