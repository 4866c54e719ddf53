//! Tandem sync server.
//!
//! Usage: `tandem-server [config.toml]`. The config path may also come from
//! `TANDEM_CONFIG`; `TANDEM_BIND` overrides the bind address.

mod config;

use config::{Settings, BIND_ENV, CONFIG_ENV};
use log::info;
use std::path::PathBuf;
use tandem_sync::SyncServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from);
    let settings = Settings::resolve(path.as_deref(), std::env::var(BIND_ENV).ok())?;
    if let Some(path) = &path {
        info!("Loaded configuration from {}", path.display());
    }

    let server = SyncServer::new(settings.server, settings.engine)?;
    info!(
        "Starting tandem server on {} (policy: {})",
        server.bind_addr(),
        server.engine().policy_name()
    );

    tokio::select! {
        result = server.run() => result.map_err(|e| -> Box<dyn std::error::Error> { e })?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
