//! MatchTalk Server
//!
//! Reads configuration from the environment, builds the collaborators and
//! serves until Ctrl-C.

use anyhow::Context;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use matchtalk::{AppConfig, MatchTalkServer, Storage, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("MatchTalk Server v{}", VERSION);

    if let Err(e) = run().await {
        error!("Fatal: {:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    let storage = Storage::from_config(&config).context("failed to initialise storage")?;
    let server = Arc::new(MatchTalkServer::new(config, storage).context("failed to build server")?);

    let signal_target = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            signal_target.shutdown();
        }
    });

    server.run().await.context("server error")?;
    Ok(())
}
