//! Warden Daemon - HIPAA compliance appliance
//!
//! Detects drift, heals it, and keeps a signed evidence trail of every fix.

use anyhow::Result;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wardend::config::WardenConfig;
use wardend::daemon::Daemon;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::var_os("WARDEN_CONFIG") {
        Some(path) => WardenConfig::load_from_path(&PathBuf::from(path))?,
        None => WardenConfig::load(),
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.site.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        "Warden Daemon v{} starting for site {}",
        env!("CARGO_PKG_VERSION"),
        config.site.site_id
    );

    let daemon = Daemon::build(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut running = tokio::spawn(daemon.run(shutdown_rx));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Cannot listen for ctrl-c: {}", e);
            }
            info!("Shutting down gracefully");
            let _ = shutdown_tx.send(true);
            running.await??;
        }
        finished = &mut running => {
            finished??;
        }
    }

    Ok(())
}
