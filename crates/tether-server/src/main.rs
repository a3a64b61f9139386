//! # tether-server
//!
//! Standalone tether server binary.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tether_core::logging::{init_json_subscriber, init_subscriber};
use tether_server::Server;
use tether_server::metrics::install_recorder;
use tether_settings::{TetherSettings, load_settings_from_path, settings_path};

/// tether real-time messaging server.
#[derive(Parser, Debug)]
#[command(name = "tether-server", about = "tether real-time messaging server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file. Defaults to `~/.tether/settings.json`.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn apply(&self, settings: &mut TetherSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let path = args.settings.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    args.apply(&mut settings);

    if settings.logging.json {
        init_json_subscriber(&settings.logging.level);
    } else {
        init_subscriber(&settings.logging.level);
    }

    let metrics = install_recorder().context("Failed to install metrics recorder")?;
    let server = Server::builder(settings.server).metrics(metrics).build();
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        "tether server listening on ws://{addr}{}",
        server.settings().path
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.close(Some(handle)).await;
    tracing::info!("Shutdown complete");
    Ok(())
}
