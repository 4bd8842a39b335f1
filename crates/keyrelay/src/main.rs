//! # keyrelay
//!
//! Relay server binary: loads settings, opens the broker session and serves
//! HTTP/WebSocket clients until SIGINT or SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use keyrelay_broker::{MemoryBroker, SessionManager};
use keyrelay_relay::Relay;
use keyrelay_server::config::{ServerConfig, relay_config};
use keyrelay_server::rpc::handlers::register_all;
use keyrelay_server::rpc::registry::MethodRegistry;
use keyrelay_server::server::KeyRelayServer;
use keyrelay_settings::KeyRelaySettings;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{info, warn};

/// Broker session relay.
#[derive(Parser, Debug)]
#[command(name = "keyrelay", about = "Broker session relay for WebSocket and HTTP clients")]
struct Cli {
    /// Settings file (defaults to `~/.keyrelay/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Broker locator, e.g. `mem://local`.
    #[arg(long)]
    locator: Option<String>,

    /// Log level or `EnvFilter` directive.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Layer flags over loaded settings.
    fn apply(&self, settings: &mut KeyRelaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(locator) = &self.locator {
            settings.broker.locator.clone_from(locator);
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

fn load(cli: &Cli) -> Result<KeyRelaySettings> {
    let mut settings = match &cli.config {
        Some(path) => keyrelay_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => keyrelay_settings::load_settings().context("Failed to load settings")?,
    };
    cli.apply(&mut settings);
    settings.validate().context("Invalid command-line override")?;
    Ok(settings)
}

/// Wire broker, relay and RPC methods into a server.
fn build(settings: &KeyRelaySettings, metrics: PrometheusHandle) -> Result<KeyRelayServer> {
    let broker = if settings.broker.storage {
        MemoryBroker::with_storage()
    } else {
        MemoryBroker::new()
    };
    let session = SessionManager::new(Arc::new(broker));
    let relay = Relay::new(
        session,
        relay_config(settings).context("Invalid relay key expression")?,
    );

    let config = ServerConfig::from_settings(settings);
    let mut registry = MethodRegistry::new().with_timeout(config.rpc_timeout);
    register_all(&mut registry);

    Ok(KeyRelayServer::new(
        config,
        relay,
        registry,
        metrics,
    ))
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;
    keyrelay_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let metrics = keyrelay_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;
    let server = build(&settings, metrics)?;

    if settings.broker.connect_on_start {
        if let Err(error) = server.relay().connect().await {
            warn!(
                locator = %settings.broker.locator,
                %error,
                "initial broker connect failed; use POST /connect to retry"
            );
        }
    }

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    info!(
        %addr,
        locator = %settings.broker.locator,
        methods = server.registry().methods().len(),
        "keyrelay listening"
    );

    shutdown_signal().await?;

    info!("Shutting down...");
    server.shutdown().stop(vec![handle], None).await;
    info!("Shutdown complete");
    Ok(())
}
