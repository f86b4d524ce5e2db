//! # huddled
//!
//! The huddle real-time server binary. Loads settings, wires the connection
//! hub and push hub to their collaborators, and serves until signalled.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use huddle_core::memory::InMemoryStore;
use huddle_push::{HttpRelayClient, NoopObserver, PushHub, PushSender};
use huddle_server::HuddleServer;
use huddle_server::websocket::Collaborators;
use huddle_settings::HuddleSettings;

/// Huddle real-time server.
#[derive(Parser, Debug)]
#[command(name = "huddled", about = "Huddle real-time server")]
struct Cli {
    /// Settings file (defaults to `~/.huddle/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,
}

/// Load settings from the CLI path or the default one, then apply flags.
fn resolve_settings(cli: &Cli) -> Result<HuddleSettings> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(huddle_settings::settings_path);
    let mut settings = huddle_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(host) = &cli.host {
        settings.server.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    Ok(settings)
}

/// Start the push hub when push is enabled.
fn start_push(settings: &HuddleSettings, store: &Arc<InMemoryStore>) -> Result<Option<Arc<PushHub>>> {
    if !settings.push.enabled {
        tracing::info!("push notifications disabled");
        return Ok(None);
    }
    let relay = HttpRelayClient::new(&settings.push.server_url, settings.push.request_timeout())
        .context("Failed to build push relay client")?;
    let sender = Arc::new(PushSender::new(
        store.clone(),
        store.clone(),
        Arc::new(relay),
        Arc::new(NoopObserver),
        settings.push.clone(),
    ));
    let hub = PushHub::start(sender, &settings.push);
    tracing::info!(
        relay = %settings.push.server_url,
        shards = settings.push.shard_count,
        "push notifications enabled"
    );
    Ok(Some(Arc::new(hub)))
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
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

    // Settings first: the log level comes from them.
    let settings = resolve_settings(&cli)?;
    huddle_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let metrics = huddle_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    // Sessions, memberships, and unread counts live in process until a
    // persistent store is wired in.
    let store = Arc::new(InMemoryStore::new());
    let push = start_push(&settings, &store)?;

    let server = HuddleServer::new(settings, Collaborators::shared(store), push)
        .with_metrics(metrics);
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        version = %server.settings().server.server_version,
        "huddled listening on http://{addr}"
    );

    shutdown_signal().await?;

    tracing::info!("Shutting down...");
    if !server.stop().await {
        tracing::warn!("shutdown timed out with work still in flight");
    }
    let _ = handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
