//! Swarmcast headless daemon: index a shared folder, serve it to the swarm,
//! announce over broadcast discovery, optionally run the autonomous bot.

mod bot;
mod config;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use swarmcast_core::download::{DownloadObserver, ProgressEvent};
use swarmcast_core::{
    bind_in_range, generate_peer_id, DiscoveryService, FileCatalog, PeerRegistry, TransferClient,
    TransferService, COMMAND_PORT_RANGE,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "swarmcastd", version, about)]
struct Args {
    /// Run without a UI (the daemon is always headless; accepted for
    /// compatibility with launcher scripts).
    #[arg(long)]
    headless: bool,
    /// Start the autonomous search/download bot. Implies --headless.
    #[arg(long)]
    bot: bool,
    /// Shared folder to index and serve (overrides config).
    #[arg(long)]
    root: Option<std::path::PathBuf>,
    /// Buffer folder downloads are written to (overrides config).
    #[arg(long)]
    buffer: Option<std::path::PathBuf>,
}

/// Progress sink for headless runs: everything goes to the log.
struct LogObserver;

impl DownloadObserver for LogObserver {
    fn on_progress(&self, event: ProgressEvent) {
        info!(
            file = %event.file_name,
            source = %event.source,
            detail = %event.detail,
            phase = ?event.phase,
            "progress"
        );
    }

    fn on_log(&self, line: &str) {
        info!("{line}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    if args.headless || args.bot {
        info!("starting in headless mode");
    }
    let mut cfg = config::load();
    if let Some(root) = args.root {
        cfg.root = root;
    }
    if let Some(buffer) = args.buffer {
        cfg.buffer = Some(buffer);
    }

    let buffer_dir = cfg.buffer_dir();
    std::fs::create_dir_all(&buffer_dir)
        .with_context(|| format!("buffer folder {} unusable", buffer_dir.display()))?;

    let catalog = Arc::new(FileCatalog::new(&cfg.root));
    let indexed = catalog
        .scan()
        .with_context(|| format!("root folder {} unusable", cfg.root.display()))?;
    info!(root = %cfg.root.display(), files = indexed, "catalog ready");

    let peer_id = generate_peer_id();
    let registry = Arc::new(PeerRegistry::new());

    let (listener, command_port) = bind_in_range(COMMAND_PORT_RANGE)
        .await
        .context("no free command port")?;
    let transfer = TransferService::new(catalog.clone());
    transfer.start(listener).await;

    let discovery = DiscoveryService::with_port(
        peer_id.clone(),
        command_port,
        cfg.discovery_port,
        registry.clone(),
    );
    discovery.start().await.context("cannot bind discovery port")?;
    info!(id = %peer_id, port = command_port, "network started");

    let bot_task = args.bot.then(|| {
        let client = TransferClient::new(registry.clone());
        tokio::spawn(bot::run_bot(
            catalog.clone(),
            registry.clone(),
            client,
            buffer_dir.clone(),
            Arc::new(LogObserver),
        ))
    });

    shutdown_signal().await?;
    info!("shutting down");
    if let Some(task) = bot_task {
        task.abort();
    }
    discovery.stop().await;
    transfer.stop().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
