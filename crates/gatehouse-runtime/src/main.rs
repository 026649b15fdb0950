//! Gatehouse runtime — entry point.
//!
//! Binds the WebSocket endpoint external client processes connect to and
//! runs the authentication handshake over it: sponsored token registration,
//! file challenges, verification, and the per-message gate.
//!
//! # Usage
//!
//! ```text
//! gatehouse-runtime [OPTIONS]
//!
//! Options:
//!   --port          <PORT>  WebSocket listener port [default: from config]
//!   --challenge-dir <DIR>   Directory for challenge files [default: from config]
//! ```
//!
//! Settings come from the TOML config file in the platform config directory;
//! CLI arguments and the `GATEHOUSE_PORT` / `GATEHOUSE_CHALLENGE_DIR`
//! environment variables override it.  Log verbosity follows `RUST_LOG`,
//! falling back to the configured level.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatehouse_core::EventBus;
use gatehouse_runtime::application::{
    AppRegistry, AuthProtocol, ClientLookup, Dispatcher, InMemoryProcessTracker, LicenseReporter,
    LogLicenseReporter, PendingAuthStore, ProcessTracker,
};
use gatehouse_runtime::infrastructure::network::SocketServer;
use gatehouse_runtime::infrastructure::storage::config::load_config;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Gatehouse runtime.
///
/// Accepts WebSocket connections from external client processes and runs the
/// authentication handshake before any other API traffic is admitted.
#[derive(Debug, Parser)]
#[command(
    name = "gatehouse-runtime",
    about = "Authentication runtime for external client connections",
    version
)]
struct Cli {
    /// TCP port for the WebSocket endpoint; overrides the configured port.
    #[arg(long, env = "GATEHOUSE_PORT")]
    port: Option<u16>,

    /// Directory challenge files are written to; overrides the configured
    /// directory.
    #[arg(long, env = "GATEHOUSE_CHALLENGE_DIR")]
    challenge_dir: Option<PathBuf>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.runtime.log_level)),
        )
        .init();

    let port = cli.port.unwrap_or(config.network.socket_port);
    let challenge_dir = cli
        .challenge_dir
        .unwrap_or_else(|| config.auth.challenge_dir());

    info!("gatehouse runtime starting on port {port}");

    let bus = EventBus::new();
    let store = PendingAuthStore::new(bus.clone());
    let registry = AppRegistry::new(bus.clone());
    let (server, events) = SocketServer::new(bus);
    let server = Arc::new(server);

    let protocol = Arc::new(AuthProtocol::new(
        store,
        registry.clone(),
        Arc::clone(&server) as Arc<dyn ClientLookup>,
        Arc::new(InMemoryProcessTracker::new()) as Arc<dyn ProcessTracker>,
        Arc::new(LogLicenseReporter) as Arc<dyn LicenseReporter>,
        challenge_dir,
    ));
    let dispatcher = Dispatcher::new(
        protocol,
        registry,
        Arc::clone(&server) as Arc<dyn ClientLookup>,
    );
    let dispatch_task = tokio::spawn(dispatcher.run(events));

    server
        .start(port)
        .await
        .context("failed to start socket server")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("received Ctrl+C, shutting down");

    server.shutdown();
    dispatch_task.abort();

    info!("gatehouse runtime stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
