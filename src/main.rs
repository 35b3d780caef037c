//! idle-portald - D-Bus portal daemon for idle-time queries.
//!
//! Mediates access to the privileged idle-monitor backend on behalf of
//! sandboxed applications, enforcing a per-application permission policy
//! and routing watch events back to the clients that own them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use idle_portald::backend::{IdleBackend, PortalIdleBackend};
use idle_portald::config::Config;
use idle_portald::permissions::{DbusPermissionStore, PermissionStore};
use idle_portald::portal;
use idle_portald::request::RequestRegistry;
use idle_portald::service::IdleMonitorService;
use idle_portald::watch::WatchRouter;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use zbus::Connection;

/// Idle-monitor portal daemon.
///
/// Sits between sandboxed clients and the trusted idle-monitor backend,
/// checking per-application permissions before any query goes through.
#[derive(Parser, Debug)]
#[command(name = "idle-portald")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override the backend bus name from the config.
    #[arg(long)]
    backend_name: Option<String>,

    /// Replace an existing owner of the portal bus name.
    #[arg(long)]
    replace: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    info!("idle-portald v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config =
        Config::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(backend_name) = args.backend_name {
        config.backend_name = backend_name;
    }
    if args.replace {
        config.replace_existing = true;
    }

    run_daemon(config).await
}

/// Initialize logging with the specified level.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(format!("idle_portald={}", level))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

/// Bring up the portal and serve until shutdown.
async fn run_daemon(config: Config) -> Result<()> {
    let connection = Connection::session()
        .await
        .context("Failed to connect to session bus")?;

    // Without a backend there is no capability to offer; construction
    // failure is fatal, not a degraded mode.
    let backend = PortalIdleBackend::connect(&connection, &config.backend_name)
        .await
        .context("Failed to create idle-monitor backend proxy")?;
    let backend = Arc::new(backend);

    let permissions = DbusPermissionStore::connect(&connection)
        .await
        .context("Failed to connect to the permission store")?;

    let router = Arc::new(WatchRouter::new());
    let watch_task = backend
        .start_watch_forwarding(Arc::clone(&router))
        .await
        .context("Failed to subscribe to backend watch-fired signals")?;

    let service = Arc::new(IdleMonitorService::new(
        Arc::new(RequestRegistry::new()),
        Arc::clone(&backend) as Arc<dyn IdleBackend>,
        Arc::new(permissions) as Arc<dyn PermissionStore>,
        router,
        config.silent_denial,
    ));

    let peer_task = portal::spawn_peer_tracker(&connection, Arc::clone(&service))
        .await
        .context("Failed to watch for vanishing clients")?;

    portal::serve(
        &connection,
        Arc::clone(&service),
        &config.bus_name,
        config.replace_existing,
    )
    .await
    .with_context(|| format!("Failed to acquire bus name {}", config.bus_name))?;

    info!(
        "Serving {} at {} (backend: {})",
        config.bus_name,
        portal::PORTAL_PATH,
        config.backend_name
    );

    wait_for_shutdown().await?;

    info!("Shutting down");
    watch_task.abort();
    peer_task.abort();
    connection
        .release_name(config.bus_name.as_str())
        .await
        .context("Failed to release bus name")?;

    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for SIGINT")?;
            debug!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            debug!("Received SIGTERM");
        }
    }
    Ok(())
}
