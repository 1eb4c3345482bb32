//! fleetd - fleet control plane server
//!
//! Composition root: loads configuration, initializes storage, wires the
//! services together, and runs the HTTP/WebSocket server alongside the queue
//! workers.

use anyhow::{Context, Result};
use clap::Parser;
use fleetd::processor::run_queue_maintenance;
use fleetd::router::LoggingTelemetrySink;
use fleetd::{
    AppConfig, AppState, ConfigPushManager, ConnectionAuthenticator, ConnectionManager,
    DatabaseConnection, HostStore, InboundProcessor, ProcessorConfig, ServerMessageQueue,
    build_router,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "fleetd", about = "Fleet control plane server", version)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration file
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fleetd=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref()).context("loading configuration")?;
    let listen = args.listen.unwrap_or_else(|| config.server.listen.clone());

    info!(
        database = %config.database.path,
        listen = %listen,
        "starting fleetd"
    );

    let db = DatabaseConnection::initialize(Path::new(&config.database.path))
        .await
        .context("initializing database")?;
    let pool = db.pool().clone();

    let connections = Arc::new(ConnectionManager::new());
    let queue = Arc::new(ServerMessageQueue::new(pool.clone()));
    let hosts = Arc::new(HostStore::new(pool.clone()));
    let auth = Arc::new(ConnectionAuthenticator::new(config.auth.clone()));
    let config_push = Arc::new(ConfigPushManager::new());
    let telemetry = Arc::new(LoggingTelemetrySink);

    let processor = Arc::new(InboundProcessor::new(
        pool.clone(),
        queue.as_ref().clone(),
        hosts.as_ref().clone(),
        connections.clone(),
        config_push.clone(),
        telemetry.clone(),
        ProcessorConfig::from_app_config(&config),
    ));
    tokio::spawn(processor.run());
    tokio::spawn(run_queue_maintenance(
        queue.as_ref().clone(),
        config.message_queue.cleanup_after_days,
    ));

    let state = AppState {
        pool,
        connections,
        queue,
        hosts,
        auth,
        config_push,
        telemetry,
    };
    let app = build_router(state);

    let addr: SocketAddr = listen.parse().context("parsing listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "fleetd listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("serving")?;

    Ok(())
}
