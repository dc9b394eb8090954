//! # Huddle Server
//!
//! Runs the signaling relay: the `/relay` WebSocket endpoint, the ICE server
//! list, relay stats, and the health probe, plus the presence sweeper that
//! drops connections which stopped heartbeating.

use clap::Parser;
use huddle_gateway::{JwtAuthenticator, RelayState, build_router, spawn_presence_sweeper};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Debug, Parser)]
#[command(name = "huddle", version, about = "Huddle signaling relay")]
struct Cli {
    /// Address to bind, overriding `server.host`
    #[arg(long, env = "HUDDLE_HOST")]
    host: Option<String>,

    /// Port to bind, overriding `server.port`
    #[arg(long, env = "HUDDLE_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = huddle_common::config::load()?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("Starting Huddle relay v{}", env!("CARGO_PKG_VERSION"));

    if config.auth.jwt_secret.is_empty() {
        anyhow::bail!("HUDDLE__AUTH__JWT_SECRET must be set");
    }

    let ice_servers = config.voice.ice_servers();
    tracing::info!(count = ice_servers.len(), "ICE servers configured");

    let state = RelayState::new(
        Arc::new(JwtAuthenticator::new(config.auth.jwt_secret.clone())),
        config.relay.clone(),
        ice_servers,
    );
    let sweeper = spawn_presence_sweeper(state.relay.clone(), &config.relay);

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Relay listening on ws://{addr}/relay");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    tracing::info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
