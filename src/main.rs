//! RoutePulse - Real-Time Shipment Tracking Service
//!
//! # Usage
//!
//! ```bash
//! # Run with the default config lookup (routepulse.toml, then defaults)
//! cargo run --release
//!
//! # Point at a specific config and bind address
//! ROUTEPULSE_CONFIG=/etc/routepulse.toml ./routepulse --addr 0.0.0.0:8080
//!
//! # Feed it positions with the bundled simulator
//! ./gps-sim --vehicle TRK-1 --server http://localhost:8080
//! ```
//!
//! # Environment Variables
//!
//! - `ROUTEPULSE_CONFIG`: Path to the TOML configuration file
//! - `RUST_LOG`: Logging filter (default: info)

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use routepulse::actor::ActorContext;
use routepulse::api::{create_app, ApiState};
use routepulse::clock::{IdGen, SystemClock};
use routepulse::config;
use routepulse::gateway::IngestionGateway;
use routepulse::hub::SubscriptionHub;
use routepulse::repo::{Repository, SledRepository};
use routepulse::routing::RoutingClient;
use routepulse::signals::{
    traffic::HttpTrafficProvider, weather::HttpWeatherProvider, TrafficProvider, WeatherProvider,
};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "routepulse")]
#[command(about = "RoutePulse shipment tracking service")]
#[command(version)]
struct CliArgs {
    /// Override the server bind address (default from config: "0.0.0.0:8080")
    #[arg(short, long)]
    addr: Option<String>,

    /// Override the sled data directory
    #[arg(long)]
    data_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();

    // Configuration: file -> validation -> global init.
    let cfg = config::ServiceConfig::load();
    match cfg.validate() {
        Ok(warnings) => {
            for warning in warnings {
                warn!(%warning, "Configuration warning");
            }
        }
        Err(e) => return Err(e).context("configuration invalid"),
    }
    config::init(cfg);
    let cfg = config::get();

    let addr = args.addr.clone().unwrap_or_else(|| cfg.server.addr.clone());
    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| cfg.storage.data_dir.clone());

    info!(addr = %addr, data_dir = %data_dir, "Starting RoutePulse");

    // Storage and id allocation.
    let repo = Arc::new(
        SledRepository::open(&data_dir)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("opening sled repository")?,
    );
    let high_water = repo
        .max_allocated_id()
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let ids = Arc::new(IdGen::starting_at(high_water + 1));
    info!(high_water, "Id allocator seeded");

    // Collaborator clients.
    let routing = Arc::new(RoutingClient::from_config(
        &cfg.routing,
        cfg.cache.route_ttl_min,
    ));
    let traffic: Arc<dyn TrafficProvider> = Arc::new(HttpTrafficProvider::new(
        &cfg.signals.traffic_endpoint,
        cfg.signals.timeout_ms,
        cfg.cache.traffic_ttl_min,
    ));
    let weather: Arc<dyn WeatherProvider> = Arc::new(HttpWeatherProvider::new(
        &cfg.signals.weather_endpoint,
        cfg.signals.timeout_ms,
        cfg.cache.weather_ttl_min,
    ));
    let hub = Arc::new(SubscriptionHub::new(cfg.subscriber.buffer));

    let cancel = CancellationToken::new();
    let ctx = ActorContext {
        repo: repo.clone(),
        routing,
        traffic,
        weather,
        hub: hub.clone(),
        clock: Arc::new(SystemClock::new()),
        ids,
    };
    let gateway = Arc::new(IngestionGateway::new(ctx, cancel.clone()));

    // Pre-spawn actors for shipments already in flight so subscribers see
    // updates from the first inbound fix after a restart.
    match repo.list_active_shipments().await {
        Ok(active) => {
            info!(count = active.len(), "Resuming active shipments");
            for shipment in active {
                if let Err(e) = gateway.ensure_actor(shipment.id).await {
                    warn!(shipment_id = shipment.id, error = %e, "Actor resume failed");
                }
            }
        }
        Err(e) => warn!(error = %e, "Active shipment scan failed"),
    }

    let repo_dyn: Arc<dyn Repository> = repo.clone();
    let state = ApiState {
        gateway,
        hub,
        repo: repo_dyn,
        started: Instant::now(),
    };
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "API listening");

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            shutdown_cancel.cancel();
        })
        .await
        .context("serving API")?;

    // Actors observed the cancellation; flush storage before exit.
    cancel.cancel();
    repo.flush().map_err(|e| anyhow::anyhow!("{e}"))?;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
