//! Tidal central controller.
//!
//! Single binary that runs:
//! - The capacity loop (forecast, tier ladder, power, health, status sync)
//! - The path loop (fabric telemetry, per-path prediction, weight publication)
//! - The operator REST API

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use tidal_common::alerts::AlertJournal;
use tidal_common::telemetry::MetricsClient;

use tidal_central::capacity::CapacityController;
use tidal_central::config::CentralConfig;
use tidal_central::forecast::{Forecaster, HoltModel, TrafficDb};
use tidal_central::health::HealthChecker;
use tidal_central::paths::collector::SdnRestClient;
use tidal_central::paths::runner::PathLoop;
use tidal_central::power::VirshActuator;
use tidal_central::runner::CapacityLoop;
use tidal_central::state::AppState;
use tidal_central::api;
use tidal_central::status::StatusSyncer;

/// Tidal central controller daemon.
#[derive(Parser, Debug)]
#[command(name = "tidal-central", about = "Tidal central controller")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(long, default_value = "/etc/tidal/central.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    // Configuration load failure is fatal by design.
    let config = CentralConfig::load(&cli.config)?;
    let call_timeout = config.call_timeout();

    tracing::info!(
        api = %config.api_listen_addr,
        backends = config.backends.len(),
        state_dir = %config.state_dir.display(),
        "tidal-central starting"
    );

    let journal = Arc::new(AlertJournal::open(
        &config.state_dir.join("alerts.json"),
        config.journal_cap,
    ));

    // ── Shared state + API channel ──────────────────────────────
    let (force_sync_tx, force_sync_rx) = mpsc::channel(8);
    let state = AppState::new(journal.clone(), force_sync_tx);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Capacity loop ───────────────────────────────────────────
    let capacity_loop = CapacityLoop::new(
        Duration::from_secs(config.tick_secs),
        Duration::from_secs(config.metrics.sample_max_age_secs),
        MetricsClient::new(&config.metrics.url, call_timeout)?,
        Box::new(TrafficDb::new(&config.traffic_db.url, call_timeout)?),
        Arc::new(VirshActuator {
            binary: config.power.virsh_binary.clone(),
            connect_uri: config.power.connect_uri.clone(),
            timeout: Duration::from_secs(config.power.timeout_secs),
        }),
        Forecaster::new(
            Box::new(HoltModel::default()),
            config.state_dir.join("traffic-history.json"),
            config.state_dir.join("forecast-cache.json"),
        ),
        CapacityController::new(
            config.to_backends(),
            config.ladder(),
            config.capacity_settings(),
            Utc::now(),
        ),
        HealthChecker::new(
            config.state_dir.join("blacklist.json"),
            config.health.probe_port,
            Duration::from_secs(config.health.probe_timeout_secs),
        )?,
        StatusSyncer::new(
            config.state_dir.join("status.json"),
            config.status_sync.build(),
            Duration::from_secs(config.status_heartbeat_secs),
        ),
        journal.clone(),
    );
    let capacity_handle = tokio::spawn(capacity_loop.run(shutdown_rx.clone()));

    // ── Path loop ───────────────────────────────────────────────
    let path_loop = PathLoop::new(
        config.path_loop_settings()?,
        config.topology.clone(),
        Box::new(SdnRestClient::new(&config.paths.sdn_url, call_timeout)?),
        config.paths.ship.build(),
        state.clone(),
    );
    let path_handle = tokio::spawn(path_loop.run(force_sync_rx, shutdown_rx.clone()));

    // ── API ─────────────────────────────────────────────────────
    let app = Router::new()
        .merge(api::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = config.api_listen_addr.parse()?;
    // Bind failure is fatal by design.
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("tidal-central API listening on {addr}");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            let _ = shutdown_tx.send(true);
        }
    }

    // Loops abort their ticks promptly; the capacity loop joins its
    // in-flight actuations with its own deadline.
    let _ = tokio::time::timeout(Duration::from_secs(35), async {
        let _ = capacity_handle.await;
        let _ = path_handle.await;
    })
    .await;

    tracing::info!("tidal-central stopped");
    Ok(())
}
