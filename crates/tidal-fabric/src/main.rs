//! Tidal fabric selector daemon.
//!
//! Runs next to the SDN controller:
//! - Watches the path-selection document shipped by the central controller
//! - Answers packet-in webhooks with a spine choice per new flow
//! - Installs symmetric leaf-spine-leaf rules through the controller REST API

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use tidal_common::alerts::AlertJournal;

use tidal_fabric::config::FabricConfig;
use tidal_fabric::flow::FiveTuple;
use tidal_fabric::reload;
use tidal_fabric::rules::RestRuleInstaller;
use tidal_fabric::selector::{Decision, DropReason, PathSelector};

/// Tidal SDN-side path selector.
#[derive(Parser, Debug)]
#[command(name = "tidal-fabric", about = "Tidal fabric path selector")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(long, default_value = "/etc/tidal/fabric.toml")]
    config: PathBuf,
}

#[derive(Clone)]
struct AppState {
    selector: Arc<Mutex<PathSelector<RestRuleInstaller>>>,
    journal: Arc<AlertJournal>,
}

#[derive(Debug, Deserialize)]
struct PacketInRequest {
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    protocol: String,
    #[serde(default)]
    src_port: u16,
    #[serde(default)]
    dst_port: u16,
    #[serde(default)]
    icmp_type: u8,
    #[serde(default)]
    icmp_code: u8,
}

impl PacketInRequest {
    fn tuple(&self) -> Option<FiveTuple> {
        match self.protocol.as_str() {
            "tcp" => Some(FiveTuple::tcp(
                self.src_ip,
                self.dst_ip,
                self.src_port,
                self.dst_port,
            )),
            "udp" => Some(FiveTuple::udp(
                self.src_ip,
                self.dst_ip,
                self.src_port,
                self.dst_port,
            )),
            "icmp" => Some(FiveTuple::icmp(
                self.src_ip,
                self.dst_ip,
                self.icmp_type,
                self.icmp_code,
            )),
            _ => None,
        }
    }
}

async fn handle_health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

async fn handle_packet_in(
    State(state): State<AppState>,
    Json(req): Json<PacketInRequest>,
) -> Json<Value> {
    let Some(tuple) = req.tuple() else {
        return Json(json!({"action": "drop", "reason": "unsupported_protocol"}));
    };

    let mut selector = state.selector.lock().await;
    match selector.handle_packet(tuple, Instant::now()).await {
        Ok(Decision::Forwarded {
            spine,
            rules_installed,
        }) => Json(json!({
            "action": "forward",
            "spine": spine,
            "rules_installed": rules_installed,
        })),
        Ok(Decision::CachedFlow { spine }) => Json(json!({
            "action": "forward",
            "spine": spine,
            "cached": true,
        })),
        Ok(Decision::Dropped { reason }) => {
            let reason = match reason {
                DropReason::MulticastOrBroadcast => "multicast_or_broadcast",
                DropReason::UnknownHost => "unknown_host",
            };
            Json(json!({"action": "drop", "reason": reason}))
        }
        Err(e) => {
            state.journal.warning(
                "fabric",
                "Flow Install Failed",
                &format!("packet-in left unanswered: {e}"),
            );
            Json(json!({"action": "drop", "reason": "install_failed"}))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = FabricConfig::load(&cli.config)?;

    tracing::info!(
        listen = %config.listen_addr,
        controller = %config.controller_url,
        weights = %config.weights_path.display(),
        "tidal-fabric starting"
    );

    let journal = Arc::new(AlertJournal::open(&config.journal_path, config.journal_cap));
    let installer = RestRuleInstaller::new(
        &config.controller_url,
        Duration::from_secs(config.call_timeout_secs),
    )?;
    let selector = Arc::new(Mutex::new(PathSelector::new(
        config.topology.clone(),
        installer,
        Duration::from_secs(config.rule_idle_timeout_secs),
    )));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Task 1: weight-document watcher ─────────────────────────
    let watcher_handle = tokio::spawn(reload::watch_weights(
        config.weights_path.clone(),
        Duration::from_secs(config.reload_check_secs),
        selector.clone(),
        journal.clone(),
        shutdown_rx.clone(),
    ));

    // ── Task 2: flow-cache purge ────────────────────────────────
    {
        let selector = selector.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        selector.lock().await.purge_flows(Instant::now());
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    // ── Task 3: packet-in webhook ───────────────────────────────
    let state = AppState {
        selector,
        journal,
    };
    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/packet_in", post(handle_packet_in))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = config.listen_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("tidal-fabric listening on {addr}");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            let _ = shutdown_tx.send(true);
        }
    }

    let _ = watcher_handle.await;
    tracing::info!("tidal-fabric stopped");
    Ok(())
}
