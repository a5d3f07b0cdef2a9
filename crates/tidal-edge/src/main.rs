//! Tidal edge controller.
//!
//! Runs at the NAT ingress box:
//! - Reloads the status replica shipped by the central controller
//! - Selects a backend per tick with dynamic weighted random selection
//! - Commits the selection as the single DNAT destination

mod nat;
mod runner;
mod selector;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use tidal_common::alerts::AlertJournal;
use tidal_common::telemetry::MetricsClient;

/// Tidal edge controller daemon.
#[derive(Parser, Debug)]
#[command(name = "tidal-edge", about = "Tidal edge NAT controller")]
struct Cli {
    /// Path the central controller ships the status document to.
    #[arg(long, default_value = "/var/lib/tidal/status.json")]
    status_path: PathBuf,

    /// Metrics DB base URL.
    #[arg(long, default_value = "http://localhost:9090")]
    metrics_url: String,

    /// Public endpoint the NAT listens on (ip:port).
    #[arg(long)]
    public_endpoint: String,

    /// Service port exposed by every backend.
    #[arg(long, default_value_t = 80)]
    backend_port: u16,

    /// nftables table holding the DNAT chain.
    #[arg(long, default_value = "tidal")]
    nat_table: String,

    /// nftables chain holding the single DNAT rule.
    #[arg(long, default_value = "ingress_dnat")]
    nat_chain: String,

    /// Tick interval in seconds.
    #[arg(long, default_value_t = 10)]
    tick_secs: u64,

    /// Telemetry older than this many seconds is treated as missing.
    #[arg(long, default_value_t = 15)]
    sample_max_age_secs: u64,

    /// Maximum age of the status replica before selection is skipped.
    #[arg(long, default_value_t = 120)]
    replica_stale_cap_secs: u64,

    /// External call timeout in seconds.
    #[arg(long, default_value_t = 10)]
    call_timeout_secs: u64,

    /// Alert journal path.
    #[arg(long, default_value = "/var/lib/tidal/edge-alerts.json")]
    journal_path: PathBuf,

    /// Alert journal size cap.
    #[arg(long, default_value_t = 500)]
    journal_cap: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(
        status_path = %cli.status_path.display(),
        public_endpoint = %cli.public_endpoint,
        "tidal-edge starting"
    );

    let metrics = MetricsClient::new(
        &cli.metrics_url,
        Duration::from_secs(cli.call_timeout_secs),
    )?;
    let journal = Arc::new(AlertJournal::open(&cli.journal_path, cli.journal_cap));
    let nat = nat::NatCommitter::new(nat::NftApplier {
        table: cli.nat_table,
        chain: cli.nat_chain,
        public_endpoint: cli.public_endpoint,
    });

    let settings = runner::EdgeSettings {
        status_path: cli.status_path,
        backend_port: cli.backend_port,
        tick: Duration::from_secs(cli.tick_secs),
        sample_max_age: Duration::from_secs(cli.sample_max_age_secs),
        replica_stale_cap: Duration::from_secs(cli.replica_stale_cap_secs),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_handle = tokio::spawn(runner::run(settings, metrics, nat, journal, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("received SIGINT, shutting down");
    let _ = shutdown_tx.send(true);
    let _ = loop_handle.await;

    tracing::info!("tidal-edge stopped");
    Ok(())
}
