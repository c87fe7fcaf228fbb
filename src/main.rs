//! wind-harvest: GFS wind snapshot harvester and query server.
//!
//! Single-binary Tokio application that:
//! 1. Polls NOAA NOMADS for the newest GFS cycle analysis
//! 2. Converts it to JSON and caches it under a cycle key, backfilling gaps
//! 3. Serves cached snapshots over HTTP (latest / nearest to a time)

mod config;
mod server;

use std::{path::PathBuf, sync::Arc, time::Duration};

use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};

use common::{Cadence, TimeGrid};
use gfs_client::{GfsClient, Grib2JsonConverter};
use harvest::{
    FsSnapshotStore, HarvestSettings, Harvester, Resolver, ResolverSettings, Scheduler,
    SnapshotStore,
};

/// GFS wind snapshot harvester and query server
#[derive(Parser)]
#[command(name = "wind-harvest", about = "GFS wind snapshot harvester and query server")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Run a single harvest from now, print the report, then exit.
    #[arg(long)]
    once: bool,

    /// Serve cached snapshots only; never contact upstream.
    #[arg(long)]
    no_harvest: bool,
}

#[tokio::main]
async fn main() {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "wind_harvest=info,harvest=info,gfs_client=info,common=info".into()
            }),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    info!("wind-harvest starting up...");

    // Load configuration.
    let cfg = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let grid = match Cadence::from_hours(cfg.timing.cadence_hours) {
        Ok(cadence) => TimeGrid::new(cadence),
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "Cadence: {}h, poll every {}s, horizon {}d",
        grid.cadence().hours(),
        cfg.timing.poll_interval_secs,
        cfg.timing.harvest_horizon_days
    );

    // ── Storage ──────────────────────────────────────────────────────
    let store = match FsSnapshotStore::open(&cfg.storage.data_dir).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(
                "Failed to open snapshot dir {}: {}",
                cfg.storage.data_dir.display(),
                e
            );
            std::process::exit(1);
        }
    };
    match store.list().await {
        Ok(keys) => info!(
            "Snapshot cache {}: {} snapshot(s), newest {}",
            store.dir().display(),
            keys.len(),
            keys.last().map(|k| k.as_str()).unwrap_or("none")
        ),
        Err(e) => warn!("Could not list snapshot cache: {}", e),
    }
    let store: Arc<dyn SnapshotStore> = store;

    // ── Query side ───────────────────────────────────────────────────
    let resolver = Arc::new(Resolver::new(
        grid,
        ResolverSettings {
            policy: cfg.resolver.policy,
            default_limit_days: cfg.resolver.default_search_limit_days,
            max_limit_days: cfg.resolver.max_search_limit_days,
            latest_lookback: chrono::Duration::days(i64::from(cfg.timing.latest_lookback_days)),
        },
        store.clone(),
    ));
    info!("Nearest search policy: {:?}", cfg.resolver.policy);

    // ── Harvest side ─────────────────────────────────────────────────
    let harvester = if cli.no_harvest {
        info!("Harvesting disabled (--no-harvest)");
        None
    } else {
        let source = match GfsClient::new(&cfg.upstream) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                error!("Failed to create GFS client: {}", e);
                std::process::exit(1);
            }
        };
        let converter = Arc::new(Grib2JsonConverter::new(&cfg.converter));
        Some(Arc::new(Harvester::new(
            grid,
            HarvestSettings {
                horizon: chrono::Duration::days(i64::from(cfg.timing.harvest_horizon_days)),
                raw_dir: cfg.storage.raw_dir.clone(),
            },
            source,
            converter,
            store.clone(),
        )))
    };

    if cli.once {
        let Some(harvester) = harvester else {
            error!("--once and --no-harvest are mutually exclusive");
            std::process::exit(2);
        };
        let now = Utc::now();
        let report = harvester.harvest(now, now).await;
        let committed: Vec<&str> = report.committed.iter().map(|k| k.as_str()).collect();
        info!(
            "Harvest from {} ended {} after {} attempts, committed {:?}",
            report.started_at,
            report.outcome.label(),
            report.attempts,
            committed
        );
        if report.outcome.is_error() {
            error!("Harvest failed: {:?}", report.outcome);
            std::process::exit(1);
        }
        return;
    }

    // ── Spawn tasks ──────────────────────────────────────────────────
    let app = server::router(
        server::AppState {
            resolver,
            store: store.clone(),
        },
        &cfg.server.cors_origins,
    );
    let bind = cfg.server.bind.clone();
    let server_handle = tokio::spawn(async move { server::serve(&bind, app).await });

    let scheduler_handle = tokio::spawn(async move {
        match harvester {
            Some(harvester) => {
                let poll = Duration::from_secs(cfg.timing.poll_interval_secs);
                Scheduler::new(harvester, poll).run().await;
            }
            None => std::future::pending::<()>().await,
        }
    });

    // ── Wait for shutdown ────────────────────────────────────────────
    info!("wind-harvest is running. Press Ctrl+C to stop.");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        r = server_handle => {
            error!("Server task exited: {:?}", r);
        }
        r = scheduler_handle => {
            error!("Scheduler task exited: {:?}", r);
        }
    }

    info!("wind-harvest shut down.");
}
