mod cat;
mod config;
mod control;
mod coordinator;
mod error;
mod flex;
mod ini;
mod qso;
mod slices;
mod supervisor;
mod telemetry;
mod types;
mod wsjtx;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, RunMode};
use crate::coordinator::Coordinator;
use crate::flex::RadioClient;
use crate::slices::SliceStore;
use crate::supervisor::{Supervisor, DEFAULT_GRACE};
use crate::telemetry::TelemetryHub;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = Config::load(config_path.as_deref()).context("loading configuration")?;
    info!(mode = ?cfg.mode, "slicelink starting");
    info!(
        web_port = cfg.web.port,
        station_lifetime_s = cfg.dashboard.station_lifetime_s,
        adif_log = ?cfg.dashboard.adif_log_path,
        "dashboard contract: events on the bus, rendering out-of-core"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let store = SliceStore::new();
    let hub = TelemetryHub::bind(cfg.wsjtx.telemetry_port)
        .await
        .context("binding telemetry port")?;
    info!(addr = %hub.local_addr()?, "telemetry listener bound");
    hub.start(shutdown_rx.clone());

    let (supervisor, exits) = Supervisor::new(DEFAULT_GRACE);
    let radio = match cfg.mode {
        RunMode::Flex => Some(RadioClient::spawn(
            cfg.flex.host.clone(),
            cfg.flex.port,
            DISCOVERY_TIMEOUT,
            store.clone(),
            shutdown_rx.clone(),
        )),
        RunMode::Standard => None,
    };

    let (bus, _) = broadcast::channel(256);
    let coord = Coordinator::start(
        &cfg,
        settings_dir(),
        store,
        radio,
        supervisor.clone(),
        exits,
        hub.clone(),
        bus,
        shutdown_rx.clone(),
    );

    if cfg.mode == RunMode::Standard {
        coord.launch_standard(&cfg.standard.rig_name)?;
    }

    tokio::spawn(control::run_stdio(coord.clone(), shutdown_rx.clone()));
    tokio::spawn(log_bus(coord.clone(), shutdown_rx));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!(telemetry_drops = hub.parse_errors(), "shutting down");
    let _ = shutdown_tx.send(true);
    supervisor.stop_all();
    wait_for_children(&supervisor).await;
    Ok(())
}

/// The decoder app reads per-rig INI files from its own config directory.
fn settings_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("WSJTX_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    match std::env::var_os("HOME") {
        Some(home) => Path::new(&home).join(".config"),
        None => PathBuf::from("settings"),
    }
}

/// Shutdown is always finite: bounded wait for children, then give up.
async fn wait_for_children(supervisor: &Supervisor) {
    let deadline = tokio::time::Instant::now() + DEFAULT_GRACE + Duration::from_secs(2);
    while !supervisor.running_ids().is_empty() {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!("children still terminating at shutdown deadline");
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Dashboard bus consumer of last resort: keeps history in the logs.
async fn log_bus(coord: Arc<Coordinator>, mut shutdown: watch::Receiver<bool>) {
    let mut bus = coord.subscribe_bus();
    loop {
        tokio::select! {
            ev = bus.recv() => match ev {
                Ok(ev) => tracing::debug!(?ev, "bus"),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = shutdown.changed() => return,
        }
    }
}
