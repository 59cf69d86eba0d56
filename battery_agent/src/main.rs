//! Battery agent binary: one battery unit as its own process.
//!
//! Responsibilities:
//! - Serve `dev/state`, `dev/power` and `dev/params` over the HTTP link.
//! - Register with the microgrid head-end and push telemetry to it.
//! - Treat a `reset` line on stdin as a press of the physical reset button.
//!
//! Configuration comes from env vars: UNIT_ID, LISTEN_ADDR, COORDINATOR_ADDR,
//! FLEET_CONFIG (defaults to fleet.yaml) and SOH_MODEL_PATH.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use bess_core::{
    FleetFile, ResetButton, UnitSettings, UnitSnapshot,
    http_link::{self, HttpLink},
    link::NodeAddr,
    ml::{self, ConstantRegressor, Regressor},
    spawn_unit,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{mpsc, watch},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct AgentConfig {
    unit: UnitSettings,
    listen: SocketAddr,
    coordinator: NodeAddr,
    timeout: Duration,
    inbox_depth: usize,
    soh_model: Option<PathBuf>,
}

impl AgentConfig {
    fn from_env() -> Result<Self> {
        let fleet_path = std::env::var("FLEET_CONFIG").unwrap_or_else(|_| "fleet.yaml".to_string());
        let fleet = FleetFile::load_or_default(Path::new(&fleet_path)).context("loading fleet config")?;

        let id: u32 = match std::env::var("UNIT_ID") {
            Ok(v) if !v.trim().is_empty() => v.trim().parse().with_context(|| format!("UNIT_ID {v}"))?,
            _ => 1,
        };
        let unit = match fleet.unit(id) {
            Some(unit) => unit.clone(),
            None => {
                tracing::warn!(unit = id, "unit not listed in fleet config, using defaults");
                UnitSettings {
                    id,
                    ..UnitSettings::default()
                }
            }
        };

        // Peers reach this unit at its listen address, so it must be routable.
        let listen = std::env::var("LISTEN_ADDR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| unit.listen_addr.clone())
            .unwrap_or_else(|| format!("127.0.0.1:{}", 5700 + id));
        let listen: SocketAddr = listen.parse().with_context(|| format!("LISTEN_ADDR {listen}"))?;

        let coordinator = std::env::var("COORDINATOR_ADDR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| fleet.coordinator_addr.clone());

        let soh_model = std::env::var("SOH_MODEL_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            unit,
            listen,
            coordinator: NodeAddr::from(coordinator),
            timeout: Duration::from_millis(fleet.link.timeout_ms),
            inbox_depth: fleet.link.inbox_depth.max(1),
            soh_model,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing from RUST_LOG (e.g., RUST_LOG=info or debug).
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = AgentConfig::from_env()?;
    let feature_len = cfg.unit.pack.feature_len();
    let soh_model = ml::load_or(cfg.soh_model.as_deref(), || {
        Box::new(ConstantRegressor::new(feature_len, vec![100.0])) as Box<dyn Regressor>
    })
    .context("loading SoH model")?;

    let (tx, inbox) = mpsc::channel(cfg.inbox_depth);
    let link = HttpLink::new(NodeAddr::from(cfg.listen.to_string()), cfg.timeout).context("building http client")?;
    let server = tokio::spawn(http_link::serve(cfg.listen, tx));

    let unit_id = cfg.unit.id;
    let handle = spawn_unit(cfg.unit, soh_model, Arc::new(link), inbox, cfg.coordinator.clone())
        .context("building unit")?;
    tracing::info!(unit = unit_id, listen = %cfg.listen, coordinator = %cfg.coordinator, "battery agent up");
    tokio::spawn(console(handle.reset.clone(), handle.state.clone()));

    tokio::select! {
        joined = handle.task => {
            match joined.context("unit task")? {
                Ok(()) => tracing::info!(unit = unit_id, "unit stopped"),
                Err(err) => {
                    // A unit that gave up registering stays halted until restarted.
                    tracing::error!(unit = unit_id, %err, "unit halted");
                    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                }
            }
        }
        served = server => {
            served.context("link server task")?.context("link server")?;
            anyhow::bail!("link server stopped");
        }
        _ = tokio::signal::ctrl_c() => tracing::info!(unit = unit_id, "shutting down"),
    }
    Ok(())
}

/// `reset` presses the reset button, `status` prints the unit as JSON.
async fn console(reset: ResetButton, state: watch::Receiver<UnitSnapshot>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim() {
            "" => {}
            "reset" => {
                tracing::info!("reset button pressed");
                if !reset.press().await {
                    break;
                }
            }
            "status" => {
                let snapshot = state.borrow().clone();
                match serde_json::to_string(&snapshot) {
                    Ok(json) => println!("{json}"),
                    Err(err) => tracing::warn!(%err, "status not serializable"),
                }
            }
            other => tracing::warn!(command = other, "unknown console command (try `reset` or `status`)"),
        }
    }
}
