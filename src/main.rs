//! Whole microgrid in one process: the coordinator plus every unit from
//! fleet.yaml, talking over the in-memory link with the latency and loss the
//! file configures.
//!
//! Console commands on stdin:
//! - `reset <id>` presses the physical reset button of unit `<id>`.
//! - `status` prints every unit's local view as JSON.
//! - `quit` stops the simulation.
//!
//! Env vars: FLEET_CONFIG (defaults to fleet.yaml), SOH_MODEL_PATH,
//! FORECAST_MODEL_PATH, FLEET_REPORT_PATH and FLEET_ALERT_PATH (JSON-lines
//! exports of cycle status and alerts).

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use bess_core::{
    Coordinator, FleetFile, LocalNetwork, UnitHandle,
    coordinator::default_forecaster,
    link::NodeAddr,
    ml::{self, ConstantRegressor, Regressor},
    report::{self, Exporters, JsonLinesExporter},
    spawn_unit,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

async fn open_export(var: &str) -> Result<Option<JsonLinesExporter>> {
    let Some(path) = env_path(var) else {
        return Ok(None);
    };
    let exporter = JsonLinesExporter::open(&path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    Ok(Some(exporter))
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

    let fleet_path = std::env::var("FLEET_CONFIG").unwrap_or_else(|_| "fleet.yaml".to_string());
    let fleet = FleetFile::load_or_default(Path::new(&fleet_path)).context("loading fleet config")?;
    let soh_model_path = env_path("SOH_MODEL_PATH");

    let seed = fleet.coordinator.seed.unwrap_or_else(rand::random);
    let net = LocalNetwork::new(fleet.link.clone(), seed);
    let coordinator_addr = NodeAddr::from(fleet.coordinator_addr.clone());

    let settings = fleet.coordinator.clone();
    let forecaster = ml::load_or(env_path("FORECAST_MODEL_PATH").as_deref(), || {
        default_forecaster(&settings)
    })
    .context("loading forecast model")?;
    let (link, inbox) = net.attach(coordinator_addr.clone());
    let coordinator = Coordinator::new(settings, Arc::new(link), inbox, forecaster)
        .context("building coordinator")?;
    let exporters = Exporters {
        statuses: open_export("FLEET_REPORT_PATH").await?,
        alerts: open_export("FLEET_ALERT_PATH").await?,
    };
    if !exporters.is_empty() {
        tokio::spawn(report::export_statuses(coordinator.subscribe(), exporters));
    }
    let control = tokio::spawn(coordinator.run());

    let mut units: BTreeMap<u32, UnitHandle> = BTreeMap::new();
    for unit in fleet.units {
        let id = unit.id;
        let addr = NodeAddr::from(unit.listen_addr.clone().unwrap_or_else(|| format!("unit-{id}")));
        let feature_len = unit.pack.feature_len();
        let soh_model = ml::load_or(soh_model_path.as_deref(), || {
            Box::new(ConstantRegressor::new(feature_len, vec![100.0])) as Box<dyn Regressor>
        })
        .with_context(|| format!("loading SoH model for unit {id}"))?;
        let (link, inbox) = net.attach(addr);
        let handle = spawn_unit(unit, soh_model, Arc::new(link), inbox, coordinator_addr.clone())
            .with_context(|| format!("building unit {id}"))?;
        units.insert(id, handle);
    }
    tracing::info!(units = units.len(), seed, "microgrid simulation running");

    tokio::select! {
        _ = console(&units) => tracing::info!("console closed, stopping"),
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    control.abort();
    for unit in units.values() {
        unit.task.abort();
    }
    Ok(())
}

async fn console(units: &BTreeMap<u32, UnitHandle>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (None, _) => {}
            (Some("quit"), _) => return,
            (Some("status"), _) => {
                for unit in units.values() {
                    let snapshot = unit.state.borrow().clone();
                    match serde_json::to_string(&snapshot) {
                        Ok(json) => println!("{json}"),
                        Err(err) => tracing::warn!(%err, "status not serializable"),
                    }
                }
            }
            (Some("reset"), Some(id)) => match id.parse::<u32>().ok().and_then(|id| units.get(&id)) {
                Some(unit) => {
                    tracing::info!(unit = unit.id, "reset button pressed");
                    if !unit.reset.press().await {
                        tracing::warn!(unit = unit.id, "unit is not running");
                    }
                }
                None => tracing::warn!(id, "no such unit"),
            },
            (Some(other), _) => {
                tracing::warn!(command = other, "unknown console command (try `reset <id>`, `status`, `quit`)")
            }
        }
    }
    // stdin closed; keep the simulation going until ctrl-c.
    std::future::pending::<()>().await
}
