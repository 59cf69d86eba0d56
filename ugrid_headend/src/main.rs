//! Microgrid head-end binary: the fleet coordinator as its own process.
//!
//! Responsibilities:
//! - Accept unit registrations and mirror their telemetry.
//! - Run the control cycle: environment step, forecast, optimizer, dispatch.
//! - Serve the fleet snapshot (`dev/state`), cost parameters (`ctrl/mpc`) and
//!   operator objectives (`ctrl/obj`) over the HTTP link.
//!
//! - Serve recent alerts (`ctrl/alerts`) and per-unit telemetry history
//!   (`ctrl/hist/<idx>`).
//!
//! Configuration comes from env vars: LISTEN_ADDR, FLEET_CONFIG (defaults to
//! fleet.yaml), FORECAST_MODEL_PATH, FLEET_REPORT_PATH and FLEET_ALERT_PATH.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use bess_core::{
    Coordinator, CoordinatorSettings, FleetFile,
    coordinator::default_forecaster,
    http_link::{self, HttpLink},
    link::NodeAddr,
    ml,
    report::{self, Exporters, JsonLinesExporter},
};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct HeadendConfig {
    coordinator: CoordinatorSettings,
    listen: SocketAddr,
    timeout: Duration,
    inbox_depth: usize,
    forecast_model: Option<PathBuf>,
    report_path: Option<PathBuf>,
    alert_path: Option<PathBuf>,
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

impl HeadendConfig {
    fn from_env() -> Result<Self> {
        let fleet_path = std::env::var("FLEET_CONFIG").unwrap_or_else(|_| "fleet.yaml".to_string());
        let fleet = FleetFile::load_or_default(Path::new(&fleet_path)).context("loading fleet config")?;
        let listen = std::env::var("LISTEN_ADDR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| fleet.coordinator_addr.clone());
        let listen: SocketAddr = listen.parse().with_context(|| format!("LISTEN_ADDR {listen}"))?;
        Ok(Self {
            coordinator: fleet.coordinator,
            listen,
            timeout: Duration::from_millis(fleet.link.timeout_ms),
            inbox_depth: fleet.link.inbox_depth.max(1),
            forecast_model: env_path("FORECAST_MODEL_PATH"),
            report_path: env_path("FLEET_REPORT_PATH"),
            alert_path: env_path("FLEET_ALERT_PATH"),
        })
    }
}

async fn open_export(path: Option<&Path>) -> Result<Option<JsonLinesExporter>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let exporter = JsonLinesExporter::open(path)
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

    let cfg = HeadendConfig::from_env()?;
    let settings = cfg.coordinator.clone();
    let forecaster = ml::load_or(cfg.forecast_model.as_deref(), || default_forecaster(&settings))
        .context("loading forecast model")?;

    let (tx, inbox) = mpsc::channel(cfg.inbox_depth);
    let link = HttpLink::new(NodeAddr::from(cfg.listen.to_string()), cfg.timeout).context("building http client")?;
    let coordinator = Coordinator::new(cfg.coordinator, Arc::new(link), inbox, forecaster)
        .context("building coordinator")?;

    let exporters = Exporters {
        statuses: open_export(cfg.report_path.as_deref()).await?,
        alerts: open_export(cfg.alert_path.as_deref()).await?,
    };
    if !exporters.is_empty() {
        tokio::spawn(report::export_statuses(coordinator.subscribe(), exporters));
    }

    let server = tokio::spawn(http_link::serve(cfg.listen, tx));
    let control = tokio::spawn(coordinator.run());
    tracing::info!(listen = %cfg.listen, "microgrid head-end up");

    tokio::select! {
        served = server => {
            served.context("link server task")?.context("link server")?;
            anyhow::bail!("link server stopped");
        }
        joined = control => {
            joined.context("coordinator task")?;
            tracing::info!("coordinator stopped");
        }
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    Ok(())
}
