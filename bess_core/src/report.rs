//! JSON-lines export of per-cycle fleet status and of the alerts raised in
//! each cycle.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use crate::coordinator::FleetStatus;

pub struct JsonLinesExporter {
    path: PathBuf,
    file: File,
}

impl JsonLinesExporter {
    /// Open `path` for appending, creating it if needed.
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write<T: Serialize>(&mut self, record: &T) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        self.file.flush().await
    }
}

/// Where each cycle's records go. Either side may be absent.
#[derive(Default)]
pub struct Exporters {
    pub statuses: Option<JsonLinesExporter>,
    pub alerts: Option<JsonLinesExporter>,
}

impl Exporters {
    pub fn is_empty(&self) -> bool {
        self.statuses.is_none() && self.alerts.is_none()
    }

    pub async fn write(&mut self, status: &FleetStatus) {
        if let Some(exporter) = self.statuses.as_mut() {
            if let Err(err) = exporter.write(status).await {
                warn!(path = %exporter.path().display(), %err, "status export failed");
            }
        }
        if let Some(exporter) = self.alerts.as_mut() {
            for alert in &status.alerts {
                if let Err(err) = exporter.write(alert).await {
                    warn!(path = %exporter.path().display(), %err, "alert export failed");
                    break;
                }
            }
        }
    }
}

/// Drain a status feed into `exporters` until the coordinator stops.
pub async fn export_statuses(mut statuses: broadcast::Receiver<FleetStatus>, mut exporters: Exporters) {
    for exporter in exporters.statuses.iter().chain(exporters.alerts.iter()) {
        info!(path = %exporter.path().display(), "exporting fleet records");
    }
    loop {
        match statuses.recv().await {
            Ok(status) => exporters.write(&status).await,
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "status export fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::GridExchange;
    use crate::forecast::{EnvironmentSample, Forecast};
    use crate::link::NodeAddr;
    use crate::registry::FleetRegistry;
    use crate::supervisor::{Alert, AlertKind, Severity};
    use chrono::Utc;

    fn status(cycle: u64, alerts: Vec<Alert>) -> FleetStatus {
        FleetStatus {
            cycle,
            at: Utc::now(),
            environment: EnvironmentSample {
                hour: 6.5,
                day_fraction: 0.0,
                irradiance: 130.0,
                cloud_cover: 0.3,
                pv_kw: 0.9,
                load_kw: 2.1,
            },
            forecast: Forecast::default(),
            active: 0,
            optimized: 0,
            avg_soc: None,
            dispatched_kw: 0.0,
            expected_grid_kw: 1.2,
            grid: GridExchange::Import,
            measured_grid_kw: 1.2,
            profit_eur: -0.15,
            profit_total_eur: -0.15,
            stale: Vec::new(),
            dispatches: Vec::new(),
            alerts,
            telemetry: Vec::new(),
        }
    }

    fn temp_path(stem: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{stem}-{}.jsonl", uuid::Uuid::new_v4()))
    }

    async fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        let raw = tokio::fs::read_to_string(path).await.expect("read back");
        let _ = tokio::fs::remove_file(path).await;
        raw.lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect()
    }

    #[tokio::test]
    async fn statuses_are_appended_one_per_line() {
        let path = temp_path("fleet-status");
        let mut exporter = JsonLinesExporter::open(&path).await.expect("open");
        exporter.write(&status(1, Vec::new())).await.expect("write");
        exporter.write(&status(2, Vec::new())).await.expect("write");
        drop(exporter);

        let lines = read_lines(&path).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["cycle"], 2);
        assert_eq!(lines[0]["grid"], "Import");
        assert_eq!(lines[0]["environment"]["load_kw"], 2.1);
    }

    #[tokio::test]
    async fn alerts_get_a_line_each() {
        let mut registry = FleetRegistry::new(1);
        registry
            .register(NodeAddr::from("unit-4"), 4, tokio::time::Instant::now())
            .expect("slot");
        let entry = registry.get(0).expect("entry");
        let alerts = vec![
            Alert::new(7, entry, Severity::Critical, AlertKind::SohLow, "soh".into()),
            Alert::new(7, entry, Severity::Warning, AlertKind::SocLow, "soc".into()),
        ];

        let path = temp_path("fleet-alerts");
        let mut exporters = Exporters {
            statuses: None,
            alerts: Some(JsonLinesExporter::open(&path).await.expect("open")),
        };
        exporters.write(&status(7, alerts)).await;
        exporters.write(&status(8, Vec::new())).await;
        drop(exporters);

        let lines = read_lines(&path).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "soh_low");
        assert_eq!(lines[0]["severity"], "critical");
        assert_eq!(lines[1]["unit_id"], 4);
    }
}
