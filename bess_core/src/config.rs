//! Typed settings for units, the coordinator and the simulated link.
//! Every struct takes defaults for missing YAML keys.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;
use crate::forecast::EnvironmentSettings;
use crate::link::LinkConditions;
use crate::optimizer::{CostParameters, OptimizerSettings};
use crate::physics::{AgingCoefficients, NoiseSettings, PackParams};
use crate::safety::SafetyThresholds;
use crate::supervisor::AlertThresholds;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct UnitSettings {
    pub id: u32,
    pub listen_addr: Option<String>,
    pub initial_soc: f64,
    pub tick_ms: u64,
    pub notify_ms: u64,
    pub status_every_ticks: u64,
    pub registration_attempts: u32,
    pub registration_backoff_ms: u64,
    pub seed: Option<u64>,
    pub pack: PackParams,
    pub aging: AgingCoefficients,
    pub noise: NoiseSettings,
    pub thresholds: SafetyThresholds,
}

impl Default for UnitSettings {
    fn default() -> Self {
        Self {
            id: 1,
            listen_addr: None,
            initial_soc: 0.5,
            tick_ms: 1_000,
            notify_ms: 5_000,
            status_every_ticks: 10,
            registration_attempts: 10,
            registration_backoff_ms: 5_000,
            seed: None,
            pack: PackParams::default(),
            aging: AgingCoefficients::default(),
            noise: NoiseSettings::default(),
            thresholds: SafetyThresholds::default(),
        }
    }
}

impl UnitSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn notify_period(&self) -> Duration {
        Duration::from_millis(self.notify_ms.max(1))
    }

    pub fn registration_backoff(&self) -> Duration {
        Duration::from_millis(self.registration_backoff_ms)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorSettings {
    pub capacity: usize,
    pub cycle_ms: u64,
    pub stale_after_ms: u64,
    pub balanced_band_kw: f64,
    pub forecast_window: usize,
    pub seed: Option<u64>,
    pub cost: CostParameters,
    pub optimizer: OptimizerSettings,
    pub environment: EnvironmentSettings,
    pub alerts: AlertThresholds,
    /// Rows kept per unit, and alerts kept overall.
    pub history_len: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            capacity: 5,
            cycle_ms: 5_000,
            stale_after_ms: 30_000,
            balanced_band_kw: 0.5,
            forecast_window: 10,
            seed: None,
            cost: CostParameters::default(),
            optimizer: OptimizerSettings::default(),
            environment: EnvironmentSettings::default(),
            alerts: AlertThresholds::default(),
            history_len: 100,
        }
    }
}

impl CoordinatorSettings {
    pub fn cycle(&self) -> Duration {
        Duration::from_millis(self.cycle_ms.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

/// `fleet.yaml`: the whole microgrid in one file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct FleetFile {
    pub coordinator_addr: String,
    pub coordinator: CoordinatorSettings,
    pub link: LinkConditions,
    pub units: Vec<UnitSettings>,
}

impl Default for FleetFile {
    fn default() -> Self {
        Self {
            coordinator_addr: "127.0.0.1:5680".into(),
            coordinator: CoordinatorSettings::default(),
            link: LinkConditions::default(),
            units: (1..=3)
                .map(|id| UnitSettings {
                    id,
                    initial_soc: 0.3 + 0.2 * (id - 1) as f64,
                    ..UnitSettings::default()
                })
                .collect(),
        }
    }
}

impl FleetFile {
    pub fn from_yaml(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|source| ConfigError::Yaml {
            path: origin.to_string(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw, &path.display().to_string())
    }

    /// Like [`FleetFile::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!(path = %path.display(), "fleet file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn unit(&self, id: u32) -> Option<&UnitSettings> {
        self.units.iter().find(|u| u.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let raw = r#"
coordinator:
  capacity: 3
  cost:
    gamma: 10.0
units:
  - id: 4
    initial_soc: 0.8
    thresholds:
      temp_critical_c: 55.0
"#;
        let fleet = FleetFile::from_yaml(raw, "inline").expect("valid yaml");
        assert_eq!(fleet.coordinator.capacity, 3);
        assert_eq!(fleet.coordinator.cost.gamma, 10.0);
        assert_eq!(fleet.coordinator.cost.alpha, 1.0);
        assert_eq!(fleet.coordinator.cycle_ms, 5_000);
        let unit = fleet.unit(4).expect("unit 4");
        assert_eq!(unit.initial_soc, 0.8);
        assert_eq!(unit.thresholds.temp_critical_c, 55.0);
        assert_eq!(unit.thresholds.soh_critical, 0.75);
        assert_eq!(unit.pack.capacity_ah, 200.0);
        assert_eq!(unit.registration_attempts, 10);
    }

    #[test]
    fn default_fleet_has_three_units() {
        let fleet = FleetFile::default();
        assert_eq!(fleet.units.len(), 3);
        assert_eq!(fleet.units[2].id, 3);
        assert!((fleet.units[2].initial_soc - 0.7).abs() < 1e-12);
    }

    #[test]
    fn shipped_fleet_file_parses() {
        let fleet = FleetFile::from_yaml(include_str!("../../fleet.yaml"), "fleet.yaml").expect("valid yaml");
        assert_eq!(fleet.units.len(), 3);
        assert_eq!(fleet.coordinator.cost, CostParameters::default());
        assert_eq!(fleet.unit(3).map(|u| u.thresholds.temp_warning_c), Some(45.0));
        assert_eq!(fleet.coordinator.alerts.soh_low_critical, 0.8);
        assert_eq!(fleet.coordinator.history_len, 100);
    }

    #[test]
    fn invalid_yaml_names_its_origin() {
        let err = FleetFile::from_yaml("units: 12", "fleet.yaml").unwrap_err();
        assert!(err.to_string().contains("fleet.yaml"));
    }
}
