//! Supervisory layer over the fleet.
//!
//! Goals steer one unit until a condition on its state of charge holds, then
//! hand it back. Alert rules run over the mirrored telemetry every cycle, and
//! the history keeps recent alerts plus per-unit telemetry rows, each row
//! carrying its share of the cycle's energy profit.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::FleetEntry;

/// Full discharge ends once SoC is at or below this.
pub const FULL_DISCHARGE_SOC: f64 = 0.05;
pub const TARGET_SOC_BAND: f64 = 0.02;
pub const TARGET_SOC_GAIN: f64 = 5.0;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Goal {
    FullDischarge,
    TargetSoc { target_soc: f64 },
    Detach,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GoalStep {
    Steer(f64),
    /// `hold_kw` stays behind as a fixed objective; `None` returns the unit
    /// to the optimizer.
    Done { hold_kw: Option<f64> },
}

impl Goal {
    pub fn mode(&self) -> &'static str {
        match self {
            Goal::FullDischarge => "full_discharge",
            Goal::TargetSoc { .. } => "target_soc",
            Goal::Detach => "detach",
        }
    }

    pub fn target_soc(&self) -> Option<f64> {
        match *self {
            Goal::TargetSoc { target_soc } => Some(target_soc),
            _ => None,
        }
    }

    pub fn step(&self, soc: f64, max_kw: f64) -> GoalStep {
        match *self {
            Goal::FullDischarge if soc > FULL_DISCHARGE_SOC => GoalStep::Steer(-max_kw),
            Goal::FullDischarge => GoalStep::Done { hold_kw: None },
            Goal::TargetSoc { target_soc } => {
                let error = target_soc - soc;
                if error.abs() <= TARGET_SOC_BAND {
                    GoalStep::Done { hold_kw: None }
                } else {
                    GoalStep::Steer((max_kw * error * TARGET_SOC_GAIN).clamp(-max_kw, max_kw))
                }
            }
            Goal::Detach => GoalStep::Done { hold_kw: Some(0.0) },
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SohLow,
    TemperatureHigh,
    SocLow,
    SocUnknown,
    GoalReached,
    Detached,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Alert {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub cycle: u64,
    pub idx: usize,
    pub unit_id: u32,
    pub severity: Severity,
    pub kind: AlertKind,
    pub message: String,
}

impl Alert {
    pub fn new(cycle: u64, entry: &FleetEntry, severity: Severity, kind: AlertKind, message: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: Utc::now(),
            cycle,
            idx: entry.idx,
            unit_id: entry.unit_id,
            severity,
            kind,
            message,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlertThresholds {
    pub soc_low_warning: f64,
    pub soh_low_critical: f64,
    pub temp_high_critical_c: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            soc_low_warning: 0.15,
            soh_low_critical: 0.80,
            temp_high_critical_c: 50.0,
        }
    }
}

impl AlertThresholds {
    /// Rules over one entry's mirrored telemetry. They fire every cycle the
    /// condition holds.
    pub fn check(&self, cycle: u64, entry: &FleetEntry) -> Vec<Alert> {
        let mut alerts = Vec::new();
        if entry.soh < self.soh_low_critical {
            alerts.push(Alert::new(
                cycle,
                entry,
                Severity::Critical,
                AlertKind::SohLow,
                format!("state of health low ({:.1} %), maintenance advised", entry.soh * 100.0),
            ));
        }
        if entry.temperature > self.temp_high_critical_c {
            alerts.push(Alert::new(
                cycle,
                entry,
                Severity::Critical,
                AlertKind::TemperatureHigh,
                format!("temperature high ({:.1} °C)", entry.temperature),
            ));
        }
        if entry.soc < self.soc_low_warning {
            alerts.push(Alert::new(
                cycle,
                entry,
                Severity::Warning,
                AlertKind::SocLow,
                format!("state of charge low ({:.1} %)", entry.soc * 100.0),
            ));
        }
        alerts
    }
}

/// Grid exchange implied by the batteries' measured power: load plus
/// charging minus PV.
pub fn measured_grid_kw(load_kw: f64, pv_kw: f64, battery_kw: impl IntoIterator<Item = f64>) -> f64 {
    load_kw + battery_kw.into_iter().sum::<f64>() - pv_kw
}

/// Exporting earns, importing costs.
pub fn interval_profit_eur(price_eur_per_kwh: f64, grid_kw: f64, hours: f64) -> f64 {
    -price_eur_per_kwh * grid_kw * hours
}

/// A unit's share of `total`, weighted by |power|.
pub fn profit_share(total_eur: f64, power_kw: f64, total_abs_kw: f64) -> f64 {
    if total_abs_kw > 0.0 {
        total_eur * power_kw.abs() / total_abs_kw
    } else {
        0.0
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct TelemetryRecord {
    pub cycle: u64,
    pub at: DateTime<Utc>,
    pub idx: usize,
    pub unit_id: u32,
    pub soc: f64,
    pub soh: f64,
    pub voltage: f64,
    pub current: f64,
    pub temperature: f64,
    pub power_kw: f64,
    pub optimal_kw: f64,
    pub grid_kw: f64,
    pub load_kw: f64,
    pub pv_kw: f64,
    pub profit_eur: f64,
}

/// Bounded, newest-first logs of alerts and per-unit telemetry.
#[derive(Debug)]
pub struct History {
    limit: usize,
    alerts: VecDeque<Alert>,
    telemetry: BTreeMap<usize, VecDeque<TelemetryRecord>>,
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            alerts: VecDeque::new(),
            telemetry: BTreeMap::new(),
        }
    }

    pub fn push_alert(&mut self, alert: Alert) {
        self.alerts.push_front(alert);
        self.alerts.truncate(self.limit);
    }

    pub fn push_telemetry(&mut self, row: TelemetryRecord) {
        let rows = self.telemetry.entry(row.idx).or_default();
        rows.push_front(row);
        rows.truncate(self.limit);
    }

    pub fn alerts(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter()
    }

    pub fn telemetry(&self, idx: usize) -> impl Iterator<Item = &TelemetryRecord> {
        self.telemetry.get(&idx).into_iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::NodeAddr;
    use crate::registry::FleetRegistry;
    use tokio::time::Instant;

    fn entry(soc: f64, soh: f64, temperature: f64) -> FleetEntry {
        let mut registry = FleetRegistry::new(1);
        registry
            .register(NodeAddr::from("unit-1"), 1, Instant::now())
            .expect("slot");
        let mut entry = registry.get(0).expect("entry").clone();
        entry.soc = soc;
        entry.soh = soh;
        entry.temperature = temperature;
        entry
    }

    #[test]
    fn full_discharge_runs_until_the_floor() {
        assert_eq!(Goal::FullDischarge.step(0.4, 10.0), GoalStep::Steer(-10.0));
        assert_eq!(Goal::FullDischarge.step(0.05, 10.0), GoalStep::Done { hold_kw: None });
    }

    #[test]
    fn target_soc_is_proportional_and_saturates() {
        let goal = Goal::TargetSoc { target_soc: 0.6 };
        let GoalStep::Steer(kw) = goal.step(0.5, 10.0) else {
            panic!("outside the band");
        };
        assert!((kw - 5.0).abs() < 1e-9);
        assert_eq!(goal.step(0.1, 10.0), GoalStep::Steer(10.0));
        assert_eq!(goal.step(0.95, 10.0), GoalStep::Steer(-10.0));
        assert_eq!(goal.step(0.59, 10.0), GoalStep::Done { hold_kw: None });
    }

    #[test]
    fn detach_holds_zero() {
        assert_eq!(Goal::Detach.step(0.7, 10.0), GoalStep::Done { hold_kw: Some(0.0) });
    }

    #[test]
    fn alert_rules_follow_thresholds() {
        let rules = AlertThresholds::default();
        assert!(rules.check(1, &entry(0.5, 0.95, 30.0)).is_empty());

        let alerts = rules.check(3, &entry(0.1, 0.78, 52.0));
        let kinds: Vec<_> = alerts.iter().map(|a| (a.kind, a.severity)).collect();
        assert_eq!(
            kinds,
            vec![
                (AlertKind::SohLow, Severity::Critical),
                (AlertKind::TemperatureHigh, Severity::Critical),
                (AlertKind::SocLow, Severity::Warning),
            ]
        );
        assert!(alerts.iter().all(|a| a.cycle == 3 && a.unit_id == 1));
    }

    #[test]
    fn profit_is_split_by_absolute_power() {
        let grid = measured_grid_kw(3.0, 5.0, [1.0, -3.0]);
        assert!((grid + 4.0).abs() < 1e-12);
        let total = interval_profit_eur(0.25, grid, 0.5);
        assert!((total - 0.5).abs() < 1e-12);
        assert!((profit_share(total, -3.0, 4.0) - 0.375).abs() < 1e-12);
        assert_eq!(profit_share(total, 0.0, 0.0), 0.0);
    }

    #[test]
    fn history_is_bounded_and_newest_first() {
        let mut history = History::new(2);
        let e = entry(0.5, 1.0, 25.0);
        for cycle in 1..=3 {
            history.push_alert(Alert::new(cycle, &e, Severity::Info, AlertKind::GoalReached, String::new()));
        }
        let cycles: Vec<u64> = history.alerts().map(|a| a.cycle).collect();
        assert_eq!(cycles, vec![3, 2]);
        assert_eq!(history.telemetry(0).count(), 0);
    }
}
