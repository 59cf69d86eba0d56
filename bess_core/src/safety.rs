//! Health blending and threshold rules that can trip a unit into isolation.

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::lifecycle::Transition;
use crate::ml::{Regressor, check_shape};
use crate::physics::{PackParams, SOH_FLOOR, UnitState};

const REGRESSION_WEIGHT: f64 = 0.7;
const MODEL_WEIGHT: f64 = 0.3;
const FILTER_KEEP: f64 = 0.95;
const TEMP_PENALTY_ABOVE_C: f64 = 45.0;
const TEMP_PENALTY_PER_C: f64 = 0.001;
const LOW_SOC_PENALTY_BELOW: f64 = 0.1;
const LOW_SOC_PENALTY_RATE: f64 = 0.02;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SafetyThresholds {
    pub soh_critical: f64,
    pub soh_warning: f64,
    pub temp_critical_c: f64,
    pub temp_warning_c: f64,
    pub cycles_warning: u32,
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self {
            soh_critical: 0.75,
            soh_warning: 0.85,
            temp_critical_c: 60.0,
            temp_warning_c: 50.0,
            cycles_warning: 100,
        }
    }
}

/// Partial threshold update; absent fields keep their value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThresholdUpdate {
    pub soh_critical: Option<f64>,
    pub soh_warning: Option<f64>,
    pub temp_critical_c: Option<f64>,
    pub temp_warning_c: Option<f64>,
    pub cycles_warning: Option<u32>,
}

impl ThresholdUpdate {
    pub fn is_empty(&self) -> bool {
        *self == ThresholdUpdate::default()
    }

    pub fn apply(&self, thresholds: &mut SafetyThresholds) {
        if let Some(v) = self.soh_critical {
            thresholds.soh_critical = v;
        }
        if let Some(v) = self.soh_warning {
            thresholds.soh_warning = v;
        }
        if let Some(v) = self.temp_critical_c {
            thresholds.temp_critical_c = v;
        }
        if let Some(v) = self.temp_warning_c {
            thresholds.temp_warning_c = v;
        }
        if let Some(v) = self.cycles_warning {
            thresholds.cycles_warning = v;
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SafetyReason {
    SohBelow { soh: f64, limit: f64 },
    TemperatureAbove { temperature: f64, limit: f64 },
    CyclesAbove { cycles: u32, limit: u32 },
}

#[derive(Clone, Debug, PartialEq)]
pub enum SafetyVerdict {
    Nominal,
    Warning(Vec<SafetyReason>),
    Critical(Vec<SafetyReason>),
}

impl SafetyVerdict {
    pub fn is_critical(&self) -> bool {
        matches!(self, SafetyVerdict::Critical(_))
    }
}

/// Threshold rules in precedence order: critical, then warning.
pub fn evaluate(thresholds: &SafetyThresholds, soh: f64, temperature: f64, cycles: u32) -> SafetyVerdict {
    let mut critical = Vec::new();
    if soh < thresholds.soh_critical {
        critical.push(SafetyReason::SohBelow {
            soh,
            limit: thresholds.soh_critical,
        });
    }
    if temperature > thresholds.temp_critical_c {
        critical.push(SafetyReason::TemperatureAbove {
            temperature,
            limit: thresholds.temp_critical_c,
        });
    }
    if !critical.is_empty() {
        return SafetyVerdict::Critical(critical);
    }

    let mut warnings = Vec::new();
    if soh < thresholds.soh_warning {
        warnings.push(SafetyReason::SohBelow {
            soh,
            limit: thresholds.soh_warning,
        });
    }
    if temperature > thresholds.temp_warning_c {
        warnings.push(SafetyReason::TemperatureAbove {
            temperature,
            limit: thresholds.temp_warning_c,
        });
    }
    if cycles > thresholds.cycles_warning {
        warnings.push(SafetyReason::CyclesAbove {
            cycles,
            limit: thresholds.cycles_warning,
        });
    }
    if warnings.is_empty() {
        SafetyVerdict::Nominal
    } else {
        SafetyVerdict::Warning(warnings)
    }
}

pub struct SafetyEvaluator {
    soh_model: Box<dyn Regressor>,
}

impl SafetyEvaluator {
    /// The model must accept the pack's full feature window and yield at least
    /// one output (SoH in percent).
    pub fn new(soh_model: Box<dyn Regressor>, params: &PackParams) -> Result<Self, ModelError> {
        check_shape(soh_model.as_ref(), params.feature_len(), 1)?;
        Ok(Self { soh_model })
    }

    pub fn predicted_soh(&self, state: &UnitState) -> f64 {
        let raw = self
            .soh_model
            .predict(state.features.as_slice())
            .first()
            .copied()
            .unwrap_or(100.0);
        raw.clamp(0.0, 100.0) / 100.0
    }

    /// Blend, filter, then apply the threshold rules. A critical verdict
    /// isolates the unit and zeroes setpoint and current.
    pub fn check(&self, state: &mut UnitState, params: &PackParams) -> SafetyVerdict {
        let mut combined = REGRESSION_WEIGHT * self.predicted_soh(state) + MODEL_WEIGHT * state.soh;
        if state.temperature > TEMP_PENALTY_ABOVE_C {
            combined -= (state.temperature - TEMP_PENALTY_ABOVE_C) * TEMP_PENALTY_PER_C;
        }
        if state.soc < LOW_SOC_PENALTY_BELOW {
            combined -= (LOW_SOC_PENALTY_BELOW - state.soc) * LOW_SOC_PENALTY_RATE;
        }
        let combined = combined.clamp(SOH_FLOOR, 1.0);

        state.soh = (FILTER_KEEP * state.soh + (1.0 - FILTER_KEEP) * combined).clamp(SOH_FLOOR, 1.0);
        state.capacity_ah = params.capacity_ah * state.soh;

        let verdict = evaluate(&state.thresholds, state.soh, state.temperature, state.charge_cycles);
        if verdict.is_critical() {
            state.lifecycle = state.lifecycle.apply(Transition::SafetyTrip);
            state.setpoint_w = 0.0;
            state.current = 0.0;
        }
        verdict
    }
}
