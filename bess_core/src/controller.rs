//! Per-unit command admission, tick cadence and telemetry.

use tracing::{error, info, warn};

use crate::error::CommandError;
use crate::lifecycle::{Lifecycle, LocalReset, Transition};
use crate::physics::{POWER_EPSILON_W, PhysicalModel, UnitState};
use crate::protocol::{ParamsUpdate, ParamsView, PowerCommand, StateReport};
use crate::safety::{SafetyEvaluator, SafetyReason, SafetyVerdict};

/// Result of one tick.
#[derive(Clone, Debug, PartialEq)]
pub struct TickOutcome {
    pub verdict: Option<SafetyVerdict>,
    pub push_now: bool,
}

/// Result of an accepted parameter update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParamsOutcome {
    pub thresholds_changed: bool,
    pub isolated: bool,
}

pub struct UnitController {
    state: UnitState,
    model: PhysicalModel,
    safety: SafetyEvaluator,
}

impl UnitController {
    pub fn new(state: UnitState, model: PhysicalModel, safety: SafetyEvaluator) -> Self {
        Self { state, model, safety }
    }

    pub fn state(&self) -> &UnitState {
        &self.state
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lifecycle
    }

    pub fn on_registered(&mut self) -> Lifecycle {
        self.state.lifecycle = self.state.lifecycle.apply(Transition::RegistrationAck);
        self.state.lifecycle
    }

    /// `PUT dev/power`: only while running, clamped to rated power.
    pub fn handle_power(&mut self, payload: &[u8]) -> Result<f64, CommandError> {
        if !self.state.lifecycle.is_running() {
            warn!(unit = self.state.id, state = %self.state.lifecycle, "power command rejected");
            return Err(CommandError::NotRunning(self.state.lifecycle));
        }
        let command = PowerCommand::decode(payload).inspect_err(|err| {
            warn!(unit = self.state.id, %err, "invalid power command");
        })?;
        let watts = self.model.params().clamp_power(command.watts);
        self.state.setpoint_w = watts;
        let mode = if watts > POWER_EPSILON_W {
            "charging"
        } else if watts < -POWER_EPSILON_W {
            "discharging"
        } else {
            "idle"
        };
        info!(unit = self.state.id, setpoint_w = watts, mode, "power setpoint");
        Ok(watts)
    }

    pub fn params_view(&self) -> ParamsView {
        let s = &self.state;
        ParamsView {
            id: s.id,
            soc: s.soc,
            soh: s.soh,
            temperature: s.temperature,
            capacity_ah: s.capacity_ah,
            lifecycle: s.lifecycle,
            soh_critical: s.thresholds.soh_critical,
            soh_warning: s.thresholds.soh_warning,
            temp_critical_c: s.thresholds.temp_critical_c,
            temp_warning_c: s.thresholds.temp_warning_c,
            cycles_warning: s.thresholds.cycles_warning,
        }
    }

    /// `PUT dev/params`: thresholds, test-state overrides and the isolate
    /// directive. Nothing here can leave isolation.
    pub fn handle_params(&mut self, payload: &[u8]) -> Result<ParamsOutcome, CommandError> {
        let update = ParamsUpdate::decode(payload)?;
        let mut outcome = ParamsOutcome::default();

        if !update.thresholds.is_empty() {
            update.thresholds.apply(&mut self.state.thresholds);
            outcome.thresholds_changed = true;
            info!(unit = self.state.id, thresholds = ?self.state.thresholds, "safety thresholds updated");
        }
        if let Some(soc) = update.soc {
            self.state.soc = soc;
        }
        if let Some(soh) = update.soh {
            self.state.soh = soh;
            self.state.capacity_ah = self.model.params().capacity_ah * soh;
        }
        if let Some(temp) = update.temperature {
            self.state.temperature = temp;
        }
        if let Some(directive) = update.directive {
            let before = self.state.lifecycle;
            self.state.lifecycle = before.apply(Transition::Remote(directive));
            self.state.setpoint_w = 0.0;
            self.state.current = 0.0;
            outcome.isolated = before != self.state.lifecycle;
            if outcome.isolated {
                warn!(unit = self.state.id, "isolated by remote request");
            }
        }
        Ok(outcome)
    }

    pub fn tick(&mut self) -> TickOutcome {
        let step = self.model.update(&mut self.state);
        if let Some((requested, admitted)) = step.derated {
            info!(
                unit = self.state.id,
                soc = self.state.soc,
                requested_w = requested,
                admitted_w = admitted,
                "setpoint limited by state of charge"
            );
        }
        if step.cycle_started {
            info!(unit = self.state.id, cycles = self.state.charge_cycles, "charge cycle counted");
        }

        if !self.state.lifecycle.is_running() {
            return TickOutcome {
                verdict: None,
                push_now: false,
            };
        }

        let verdict = self.safety.check(&mut self.state, self.model.params());
        match &verdict {
            SafetyVerdict::Nominal => {}
            SafetyVerdict::Warning(reasons) => {
                for reason in reasons {
                    warn!(unit = self.state.id, reason = %describe(reason), "safety warning");
                }
            }
            SafetyVerdict::Critical(reasons) => {
                for reason in reasons {
                    error!(unit = self.state.id, reason = %describe(reason), "safety critical, unit isolated");
                }
            }
        }
        TickOutcome {
            push_now: verdict.is_critical(),
            verdict: Some(verdict),
        }
    }

    /// Snapshot for `dev/state`. An isolated unit reports no current and its
    /// open-circuit voltage.
    pub fn telemetry(&self) -> StateReport {
        let s = &self.state;
        let (voltage, current) = if s.lifecycle.is_isolated() {
            (self.model.params().ocv(s.soc), 0.0)
        } else {
            (s.voltage, s.current)
        };
        StateReport {
            voltage,
            current,
            temperature: s.temperature,
            soc: s.soc,
            soh: s.soh,
            lifecycle: s.lifecycle,
        }
    }

    pub fn local_reset(&mut self, token: LocalReset) -> bool {
        if !self.state.lifecycle.is_isolated() {
            return false;
        }
        let params = self.model.params().clone();
        self.state.restore_factory(&params);
        self.state.lifecycle = self.state.lifecycle.apply(Transition::Local(token));
        info!(unit = self.state.id, "factory reset, unit running again");
        true
    }
}

fn describe(reason: &SafetyReason) -> String {
    match reason {
        SafetyReason::SohBelow { soh, limit } => format!("SoH {:.1}% below {:.1}%", soh * 100.0, limit * 100.0),
        SafetyReason::TemperatureAbove { temperature, limit } => {
            format!("temperature {temperature:.1}C above {limit:.1}C")
        }
        SafetyReason::CyclesAbove { cycles, limit } => format!("{cycles} cycles above {limit}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ConstantRegressor;
    use crate::physics::{AgingCoefficients, NoiseSettings, PackParams};
    use crate::safety::SafetyThresholds;

    fn controller(soc: f64) -> UnitController {
        let params = PackParams::default();
        let state = UnitState::new(7, &params, SafetyThresholds::default(), soc);
        let safety = SafetyEvaluator::new(
            Box::new(ConstantRegressor::new(params.feature_len(), vec![100.0])),
            &params,
        )
        .expect("shape matches");
        let model = PhysicalModel::new(params, AgingCoefficients::default(), NoiseSettings::disabled(), 1);
        UnitController::new(state, model, safety)
    }

    fn running(soc: f64) -> UnitController {
        let mut c = controller(soc);
        c.on_registered();
        c
    }

    fn isolate(c: &mut UnitController) {
        c.handle_params(br#"{"state":"ISO"}"#).expect("accepted");
    }

    #[test]
    fn power_is_refused_before_registration() {
        let mut c = controller(0.5);
        assert_eq!(
            c.handle_power(br#"{"u":1000}"#),
            Err(CommandError::NotRunning(Lifecycle::Init))
        );
        assert_eq!(c.state().setpoint_w, 0.0);
    }

    #[test]
    fn power_is_clamped_to_rating() {
        let mut c = running(0.5);
        assert_eq!(c.handle_power(br#"{"u":25000}"#), Ok(10_000.0));
        assert_eq!(c.handle_power(b"-30000"), Ok(-10_000.0));
    }

    #[test]
    fn malformed_power_leaves_setpoint_alone() {
        let mut c = running(0.5);
        c.handle_power(br#"{"u":1000}"#).expect("accepted");
        assert!(c.handle_power(b"{\"v\":5}").is_err());
        assert_eq!(c.state().setpoint_w, 1000.0);
    }

    #[test]
    fn isolation_latches_until_local_reset() {
        let mut c = running(0.5);
        c.handle_power(br#"{"u":3000}"#).expect("accepted");
        isolate(&mut c);

        for _ in 0..30 {
            c.tick();
            assert!(c.handle_power(br#"{"u":3000}"#).is_err());
            c.handle_params(br#"{"state":"RUN"}"#).expect("accepted");
            assert_eq!(c.lifecycle(), Lifecycle::Isolated);
            assert_eq!(c.state().setpoint_w, 0.0);
        }

        assert!(c.local_reset(LocalReset::new()));
        assert_eq!(c.lifecycle(), Lifecycle::Running);
    }

    #[test]
    fn local_reset_restores_factory_state() {
        let mut c = running(0.4);
        c.handle_params(br#"{"soh":0.8,"temp":70}"#).expect("accepted");
        isolate(&mut c);
        assert!(c.local_reset(LocalReset::new()));
        let s = c.state();
        assert_eq!(s.soh, 1.0);
        assert_eq!(s.capacity_ah, 200.0);
        assert_eq!(s.temperature, 25.0);
        assert_eq!(s.peak_temperature, 25.0);
        assert_eq!(s.charge_cycles, 0);
        assert_eq!(s.ah_throughput, 0.0);
        assert_eq!(s.soc, 0.4);
    }

    #[test]
    fn local_reset_is_ignored_when_running() {
        let mut c = running(0.5);
        c.handle_params(br#"{"soh":0.9}"#).expect("accepted");
        assert!(!c.local_reset(LocalReset::new()));
        assert_eq!(c.state().soh, 0.9);
    }

    #[test]
    fn overheated_unit_trips_on_safety_check() {
        let mut c = running(0.5);
        c.handle_power(br#"{"u":4000}"#).expect("accepted");
        c.tick();
        c.state.temperature = 61.0;
        let params = c.model.params().clone();
        let verdict = c.safety.check(&mut c.state, &params);
        assert!(verdict.is_critical());
        assert_eq!(c.lifecycle(), Lifecycle::Isolated);
        assert_eq!(c.state().current, 0.0);
        assert_eq!(c.state().setpoint_w, 0.0);
        assert_eq!(c.telemetry().current, 0.0);
    }

    #[test]
    fn lowered_threshold_trips_on_next_tick() {
        let mut c = running(0.5);
        c.handle_params(br#"{"temp_critical":20}"#).expect("accepted");
        let outcome = c.tick();
        assert!(outcome.push_now);
        assert_eq!(c.lifecycle(), Lifecycle::Isolated);
    }

    #[test]
    fn isolated_telemetry_reports_open_circuit() {
        let mut c = running(0.5);
        c.handle_power(br#"{"u":-5000}"#).expect("accepted");
        c.tick();
        isolate(&mut c);
        let report = c.telemetry();
        assert_eq!(report.current, 0.0);
        assert!((report.voltage - (3.0 + 1.2 * c.state().soc)).abs() < 1e-9);
        assert_eq!(report.lifecycle, Lifecycle::Isolated);
    }

    #[test]
    fn oversized_params_are_rejected() {
        let mut c = running(0.5);
        let big = format!("{{\"pad\":\"{}\"}}", "x".repeat(300));
        assert!(matches!(
            c.handle_params(big.as_bytes()),
            Err(CommandError::Oversized { .. })
        ));
    }
}
