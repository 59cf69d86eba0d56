//! Electrical, thermal and aging model for one battery pack.
//! Pure state integration: no I/O, the caller decides what to log.

use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::lifecycle::Lifecycle;
use crate::safety::SafetyThresholds;

pub const FEATURES_PER_TICK: usize = 4;
pub const TEMP_MIN_C: f64 = 0.0;
pub const TEMP_MAX_C: f64 = 80.0;
pub const SOH_FLOOR: f64 = 0.5;

/// Setpoints within this band of zero are treated as idle.
pub const POWER_EPSILON_W: f64 = 0.5;
const SOC_EMPTY_CUTOFF: f64 = 0.02;
const SOC_DERATE_DISCHARGE: f64 = 0.10;
const SOC_FULL_CUTOFF: f64 = 0.98;
const SOC_DERATE_CHARGE: f64 = 0.90;
const CHARGING_CURRENT_A: f64 = 0.5;
const CYCLE_COUNT_SOC: f64 = 0.5;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PackParams {
    pub capacity_ah: f64,
    pub nominal_voltage: f64,
    pub v_min: f64,
    pub v_max: f64,
    pub internal_resistance_ohm: f64,
    pub thermal_mass_j_per_c: f64,
    pub dissipation_w_per_c: f64,
    pub ambient_c: f64,
    pub efficiency: f64,
    pub max_c_rate: f64,
    pub rated_power_w: f64,
    pub dt_secs: f64,
    pub window_len: usize,
}

impl Default for PackParams {
    fn default() -> Self {
        Self {
            capacity_ah: 200.0,
            nominal_voltage: 3.7,
            v_min: 3.0,
            v_max: 4.2,
            internal_resistance_ohm: 0.0008,
            thermal_mass_j_per_c: 5000.0,
            dissipation_w_per_c: 200.0,
            ambient_c: 25.0,
            efficiency: 0.92,
            max_c_rate: 15.0,
            rated_power_w: 10_000.0,
            dt_secs: 1.0,
            window_len: 20,
        }
    }
}

impl PackParams {
    pub fn ocv(&self, soc: f64) -> f64 {
        self.v_min + (self.v_max - self.v_min) * soc
    }

    pub fn max_current_a(&self) -> f64 {
        self.capacity_ah * self.max_c_rate
    }

    pub fn clamp_power(&self, watts: f64) -> f64 {
        watts.clamp(-self.rated_power_w, self.rated_power_w)
    }

    pub fn feature_len(&self) -> usize {
        self.window_len * FEATURES_PER_TICK
    }

    fn normalized_features(&self, state: &UnitState) -> [f64; FEATURES_PER_TICK] {
        [
            state.voltage / self.v_max,
            ((state.current / 100.0) + 10.0) / 20.0,
            state.temperature / TEMP_MAX_C,
            state.soc,
        ]
    }
}

/// Per-second SoH loss coefficients for each stress term.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgingCoefficients {
    pub per_cycle: f64,
    pub per_ah_throughput: f64,
    pub warm_above_c: f64,
    pub warm_per_c: f64,
    pub hot_above_c: f64,
    pub hot_per_c: f64,
    pub low_soc_below: f64,
    pub low_soc_rate: f64,
    pub high_soc_above: f64,
    pub high_soc_rate: f64,
    pub c_rate_above: f64,
    pub c_rate_rate: f64,
}

impl Default for AgingCoefficients {
    fn default() -> Self {
        Self {
            per_cycle: 0.0008,
            per_ah_throughput: 0.00005,
            warm_above_c: 40.0,
            warm_per_c: 0.0001,
            hot_above_c: 55.0,
            hot_per_c: 0.0005,
            low_soc_below: 0.15,
            low_soc_rate: 0.0002,
            high_soc_above: 0.95,
            high_soc_rate: 0.0001,
            c_rate_above: 3.0,
            c_rate_rate: 0.00003,
        }
    }
}

impl AgingCoefficients {
    pub fn degradation_rate(
        &self,
        cycles: u32,
        ah_throughput: f64,
        temperature: f64,
        soc: f64,
        c_rate: f64,
    ) -> f64 {
        let mut rate = cycles as f64 * self.per_cycle + ah_throughput * self.per_ah_throughput;
        if temperature > self.warm_above_c {
            rate += (temperature - self.warm_above_c) * self.warm_per_c;
        }
        if temperature > self.hot_above_c {
            rate += (temperature - self.hot_above_c) * self.hot_per_c;
        }
        if soc < self.low_soc_below {
            rate += (self.low_soc_below - soc) * self.low_soc_rate;
        } else if soc > self.high_soc_above {
            rate += (soc - self.high_soc_above) * self.high_soc_rate;
        }
        if c_rate > self.c_rate_above {
            rate += (c_rate - self.c_rate_above) * self.c_rate_rate;
        }
        rate
    }
}

/// Amplitudes of the uniform measurement noise.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NoiseSettings {
    pub current_fraction: f64,
    pub voltage_v: f64,
    pub temperature_c: f64,
}

impl Default for NoiseSettings {
    fn default() -> Self {
        Self {
            current_fraction: 0.02,
            voltage_v: 0.01,
            temperature_c: 0.5,
        }
    }
}

impl NoiseSettings {
    pub fn disabled() -> Self {
        Self {
            current_fraction: 0.0,
            voltage_v: 0.0,
            temperature_c: 0.0,
        }
    }
}

/// Last `window_len` ticks of normalized features, oldest first.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureWindow {
    values: Vec<f64>,
}

impl FeatureWindow {
    pub fn new(window_len: usize) -> Self {
        Self {
            values: vec![0.5; window_len * FEATURES_PER_TICK],
        }
    }

    pub fn push(&mut self, sample: [f64; FEATURES_PER_TICK]) {
        if self.values.len() < FEATURES_PER_TICK {
            return;
        }
        self.values.rotate_left(FEATURES_PER_TICK);
        let start = self.values.len() - FEATURES_PER_TICK;
        self.values[start..].copy_from_slice(&sample);
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn latest(&self) -> Option<&[f64]> {
        let len = self.values.len();
        (len >= FEATURES_PER_TICK).then(|| &self.values[len - FEATURES_PER_TICK..])
    }
}

/// Everything one unit knows about itself.
#[derive(Clone, Debug)]
pub struct UnitState {
    pub id: u32,
    pub lifecycle: Lifecycle,
    pub voltage: f64,
    pub current: f64,
    pub temperature: f64,
    pub soc: f64,
    pub soh: f64,
    pub capacity_ah: f64,
    pub setpoint_w: f64,
    pub charge_cycles: u32,
    pub ah_throughput: f64,
    pub peak_temperature: f64,
    pub was_charging: bool,
    pub thresholds: SafetyThresholds,
    pub features: FeatureWindow,
}

impl UnitState {
    pub fn new(id: u32, params: &PackParams, thresholds: SafetyThresholds, soc: f64) -> Self {
        let soc = soc.clamp(0.0, 1.0);
        Self {
            id,
            lifecycle: Lifecycle::Init,
            voltage: params.ocv(soc),
            current: 0.0,
            temperature: params.ambient_c,
            soc,
            soh: 1.0,
            capacity_ah: params.capacity_ah,
            setpoint_w: 0.0,
            charge_cycles: 0,
            ah_throughput: 0.0,
            peak_temperature: params.ambient_c,
            was_charging: false,
            thresholds,
            features: FeatureWindow::new(params.window_len),
        }
    }

    /// Factory conditions after the physical reset button. Lifecycle and SoC
    /// are left to the caller.
    pub fn restore_factory(&mut self, params: &PackParams) {
        self.soh = 1.0;
        self.capacity_ah = params.capacity_ah;
        self.temperature = params.ambient_c;
        self.setpoint_w = 0.0;
        self.current = 0.0;
        self.charge_cycles = 0;
        self.ah_throughput = 0.0;
        self.peak_temperature = params.ambient_c;
        self.was_charging = false;
    }

    pub fn power_w(&self) -> f64 {
        self.voltage * self.current
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepOutcome {
    pub integrated: bool,
    pub derated: Option<(f64, f64)>,
    pub cycle_started: bool,
}

pub struct PhysicalModel {
    params: PackParams,
    aging: AgingCoefficients,
    noise: NoiseSettings,
    rng: StdRng,
}

impl PhysicalModel {
    pub fn new(params: PackParams, aging: AgingCoefficients, noise: NoiseSettings, seed: u64) -> Self {
        Self {
            params,
            aging,
            noise,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn params(&self) -> &PackParams {
        &self.params
    }

    /// SoC-based admission: the power the pack may actually exchange.
    pub fn admit_power(soc: f64, setpoint_w: f64) -> f64 {
        if setpoint_w < -POWER_EPSILON_W {
            if soc <= SOC_EMPTY_CUTOFF {
                return 0.0;
            }
            if soc < SOC_DERATE_DISCHARGE {
                let scale = (soc - SOC_EMPTY_CUTOFF) / (SOC_DERATE_DISCHARGE - SOC_EMPTY_CUTOFF);
                return setpoint_w * scale.max(0.0);
            }
        } else if setpoint_w > POWER_EPSILON_W {
            if soc >= SOC_FULL_CUTOFF {
                return 0.0;
            }
            if soc > SOC_DERATE_CHARGE {
                let scale = (SOC_FULL_CUTOFF - soc) / (SOC_FULL_CUTOFF - SOC_DERATE_CHARGE);
                return setpoint_w * scale.max(0.0);
            }
        }
        setpoint_w
    }

    /// Advance one `dt`. The pack only integrates while running; the feature
    /// window shifts every call.
    pub fn update(&mut self, state: &mut UnitState) -> StepOutcome {
        let mut outcome = StepOutcome::default();
        if state.lifecycle.is_running() {
            self.integrate(state, &mut outcome);
        }
        let sample = self.params.normalized_features(state);
        state.features.push(sample);
        outcome
    }

    fn integrate(&mut self, state: &mut UnitState, outcome: &mut StepOutcome) {
        let p = &self.params;
        let dt = p.dt_secs;
        outcome.integrated = true;

        let admitted = Self::admit_power(state.soc, state.setpoint_w);
        if admitted != state.setpoint_w {
            outcome.derated = Some((state.setpoint_w, admitted));
        }
        state.setpoint_w = admitted;

        // Electrical
        let ocv = p.ocv(state.soc);
        let requested_current = if ocv > 0.1 { admitted / ocv } else { 0.0 };
        let current_noise = noise(&mut self.rng, self.noise.current_fraction * requested_current.abs());
        let max_current = p.max_current_a();
        state.current = (requested_current + current_noise).clamp(-max_current, max_current);

        let mut voltage = ocv - state.current * p.internal_resistance_ohm;
        if state.soc < 0.1 {
            voltage -= (0.1 - state.soc) * 2.0;
        }
        if state.soc > 0.9 {
            voltage += (state.soc - 0.9) * 0.5;
        }
        state.voltage = voltage.clamp(p.v_min, p.v_max) + noise(&mut self.rng, self.noise.voltage_v);

        // State of charge
        let efficiency = if state.current > 0.0 {
            p.efficiency
        } else {
            1.0 / p.efficiency
        };
        let energy_j = admitted * efficiency * dt;
        let capacity_j = p.capacity_ah * state.soh * p.nominal_voltage * 3600.0;
        state.soc += energy_j / capacity_j;
        state.ah_throughput += state.current.abs() * dt / 3600.0;

        let charging = state.current > CHARGING_CURRENT_A;
        if charging && !state.was_charging && state.soc < CYCLE_COUNT_SOC {
            state.charge_cycles += 1;
            outcome.cycle_started = true;
        }
        state.was_charging = charging;
        state.soc = state.soc.clamp(0.0, 1.0);

        // Thermal
        let generated = state.current * state.current * p.internal_resistance_ohm * dt;
        let dissipated = p.dissipation_w_per_c * (state.temperature - p.ambient_c) * dt;
        state.temperature += (generated - dissipated) / p.thermal_mass_j_per_c;
        state.temperature += noise(&mut self.rng, self.noise.temperature_c);
        if state.temperature > state.peak_temperature {
            state.peak_temperature = state.temperature;
        }
        state.temperature = state.temperature.clamp(TEMP_MIN_C, TEMP_MAX_C);

        // Aging
        let c_rate = state.current.abs() / p.capacity_ah;
        let rate = self.aging.degradation_rate(
            state.charge_cycles,
            state.ah_throughput,
            state.temperature,
            state.soc,
            c_rate,
        );
        state.soh = (state.soh - rate * dt).clamp(SOH_FLOOR, 1.0);
        state.capacity_ah = p.capacity_ah * state.soh;
    }
}

fn noise(rng: &mut StdRng, amplitude: f64) -> f64 {
    if amplitude > 0.0 {
        rng.gen_range(-amplitude..=amplitude)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn running_state(soc: f64) -> UnitState {
        let mut state = UnitState::new(1, &PackParams::default(), SafetyThresholds::default(), soc);
        state.lifecycle = Lifecycle::Running;
        state
    }

    fn quiet_model() -> PhysicalModel {
        PhysicalModel::new(
            PackParams::default(),
            AgingCoefficients::default(),
            NoiseSettings::disabled(),
            7,
        )
    }

    #[test]
    fn admission_derates_linearly() {
        assert!((PhysicalModel::admit_power(0.06, -1000.0) + 500.0).abs() < 1e-9);
        assert!((PhysicalModel::admit_power(0.94, 1000.0) - 500.0).abs() < 1e-9);
        assert_eq!(PhysicalModel::admit_power(0.5, -1000.0), -1000.0);
        assert_eq!(PhysicalModel::admit_power(0.01, 1000.0), 1000.0);
    }

    #[test]
    fn derated_value_becomes_visible_setpoint() {
        let mut model = quiet_model();
        let mut state = running_state(0.99);
        state.setpoint_w = 4000.0;
        let outcome = model.update(&mut state);
        assert_eq!(state.setpoint_w, 0.0);
        assert_eq!(outcome.derated, Some((4000.0, 0.0)));
    }

    #[test]
    fn idle_pack_relaxes_toward_ambient() {
        let mut model = quiet_model();
        let mut state = running_state(0.5);
        state.temperature = 40.0;
        model.update(&mut state);
        assert!(state.temperature < 40.0);
        assert!(state.temperature > 25.0);
    }

    #[test]
    fn init_state_only_shifts_features() {
        let mut model = quiet_model();
        let mut state = UnitState::new(1, &PackParams::default(), SafetyThresholds::default(), 0.3);
        state.setpoint_w = 5000.0;
        let outcome = model.update(&mut state);
        assert!(!outcome.integrated);
        assert_eq!(state.soc, 0.3);
        let latest = state.features.latest().map(|f| f.to_vec());
        assert_eq!(latest.map(|f| f[3]), Some(0.3));
    }

    #[test]
    fn charge_start_below_half_counts_a_cycle() {
        let mut model = quiet_model();
        let mut state = running_state(0.3);
        state.setpoint_w = 2000.0;
        let outcome = model.update(&mut state);
        assert!(outcome.cycle_started);
        model.update(&mut state);
        assert_eq!(state.charge_cycles, 1);
    }

    #[test]
    fn feature_window_drops_oldest_sample() {
        let mut window = FeatureWindow::new(2);
        window.push([1.0, 1.0, 1.0, 1.0]);
        window.push([2.0, 2.0, 2.0, 2.0]);
        window.push([3.0, 3.0, 3.0, 3.0]);
        assert_eq!(window.as_slice(), &[2.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0, 3.0]);
    }

    #[test]
    fn charging_from_eighty_percent_rises_monotonically() {
        let mut model = quiet_model();
        let mut state = running_state(0.80);
        let mut last_soc = state.soc;
        let mut last_voltage = 0.0;
        for tick in 0..600 {
            state.setpoint_w = 5000.0;
            model.update(&mut state);
            assert!(state.soc >= last_soc, "soc fell at tick {tick}");
            assert!(state.voltage >= last_voltage - 1e-9, "voltage fell at tick {tick}");
            last_soc = state.soc;
            last_voltage = state.voltage;
        }
        assert!(state.soc > 0.9);
        assert!(state.soc < 0.98);
    }

    proptest! {
        #[test]
        fn state_stays_inside_physical_bounds(
            soc in 0.0f64..=1.0,
            soh in 0.5f64..=1.0,
            temp in 0.0f64..=80.0,
            setpoint in -10_000.0f64..=10_000.0,
            seed in any::<u64>(),
        ) {
            let mut model = PhysicalModel::new(
                PackParams::default(),
                AgingCoefficients::default(),
                NoiseSettings::default(),
                seed,
            );
            let mut state = running_state(soc);
            state.soh = soh;
            state.temperature = temp;
            for _ in 0..20 {
                state.setpoint_w = setpoint;
                model.update(&mut state);
                prop_assert!((0.0..=1.0).contains(&state.soc));
                prop_assert!((0.5..=1.0).contains(&state.soh));
                prop_assert!((0.0..=80.0).contains(&state.temperature));
            }
        }

        #[test]
        fn empty_and_full_packs_refuse_power(
            low in 0.0f64..=0.02,
            high in 0.98f64..=1.0,
            watts in 1.0f64..=10_000.0,
        ) {
            prop_assert_eq!(PhysicalModel::admit_power(low, -watts), 0.0);
            prop_assert_eq!(PhysicalModel::admit_power(high, watts), 0.0);
        }
    }
}
