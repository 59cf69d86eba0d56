//! Simulated microgrid environment and the rolling forecast window fed from it.

use std::collections::VecDeque;
use std::f64::consts::PI;

use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::ml::{Regressor, check_shape};

pub const FORECAST_FEATURES: usize = 6;
const IRRADIANCE_NORM: f64 = 1200.0;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnvironmentSettings {
    pub start_hour: f64,
    pub step_hours: f64,
    pub pv_peak_kw: f64,
    pub base_load_kw: f64,
    pub sunny_probability: f64,
    pub event_probability: f64,
    pub load_ceiling_fraction: f64,
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self {
            start_hour: 6.0,
            step_hours: 0.5,
            pv_peak_kw: 10.0,
            base_load_kw: 2.5,
            sunny_probability: 0.7,
            event_probability: 0.15,
            load_ceiling_fraction: 0.8,
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct EnvironmentSample {
    pub hour: f64,
    pub day_fraction: f64,
    pub irradiance: f64,
    pub cloud_cover: f64,
    pub pv_kw: f64,
    pub load_kw: f64,
}

/// Sinusoidal irradiance under a random-walk cloud cover, and a piecewise
/// hourly load profile with random event spikes.
pub struct Environment {
    settings: EnvironmentSettings,
    hour: f64,
    day_fraction: f64,
    sunny: bool,
    cloud_cover: f64,
    rng: StdRng,
}

impl Environment {
    pub fn new(settings: EnvironmentSettings, seed: u64) -> Self {
        Self {
            hour: settings.start_hour,
            settings,
            day_fraction: 0.0,
            sunny: true,
            cloud_cover: 0.3,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn advance(&mut self) -> EnvironmentSample {
        self.hour += self.settings.step_hours;
        if self.hour >= 24.0 {
            self.hour = 0.0;
            self.sunny = self.rng.gen_bool(self.settings.sunny_probability.clamp(0.0, 1.0));
            self.day_fraction += 0.1;
            if self.day_fraction > 1.0 {
                self.day_fraction = 0.0;
            }
        }
        let (irradiance, pv_kw) = self.solar();
        let load_kw = self.load();
        EnvironmentSample {
            hour: self.hour,
            day_fraction: self.day_fraction,
            irradiance,
            cloud_cover: self.cloud_cover,
            pv_kw,
            load_kw,
        }
    }

    fn solar(&mut self) -> (f64, f64) {
        let peak = self.settings.pv_peak_kw;
        if !(6.0..18.0).contains(&self.hour) {
            self.cloud_cover = 0.3;
            return (0.0, 0.0);
        }
        let irradiance = 1000.0 * (PI * (self.hour - 6.0) / 12.0).sin();

        self.cloud_cover = (self.cloud_cover + self.rng.gen_range(-0.15..0.15)).clamp(0.0, 0.95);
        if !self.sunny {
            self.cloud_cover = 0.5 + self.cloud_cover * 0.5;
        }
        let cloud_factor = 1.0 - self.cloud_cover * 0.85;
        let turbulence = if self.cloud_cover > 0.3 {
            0.7 + self.rng.gen_range(0.0..0.6)
        } else {
            1.0
        };
        let effective = irradiance * cloud_factor * turbulence;
        let pv = peak * effective / 1000.0 + self.rng.gen_range(-0.15..0.15);
        (irradiance, pv.clamp(0.0, peak))
    }

    fn load(&mut self) -> f64 {
        let h = self.hour;
        let hour_factor = if h < 6.0 {
            0.3 + self.rng.gen_range(0.0..0.2)
        } else if h < 9.0 {
            0.5 + (h - 6.0) / 3.0 * 0.7
        } else if h < 12.0 {
            0.9 + self.rng.gen_range(0.0..0.3)
        } else if h < 14.0 {
            1.1 + self.rng.gen_range(0.0..0.2)
        } else if h < 17.0 {
            0.7 + self.rng.gen_range(0.0..0.3)
        } else if h < 21.0 {
            1.3 + self.rng.gen_range(0.0..0.4)
        } else {
            0.4 + (1.0 - (h - 21.0) / 3.0) * 0.6
        };
        let event = if self.rng.gen_bool(self.settings.event_probability.clamp(0.0, 1.0)) {
            1.0 + self.rng.gen_range(0.0..3.0)
        } else {
            0.0
        };
        let load = self.settings.base_load_kw * hour_factor + event + self.rng.gen_range(-0.2..0.2);
        load.clamp(0.5, self.settings.pv_peak_kw * self.settings.load_ceiling_fraction)
    }
}

/// Short-horizon prediction. Net is load minus PV: positive means the site
/// needs power.
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq)]
pub struct Forecast {
    pub pv_kw: f64,
    pub load_kw: f64,
    pub net_kw: f64,
}

#[derive(Clone, Debug)]
pub struct PersistenceForecaster {
    window: usize,
    pv_peak_kw: f64,
}

impl PersistenceForecaster {
    pub fn new(window: usize, pv_peak_kw: f64) -> Self {
        Self { window, pv_peak_kw }
    }
}

impl Regressor for PersistenceForecaster {
    fn input_len(&self) -> usize {
        self.window * FORECAST_FEATURES
    }

    fn output_len(&self) -> usize {
        2
    }

    fn predict(&self, features: &[f64]) -> Vec<f64> {
        match features.chunks_exact(FORECAST_FEATURES).last() {
            Some(row) => vec![row[4] * self.pv_peak_kw, row[5] * self.pv_peak_kw],
            None => vec![0.0, 0.0],
        }
    }
}

/// Rolling window of normalized environment features and the forecaster that
/// reads it.
pub struct ForecastFeed {
    window: VecDeque<[f64; FORECAST_FEATURES]>,
    capacity: usize,
    pv_peak_kw: f64,
    forecaster: Box<dyn Regressor>,
}

impl ForecastFeed {
    /// The forecaster must take `capacity` rows of features and return PV and
    /// load in kW.
    pub fn new(capacity: usize, pv_peak_kw: f64, forecaster: Box<dyn Regressor>) -> Result<Self, ModelError> {
        check_shape(forecaster.as_ref(), capacity * FORECAST_FEATURES, 2)?;
        Ok(Self {
            window: VecDeque::from(vec![[0.0; FORECAST_FEATURES]; capacity]),
            capacity,
            pv_peak_kw,
            forecaster,
        })
    }

    pub fn push(&mut self, sample: &EnvironmentSample) {
        if self.capacity == 0 {
            return;
        }
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back([
            sample.irradiance / IRRADIANCE_NORM,
            sample.cloud_cover,
            sample.hour / 24.0,
            sample.day_fraction,
            sample.pv_kw / self.pv_peak_kw,
            sample.load_kw / self.pv_peak_kw,
        ]);
    }

    pub fn features(&self) -> Vec<f64> {
        self.window.iter().flatten().copied().collect()
    }

    pub fn forecast(&self) -> Forecast {
        let out = self.forecaster.predict(&self.features());
        let pv_kw = out.first().copied().unwrap_or(0.0).max(0.0);
        let load_kw = out.get(1).copied().unwrap_or(0.0).max(0.0);
        Forecast {
            pv_kw,
            load_kw,
            net_kw: load_kw - pv_kw,
        }
    }
}
