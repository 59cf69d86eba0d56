//! Fixed-budget projected gradient descent over the fleet.
//!
//! Per-unit cost: `J(u) = alpha*price*u + beta*u^2 + gamma*(soc + k*u - soc_ref)^2`
//! with `u` in kW, positive charging. Units do not interact, so each one is
//! solved on its own with the same iteration count every cycle.

use serde::{Deserialize, Serialize};

use crate::protocol::CostUpdate;
use crate::registry::{FleetEntry, FleetRegistry};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CostParameters {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub price: f64,
}

impl Default for CostParameters {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            gamma: 20.0,
            price: 0.25,
        }
    }
}

impl CostParameters {
    pub fn apply(&mut self, update: &CostUpdate) {
        if let Some(v) = update.alpha {
            self.alpha = v;
        }
        if let Some(v) = update.beta {
            self.beta = v;
        }
        if let Some(v) = update.gamma {
            self.gamma = v;
        }
        if let Some(v) = update.price {
            self.price = v;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OptimizerSettings {
    pub soc_gain: f64,
    pub soc_ref: f64,
    pub learning_rate: f64,
    pub iterations: u32,
    pub max_power_kw: f64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            soc_gain: 0.05,
            soc_ref: 0.5,
            learning_rate: 0.1,
            iterations: 100,
            max_power_kw: 10.0,
        }
    }
}

/// True when the optimizer owns this entry's setpoint.
pub fn is_optimizable(entry: &FleetEntry) -> bool {
    entry.active && !entry.is_isolated() && entry.objective_kw.is_none()
}

#[derive(Clone, Debug)]
pub struct FleetOptimizer {
    settings: OptimizerSettings,
}

impl FleetOptimizer {
    pub fn new(settings: OptimizerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    pub fn gradient(&self, cost: &CostParameters, soc: f64, u: f64) -> f64 {
        let s = &self.settings;
        cost.alpha * cost.price
            + 2.0 * cost.beta * u
            + 2.0 * cost.gamma * s.soc_gain * (soc + s.soc_gain * u - s.soc_ref)
    }

    /// Exactly `iterations` projected steps from `start`; no early exit.
    pub fn solve_unit(&self, cost: &CostParameters, soc: f64, start: f64) -> f64 {
        let s = &self.settings;
        let mut u = start.clamp(-s.max_power_kw, s.max_power_kw);
        for _ in 0..s.iterations {
            u = (u - s.learning_rate * self.gradient(cost, soc, u)).clamp(-s.max_power_kw, s.max_power_kw);
        }
        u
    }

    /// Update `optimal_u_kw` of every optimizable entry, warm-started from its
    /// previous value. Returns how many entries were solved.
    pub fn run(&self, cost: &CostParameters, registry: &mut FleetRegistry) -> usize {
        let mut solved = 0;
        for entry in registry.entries_mut().filter(|e| is_optimizable(e)) {
            entry.optimal_u_kw = self.solve_unit(cost, entry.soc, entry.optimal_u_kw);
            solved += 1;
        }
        solved
    }
}
