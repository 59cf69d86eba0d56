//! Resource paths and payload codecs for the unit/coordinator message boundary.
//!
//! Scaling factors are part of the interop contract: V, I, T and every kW value
//! travel as centi-units, unit SoC/SoH as ten-thousandths, cost parameters as
//! hundredths.

use serde_json::{Map, Value, json};

use crate::error::{CodecError, CommandError};
use crate::lifecycle::{Lifecycle, RemoteDirective};
use crate::optimizer::CostParameters;
use crate::physics::{SOH_FLOOR, TEMP_MAX_C, TEMP_MIN_C};
use crate::safety::ThresholdUpdate;
use crate::supervisor::Goal;

pub const REGISTER: &str = "dev/register";
pub const STATE: &str = "dev/state";
pub const POWER: &str = "dev/power";
pub const PARAMS: &str = "dev/params";
pub const MPC: &str = "ctrl/mpc";
pub const OBJECTIVES: &str = "ctrl/obj";
pub const ALERTS: &str = "ctrl/alerts";
/// Followed by the fleet index: `ctrl/hist/<idx>`.
pub const HISTORY_PREFIX: &str = "ctrl/hist/";

pub const POWER_PAYLOAD_MAX: usize = 31;
pub const PARAMS_PAYLOAD_MAX: usize = 255;
pub const COST_PAYLOAD_MAX: usize = 63;
pub const OBJECTIVE_PAYLOAD_MAX: usize = 63;

fn centi(value: f64) -> i64 {
    (value * 100.0).round() as i64
}

fn ten_thousandths(value: f64) -> i64 {
    (value * 10_000.0).round() as i64
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Reject empty payloads and payloads longer than `max`.
pub fn check_len(payload: &[u8], max: usize) -> Result<(), CommandError> {
    if payload.is_empty() || payload.len() > max {
        return Err(CommandError::Oversized {
            len: payload.len(),
            max,
        });
    }
    Ok(())
}

fn parse_object(payload: &[u8]) -> Result<Map<String, Value>, CommandError> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(CommandError::Malformed("expected a json object".into())),
        Err(err) => Err(CommandError::Malformed(err.to_string())),
    }
}

fn number_in(map: &Map<String, Value>, key: &str, lo: f64, hi: f64) -> Option<f64> {
    map.get(key)
        .and_then(Value::as_f64)
        .filter(|v| (lo..=hi).contains(v))
}

/// Electrical snapshot published on `dev/state`.
#[derive(Clone, Debug, PartialEq)]
pub struct StateReport {
    pub voltage: f64,
    pub current: f64,
    pub temperature: f64,
    pub soc: f64,
    pub soh: f64,
    pub lifecycle: Lifecycle,
}

impl StateReport {
    pub fn encode(&self) -> Vec<u8> {
        json!({
            "V": centi(self.voltage),
            "I": centi(self.current),
            "T": centi(self.temperature),
            "S": ten_thousandths(self.soc),
            "H": ten_thousandths(self.soh),
            "St": self.lifecycle.as_str(),
        })
        .to_string()
        .into_bytes()
    }

    /// Accepts `St` either as its three-letter name or its integer tag.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_slice(payload)?;
        let field = |key: &'static str| value.get(key).and_then(Value::as_f64).ok_or(CodecError::Field(key));
        let lifecycle = match value.get("St") {
            Some(Value::String(name)) => {
                Lifecycle::from_wire(name).ok_or_else(|| CodecError::Lifecycle(name.clone()))?
            }
            Some(Value::Number(code)) => code
                .as_u64()
                .and_then(Lifecycle::from_code)
                .ok_or_else(|| CodecError::Lifecycle(code.to_string()))?,
            _ => return Err(CodecError::Field("St")),
        };
        Ok(Self {
            voltage: field("V")? / 100.0,
            current: field("I")? / 100.0,
            temperature: field("T")? / 100.0,
            soc: field("S")? / 10_000.0,
            soh: field("H")? / 10_000.0,
            lifecycle,
        })
    }

    pub fn power_kw(&self) -> f64 {
        self.voltage * self.current / 1000.0
    }
}

/// Signed setpoint in watts; positive charges.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PowerCommand {
    pub watts: f64,
}

impl PowerCommand {
    pub fn from_kw(kw: f64) -> Self {
        Self { watts: kw * 1000.0 }
    }

    pub fn encode(&self) -> Vec<u8> {
        json!({ "u": self.watts.round() as i64 }).to_string().into_bytes()
    }

    /// `{"u": watts}` or a bare number.
    pub fn decode(payload: &[u8]) -> Result<Self, CommandError> {
        check_len(payload, POWER_PAYLOAD_MAX)?;
        let value: Value = serde_json::from_slice(payload)
            .map_err(|err| CommandError::Malformed(err.to_string()))?;
        let watts = match &value {
            Value::Number(n) => n.as_f64(),
            Value::Object(map) => map.get("u").and_then(Value::as_f64),
            _ => None,
        };
        watts
            .filter(|w| w.is_finite())
            .map(|watts| Self { watts })
            .ok_or_else(|| CommandError::Malformed("expected {\"u\": <watts>}".into()))
    }
}

pub fn encode_registration(unit_id: u32) -> Vec<u8> {
    unit_id.to_string().into_bytes()
}

pub fn decode_registration(payload: &[u8]) -> Result<u32, CodecError> {
    let text = std::str::from_utf8(payload).map_err(|_| CodecError::Utf8)?;
    text.trim().parse().map_err(|_| CodecError::Field("unit id"))
}

/// Body of `GET dev/params`.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamsView {
    pub id: u32,
    pub soc: f64,
    pub soh: f64,
    pub temperature: f64,
    pub capacity_ah: f64,
    pub lifecycle: Lifecycle,
    pub soh_critical: f64,
    pub soh_warning: f64,
    pub temp_critical_c: f64,
    pub temp_warning_c: f64,
    pub cycles_warning: u32,
}

impl ParamsView {
    pub fn encode(&self) -> Vec<u8> {
        json!({
            "id": self.id,
            "soc": (self.soc * 1000.0).round() / 1000.0,
            "soh": (self.soh * 1000.0).round() / 1000.0,
            "temp": round2(self.temperature),
            "capacity_ah": (self.capacity_ah * 1000.0).round() / 1000.0,
            "state": self.lifecycle.as_str(),
            "soh_critical": self.soh_critical,
            "soh_warning": self.soh_warning,
            "temp_critical": self.temp_critical_c,
            "temp_warning": self.temp_warning_c,
            "cycles_warning": self.cycles_warning,
        })
        .to_string()
        .into_bytes()
    }
}

/// Body of `PUT dev/params`. Each field is validated on its own; invalid ones
/// are dropped without failing the update.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamsUpdate {
    pub thresholds: ThresholdUpdate,
    pub soc: Option<f64>,
    pub soh: Option<f64>,
    pub temperature: Option<f64>,
    pub directive: Option<RemoteDirective>,
}

impl ParamsUpdate {
    pub fn decode(payload: &[u8]) -> Result<Self, CommandError> {
        check_len(payload, PARAMS_PAYLOAD_MAX)?;
        let map = parse_object(payload)?;
        let thresholds = ThresholdUpdate {
            soh_critical: number_in(&map, "soh_critical", SOH_FLOOR, 1.0),
            soh_warning: number_in(&map, "soh_warning", SOH_FLOOR, 1.0),
            temp_critical_c: number_in(&map, "temp_critical", TEMP_MIN_C, TEMP_MAX_C),
            temp_warning_c: number_in(&map, "temp_warning", TEMP_MIN_C, TEMP_MAX_C),
            cycles_warning: map
                .get("cycles_warning")
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok()),
        };
        Ok(Self {
            thresholds,
            soc: number_in(&map, "soc", 0.0, 1.0),
            soh: number_in(&map, "soh", SOH_FLOOR, 1.0),
            temperature: number_in(&map, "temp", TEMP_MIN_C, TEMP_MAX_C),
            directive: map
                .get("state")
                .and_then(Value::as_str)
                .and_then(RemoteDirective::parse),
        })
    }
}

/// Body of `GET ctrl/mpc`: the cost parameters as floats with two decimals.
pub fn encode_cost(cost: &CostParameters) -> Vec<u8> {
    json!({
        "a": round2(cost.alpha),
        "b": round2(cost.beta),
        "g": round2(cost.gamma),
        "p": round2(cost.price),
    })
    .to_string()
    .into_bytes()
}

/// Body of `PUT ctrl/mpc`: any subset of `a`, `b`, `g`, `p`, scaled by 100.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CostUpdate {
    pub alpha: Option<f64>,
    pub beta: Option<f64>,
    pub gamma: Option<f64>,
    pub price: Option<f64>,
}

impl CostUpdate {
    pub fn decode(payload: &[u8]) -> Result<Self, CommandError> {
        check_len(payload, COST_PAYLOAD_MAX)?;
        let map = parse_object(payload)?;
        let scaled = |key: &str| map.get(key).and_then(Value::as_f64).map(|v| v / 100.0);
        Ok(Self {
            alpha: scaled("a"),
            beta: scaled("b"),
            gamma: scaled("g"),
            price: scaled("p"),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut map = Map::new();
        for (key, value) in [("a", self.alpha), ("b", self.beta), ("g", self.gamma), ("p", self.price)] {
            if let Some(v) = value {
                map.insert(key.into(), json!(centi(v)));
            }
        }
        Value::Object(map).to_string().into_bytes()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ObjectiveAction {
    Set { power_kw: f64 },
    Goal(Goal),
    Clear,
}

/// Body of `PUT ctrl/obj`. `idx` is required. `clear` wins over `mode`, and
/// `mode` over `power_kw`; `target_soc` is a fraction in [0, 1].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ObjectiveUpdate {
    pub idx: usize,
    pub action: ObjectiveAction,
}

impl ObjectiveUpdate {
    pub fn decode(payload: &[u8]) -> Result<Self, CommandError> {
        check_len(payload, OBJECTIVE_PAYLOAD_MAX)?;
        let map = parse_object(payload)?;
        let idx = map
            .get("idx")
            .and_then(Value::as_u64)
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| CommandError::Malformed("`idx` is required".into()))?;
        let clear = match map.get("clear") {
            Some(Value::Bool(b)) => *b,
            Some(v) => v.as_i64() == Some(1),
            None => false,
        };
        if clear {
            return Ok(Self {
                idx,
                action: ObjectiveAction::Clear,
            });
        }
        if let Some(mode) = map.get("mode").and_then(Value::as_str) {
            let goal = match mode {
                "full_discharge" => Goal::FullDischarge,
                "detach" => Goal::Detach,
                "target_soc" => Goal::TargetSoc {
                    target_soc: number_in(&map, "target_soc", 0.0, 1.0).ok_or_else(|| {
                        CommandError::Malformed("`target_soc` in [0, 1] is required".into())
                    })?,
                },
                other => return Err(CommandError::Malformed(format!("unknown mode `{other}`"))),
            };
            return Ok(Self {
                idx,
                action: ObjectiveAction::Goal(goal),
            });
        }
        let power_kw = map
            .get("power_kw")
            .and_then(Value::as_f64)
            .ok_or_else(|| CommandError::Malformed("`power_kw` is required".into()))?
            / 100.0;
        Ok(Self {
            idx,
            action: ObjectiveAction::Set { power_kw },
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        match self.action {
            ObjectiveAction::Set { power_kw } => {
                json!({ "idx": self.idx, "power_kw": centi(power_kw), "clear": 0 })
            }
            ObjectiveAction::Goal(Goal::TargetSoc { target_soc }) => {
                json!({ "idx": self.idx, "mode": "target_soc", "target_soc": target_soc })
            }
            ObjectiveAction::Goal(goal) => json!({ "idx": self.idx, "mode": goal.mode() }),
            ObjectiveAction::Clear => json!({ "idx": self.idx, "clear": 1 }),
        }
        .to_string()
        .into_bytes()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ObjectiveView {
    pub idx: usize,
    pub power_kw: Option<f64>,
    pub goal: Option<Goal>,
}

/// Body of `GET ctrl/obj`.
pub fn encode_objectives(entries: &[ObjectiveView]) -> Vec<u8> {
    let bats: Vec<Value> = entries
        .iter()
        .map(|e| {
            json!({
                "idx": e.idx,
                "has_obj": e.power_kw.is_some() || e.goal.is_some(),
                "power_kw": round2(e.power_kw.unwrap_or(0.0)),
                "mode": e.goal.map(|g| g.mode()),
                "target_soc": e.goal.and_then(|g| g.target_soc()),
            })
        })
        .collect();
    json!({ "bats": bats }).to_string().into_bytes()
}

#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotEntry {
    pub idx: usize,
    pub addr: String,
    pub unit_id: u32,
    pub optimal_kw: f64,
    pub objective_kw: Option<f64>,
    pub power_kw: f64,
    pub soc: f64,
    pub soh: f64,
    pub voltage: f64,
    pub current: f64,
    pub temperature: f64,
    pub lifecycle: Lifecycle,
    pub stale: bool,
}

/// Body of the coordinator's `GET dev/state`.
#[derive(Clone, Debug, PartialEq)]
pub struct FleetSnapshot {
    pub load_kw: f64,
    pub pv_kw: f64,
    pub units: Vec<SnapshotEntry>,
}

impl FleetSnapshot {
    pub fn to_json(&self) -> Vec<u8> {
        let bats: Vec<Value> = self
            .units
            .iter()
            .map(|e| {
                json!({
                    "idx": e.idx,
                    "addr": e.addr,
                    "unit_id": e.unit_id,
                    "u": round2(e.optimal_kw),
                    "obj": e.objective_kw.map(round2),
                    "p": round2(e.power_kw),
                    "S": round2(e.soc),
                    "H": round2(e.soh),
                    "V": round2(e.voltage),
                    "I": round2(e.current),
                    "T": round2(e.temperature),
                    "state": e.lifecycle.as_str(),
                    "stale": e.stale,
                })
            })
            .collect();
        json!({
            "cnt": self.units.len(),
            "load_kw": round2(self.load_kw),
            "pv_kw": round2(self.pv_kw),
            "bats": bats,
        })
        .to_string()
        .into_bytes()
    }

    /// Tag-keyed form for constrained links; every value is a centi-scaled
    /// integer.
    pub fn to_compact(&self) -> Vec<u8> {
        let rows: Vec<Value> = self
            .units
            .iter()
            .map(|e| {
                json!([
                    e.idx,
                    centi(e.optimal_kw),
                    centi(e.soc),
                    centi(e.power_kw),
                    centi(e.voltage),
                    centi(e.current),
                    centi(e.temperature),
                    centi(e.soh),
                    e.lifecycle.code(),
                ])
            })
            .collect();
        json!({
            "0": self.units.len(),
            "1": centi(self.load_kw),
            "2": centi(self.pv_kw),
            "3": rows,
        })
        .to_string()
        .into_bytes()
    }
}
