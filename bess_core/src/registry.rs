//! Bounded, append-only table of the units a coordinator knows about.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::RegistryError;
use crate::lifecycle::Lifecycle;
use crate::link::NodeAddr;
use crate::protocol::{FleetSnapshot, ObjectiveView, SnapshotEntry, StateReport};
use crate::supervisor::Goal;

/// Coordinator-side mirror of one unit.
#[derive(Clone, Debug)]
pub struct FleetEntry {
    pub idx: usize,
    pub addr: NodeAddr,
    pub unit_id: u32,
    pub active: bool,
    pub voltage: f64,
    pub current: f64,
    pub temperature: f64,
    pub soc: f64,
    pub soh: f64,
    pub lifecycle: Lifecycle,
    pub power_kw: f64,
    pub optimal_u_kw: f64,
    pub objective_kw: Option<f64>,
    pub goal: Option<Goal>,
    pub subscribed: bool,
    /// At least one telemetry report since (re-)registration.
    pub reported: bool,
    pub last_update: Instant,
}

impl FleetEntry {
    fn new(idx: usize, addr: NodeAddr, unit_id: u32, now: Instant) -> Self {
        Self {
            idx,
            addr,
            unit_id,
            active: true,
            voltage: 0.0,
            current: 0.0,
            temperature: 25.0,
            soc: 0.5,
            soh: 1.0,
            lifecycle: Lifecycle::Init,
            power_kw: 0.0,
            optimal_u_kw: 0.0,
            objective_kw: None,
            goal: None,
            subscribed: false,
            reported: false,
            last_update: now,
        }
    }

    pub fn effective_command_kw(&self) -> f64 {
        self.objective_kw.unwrap_or(self.optimal_u_kw)
    }

    pub fn is_isolated(&self) -> bool {
        self.lifecycle.is_isolated()
    }

    pub fn is_stale(&self, now: Instant, stale_after: Duration) -> bool {
        now.saturating_duration_since(self.last_update) > stale_after
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registration {
    pub idx: usize,
    pub fresh: bool,
}

pub struct FleetRegistry {
    capacity: usize,
    entries: Vec<FleetEntry>,
}

impl FleetRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Allocate the next slot, or reuse the slot already held by `addr`.
    /// A reused slot is reset to defaults and loses its subscription; its
    /// objective and goal are kept. A deactivated slot is never reused.
    pub fn register(&mut self, addr: NodeAddr, unit_id: u32, now: Instant) -> Result<Registration, RegistryError> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.addr == addr) {
            if !entry.active {
                return Err(RegistryError::Inactive(entry.idx));
            }
            let (objective, goal) = (entry.objective_kw, entry.goal);
            *entry = FleetEntry::new(entry.idx, addr, unit_id, now);
            entry.objective_kw = objective;
            entry.goal = goal;
            return Ok(Registration {
                idx: entry.idx,
                fresh: false,
            });
        }
        if self.is_full() {
            return Err(RegistryError::Full {
                capacity: self.capacity,
            });
        }
        let idx = self.entries.len();
        self.entries.push(FleetEntry::new(idx, addr, unit_id, now));
        Ok(Registration { idx, fresh: true })
    }

    pub fn get(&self, idx: usize) -> Option<&FleetEntry> {
        self.entries.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut FleetEntry> {
        self.entries.get_mut(idx)
    }

    pub fn entries(&self) -> &[FleetEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut FleetEntry> {
        self.entries.iter_mut()
    }

    pub fn active(&self) -> impl Iterator<Item = &FleetEntry> {
        self.entries.iter().filter(|e| e.active)
    }

    pub fn find_by_addr(&self, addr: &NodeAddr) -> Option<usize> {
        self.entries.iter().position(|e| &e.addr == addr)
    }

    /// Mirror a telemetry report from `addr`. Returns the entry index, or
    /// `None` when the sender never registered.
    pub fn apply_report(&mut self, addr: &NodeAddr, report: &StateReport, now: Instant) -> Option<usize> {
        let entry = self.entries.iter_mut().find(|e| &e.addr == addr)?;
        entry.voltage = report.voltage;
        entry.current = report.current;
        entry.temperature = report.temperature;
        entry.soc = report.soc;
        entry.soh = report.soh;
        entry.lifecycle = report.lifecycle;
        entry.power_kw = report.power_kw();
        entry.reported = true;
        entry.last_update = now;
        Some(entry.idx)
    }

    pub fn mark_subscribed(&mut self, idx: usize) {
        if let Some(entry) = self.entries.get_mut(idx) {
            entry.subscribed = true;
        }
    }

    pub fn deactivate(&mut self, idx: usize) -> Result<(), RegistryError> {
        let entry = self.entries.get_mut(idx).ok_or(RegistryError::InvalidIndex(idx))?;
        entry.active = false;
        Ok(())
    }

    fn active_entry_mut(&mut self, idx: usize) -> Result<&mut FleetEntry, RegistryError> {
        let entry = self.entries.get_mut(idx).ok_or(RegistryError::InvalidIndex(idx))?;
        if !entry.active {
            return Err(RegistryError::Inactive(idx));
        }
        Ok(entry)
    }

    /// A fixed objective replaces any goal.
    pub fn set_objective(&mut self, idx: usize, power_kw: f64) -> Result<(), RegistryError> {
        let entry = self.active_entry_mut(idx)?;
        entry.objective_kw = Some(power_kw);
        entry.goal = None;
        Ok(())
    }

    pub fn set_goal(&mut self, idx: usize, goal: Goal) -> Result<(), RegistryError> {
        let entry = self.active_entry_mut(idx)?;
        entry.goal = Some(goal);
        entry.objective_kw = None;
        Ok(())
    }

    pub fn clear_objective(&mut self, idx: usize) -> Result<(), RegistryError> {
        let entry = self.active_entry_mut(idx)?;
        entry.objective_kw = None;
        entry.goal = None;
        Ok(())
    }

    pub fn objectives(&self) -> Vec<ObjectiveView> {
        self.active()
            .map(|e| ObjectiveView {
                idx: e.idx,
                power_kw: e.objective_kw,
                goal: e.goal,
            })
            .collect()
    }

    pub fn stale(&self, now: Instant, stale_after: Duration) -> Vec<usize> {
        self.active()
            .filter(|e| e.is_stale(now, stale_after))
            .map(|e| e.idx)
            .collect()
    }

    pub fn snapshot(&self, load_kw: f64, pv_kw: f64, now: Instant, stale_after: Duration) -> FleetSnapshot {
        FleetSnapshot {
            load_kw,
            pv_kw,
            units: self
                .active()
                .map(|e| SnapshotEntry {
                    idx: e.idx,
                    addr: e.addr.to_string(),
                    unit_id: e.unit_id,
                    optimal_kw: e.optimal_u_kw,
                    objective_kw: e.objective_kw,
                    power_kw: e.power_kw,
                    soc: e.soc,
                    soh: e.soh,
                    voltage: e.voltage,
                    current: e.current,
                    temperature: e.temperature,
                    lifecycle: e.lifecycle,
                    stale: e.is_stale(now, stale_after),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u32) -> NodeAddr {
        NodeAddr::from(format!("unit-{n}"))
    }

    #[test]
    fn registration_beyond_capacity_is_rejected() {
        let now = Instant::now();
        let mut registry = FleetRegistry::new(2);
        registry.register(addr(1), 1, now).expect("slot 0");
        registry.register(addr(2), 2, now).expect("slot 1");
        registry.set_objective(1, 2.5).expect("active");

        let err = registry.register(addr(3), 3, now).unwrap_err();
        assert_eq!(err, RegistryError::Full { capacity: 2 });
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(0).map(|e| e.unit_id), Some(1));
        assert_eq!(registry.get(1).and_then(|e| e.objective_kw), Some(2.5));
    }

    #[test]
    fn known_address_keeps_its_slot() {
        let now = Instant::now();
        let mut registry = FleetRegistry::new(1);
        registry.register(addr(1), 1, now).expect("slot 0");
        registry.mark_subscribed(0);
        registry.set_objective(0, -1.0).expect("active");

        let again = registry.register(addr(1), 1, now).expect("same slot");
        assert_eq!(again, Registration { idx: 0, fresh: false });
        let entry = registry.get(0).expect("entry");
        assert!(!entry.subscribed);
        assert_eq!(entry.objective_kw, Some(-1.0));
    }

    #[test]
    fn deactivated_slot_stays_retired() {
        let now = Instant::now();
        let mut registry = FleetRegistry::new(2);
        registry.register(addr(1), 1, now).expect("slot 0");
        registry.deactivate(0).expect("exists");

        assert_eq!(registry.register(addr(1), 1, now), Err(RegistryError::Inactive(0)));
        assert!(!registry.get(0).expect("entry").active);
        assert_eq!(registry.active().count(), 0);
        assert_eq!(registry.register(addr(2), 2, now).map(|r| r.idx), Ok(1));
    }

    #[test]
    fn goal_and_fixed_objective_replace_each_other() {
        let now = Instant::now();
        let mut registry = FleetRegistry::new(1);
        registry.register(addr(1), 1, now).expect("slot 0");
        registry.set_objective(0, 2.0).expect("active");
        registry.set_goal(0, Goal::FullDischarge).expect("active");
        let entry = registry.get(0).expect("entry");
        assert_eq!((entry.objective_kw, entry.goal), (None, Some(Goal::FullDischarge)));

        registry.register(addr(1), 1, now).expect("same slot");
        assert_eq!(registry.get(0).and_then(|e| e.goal), Some(Goal::FullDischarge));

        registry.set_objective(0, 1.0).expect("active");
        assert_eq!(registry.get(0).and_then(|e| e.goal), None);
        registry.clear_objective(0).expect("active");
        assert_eq!(registry.objectives()[0], ObjectiveView { idx: 0, power_kw: None, goal: None });
    }

    #[test]
    fn reports_from_unknown_senders_are_ignored() {
        let now = Instant::now();
        let mut registry = FleetRegistry::new(2);
        registry.register(addr(1), 1, now).expect("slot 0");
        let report = StateReport {
            voltage: 4.0,
            current: 250.0,
            temperature: 30.0,
            soc: 0.6,
            soh: 0.97,
            lifecycle: Lifecycle::Running,
        };
        assert_eq!(registry.apply_report(&addr(9), &report, now), None);
        assert!(!registry.get(0).expect("entry").reported);
        assert_eq!(registry.apply_report(&addr(1), &report, now), Some(0));
        let entry = registry.get(0).expect("entry");
        assert!(entry.reported);
        assert_eq!(entry.lifecycle, Lifecycle::Running);
        assert!((entry.power_kw - 1.0).abs() < 1e-9);
    }

    #[test]
    fn objectives_require_an_active_entry() {
        let now = Instant::now();
        let mut registry = FleetRegistry::new(2);
        registry.register(addr(1), 1, now).expect("slot 0");
        assert_eq!(registry.set_objective(4, 1.0), Err(RegistryError::InvalidIndex(4)));
        registry.deactivate(0).expect("exists");
        assert_eq!(registry.set_objective(0, 1.0), Err(RegistryError::Inactive(0)));
    }

    #[test]
    fn stale_entries_are_flagged_not_removed() {
        let start = Instant::now();
        let mut registry = FleetRegistry::new(2);
        registry.register(addr(1), 1, start).expect("slot 0");
        let later = start + Duration::from_secs(60);
        assert_eq!(registry.stale(later, Duration::from_secs(30)), vec![0]);
        assert_eq!(registry.len(), 1);
        let snapshot = registry.snapshot(0.0, 0.0, later, Duration::from_secs(30));
        assert!(snapshot.units[0].stale);
    }
}
