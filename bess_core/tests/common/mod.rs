#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bess_core::agent::{UnitHandle, spawn_unit};
use bess_core::config::{CoordinatorSettings, UnitSettings};
use bess_core::coordinator::{Coordinator, DispatchRecord, FleetStatus, default_forecaster};
use bess_core::lifecycle::Lifecycle;
use bess_core::link::{Code, LinkConditions, LocalLink, LocalNetwork, NodeAddr, Request, Response};
use bess_core::link::Link;
use bess_core::ml::ConstantRegressor;
use bess_core::physics::NoiseSettings;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

pub const COORDINATOR: &str = "coordinator";

pub fn unit_addr(id: u32) -> NodeAddr {
    NodeAddr::from(format!("unit-{id}"))
}

pub fn unit_settings(id: u32, soc: f64) -> UnitSettings {
    UnitSettings {
        id,
        initial_soc: soc,
        seed: Some(u64::from(id)),
        noise: NoiseSettings::disabled(),
        status_every_ticks: 0,
        registration_attempts: 3,
        registration_backoff_ms: 1_000,
        ..UnitSettings::default()
    }
}

pub fn coordinator_settings(capacity: usize) -> CoordinatorSettings {
    CoordinatorSettings {
        capacity,
        seed: Some(42),
        ..CoordinatorSettings::default()
    }
}

pub struct Fleet {
    pub net: LocalNetwork,
    pub operator: LocalLink,
    pub statuses: broadcast::Receiver<FleetStatus>,
    pub coordinator: JoinHandle<()>,
}

impl Fleet {
    pub fn start(settings: CoordinatorSettings) -> Self {
        let net = LocalNetwork::new(LinkConditions::ideal(), 9);
        let (link, inbox) = net.attach(COORDINATOR);
        let forecaster = default_forecaster(&settings);
        let coordinator = Coordinator::new(settings, Arc::new(link), inbox, forecaster).expect("coordinator");
        let statuses = coordinator.subscribe();
        let (operator, _) = net.attach("operator");
        Self {
            net,
            operator,
            statuses,
            coordinator: tokio::spawn(coordinator.run()),
        }
    }

    pub fn add_unit(&self, settings: UnitSettings) -> UnitHandle {
        start_unit(&self.net, settings)
    }

    /// Next status published after this call.
    pub async fn fresh_status(&mut self) -> FleetStatus {
        self.statuses = self.statuses.resubscribe();
        self.next_status().await
    }

    pub async fn next_status(&mut self) -> FleetStatus {
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                match self.statuses.recv().await {
                    Ok(status) => return status,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => panic!("coordinator stopped"),
                }
            }
        })
        .await
        .expect("a cycle within a minute")
    }

    pub async fn ask(&self, to: &str, request: Request) -> Response {
        self.operator
            .request(&NodeAddr::from(to), request)
            .await
            .expect("answered")
    }

    pub async fn ask_coordinator(&self, request: Request) -> Response {
        self.ask(COORDINATOR, request).await
    }
}

pub fn start_unit(net: &LocalNetwork, settings: UnitSettings) -> UnitHandle {
    start_unit_predicting(net, settings, 100.0)
}

/// A unit whose SoH model always answers `soh_percent`.
pub fn start_unit_predicting(net: &LocalNetwork, settings: UnitSettings, soh_percent: f64) -> UnitHandle {
    let (link, inbox) = net.attach(unit_addr(settings.id));
    let model = Box::new(ConstantRegressor::new(settings.pack.feature_len(), vec![soh_percent]));
    spawn_unit(settings, model, Arc::new(link), inbox, NodeAddr::from(COORDINATOR)).expect("unit")
}

pub async fn wait_for_state(unit: &mut UnitHandle, lifecycle: Lifecycle) {
    tokio::time::timeout(Duration::from_secs(60), unit.state.wait_for(|s| s.lifecycle == lifecycle))
        .await
        .expect("state reached in time")
        .expect("unit alive");
}

pub fn record(status: &FleetStatus, unit_id: u32) -> &DispatchRecord {
    status
        .dispatches
        .iter()
        .find(|d| d.unit_id == unit_id)
        .unwrap_or_else(|| panic!("no dispatch for unit {unit_id}"))
}

pub fn json(response: &Response) -> serde_json::Value {
    assert_eq!(response.code, Code::Content);
    serde_json::from_slice(&response.payload).expect("json payload")
}
