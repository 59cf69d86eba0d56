mod common;

use std::time::Duration;

use bess_core::config::UnitSettings;
use bess_core::coordinator::{CommandSource, DispatchOutcome};
use bess_core::lifecycle::Lifecycle;
use bess_core::link::{Code, LinkConditions, LocalNetwork, NodeAddr, Request};
use bess_core::link::Link;
use bess_core::protocol::{
    CostUpdate, MPC, OBJECTIVES, ObjectiveAction, ObjectiveUpdate, PARAMS, POWER, STATE, StateReport,
};

use common::*;

#[tokio::test(start_paused = true)]
async fn unregistered_unit_refuses_power() {
    let net = LocalNetwork::new(LinkConditions::ideal(), 3);
    let (operator, _inbox) = net.attach("operator");
    let settings = UnitSettings {
        registration_attempts: 100,
        ..unit_settings(5, 0.5)
    };
    let unit = start_unit(&net, settings);
    let addr = unit_addr(5);
    tokio::time::sleep(Duration::from_secs(3)).await;

    let response = operator
        .request(&addr, Request::put(POWER, br#"{"u":1000}"#.to_vec()))
        .await
        .expect("answered");
    assert_eq!(response.code, Code::Forbidden);
    assert_eq!(unit.state.borrow().setpoint_w, 0.0);

    let response = operator.request(&addr, Request::get(STATE)).await.expect("answered");
    let report = StateReport::decode(&response.payload).expect("state report");
    assert_eq!(report.lifecycle, Lifecycle::Init);
    assert_eq!(report.soc, 0.5);

    let response = operator.request(&addr, Request::post(STATE, Vec::new())).await.expect("answered");
    assert_eq!(response.code, Code::MethodNotAllowed);
    let response = operator.request(&addr, Request::get("dev/unknown")).await.expect("answered");
    assert_eq!(response.code, Code::NotFound);
}

#[tokio::test(start_paused = true)]
async fn lowered_threshold_isolates_unit_and_fleet_skips_it() {
    let mut fleet = Fleet::start(coordinator_settings(5));
    let mut a = fleet.add_unit(unit_settings(1, 0.5));
    let mut b = fleet.add_unit(unit_settings(2, 0.5));
    wait_for_state(&mut a, Lifecycle::Running).await;
    wait_for_state(&mut b, Lifecycle::Running).await;
    fleet.next_status().await;

    let response = fleet
        .ask(unit_addr(2).as_str(), Request::put(PARAMS, br#"{"temp_critical":20}"#.to_vec()))
        .await;
    assert_eq!(response.code, Code::Changed);
    wait_for_state(&mut b, Lifecycle::Isolated).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let params = json(&fleet.ask(unit_addr(2).as_str(), Request::get(PARAMS)).await);
    assert_eq!(params["temp_critical"], 20.0);
    assert_eq!(params["state"], "ISO");

    let status = fleet.fresh_status().await;
    assert_eq!(record(&status, 2).outcome, DispatchOutcome::Skipped);
    assert_eq!(record(&status, 1).outcome, DispatchOutcome::Accepted);
    assert_eq!(b.state.borrow().setpoint_w, 0.0);
}

#[tokio::test(start_paused = true)]
async fn cost_parameters_are_remotely_tunable() {
    let fleet = Fleet::start(coordinator_settings(5));

    let update = CostUpdate {
        gamma: Some(10.0),
        price: Some(0.5),
        ..CostUpdate::default()
    };
    let response = fleet.ask_coordinator(Request::put(MPC, update.encode())).await;
    assert_eq!(response.code, Code::Changed);

    let cost = json(&fleet.ask_coordinator(Request::get(MPC)).await);
    assert_eq!(cost["a"], 1.0);
    assert_eq!(cost["b"], 1.0);
    assert_eq!(cost["g"], 10.0);
    assert_eq!(cost["p"], 0.5);

    let response = fleet.ask_coordinator(Request::put(MPC, b"[1,2]".to_vec())).await;
    assert_eq!(response.code, Code::BadRequest);
    let response = fleet.ask_coordinator(Request::post(MPC, b"{}".to_vec())).await;
    assert_eq!(response.code, Code::MethodNotAllowed);
    let response = fleet.ask_coordinator(Request::get("ctrl/unknown")).await;
    assert_eq!(response.code, Code::NotFound);
}

#[tokio::test(start_paused = true)]
async fn objectives_are_validated_and_clamped() {
    let mut fleet = Fleet::start(coordinator_settings(5));
    let mut a = fleet.add_unit(unit_settings(1, 0.5));
    wait_for_state(&mut a, Lifecycle::Running).await;
    let idx = record(&fleet.next_status().await, 1).idx;

    let unknown = ObjectiveUpdate {
        idx: 4,
        action: ObjectiveAction::Set { power_kw: 1.0 },
    };
    let response = fleet.ask_coordinator(Request::put(OBJECTIVES, unknown.encode())).await;
    assert_eq!(response.code, Code::BadRequest);
    let response = fleet
        .ask_coordinator(Request::put(OBJECTIVES, br#"{"power_kw":100}"#.to_vec()))
        .await;
    assert_eq!(response.code, Code::BadRequest);

    let excessive = ObjectiveUpdate {
        idx,
        action: ObjectiveAction::Set { power_kw: -25.0 },
    };
    let response = fleet.ask_coordinator(Request::put(OBJECTIVES, excessive.encode())).await;
    assert_eq!(response.code, Code::Changed);

    let status = fleet.fresh_status().await;
    let d = record(&status, 1);
    assert_eq!(d.source, CommandSource::Objective);
    assert_eq!(d.kw, -10.0);
}

#[tokio::test(start_paused = true)]
async fn restarted_unit_keeps_its_slot_and_objective() {
    let mut fleet = Fleet::start(coordinator_settings(5));
    let mut a = fleet.add_unit(unit_settings(1, 0.5));
    wait_for_state(&mut a, Lifecycle::Running).await;
    let idx = record(&fleet.next_status().await, 1).idx;

    let set = ObjectiveUpdate {
        idx,
        action: ObjectiveAction::Set { power_kw: 2.0 },
    };
    let response = fleet.ask_coordinator(Request::put(OBJECTIVES, set.encode())).await;
    assert_eq!(response.code, Code::Changed);

    a.task.abort();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut again = fleet.add_unit(unit_settings(1, 0.5));
    wait_for_state(&mut again, Lifecycle::Running).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = fleet.fresh_status().await;
    assert_eq!(status.active, 1);
    let d = record(&status, 1);
    assert_eq!(d.idx, idx);
    assert_eq!(d.addr, NodeAddr::from("unit-1"));
    assert_eq!(d.source, CommandSource::Objective);
    assert_eq!(d.kw, 2.0);
    assert_eq!(d.outcome, DispatchOutcome::Accepted);
    assert_eq!(again.state.borrow().setpoint_w, 2_000.0);
}
