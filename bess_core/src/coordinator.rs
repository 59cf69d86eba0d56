//! Microgrid coordinator actor.
//!
//! Owns the fleet registry and cost parameters. Each cycle it advances the
//! environment, refreshes the forecast, steers operator goals, runs the
//! optimizer and dispatches one command per unit, strictly one exchange after
//! another. Alerts and telemetry rows from the cycle go to the history.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::CoordinatorSettings;
use crate::error::ModelError;
use crate::forecast::{Environment, EnvironmentSample, Forecast, ForecastFeed, PersistenceForecaster};
use crate::link::{Code, ContentFormat, Inbound, Link, Method, NodeAddr, Notification, Request, Response};
use crate::ml::Regressor;
use crate::optimizer::{CostParameters, FleetOptimizer};
use crate::error::RegistryError;
use crate::protocol::{
    self, ALERTS, CostUpdate, HISTORY_PREFIX, MPC, OBJECTIVES, ObjectiveAction, ObjectiveUpdate, POWER, PowerCommand,
    REGISTER, STATE, StateReport,
};
use crate::registry::FleetRegistry;
use crate::supervisor::{self, Alert, AlertKind, Goal, GoalStep, History, Severity, TelemetryRecord};

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub enum CommandSource {
    #[serde(rename = "OBJ")]
    Objective,
    #[serde(rename = "GOAL")]
    Goal,
    #[serde(rename = "MPC")]
    Optimizer,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Accepted,
    Rejected { code: String },
    NoAck { reason: String },
    Skipped,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct DispatchRecord {
    pub id: Uuid,
    pub idx: usize,
    pub unit_id: u32,
    pub addr: NodeAddr,
    pub kw: f64,
    pub source: CommandSource,
    #[serde(flatten)]
    pub outcome: DispatchOutcome,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub enum GridExchange {
    Balanced,
    Import,
    Export,
}

impl GridExchange {
    pub fn classify(expected_kw: f64, band_kw: f64) -> Self {
        if expected_kw.abs() < band_kw {
            GridExchange::Balanced
        } else if expected_kw > 0.0 {
            GridExchange::Import
        } else {
            GridExchange::Export
        }
    }
}

/// Summary of one control cycle.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct FleetStatus {
    pub cycle: u64,
    pub at: DateTime<Utc>,
    pub environment: EnvironmentSample,
    pub forecast: Forecast,
    pub active: usize,
    pub optimized: usize,
    pub avg_soc: Option<f64>,
    pub dispatched_kw: f64,
    pub expected_grid_kw: f64,
    pub grid: GridExchange,
    /// From mirrored battery power rather than this cycle's commands.
    pub measured_grid_kw: f64,
    pub profit_eur: f64,
    pub profit_total_eur: f64,
    pub stale: Vec<usize>,
    pub dispatches: Vec<DispatchRecord>,
    pub alerts: Vec<Alert>,
    pub telemetry: Vec<TelemetryRecord>,
}

impl FleetStatus {
    pub fn dispatch_for(&self, idx: usize) -> Option<&DispatchRecord> {
        self.dispatches.iter().find(|d| d.idx == idx)
    }

    pub fn alerts_for(&self, idx: usize) -> impl Iterator<Item = &Alert> {
        self.alerts.iter().filter(move |a| a.idx == idx)
    }
}

pub fn default_forecaster(settings: &CoordinatorSettings) -> Box<dyn Regressor> {
    Box::new(PersistenceForecaster::new(
        settings.forecast_window,
        settings.environment.pv_peak_kw,
    ))
}

pub struct Coordinator {
    settings: CoordinatorSettings,
    link: Arc<dyn Link>,
    inbox: mpsc::Receiver<Inbound>,
    registry: FleetRegistry,
    cost: CostParameters,
    optimizer: FleetOptimizer,
    environment: Environment,
    feed: ForecastFeed,
    status_tx: broadcast::Sender<FleetStatus>,
    history: History,
    last_sample: Option<EnvironmentSample>,
    profit_total_eur: f64,
    cycle: u64,
}

impl Coordinator {
    pub fn new(
        settings: CoordinatorSettings,
        link: Arc<dyn Link>,
        inbox: mpsc::Receiver<Inbound>,
        forecaster: Box<dyn Regressor>,
    ) -> Result<Self, ModelError> {
        let feed = ForecastFeed::new(
            settings.forecast_window,
            settings.environment.pv_peak_kw,
            forecaster,
        )?;
        let seed = settings.seed.unwrap_or_else(rand::random);
        let (status_tx, _) = broadcast::channel(32);
        Ok(Self {
            registry: FleetRegistry::new(settings.capacity),
            cost: settings.cost.clone(),
            optimizer: FleetOptimizer::new(settings.optimizer.clone()),
            environment: Environment::new(settings.environment.clone(), seed),
            feed,
            history: History::new(settings.history_len),
            settings,
            link,
            inbox,
            status_tx,
            last_sample: None,
            profit_total_eur: 0.0,
            cycle: 0,
        })
    }

    /// Per-cycle status feed. Subscribe before calling [`Coordinator::run`].
    pub fn subscribe(&self) -> broadcast::Receiver<FleetStatus> {
        self.status_tx.subscribe()
    }

    pub fn registry(&self) -> &FleetRegistry {
        &self.registry
    }

    pub fn cost(&self) -> &CostParameters {
        &self.cost
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub async fn run(mut self) {
        let period = self.settings.cycle();
        let mut cycle = time::interval_at(Instant::now() + period, period);
        cycle.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            addr = %self.link.local_addr(),
            capacity = self.settings.capacity,
            cycle_ms = self.settings.cycle_ms,
            "coordinator started"
        );
        loop {
            tokio::select! {
                _ = cycle.tick() => {
                    self.run_cycle().await;
                }
                event = self.inbox.recv() => match event {
                    Some(event) => self.on_inbound(event).await,
                    None => {
                        info!("inbox closed, coordinator stopping");
                        break;
                    }
                },
            }
        }
    }

    async fn on_inbound(&mut self, event: Inbound) {
        match event {
            Inbound::Request { request, reply } => self.on_request(request, reply).await,
            Inbound::Notification(notification) => self.on_notification(notification),
        }
    }

    fn on_notification(&mut self, n: Notification) {
        if n.path != STATE {
            debug!(path = %n.path, from = %n.source, "ignoring notification");
            return;
        }
        match StateReport::decode(&n.payload) {
            Ok(report) => {
                if self.registry.apply_report(&n.source, &report, Instant::now()).is_none() {
                    debug!(from = %n.source, "telemetry from unregistered node");
                }
            }
            Err(err) => warn!(from = %n.source, %err, "undecodable telemetry"),
        }
    }

    async fn on_request(&mut self, request: Request, reply: oneshot::Sender<Response>) {
        let path = request.path.clone();
        if let Some(idx) = path.strip_prefix(HISTORY_PREFIX) {
            let response = match request.method {
                Method::Get => self.telemetry_history(idx),
                _ => Response::new(Code::MethodNotAllowed),
            };
            let _ = reply.send(response);
            return;
        }
        let response = match (path.as_str(), request.method) {
            (REGISTER, Method::Post) => return self.handle_register(request, reply).await,
            (STATE, Method::Get) => self.fleet_state(request.accept),
            (MPC, Method::Get) => Response::with_payload(Code::Content, protocol::encode_cost(&self.cost)),
            (MPC, Method::Put) => self.update_cost(&request.payload),
            (OBJECTIVES, Method::Get) => Response::with_payload(
                Code::Content,
                protocol::encode_objectives(&self.registry.objectives()),
            ),
            (OBJECTIVES, Method::Put) => self.update_objective(&request.payload),
            (ALERTS, Method::Get) => self.alert_log(),
            (REGISTER | STATE | MPC | OBJECTIVES | ALERTS, _) => Response::new(Code::MethodNotAllowed),
            _ => Response::new(Code::NotFound),
        };
        let _ = reply.send(response);
    }

    async fn handle_register(&mut self, request: Request, reply: oneshot::Sender<Response>) {
        let unit_id = match protocol::decode_registration(&request.payload) {
            Ok(id) => id,
            Err(err) => {
                warn!(from = %request.source, %err, "bad registration payload");
                let _ = reply.send(Response::new(Code::BadRequest));
                return;
            }
        };
        match self.registry.register(request.source.clone(), unit_id, Instant::now()) {
            Ok(registration) => {
                let code = if registration.fresh { Code::Created } else { Code::Changed };
                info!(
                    unit = unit_id,
                    idx = registration.idx,
                    addr = %request.source,
                    fresh = registration.fresh,
                    "unit registered"
                );
                let _ = reply.send(Response::with_payload(code, registration.idx.to_string().into_bytes()));
                self.subscribe_unit(registration.idx).await;
            }
            Err(err) => {
                warn!(unit = unit_id, addr = %request.source, %err, "registration rejected");
                let code = match err {
                    RegistryError::Full { .. } => Code::ServiceUnavailable,
                    _ => Code::Forbidden,
                };
                let _ = reply.send(Response::new(code));
            }
        }
    }

    async fn subscribe_unit(&mut self, idx: usize) {
        let Some(addr) = self.registry.get(idx).map(|e| e.addr.clone()) else {
            return;
        };
        match self.link.request(&addr, Request::observe(STATE)).await {
            Ok(response) if response.code == Code::Content => {
                self.registry.mark_subscribed(idx);
                match StateReport::decode(&response.payload) {
                    Ok(report) => {
                        self.registry.apply_report(&addr, &report, Instant::now());
                    }
                    Err(err) => debug!(idx, %err, "initial state undecodable"),
                }
                info!(idx, %addr, "telemetry subscription established");
            }
            Ok(response) => warn!(idx, %addr, code = ?response.code, "subscription refused"),
            Err(err) => warn!(idx, %addr, %err, "subscription failed, retrying next cycle"),
        }
    }

    fn fleet_state(&self, format: ContentFormat) -> Response {
        let (load, pv) = self
            .last_sample
            .as_ref()
            .map(|s| (s.load_kw, s.pv_kw))
            .unwrap_or((0.0, 0.0));
        let snapshot = self
            .registry
            .snapshot(load, pv, Instant::now(), self.settings.stale_after());
        let payload = match format {
            ContentFormat::Json => snapshot.to_json(),
            ContentFormat::Compact => snapshot.to_compact(),
        };
        Response::with_payload(Code::Content, payload)
    }

    fn update_cost(&mut self, payload: &[u8]) -> Response {
        match CostUpdate::decode(payload) {
            Ok(update) => {
                self.cost.apply(&update);
                info!(cost = ?self.cost, "cost parameters updated");
                Response::new(Code::Changed)
            }
            Err(err) => {
                warn!(%err, "cost update rejected");
                Response::new(Code::BadRequest)
            }
        }
    }

    fn update_objective(&mut self, payload: &[u8]) -> Response {
        let update = match ObjectiveUpdate::decode(payload) {
            Ok(update) => update,
            Err(err) => {
                warn!(%err, "objective update rejected");
                return Response::new(Code::BadRequest);
            }
        };
        let max = self.optimizer.settings().max_power_kw;
        let result = match update.action {
            ObjectiveAction::Set { power_kw } => self.registry.set_objective(update.idx, power_kw.clamp(-max, max)),
            ObjectiveAction::Goal(goal) => self.registry.set_goal(update.idx, goal),
            ObjectiveAction::Clear => self.registry.clear_objective(update.idx),
        };
        match result {
            Ok(()) => {
                info!(idx = update.idx, action = ?update.action, "objective updated");
                Response::new(Code::Changed)
            }
            Err(err) => {
                warn!(idx = update.idx, %err, "objective update rejected");
                Response::new(Code::BadRequest)
            }
        }
    }

    /// `GET ctrl/alerts`: newest first.
    fn alert_log(&self) -> Response {
        encode_view(&AlertLog {
            alerts: self.history.alerts().collect(),
        })
    }

    /// `GET ctrl/hist/<idx>`: that unit's telemetry rows, newest first.
    fn telemetry_history(&self, idx: &str) -> Response {
        let Ok(idx) = idx.parse::<usize>() else {
            return Response::new(Code::BadRequest);
        };
        if self.registry.get(idx).is_none() {
            return Response::new(Code::NotFound);
        }
        encode_view(&TelemetryLog {
            idx,
            rows: self.history.telemetry(idx).collect(),
        })
    }

    /// Move every goal one step before the optimizer sees the fleet.
    fn steer_goals(&mut self) -> Vec<Alert> {
        let max = self.optimizer.settings().max_power_kw;
        let cycle = self.cycle;
        let mut alerts = Vec::new();
        for entry in self.registry.entries_mut().filter(|e| e.active) {
            let Some(goal) = entry.goal else {
                continue;
            };
            if !entry.reported {
                alerts.push(Alert::new(
                    cycle,
                    entry,
                    Severity::Warning,
                    AlertKind::SocUnknown,
                    format!("cannot apply {}: state of charge unknown", goal.mode()),
                ));
                continue;
            }
            match goal.step(entry.soc, max) {
                GoalStep::Steer(kw) => {
                    entry.objective_kw = Some(kw);
                    debug!(idx = entry.idx, mode = goal.mode(), soc = entry.soc, kw, "goal steering");
                }
                GoalStep::Done { hold_kw } => {
                    entry.goal = None;
                    entry.objective_kw = hold_kw;
                    let (kind, message) = match goal {
                        Goal::Detach => (AlertKind::Detached, "unit detached, held at 0 kW".to_string()),
                        Goal::FullDischarge => (
                            AlertKind::GoalReached,
                            format!("full discharge complete at {:.1} % SoC, objective removed", entry.soc * 100.0),
                        ),
                        Goal::TargetSoc { target_soc } => (
                            AlertKind::GoalReached,
                            format!(
                                "target SoC {:.1} % reached at {:.1} %, objective removed",
                                target_soc * 100.0,
                                entry.soc * 100.0
                            ),
                        ),
                    };
                    alerts.push(Alert::new(cycle, entry, Severity::Info, kind, message));
                }
            }
        }
        alerts
    }

    /// One full control cycle.
    pub async fn run_cycle(&mut self) -> FleetStatus {
        self.cycle += 1;

        let unsubscribed: Vec<usize> = self
            .registry
            .active()
            .filter(|e| !e.subscribed)
            .map(|e| e.idx)
            .collect();
        for idx in unsubscribed {
            self.subscribe_unit(idx).await;
        }

        let sample = self.environment.advance();
        self.feed.push(&sample);
        let forecast = self.feed.forecast();

        let stale = self.registry.stale(Instant::now(), self.settings.stale_after());
        if !stale.is_empty() {
            warn!(cycle = self.cycle, ?stale, "telemetry is stale for some units");
        }

        let mut alerts = self.steer_goals();
        let optimized = self.optimizer.run(&self.cost, &mut self.registry);

        let plan: Vec<_> = self
            .registry
            .active()
            .map(|e| {
                let source = if e.goal.is_some() {
                    CommandSource::Goal
                } else if e.objective_kw.is_some() {
                    CommandSource::Objective
                } else {
                    CommandSource::Optimizer
                };
                (e.idx, e.unit_id, e.addr.clone(), e.effective_command_kw(), source, e.is_isolated())
            })
            .collect();

        let mut dispatches = Vec::with_capacity(plan.len());
        let mut dispatched_kw = 0.0;
        for (idx, unit_id, addr, kw, source, isolated) in plan {
            let outcome = if isolated {
                DispatchOutcome::Skipped
            } else {
                dispatched_kw += kw;
                let request = Request::put(POWER, PowerCommand::from_kw(kw).encode());
                match self.link.request(&addr, request).await {
                    Ok(response) if response.code == Code::Changed => DispatchOutcome::Accepted,
                    Ok(response) => DispatchOutcome::Rejected {
                        code: format!("{:?}", response.code),
                    },
                    Err(err) => DispatchOutcome::NoAck {
                        reason: err.to_string(),
                    },
                }
            };
            info!(idx, unit = unit_id, kw = format_args!("{kw:+.3}"), ?source, ?outcome, "dispatch");
            dispatches.push(DispatchRecord {
                id: Uuid::new_v4(),
                idx,
                unit_id,
                addr,
                kw,
                source,
                outcome,
            });
        }

        let active: Vec<f64> = self.registry.active().map(|e| e.soc).collect();
        let avg_soc = (!active.is_empty()).then(|| active.iter().sum::<f64>() / active.len() as f64);
        let expected_grid_kw = sample.load_kw - sample.pv_kw + dispatched_kw;
        let grid = GridExchange::classify(expected_grid_kw, self.settings.balanced_band_kw);

        let at = Utc::now();
        let reporting: Vec<_> = self.registry.active().filter(|e| e.reported).collect();
        let measured_grid_kw =
            supervisor::measured_grid_kw(sample.load_kw, sample.pv_kw, reporting.iter().map(|e| e.power_kw));
        let profit_eur =
            supervisor::interval_profit_eur(self.cost.price, measured_grid_kw, self.settings.environment.step_hours);
        let total_abs_kw: f64 = reporting.iter().map(|e| e.power_kw.abs()).sum();
        let mut telemetry = Vec::with_capacity(reporting.len());
        for e in &reporting {
            alerts.extend(self.settings.alerts.check(self.cycle, e));
            telemetry.push(TelemetryRecord {
                cycle: self.cycle,
                at,
                idx: e.idx,
                unit_id: e.unit_id,
                soc: e.soc,
                soh: e.soh,
                voltage: e.voltage,
                current: e.current,
                temperature: e.temperature,
                power_kw: e.power_kw,
                optimal_kw: e.optimal_u_kw,
                grid_kw: measured_grid_kw,
                load_kw: sample.load_kw,
                pv_kw: sample.pv_kw,
                profit_eur: supervisor::profit_share(profit_eur, e.power_kw, total_abs_kw),
            });
        }
        self.profit_total_eur += profit_eur;
        for alert in &alerts {
            log_alert(alert);
            self.history.push_alert(alert.clone());
        }
        for row in &telemetry {
            self.history.push_telemetry(row.clone());
        }

        info!(
            cycle = self.cycle,
            hour = sample.hour,
            load_kw = format_args!("{:.2}", sample.load_kw),
            pv_kw = format_args!("{:.2}", sample.pv_kw),
            forecast_pv_kw = format_args!("{:.2}", forecast.pv_kw),
            forecast_load_kw = format_args!("{:.2}", forecast.load_kw),
            avg_soc = format_args!("{:.3}", avg_soc.unwrap_or(0.0)),
            expected_grid_kw = format_args!("{expected_grid_kw:+.2}"),
            ?grid,
            profit_eur = format_args!("{profit_eur:+.3}"),
            alerts = alerts.len(),
            "cycle complete"
        );

        let status = FleetStatus {
            cycle: self.cycle,
            at,
            environment: sample.clone(),
            forecast,
            active: active.len(),
            optimized,
            avg_soc,
            dispatched_kw,
            expected_grid_kw,
            grid,
            measured_grid_kw,
            profit_eur,
            profit_total_eur: self.profit_total_eur,
            stale,
            dispatches,
            alerts,
            telemetry,
        };
        self.last_sample = Some(sample);
        let _ = self.status_tx.send(status.clone());
        status
    }
}

#[derive(Serialize)]
struct AlertLog<'a> {
    alerts: Vec<&'a Alert>,
}

#[derive(Serialize)]
struct TelemetryLog<'a> {
    idx: usize,
    rows: Vec<&'a TelemetryRecord>,
}

fn encode_view<T: Serialize>(view: &T) -> Response {
    match serde_json::to_vec(view) {
        Ok(payload) => Response::with_payload(Code::Content, payload),
        Err(err) => {
            warn!(%err, "view not serializable");
            Response::new(Code::InternalError)
        }
    }
}

fn log_alert(alert: &Alert) {
    match alert.severity {
        Severity::Critical => {
            error!(idx = alert.idx, unit = alert.unit_id, kind = ?alert.kind, "{}", alert.message)
        }
        Severity::Warning => warn!(idx = alert.idx, unit = alert.unit_id, kind = ?alert.kind, "{}", alert.message),
        Severity::Info => info!(idx = alert.idx, unit = alert.unit_id, kind = ?alert.kind, "{}", alert.message),
    }
}
