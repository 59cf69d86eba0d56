//! A battery unit as a single actor: one event at a time from its tick timer,
//! push timer, registration timer, network inbox and reset button.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::UnitSettings;
use crate::controller::UnitController;
use crate::error::{AgentError, CommandError, ModelError};
use crate::lifecycle::{Lifecycle, LocalReset};
use crate::link::{Code, Inbound, Link, Method, NodeAddr, Request, Response};
use crate::ml::Regressor;
use crate::physics::{PhysicalModel, UnitState};
use crate::protocol::{self, PARAMS, POWER, REGISTER, STATE};
use crate::safety::SafetyEvaluator;

/// The unit's physical reset button. Held by local hardware glue only.
#[derive(Clone)]
pub struct ResetButton {
    tx: mpsc::Sender<LocalReset>,
}

impl ResetButton {
    pub async fn press(&self) -> bool {
        self.tx.send(LocalReset::new()).await.is_ok()
    }
}

/// Read-only view of a unit for local displays and tests.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct UnitSnapshot {
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
}

impl From<&UnitState> for UnitSnapshot {
    fn from(s: &UnitState) -> Self {
        Self {
            id: s.id,
            lifecycle: s.lifecycle,
            voltage: s.voltage,
            current: s.current,
            temperature: s.temperature,
            soc: s.soc,
            soh: s.soh,
            capacity_ah: s.capacity_ah,
            setpoint_w: s.setpoint_w,
            charge_cycles: s.charge_cycles,
            ah_throughput: s.ah_throughput,
            peak_temperature: s.peak_temperature,
        }
    }
}

pub struct UnitHandle {
    pub id: u32,
    pub reset: ResetButton,
    pub state: watch::Receiver<UnitSnapshot>,
    pub task: JoinHandle<Result<(), AgentError>>,
}

/// Wire a controller from settings and a SoH model.
pub fn build_controller(settings: &UnitSettings, soh_model: Box<dyn Regressor>) -> Result<UnitController, ModelError> {
    let safety = SafetyEvaluator::new(soh_model, &settings.pack)?;
    let state = UnitState::new(
        settings.id,
        &settings.pack,
        settings.thresholds.clone(),
        settings.initial_soc,
    );
    let seed = settings.seed.unwrap_or_else(rand::random);
    let model = PhysicalModel::new(
        settings.pack.clone(),
        settings.aging.clone(),
        settings.noise.clone(),
        seed,
    );
    Ok(UnitController::new(state, model, safety))
}

pub struct UnitAgent {
    settings: UnitSettings,
    controller: UnitController,
    link: Arc<dyn Link>,
    coordinator: NodeAddr,
    inbox: mpsc::Receiver<Inbound>,
    resets: mpsc::Receiver<LocalReset>,
    observers: Vec<NodeAddr>,
    state_tx: watch::Sender<UnitSnapshot>,
    ticks: u64,
}

impl UnitAgent {
    pub fn new(
        settings: UnitSettings,
        controller: UnitController,
        link: Arc<dyn Link>,
        inbox: mpsc::Receiver<Inbound>,
        coordinator: NodeAddr,
    ) -> (Self, ResetButton, watch::Receiver<UnitSnapshot>) {
        let (reset_tx, resets) = mpsc::channel(4);
        let (state_tx, state_rx) = watch::channel(UnitSnapshot::from(controller.state()));
        let agent = Self {
            settings,
            controller,
            link,
            coordinator,
            inbox,
            resets,
            observers: Vec::new(),
            state_tx,
            ticks: 0,
        };
        (agent, ResetButton { tx: reset_tx }, state_rx)
    }

    /// Runs until the inbox closes or registration is exhausted.
    pub async fn run(mut self) -> Result<(), AgentError> {
        let id = self.settings.id;
        let mut tick = time::interval(self.settings.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let period = self.settings.notify_period();
        let mut notify = time::interval_at(Instant::now() + period, period);
        notify.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let max_attempts = self.settings.registration_attempts.max(1);
        let mut attempts = 0u32;
        let mut next_attempt = Some(Instant::now());

        info!(unit = id, coordinator = %self.coordinator, "unit agent started");
        loop {
            let registering = next_attempt.is_some();
            let attempt_at = next_attempt.unwrap_or_else(Instant::now);
            tokio::select! {
                _ = tick.tick() => self.on_tick().await,
                _ = notify.tick() => {
                    if self.controller.lifecycle().is_running() {
                        self.push_state().await;
                    }
                }
                event = self.inbox.recv() => match event {
                    Some(event) => self.on_inbound(event).await,
                    None => return Err(AgentError::InboxClosed),
                },
                Some(token) = self.resets.recv() => self.on_reset(token).await,
                _ = time::sleep_until(attempt_at), if registering => {
                    attempts += 1;
                    if self.try_register(attempts).await {
                        next_attempt = None;
                    } else if attempts >= max_attempts {
                        error!(unit = id, attempts, "registration exhausted, unit halted");
                        return Err(AgentError::RegistrationExhausted { attempts });
                    } else {
                        next_attempt = Some(Instant::now() + self.settings.registration_backoff());
                    }
                }
            }
        }
    }

    async fn try_register(&mut self, attempt: u32) -> bool {
        let id = self.settings.id;
        info!(unit = id, attempt, "registering with coordinator");
        let request = Request::post(REGISTER, protocol::encode_registration(id));
        match self.link.request(&self.coordinator, request).await {
            Ok(response) if matches!(response.code, Code::Created | Code::Changed) => {
                let state = self.controller.on_registered();
                info!(unit = id, code = ?response.code, %state, "registered");
                self.publish();
                true
            }
            Ok(response) => {
                warn!(unit = id, code = ?response.code, "registration refused");
                false
            }
            Err(err) => {
                warn!(unit = id, %err, "registration not acknowledged");
                false
            }
        }
    }

    async fn on_tick(&mut self) {
        let outcome = self.controller.tick();
        self.ticks += 1;
        if outcome.push_now {
            self.push_state().await;
        }
        if self.settings.status_every_ticks > 0 && self.ticks % self.settings.status_every_ticks == 0 {
            self.log_status();
        }
        self.publish();
    }

    async fn on_inbound(&mut self, event: Inbound) {
        match event {
            Inbound::Request { request, reply } => {
                let (response, push) = self.handle_request(request);
                let _ = reply.send(response);
                if push {
                    self.push_state().await;
                }
                self.publish();
            }
            Inbound::Notification(n) => {
                debug!(unit = self.settings.id, path = %n.path, from = %n.source, "ignoring notification");
            }
        }
    }

    fn handle_request(&mut self, request: Request) -> (Response, bool) {
        match (request.path.as_str(), request.method) {
            (STATE, Method::Get) => (self.state_response(), false),
            (STATE, Method::Observe) => {
                if !self.observers.contains(&request.source) {
                    info!(unit = self.settings.id, observer = %request.source, "telemetry subscription added");
                    self.observers.push(request.source);
                }
                (self.state_response(), false)
            }
            (POWER, Method::Put) => match self.controller.handle_power(&request.payload) {
                Ok(_) => (Response::new(Code::Changed), false),
                Err(CommandError::NotRunning(_)) => (Response::new(Code::Forbidden), false),
                Err(_) => (Response::new(Code::BadRequest), false),
            },
            (PARAMS, Method::Get) => (
                Response::with_payload(Code::Content, self.controller.params_view().encode()),
                false,
            ),
            (PARAMS, Method::Put) => match self.controller.handle_params(&request.payload) {
                Ok(outcome) => (Response::new(Code::Changed), outcome.isolated),
                Err(err) => {
                    warn!(unit = self.settings.id, %err, "params update rejected");
                    (Response::new(Code::BadRequest), false)
                }
            },
            (STATE | POWER | PARAMS, _) => (Response::new(Code::MethodNotAllowed), false),
            _ => (Response::new(Code::NotFound), false),
        }
    }

    fn state_response(&self) -> Response {
        Response::with_payload(Code::Content, self.controller.telemetry().encode())
    }

    async fn on_reset(&mut self, token: LocalReset) {
        if self.controller.local_reset(token) {
            self.push_state().await;
        } else {
            info!(unit = self.settings.id, state = %self.controller.lifecycle(), "reset ignored, unit not isolated");
        }
        self.publish();
    }

    async fn push_state(&self) {
        let payload = self.controller.telemetry().encode();
        for observer in &self.observers {
            if let Err(err) = self.link.notify(observer, STATE, payload.clone()).await {
                debug!(unit = self.settings.id, %observer, %err, "telemetry push failed");
            }
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(UnitSnapshot::from(self.controller.state()));
    }

    fn log_status(&self) {
        let s = self.controller.state();
        info!(
            unit = s.id,
            state = %s.lifecycle,
            voltage = format_args!("{:.3}", s.voltage),
            current = format_args!("{:.2}", s.current),
            temp_c = format_args!("{:.1}", s.temperature),
            soc_pct = format_args!("{:.1}", s.soc * 100.0),
            soh_pct = format_args!("{:.1}", s.soh * 100.0),
            capacity_ah = format_args!("{:.1}", s.capacity_ah),
            power_w = format_args!("{:.1}", s.power_w()),
            cycles = s.charge_cycles,
            throughput_ah = format_args!("{:.2}", s.ah_throughput),
            peak_temp_c = format_args!("{:.1}", s.peak_temperature),
            "unit status"
        );
    }
}

/// Build a unit from settings and start it on the current runtime.
pub fn spawn_unit(
    settings: UnitSettings,
    soh_model: Box<dyn Regressor>,
    link: Arc<dyn Link>,
    inbox: mpsc::Receiver<Inbound>,
    coordinator: NodeAddr,
) -> Result<UnitHandle, ModelError> {
    let controller = build_controller(&settings, soh_model)?;
    let id = settings.id;
    let (agent, reset, state) = UnitAgent::new(settings, controller, link, inbox, coordinator);
    let task = tokio::spawn(agent.run());
    Ok(UnitHandle { id, reset, state, task })
}
