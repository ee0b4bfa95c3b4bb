//! Bridge between a frontend and the schedule engine.
//!
//! A frontend talks to the engine only through the [`Controller`]'s command
//! channel and observes it through `watch` snapshots; it never touches the
//! engine's state directly. Manual hardware actuations are mirrored back to
//! observers by wrapping the interface in a [`MonitoredInterface`], which
//! broadcasts every mutation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::hw::{HwError, Interface};
use crate::output::OutputSink;
use crate::schedule::{EngineState, Execute, NamedTask, RescheduleError, Schedule};

/// A hardware mutation observed through a [`MonitoredInterface`].
#[derive(Debug, Clone, PartialEq)]
pub enum InterfaceEvent {
    Overflow(bool),
    Vacuum(bool),
    Evacuation(bool),
    Ssv(u8),
    Flow(f64),
    PfpValve { valve: u8, open: bool },
}

/// Interface wrapper that broadcasts actuator mutations so a frontend can
/// mirror externally driven changes into its controls.
pub struct MonitoredInterface {
    inner: Arc<dyn Interface>,
    events: broadcast::Sender<InterfaceEvent>,
}

impl MonitoredInterface {
    pub fn new(inner: Arc<dyn Interface>) -> Self {
        let (events, _) = broadcast::channel(64);
        MonitoredInterface { inner, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InterfaceEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: InterfaceEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Interface for MonitoredInterface {
    async fn get_pressure(&self) -> Option<f64> {
        self.inner.get_pressure().await
    }

    async fn get_pfp_pressure(&self, ssv: Option<u8>) -> Option<f64> {
        self.inner.get_pfp_pressure(ssv).await
    }

    async fn get_display_pfp_pressure(&self) -> Option<f64> {
        self.inner.get_display_pfp_pressure().await
    }

    async fn get_flow_signal(&self) -> Option<f64> {
        self.inner.get_flow_signal().await
    }

    async fn get_flow_control_output(&self) -> Option<f64> {
        self.inner.get_flow_control_output().await
    }

    async fn get_oven_temperature_signal(&self) -> Option<f64> {
        self.inner.get_oven_temperature_signal().await
    }

    async fn get_thermocouple_temperature(&self, index: usize) -> Option<f64> {
        self.inner.get_thermocouple_temperature(index).await
    }

    async fn get_ssv_position(&self) -> Option<u8> {
        self.inner.get_ssv_position().await
    }

    async fn set_cryogen(&self, enable: bool) {
        self.inner.set_cryogen(enable).await;
    }

    async fn set_gc_cryogen(&self, enable: bool) {
        self.inner.set_gc_cryogen(enable).await;
    }

    async fn set_vacuum(&self, enable: bool) {
        self.notify(InterfaceEvent::Vacuum(enable));
        self.inner.set_vacuum(enable).await;
    }

    async fn set_sample(&self, enable: bool) {
        self.inner.set_sample(enable).await;
    }

    async fn set_cryo_heater(&self, enable: bool) {
        self.inner.set_cryo_heater(enable).await;
    }

    async fn set_overflow(&self, enable: bool) {
        self.notify(InterfaceEvent::Overflow(enable));
        self.inner.set_overflow(enable).await;
    }

    async fn set_evacuation_valve(&self, enable: bool) {
        self.notify(InterfaceEvent::Evacuation(enable));
        self.inner.set_evacuation_valve(enable).await;
    }

    async fn set_high_pressure_valve(&self, enable: bool) {
        self.inner.set_high_pressure_valve(enable).await;
    }

    async fn set_flow(&self, flow: f64) {
        self.notify(InterfaceEvent::Flow(flow));
        self.inner.set_flow(flow).await;
    }

    async fn set_pfp_valve(&self, ssv: Option<u8>, valve: u8, open: bool) -> Result<String, HwError> {
        self.notify(InterfaceEvent::PfpValve { valve, open });
        self.inner.set_pfp_valve(ssv, valve, open).await
    }

    async fn valve_load(&self) {
        self.inner.valve_load().await;
    }

    async fn valve_inject(&self) {
        self.inner.valve_inject().await;
    }

    async fn precolumn_in(&self) {
        self.inner.precolumn_in().await;
    }

    async fn precolumn_out(&self) {
        self.inner.precolumn_out().await;
    }

    async fn set_ssv(&self, index: u8, manual: bool) {
        self.notify(InterfaceEvent::Ssv(index));
        self.inner.set_ssv(index, manual).await;
    }

    async fn adjust_flow(&self, flow: f64) {
        self.inner.adjust_flow(flow).await;
    }

    async fn increment_flow(&self, flow: f64, multiplier: f64) {
        self.inner.increment_flow(flow, multiplier).await;
    }

    async fn ready_gcms(&self) {
        self.inner.ready_gcms().await;
    }

    async fn trigger_gcms(&self) {
        self.inner.trigger_gcms().await;
    }

    async fn initialization(&self) {
        self.inner.initialization().await;
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    fn flow_zero_offset(&self) -> f64 {
        self.inner.flow_zero_offset()
    }

    fn set_flow_zero_offset(&self, offset: f64) {
        self.inner.set_flow_zero_offset(offset);
    }
}

/// Snapshot of the controller and the engine it is driving.
#[derive(Debug, Clone, Default)]
pub struct ControllerState {
    /// Whether a schedule is currently executing.
    pub running: bool,
    /// Latest engine snapshot (events, task phases, current task).
    pub engine: EngineState,
    /// Message of the most recent aborted run, if any.
    pub abort_message: Option<String>,
}

enum Command {
    Start {
        tasks: Vec<NamedTask>,
        reply: oneshot::Sender<bool>,
    },
    Abort,
    Pause,
    Resume,
    Reschedule {
        remove: Option<usize>,
        append: Vec<NamedTask>,
        reply: oneshot::Sender<Result<(), RescheduleError>>,
    },
}

/// Handle for driving schedules from outside the engine's executor.
#[derive(Clone)]
pub struct Controller {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ControllerState>,
}

impl Controller {
    /// Spawn the controller loop on the current runtime.
    pub fn spawn(interface: Arc<dyn Interface>, sink: Arc<OutputSink>) -> Controller {
        let (commands, command_rx) = mpsc::channel(16);
        let (state_tx, state) = watch::channel(ControllerState::default());
        tokio::spawn(run_controller(interface, sink, command_rx, state_tx));
        Controller { commands, state }
    }

    /// Submit a schedule. Returns false when one is already running.
    pub async fn start(&self, tasks: Vec<NamedTask>) -> bool {
        let (reply, result) = oneshot::channel();
        if self
            .commands
            .send(Command::Start { tasks, reply })
            .await
            .is_err()
        {
            return false;
        }
        result.await.unwrap_or(false)
    }

    /// Run a single task as its own schedule.
    pub async fn start_single(&self, task: NamedTask) -> bool {
        self.start(vec![task]).await
    }

    pub async fn abort(&self) {
        let _ = self.commands.send(Command::Abort).await;
    }

    pub async fn pause(&self) {
        let _ = self.commands.send(Command::Pause).await;
    }

    pub async fn resume(&self) {
        let _ = self.commands.send(Command::Resume).await;
    }

    /// Request an atomic mutation of the running schedule.
    pub async fn reschedule(
        &self,
        remove: Option<usize>,
        append: Vec<NamedTask>,
    ) -> Result<(), RescheduleError> {
        let (reply, result) = oneshot::channel();
        if self
            .commands
            .send(Command::Reschedule {
                remove,
                append,
                reply,
            })
            .await
            .is_err()
        {
            return Err(RescheduleError::NotRunning);
        }
        result.await.unwrap_or(Err(RescheduleError::NotRunning))
    }

    /// Subscribe to controller state snapshots.
    pub fn state(&self) -> watch::Receiver<ControllerState> {
        self.state.clone()
    }
}

async fn run_controller(
    interface: Arc<dyn Interface>,
    sink: Arc<OutputSink>,
    mut commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ControllerState>,
) {
    let mut active: Option<Arc<Schedule>> = None;
    let (done_tx, mut done_rx) = mpsc::channel::<bool>(1);

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    // Handle dropped; wind down any active run.
                    if let Some(schedule) = &active {
                        schedule.abort(None);
                    }
                    return;
                };
                match command {
                    Command::Start { tasks, reply } => {
                        if active.is_some() {
                            let _ = reply.send(false);
                            continue;
                        }
                        let mut execute = Execute::new(tasks, sink.clone());
                        let schedule = execute.schedule();
                        active = Some(schedule.clone());

                        let mut engine_rx = schedule.subscribe();
                        let forward_tx = state_tx.clone();
                        tokio::spawn(async move {
                            while engine_rx.changed().await.is_ok() {
                                let engine = engine_rx.borrow_and_update().clone();
                                forward_tx.send_modify(|state| state.engine = engine);
                            }
                        });

                        let done = done_tx.clone();
                        let run_interface = interface.clone();
                        tokio::spawn(async move {
                            let completed = execute.execute(run_interface).await;
                            let _ = done.send(completed).await;
                        });

                        state_tx.send_modify(|state| {
                            state.running = true;
                            state.abort_message = None;
                        });
                        let _ = reply.send(true);
                    }
                    Command::Abort => {
                        if let Some(schedule) = &active {
                            schedule.abort(None);
                        }
                    }
                    Command::Pause => {
                        if let Some(schedule) = &active {
                            schedule.pause();
                        }
                    }
                    Command::Resume => {
                        if let Some(schedule) = &active {
                            schedule.resume();
                        }
                    }
                    Command::Reschedule { remove, append, reply } => {
                        match &active {
                            Some(schedule) => {
                                let schedule = schedule.clone();
                                tokio::spawn(async move {
                                    let _ = reply.send(schedule.reschedule(remove, append).await);
                                });
                            }
                            None => {
                                let _ = reply.send(Err(RescheduleError::NotRunning));
                            }
                        }
                    }
                }
            }
            completed = done_rx.recv() => {
                let Some(completed) = completed else { return };
                let message = active
                    .as_ref()
                    .filter(|_| !completed)
                    .and_then(|schedule| schedule.abort_message());
                active = None;
                // Leave the instrument idle after every run.
                interface.shutdown().await;
                state_tx.send_modify(|state| {
                    state.running = false;
                    state.abort_message = message.clone();
                });
            }
        }
    }
}
