//! Time-ordered schedule execution engine.
//!
//! A [`Task`] expands into [`Runnable`]s carrying schedule-relative origins.
//! [`Execute`] merges every task's runnables into one origin-sorted run list
//! and drives it on a cooperative executor:
//!
//! 1. Sleep until the next runnable's origin (interruptible by the break
//!    signal raised for abort / pause / reschedule).
//! 2. Execute the runnable, then publish its event effects.
//! 3. Reap finished background coroutines.
//!
//! Two clocks anchor the schedule: a monotonic clock for sleeping and a wall
//! clock for user-facing event times. Pausing advances both anchors by the
//! pause duration, so paused wall time never appears in the schedule. A
//! runnable returning `true` from `execute` re-anchors both clocks so the
//! wall time it consumed counts against the remaining schedule.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::hw::Interface;
use crate::output::OutputSink;

/// Origin value meaning "immediate, unsequenced".
pub const IMMEDIATE: f64 = f64::NEG_INFINITY;

/// Current wall time in seconds since the Unix epoch.
pub(crate) fn wall_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// A named timestamped marker in the schedule's event index.
///
/// Before the runnable that sets the event has executed, `occurred` is false
/// and `time` is the projected wall time; afterwards `occurred` is true and
/// `time` is the real completion time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    /// Wall-clock seconds since the Unix epoch.
    pub time: f64,
    /// Whether the event has actually happened.
    pub occurred: bool,
}

/// Per-task progress flags, mutated by the engine and by cycle runnables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskPhase {
    /// The engine has begun executing runnables belonging to this task.
    pub activated: bool,
    /// The task's cycle has formally begun.
    pub started: bool,
    /// The task's cycle has formally completed.
    pub completed: bool,
}

/// Snapshot of engine state published to observers after every step.
#[derive(Debug, Clone, Default)]
pub struct EngineState {
    /// Event index: real occurrences plus future projections.
    pub events: HashMap<String, Event>,
    /// Per-task progress, parallel to the submitted task list.
    pub tasks: Vec<TaskPhase>,
    /// Index of the task whose runnable executed most recently.
    pub current_task: Option<usize>,
    /// Whether a pause is outstanding.
    pub paused: bool,
}

/// Per-task context handed to [`Task::schedule`] and retained by runnables.
///
/// Cloning is cheap; the activation flags live in the shared [`Schedule`]
/// core and are addressed through `task_index`.
#[derive(Clone)]
pub struct Context {
    /// Hardware capability surface.
    pub interface: Arc<dyn Interface>,
    /// Shared schedule core (abort, background, events, sink).
    pub schedule: Arc<Schedule>,
    /// Absolute schedule-relative origin of this task.
    pub origin: f64,
    /// Index of this task in the submitted list.
    pub task_index: usize,
    /// Display name of this task, when one was given.
    pub task_name: Option<Arc<str>>,
}

impl Context {
    /// Announce that this task's cycle has begun.
    pub fn mark_started(&self) {
        self.schedule.set_phase(self.task_index, |p| p.started = true);
    }

    /// Announce that this task's cycle has completed.
    pub fn mark_completed(&self) {
        self.schedule.set_phase(self.task_index, |p| p.completed = true);
    }
}

/// A unit of scheduled work.
///
/// The `origin` is immutable once scheduled. `set_events` and `clear_events`
/// must be disjoint. `execute` returning `true` means the wall time the
/// runnable consumed counts against the remaining schedule (the engine
/// re-anchors its clocks).
#[async_trait]
pub trait Runnable: Send {
    /// Schedule-relative execution time; [`IMMEDIATE`] for unsequenced.
    fn origin(&self) -> f64;

    /// The context this runnable belongs to.
    fn context(&self) -> &Context;

    /// Event keys published on completion.
    fn set_events(&self) -> &[&'static str] {
        &[]
    }

    /// Event keys removed from the index on completion.
    fn clear_events(&self) -> &[&'static str] {
        &[]
    }

    /// Perform the action. Never propagates errors; translate them into logs
    /// or abort-point invocations instead.
    async fn execute(&mut self) -> bool;
}

/// A factory that expands into an ordered set of runnables for one cycle.
///
/// Implementations must be pure: repeated calls with an equivalent context
/// return an equivalent runnable list.
pub trait Task: Send + Sync {
    /// Seconds between this task's origin and the next task's origin.
    fn origin_advance(&self) -> f64 {
        0.0
    }

    /// Expand into runnables. Origins may be negative relative to
    /// `context.origin`; such runnables belong to the preparation window and
    /// are only emitted when `context.origin > 0`.
    fn schedule(&self, context: &Context) -> Vec<Box<dyn Runnable>>;
}

/// A task paired with its display name.
#[derive(Clone)]
pub struct NamedTask {
    pub name: Option<Arc<str>>,
    pub task: Arc<dyn Task>,
}

impl NamedTask {
    pub fn new(name: impl Into<Arc<str>>, task: Arc<dyn Task>) -> Self {
        Self {
            name: Some(name.into()),
            task,
        }
    }

    pub fn unnamed(task: Arc<dyn Task>) -> Self {
        Self { name: None, task }
    }
}

/// Why a requested schedule mutation was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RescheduleError {
    #[error("task already active")]
    TaskActive,
    #[error("task requires action in the past")]
    ActionInPast,
    #[error("reschedule already pending")]
    Pending,
    #[error("schedule is not running")]
    NotRunning,
}

struct RescheduleRequest {
    remove: Option<usize>,
    append: Vec<NamedTask>,
    reply: oneshot::Sender<Result<(), RescheduleError>>,
}

/// The reference points translating schedule-relative origins to real clocks.
#[derive(Debug, Clone, Copy)]
struct Anchor {
    monotonic: Instant,
    real: f64,
}

impl Anchor {
    fn now() -> Self {
        Anchor {
            monotonic: Instant::now(),
            real: wall_now(),
        }
    }

    /// Schedule seconds elapsed since origin zero (negative if zero lies in
    /// the future after a re-anchor).
    fn elapsed(&self) -> f64 {
        let now = Instant::now();
        if now >= self.monotonic {
            (now - self.monotonic).as_secs_f64()
        } else {
            -((self.monotonic - now).as_secs_f64())
        }
    }

    /// Advance both anchors by a pause duration, suspending wall time.
    fn suspend(&mut self, paused_for: Duration) {
        self.monotonic += paused_for;
        self.real += paused_for.as_secs_f64();
    }

    /// Re-anchor so that `origin` corresponds to the present instant.
    fn reanchor(&mut self, origin: f64) {
        let now = Instant::now();
        self.monotonic = if origin >= 0.0 {
            now - Duration::from_secs_f64(origin)
        } else {
            now + Duration::from_secs_f64(-origin)
        };
        self.real = wall_now() - origin;
    }
}

/// Shared core of a schedule run.
///
/// Owned behind an `Arc` by the [`Execute`] driver, every [`Context`], and
/// any controller that needs to abort, pause, resume or reschedule the run.
pub struct Schedule {
    aborted: AtomicBool,
    abort_message: Mutex<Option<String>>,
    break_flag: AtomicBool,
    break_signal: Notify,
    pause_release: Mutex<Option<oneshot::Sender<()>>>,
    pause_waiter: Mutex<Option<oneshot::Receiver<()>>>,
    events: Mutex<HashMap<String, Event>>,
    phases: Mutex<Vec<TaskPhase>>,
    background: Mutex<JoinSet<()>>,
    reschedule_op: Mutex<Option<RescheduleRequest>>,
    state_tx: watch::Sender<EngineState>,
    anchor: Mutex<Anchor>,
    sink: Arc<OutputSink>,
}

impl Schedule {
    fn new(sink: Arc<OutputSink>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(EngineState::default());
        Arc::new(Schedule {
            aborted: AtomicBool::new(false),
            abort_message: Mutex::new(None),
            break_flag: AtomicBool::new(false),
            break_signal: Notify::new(),
            pause_release: Mutex::new(None),
            pause_waiter: Mutex::new(None),
            events: Mutex::new(HashMap::new()),
            phases: Mutex::new(Vec::new()),
            background: Mutex::new(JoinSet::new()),
            reschedule_op: Mutex::new(None),
            state_tx,
            anchor: Mutex::new(Anchor::now()),
            sink,
        })
    }

    /// Abort the running schedule. Takes effect at the engine's next
    /// suspension point; a currently executing runnable is not cancelled.
    pub fn abort(&self, message: Option<&str>) {
        self.aborted.store(true, Ordering::SeqCst);
        if let Some(msg) = message {
            *self.abort_message.lock().unwrap() = Some(msg.to_string());
        }
        // Aborting also releases an outstanding pause.
        if let Some(release) = self.pause_release.lock().unwrap().take() {
            let _ = release.send(());
        }
        self.raise_break();
        log::debug!("Schedule processing aborting");
    }

    /// Pause schedule execution. Idempotent.
    pub fn pause(&self) {
        let mut release = self.pause_release.lock().unwrap();
        if release.is_some() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        *release = Some(tx);
        *self.pause_waiter.lock().unwrap() = Some(rx);
        drop(release);
        self.raise_break();
        log::debug!("Schedule processing pause requested");
    }

    /// Resume paused schedule execution. No-op when not paused.
    pub fn resume(&self) {
        if let Some(release) = self.pause_release.lock().unwrap().take() {
            let _ = release.send(());
            log::debug!("Schedule processing resume requested");
        }
    }

    /// Whether a pause is outstanding.
    pub fn is_paused(&self) -> bool {
        self.pause_release.lock().unwrap().is_some()
    }

    /// Whether the schedule has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// The message supplied with the abort, if any.
    pub fn abort_message(&self) -> Option<String> {
        self.abort_message.lock().unwrap().clone()
    }

    /// Snapshot of the event index.
    pub fn events(&self) -> HashMap<String, Event> {
        self.events.lock().unwrap().clone()
    }

    /// Subscribe to engine state snapshots.
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    /// The output sink this run reports to.
    pub fn sink(&self) -> &Arc<OutputSink> {
        &self.sink
    }

    /// Schedule seconds elapsed since origin zero.
    pub fn elapsed_origin(&self) -> f64 {
        self.anchor.lock().unwrap().elapsed()
    }

    /// Projected wall time (epoch seconds) of a schedule-relative origin.
    pub fn projected_wall_time(&self, origin: f64) -> f64 {
        self.anchor.lock().unwrap().real + origin
    }

    /// Register a coroutine that lives in the schedule's background set. It
    /// is reaped when finished, awaited at completion and cancelled on abort.
    pub fn start_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.background.lock().unwrap().spawn(task);
    }

    /// Wait for every currently running background coroutine to finish.
    pub async fn complete_background(&self) {
        let mut set = std::mem::take(&mut *self.background.lock().unwrap());
        while let Some(result) = set.join_next().await {
            if let Err(err) = result {
                if err.is_panic() {
                    log::warn!("Background task failed: {err}");
                }
            }
        }
    }

    /// Request an atomic schedule mutation: drop tasks with index >= `remove`
    /// (if given), then expand and splice `append` at the next available
    /// origin. Resolves once the engine has applied or rejected the mutation.
    pub async fn reschedule(
        &self,
        remove: Option<usize>,
        append: Vec<NamedTask>,
    ) -> Result<(), RescheduleError> {
        let (reply, result) = oneshot::channel();
        {
            let mut slot = self.reschedule_op.lock().unwrap();
            if slot.is_some() {
                return Err(RescheduleError::Pending);
            }
            *slot = Some(RescheduleRequest {
                remove,
                append,
                reply,
            });
        }
        self.raise_break();
        result.await.unwrap_or(Err(RescheduleError::NotRunning))
    }

    fn raise_break(&self) {
        self.break_flag.store(true, Ordering::SeqCst);
        self.break_signal.notify_one();
    }

    fn consume_break(&self) -> bool {
        self.break_flag.swap(false, Ordering::SeqCst)
    }

    /// Wait until the break signal is raised, consuming it.
    async fn wait_break(&self) {
        loop {
            if self.consume_break() {
                return;
            }
            self.break_signal.notified().await;
        }
    }

    fn set_phase(&self, index: usize, mutate: impl FnOnce(&mut TaskPhase)) {
        let mut phases = self.phases.lock().unwrap();
        if let Some(phase) = phases.get_mut(index) {
            mutate(phase);
        }
    }

    fn phases(&self) -> Vec<TaskPhase> {
        self.phases.lock().unwrap().clone()
    }

    fn publish(&self, current_task: Option<usize>) {
        let state = EngineState {
            events: self.events(),
            tasks: self.phases(),
            current_task,
            paused: self.is_paused(),
        };
        self.state_tx.send_replace(state);
    }

    fn apply_events(&self, clear: &[&'static str], set: &[&'static str], time: f64) {
        let mut events = self.events.lock().unwrap();
        for key in clear {
            events.remove(*key);
        }
        for key in set {
            events.insert((*key).to_string(), Event {
                time,
                occurred: true,
            });
        }
    }

    /// Recompute future entries by walking the still-pending run list in
    /// order. An event already present (real or future) is never overwritten;
    /// a clear by an earlier pending runnable masks later sets of that key.
    fn project_events(&self, run: &VecDeque<Box<dyn Runnable>>) {
        let anchor_real = self.anchor.lock().unwrap().real;
        let mut events = self.events.lock().unwrap();
        events.retain(|_, event| event.occurred);

        let mut stopped: HashSet<&str> = HashSet::new();
        for runnable in run {
            let origin = runnable.origin();
            for key in runnable.clear_events() {
                stopped.insert(*key);
            }
            if !origin.is_finite() {
                continue;
            }
            for key in runnable.set_events() {
                if stopped.contains(key) || events.contains_key(*key) {
                    continue;
                }
                events.insert((*key).to_string(), Event {
                    time: anchor_real + origin,
                    occurred: false,
                });
            }
        }
    }

    fn reset(&self) {
        self.aborted.store(false, Ordering::SeqCst);
        *self.abort_message.lock().unwrap() = None;
        self.break_flag.store(false, Ordering::SeqCst);
        *self.pause_release.lock().unwrap() = None;
        *self.pause_waiter.lock().unwrap() = None;
        self.events.lock().unwrap().clear();
        self.phases.lock().unwrap().clear();
        *self.reschedule_op.lock().unwrap() = None;
    }

    fn reap_background(&self) {
        let mut set = self.background.lock().unwrap();
        while let Some(result) = set.try_join_next() {
            if let Err(err) = result {
                if err.is_panic() {
                    log::warn!("Background task failed: {err}");
                }
            }
        }
    }

    async fn cancel_background(&self) {
        let mut set = {
            let mut guard = self.background.lock().unwrap();
            guard.abort_all();
            std::mem::take(&mut *guard)
        };
        while set.join_next().await.is_some() {}
        log::debug!("Schedule abort completed");
    }

    fn take_pause_waiter(&self) -> Option<oneshot::Receiver<()>> {
        self.pause_waiter.lock().unwrap().take()
    }

    fn take_reschedule(&self) -> Option<RescheduleRequest> {
        self.reschedule_op.lock().unwrap().take()
    }

    fn discard_reschedule(&self) {
        if let Some(op) = self.take_reschedule() {
            let _ = op.reply.send(Err(RescheduleError::NotRunning));
        }
    }

    fn push_phase(&self) {
        self.phases.lock().unwrap().push(TaskPhase::default());
    }

    fn truncate_phases(&self, keep: usize) {
        self.phases.lock().unwrap().truncate(keep);
    }
}

struct Planned {
    named: NamedTask,
    origin: f64,
}

/// The execution driver for a list of tasks.
pub struct Execute {
    tasks: Vec<Planned>,
    schedule: Arc<Schedule>,
}

impl Execute {
    pub fn new(tasks: Vec<NamedTask>, sink: Arc<OutputSink>) -> Self {
        Execute {
            tasks: tasks
                .into_iter()
                .map(|named| Planned { named, origin: 0.0 })
                .collect(),
            schedule: Schedule::new(sink),
        }
    }

    /// The shared core, for abort/pause/resume/reschedule and observation.
    pub fn schedule(&self) -> Arc<Schedule> {
        self.schedule.clone()
    }

    fn context_for(&self, interface: &Arc<dyn Interface>, index: usize, origin: f64) -> Context {
        Context {
            interface: interface.clone(),
            schedule: self.schedule.clone(),
            origin,
            task_index: index,
            task_name: self.tasks[index].named.name.clone(),
        }
    }

    /// Execute the scheduled tasks. Returns `true` on completion, `false` on
    /// abort (after cancelling background work and flushing the abort record
    /// to the output sink).
    pub async fn execute(&mut self, interface: Arc<dyn Interface>) -> bool {
        self.schedule.reset();

        let mut expanded: Vec<Box<dyn Runnable>> = Vec::new();
        let mut origin = 0.0;
        for index in 0..self.tasks.len() {
            self.tasks[index].origin = origin;
            self.schedule.push_phase();
            let context = self.context_for(&interface, index, origin);
            expanded.extend(self.tasks[index].named.task.schedule(&context));
            origin += self.tasks[index].named.task.origin_advance();
        }
        sort_by_origin(&mut expanded);
        let mut run: VecDeque<Box<dyn Runnable>> = expanded.into();

        *self.schedule.anchor.lock().unwrap() = Anchor::now();
        let mut current_task = None;

        let completed = loop {
            // Pause: suspend wall time for exactly the pause duration.
            if let Some(waiter) = self.schedule.take_pause_waiter() {
                self.schedule.project_events(&run);
                self.schedule.publish(current_task);
                log::debug!("Schedule processing paused");
                let pause_begin = Instant::now();
                let _ = waiter.await;
                self.schedule
                    .anchor
                    .lock()
                    .unwrap()
                    .suspend(pause_begin.elapsed());
                log::debug!("Schedule processing resumed");
                continue;
            }

            if self.schedule.is_aborted() {
                break false;
            }

            if let Some(op) = self.schedule.take_reschedule() {
                let result = self.apply_reschedule(&mut run, &interface, op.remove, op.append);
                let _ = op.reply.send(result);
                continue;
            }

            let Some(next) = run.front() else {
                break true;
            };

            self.schedule.project_events(&run);
            self.schedule.publish(current_task);

            let target = next.origin();
            if target.is_finite() {
                let delay = target - self.schedule.elapsed_origin();
                if delay > 0.0 {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs_f64(delay)) => {}
                        _ = self.schedule.wait_break() => continue,
                    }
                } else if self.schedule.consume_break() {
                    continue;
                }
            } else if self.schedule.consume_break() {
                continue;
            }

            let mut running = run.pop_front().expect("run list is non-empty");
            current_task = Some(running.context().task_index);
            self.schedule
                .set_phase(running.context().task_index, |p| p.activated = true);
            self.schedule.publish(current_task);

            let delay_schedule = running.execute().await;
            if self.schedule.is_aborted() {
                break false;
            }

            if delay_schedule && running.origin().is_finite() {
                self.schedule
                    .anchor
                    .lock()
                    .unwrap()
                    .reanchor(running.origin());
            }

            self.schedule
                .apply_events(running.clear_events(), running.set_events(), wall_now());

            self.schedule.reap_background();
        };

        self.schedule.discard_reschedule();
        if !completed {
            self.schedule.cancel_background().await;
            let message = self.schedule.abort_message();
            self.schedule.sink.abort_cycle(message.as_deref());
            self.schedule.publish(current_task);
            return false;
        }
        self.schedule.complete_background().await;
        self.schedule.publish(current_task);
        log::debug!("Schedule processing completed");
        true
    }

    /// Apply a reschedule request. Either the whole mutation commits and the
    /// run list is resorted, or the request is rejected and state is
    /// unchanged.
    fn apply_reschedule(
        &mut self,
        run: &mut VecDeque<Box<dyn Runnable>>,
        interface: &Arc<dyn Interface>,
        remove: Option<usize>,
        append: Vec<NamedTask>,
    ) -> Result<(), RescheduleError> {
        let elapsed = self.schedule.elapsed_origin();
        let keep = remove.unwrap_or(self.tasks.len()).min(self.tasks.len());

        if remove.is_some() {
            let phases = self.schedule.phases();
            if phases.iter().skip(keep).any(|phase| phase.activated) {
                return Err(RescheduleError::TaskActive);
            }
        }

        let mut next_origin = match self.tasks[..keep].last() {
            Some(planned) => planned.origin + planned.named.task.origin_advance(),
            None => 0.0,
        };

        let mut new_tasks: Vec<Planned> = Vec::new();
        let mut new_runnables: Vec<Box<dyn Runnable>> = Vec::new();
        for (offset, named) in append.into_iter().enumerate() {
            let context = Context {
                interface: interface.clone(),
                schedule: self.schedule.clone(),
                origin: next_origin,
                task_index: keep + offset,
                task_name: named.name.clone(),
            };
            for runnable in named.task.schedule(&context) {
                let origin = runnable.origin();
                if origin.is_finite() && origin < elapsed {
                    if context.origin > elapsed {
                        // Long-horizon preparation for a future cycle that is
                        // already too late to perform; drop it silently.
                        log::debug!(
                            "Dropping preparation action at origin {origin:.1} \
                             (schedule already at {elapsed:.1})"
                        );
                        continue;
                    }
                    return Err(RescheduleError::ActionInPast);
                }
                new_runnables.push(runnable);
            }
            let advance = named.task.origin_advance();
            new_tasks.push(Planned {
                named,
                origin: next_origin,
            });
            next_origin += advance;
        }

        // Validation passed; commit.
        if remove.is_some() {
            self.tasks.truncate(keep);
            self.schedule.truncate_phases(keep);
            run.retain(|runnable| runnable.context().task_index < keep);
        }
        for _ in &new_tasks {
            self.schedule.push_phase();
        }
        self.tasks.extend(new_tasks);

        let mut merged: Vec<Box<dyn Runnable>> = run.drain(..).collect();
        merged.extend(new_runnables);
        sort_by_origin(&mut merged);
        *run = merged.into();
        Ok(())
    }
}

fn sort_by_origin(runnables: &mut [Box<dyn Runnable>]) {
    // Stable: ties keep insertion order, non-finite origins sort first.
    runnables.sort_by(|a, b| {
        a.origin()
            .partial_cmp(&b.origin())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

// ---------------------------------------------------------------------------
// General-purpose runnables
// ---------------------------------------------------------------------------

/// Releases one slot of a [`Gate`] when fired. Firing twice is harmless.
pub struct GateRelease(Option<oneshot::Sender<()>>);

impl GateRelease {
    pub fn release(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

/// Holds the schedule until a set of release handles have fired.
///
/// With no required count, every handle must fire; otherwise the gate opens
/// after `required` of them have.
pub struct Gate {
    context: Context,
    origin: f64,
    required: Option<usize>,
    waiters: Vec<oneshot::Receiver<()>>,
}

impl Gate {
    pub fn new(context: &Context, origin: f64) -> Self {
        Gate {
            context: context.clone(),
            origin,
            required: None,
            waiters: Vec::new(),
        }
    }

    pub fn with_required(context: &Context, origin: f64, required: usize) -> Self {
        Gate {
            context: context.clone(),
            origin,
            required: Some(required),
            waiters: Vec::new(),
        }
    }

    /// Create a release handle that must fire before the gate opens.
    pub fn add_release(&mut self) -> GateRelease {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(rx);
        GateRelease(Some(tx))
    }
}

#[async_trait]
impl Runnable for Gate {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        let total = self.waiters.len();
        let required = self.required.map_or(total, |n| n.min(total));
        let mut pending = JoinSet::new();
        for waiter in self.waiters.drain(..) {
            pending.spawn(async move {
                let _ = waiter.await;
            });
        }
        for _ in 0..required {
            if pending.join_next().await.is_none() {
                break;
            }
        }
        pending.abort_all();
        true
    }
}

#[derive(Default)]
struct AbortFlag {
    armed: bool,
    message: Option<String>,
}

/// Arms a deferred [`AbortPoint`] from anywhere in the cycle.
#[derive(Clone, Default)]
pub struct AbortHandle(Arc<Mutex<AbortFlag>>);

impl AbortHandle {
    /// Schedule the abort; it takes effect when the abort point is reached.
    pub fn arm(&self, message: Option<&str>) {
        let mut flag = self.0.lock().unwrap();
        flag.armed = true;
        if let Some(msg) = message {
            flag.message = Some(msg.to_string());
        }
    }

    pub fn is_armed(&self) -> bool {
        self.0.lock().unwrap().armed
    }
}

/// A deferred abort point: aborts the schedule when reached, if armed.
///
/// Lets time-critical cleanup (valve closes, injection) run before the cycle
/// is torn down.
pub struct AbortPoint {
    context: Context,
    origin: f64,
    handle: AbortHandle,
}

impl AbortPoint {
    pub fn new(context: &Context, origin: f64) -> Self {
        AbortPoint {
            context: context.clone(),
            origin,
            handle: AbortHandle::default(),
        }
    }

    /// A handle earlier runnables use to arm this point.
    pub fn handle(&self) -> AbortHandle {
        self.handle.clone()
    }
}

#[async_trait]
impl Runnable for AbortPoint {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        let (armed, message) = {
            let flag = self.handle.0.lock().unwrap();
            (flag.armed, flag.message.clone())
        };
        if armed {
            self.context.schedule.abort(message.as_deref());
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::SimulatedInstrument;
    use crate::output::{CycleRecord, OutputSink};

    // -----------------------------------------------------------------------
    // Test tasks and runnables
    // -----------------------------------------------------------------------

    type Trace = Arc<Mutex<Vec<u32>>>;

    struct TraceRunnable {
        context: Context,
        origin: f64,
        trace: Trace,
        key: u32,
        set_events: Vec<&'static str>,
        clear_events: Vec<&'static str>,
        executed_at: Option<Arc<Mutex<Vec<f64>>>>,
    }

    #[async_trait]
    impl Runnable for TraceRunnable {
        fn origin(&self) -> f64 {
            self.origin
        }

        fn context(&self) -> &Context {
            &self.context
        }

        fn set_events(&self) -> &[&'static str] {
            &self.set_events
        }

        fn clear_events(&self) -> &[&'static str] {
            &self.clear_events
        }

        async fn execute(&mut self) -> bool {
            self.trace.lock().unwrap().push(self.key);
            if let Some(times) = &self.executed_at {
                times
                    .lock()
                    .unwrap()
                    .push(self.context.schedule.elapsed_origin());
            }
            false
        }
    }

    struct TraceTask {
        trace: Trace,
        key: u32,
        origin_advance: f64,
        origin_offset: f64,
        set_events: Vec<&'static str>,
        clear_events: Vec<&'static str>,
        executed_at: Option<Arc<Mutex<Vec<f64>>>>,
    }

    impl TraceTask {
        fn new(trace: &Trace, key: u32) -> Self {
            TraceTask {
                trace: trace.clone(),
                key,
                origin_advance: 0.01,
                origin_offset: 0.0,
                set_events: Vec::new(),
                clear_events: Vec::new(),
                executed_at: None,
            }
        }

        fn advance(mut self, advance: f64) -> Self {
            self.origin_advance = advance;
            self
        }

        fn offset(mut self, offset: f64) -> Self {
            self.origin_offset = offset;
            self
        }

        fn sets(mut self, key: &'static str) -> Self {
            self.set_events.push(key);
            self
        }

        fn clears(mut self, key: &'static str) -> Self {
            self.clear_events.push(key);
            self
        }

        fn timed(mut self, times: &Arc<Mutex<Vec<f64>>>) -> Self {
            self.executed_at = Some(times.clone());
            self
        }
    }

    impl Task for TraceTask {
        fn origin_advance(&self) -> f64 {
            self.origin_advance
        }

        fn schedule(&self, context: &Context) -> Vec<Box<dyn Runnable>> {
            vec![Box::new(TraceRunnable {
                context: context.clone(),
                origin: context.origin + self.origin_offset,
                trace: self.trace.clone(),
                key: self.key,
                set_events: self.set_events.clone(),
                clear_events: self.clear_events.clone(),
                executed_at: self.executed_at.clone(),
            })]
        }
    }

    fn named(task: impl Task + 'static) -> NamedTask {
        NamedTask::unnamed(Arc::new(task))
    }

    fn test_interface() -> Arc<dyn Interface> {
        Arc::new(SimulatedInstrument::new())
    }

    fn test_sink() -> Arc<OutputSink> {
        Arc::new(OutputSink::new())
    }

    // -----------------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn runs_tasks_in_origin_order() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let mut exe = Execute::new(
            vec![
                named(TraceTask::new(&trace, 1)),
                named(TraceTask::new(&trace, 2)),
                named(TraceTask::new(&trace, 3)),
            ],
            test_sink(),
        );
        assert!(exe.execute(test_interface()).await);
        assert_eq!(*trace.lock().unwrap(), vec![1, 2, 3]);
        assert!(exe.schedule().events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn identical_origins_run_in_insertion_order() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let mut exe = Execute::new(
            vec![
                named(TraceTask::new(&trace, 1).advance(0.0)),
                named(TraceTask::new(&trace, 2).advance(0.0)),
                named(TraceTask::new(&trace, 3).advance(0.0)),
            ],
            test_sink(),
        );
        assert!(exe.execute(test_interface()).await);
        assert_eq!(*trace.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_runs_before_finite_origins() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let mut exe = Execute::new(
            vec![
                named(TraceTask::new(&trace, 1).advance(1.0)),
                named(TraceTask::new(&trace, 2).advance(1.0)),
                named(TraceTask::new(&trace, 9).offset(IMMEDIATE)),
            ],
            test_sink(),
        );
        assert!(exe.execute(test_interface()).await);
        assert_eq!(*trace.lock().unwrap(), vec![9, 1, 2]);
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    struct EventProbe {
        context: Context,
        origin: f64,
        key: &'static str,
        expect_occurred: Option<bool>,
    }

    #[async_trait]
    impl Runnable for EventProbe {
        fn origin(&self) -> f64 {
            self.origin
        }

        fn context(&self) -> &Context {
            &self.context
        }

        async fn execute(&mut self) -> bool {
            let events = self.context.schedule.events();
            match self.expect_occurred {
                None => assert!(!events.contains_key(self.key)),
                Some(expected) => {
                    assert_eq!(events.get(self.key).expect("event present").occurred, expected)
                }
            }
            false
        }
    }

    struct EventProbeTask {
        key: &'static str,
        expect_occurred: Option<bool>,
    }

    impl Task for EventProbeTask {
        fn schedule(&self, context: &Context) -> Vec<Box<dyn Runnable>> {
            vec![Box::new(EventProbe {
                context: context.clone(),
                origin: context.origin,
                key: self.key,
                expect_occurred: self.expect_occurred,
            })]
        }
    }

    #[tokio::test(start_paused = true)]
    async fn event_lifecycle_set_project_clear() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let mut exe = Execute::new(
            vec![
                named(TraceTask::new(&trace, 1).sets("e1")),
                named(EventProbeTask {
                    key: "e1",
                    expect_occurred: Some(true),
                }),
                named(EventProbeTask {
                    key: "e2",
                    expect_occurred: Some(false),
                }),
                named(TraceTask::new(&trace, 2).sets("e2")),
                named(EventProbeTask {
                    key: "e2",
                    expect_occurred: Some(true),
                }),
                named(TraceTask::new(&trace, 3).clears("e2")),
                named(EventProbeTask {
                    key: "e1",
                    expect_occurred: Some(true),
                }),
                named(EventProbeTask {
                    key: "e2",
                    expect_occurred: None,
                }),
            ],
            test_sink(),
        );
        assert!(exe.execute(test_interface()).await);
        assert_eq!(*trace.lock().unwrap(), vec![1, 2, 3]);
    }

    // -----------------------------------------------------------------------
    // Abort
    // -----------------------------------------------------------------------

    struct AbortingTask {
        trace: Trace,
        key: u32,
        message: &'static str,
    }

    struct AbortingRunnable {
        context: Context,
        origin: f64,
        trace: Trace,
        key: u32,
        message: &'static str,
    }

    #[async_trait]
    impl Runnable for AbortingRunnable {
        fn origin(&self) -> f64 {
            self.origin
        }

        fn context(&self) -> &Context {
            &self.context
        }

        async fn execute(&mut self) -> bool {
            self.trace.lock().unwrap().push(self.key);
            self.context.schedule.abort(Some(self.message));
            false
        }
    }

    impl Task for AbortingTask {
        fn origin_advance(&self) -> f64 {
            0.01
        }

        fn schedule(&self, context: &Context) -> Vec<Box<dyn Runnable>> {
            vec![Box::new(AbortingRunnable {
                context: context.clone(),
                origin: context.origin,
                trace: self.trace.clone(),
                key: self.key,
                message: self.message,
            })]
        }
    }

    struct AbortProbe(Arc<AtomicBool>);

    impl CycleRecord for AbortProbe {
        fn finish(&mut self, _sink: &OutputSink) {}

        fn abort(&mut self, _sink: &OutputSink, _message: Option<&str>) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_later_runnables_and_flushes_sink() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let sink = test_sink();
        let aborted = Arc::new(AtomicBool::new(false));
        sink.begin_cycle(Arc::new(Mutex::new(AbortProbe(aborted.clone()))));

        let mut exe = Execute::new(
            vec![
                named(TraceTask::new(&trace, 1)),
                named(AbortingTask {
                    trace: trace.clone(),
                    key: 2,
                    message: "boom",
                }),
                named(TraceTask::new(&trace, 3)),
            ],
            sink,
        );

        let schedule = exe.schedule();
        let should_not_set = Arc::new(AtomicBool::new(false));
        let flag = should_not_set.clone();
        schedule.start_background(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            flag.store(true, Ordering::SeqCst);
        });

        assert!(!exe.execute(test_interface()).await);
        assert_eq!(*trace.lock().unwrap(), vec![1, 2]);
        assert_eq!(schedule.abort_message().as_deref(), Some("boom"));
        assert!(aborted.load(Ordering::SeqCst));
        assert!(!should_not_set.load(Ordering::SeqCst));
    }

    // -----------------------------------------------------------------------
    // Pause / resume
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn pause_shifts_pending_runnables_by_pause_duration() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let times = Arc::new(Mutex::new(Vec::new()));
        let mut exe = Execute::new(
            vec![
                named(TraceTask::new(&trace, 1).advance(1.0).timed(&times)),
                named(TraceTask::new(&trace, 2).advance(1.0).timed(&times).sets("e")),
                named(TraceTask::new(&trace, 3).advance(1.0).timed(&times)),
            ],
            test_sink(),
        );
        let schedule = exe.schedule();
        let start = Instant::now();

        let driver = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(0.5)).await;
            schedule.pause();
            assert!(schedule.is_paused());
            schedule.pause(); // idempotent
            tokio::time::sleep(Duration::from_secs_f64(2.0)).await;
            schedule.resume();
            schedule.resume(); // no-op when not paused
        });

        assert!(exe.execute(test_interface()).await);
        driver.await.unwrap();

        // Origins 1.0 and 2.0 shift by the 2.0 s pause; elapsed_origin stays
        // origin-relative, so the recorded schedule times are unshifted.
        let times = times.lock().unwrap();
        assert!((times[0] - 0.0).abs() < 0.05, "first at {}", times[0]);
        assert!((times[1] - 1.0).abs() < 0.05, "second at {}", times[1]);
        assert!((times[2] - 2.0).abs() < 0.05, "third at {}", times[2]);
        let wall = Instant::now() - start;
        assert!(
            (wall.as_secs_f64() - 4.0).abs() < 0.1,
            "run took {:?}",
            wall
        );
    }

    // -----------------------------------------------------------------------
    // delay_schedule re-anchoring
    // -----------------------------------------------------------------------

    struct SlowRunnable {
        context: Context,
        origin: f64,
        duration: f64,
    }

    #[async_trait]
    impl Runnable for SlowRunnable {
        fn origin(&self) -> f64 {
            self.origin
        }

        fn context(&self) -> &Context {
            &self.context
        }

        async fn execute(&mut self) -> bool {
            tokio::time::sleep(Duration::from_secs_f64(self.duration)).await;
            true
        }
    }

    struct SlowTask {
        duration: f64,
        advance: f64,
    }

    impl Task for SlowTask {
        fn origin_advance(&self) -> f64 {
            self.advance
        }

        fn schedule(&self, context: &Context) -> Vec<Box<dyn Runnable>> {
            vec![Box::new(SlowRunnable {
                context: context.clone(),
                origin: context.origin,
                duration: self.duration,
            })]
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delay_schedule_shifts_unexecuted_runnables() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();
        let mut exe = Execute::new(
            vec![
                named(SlowTask {
                    duration: 5.0,
                    advance: 1.0,
                }),
                named(TraceTask::new(&trace, 1).advance(1.0)),
            ],
            test_sink(),
        );
        assert!(exe.execute(test_interface()).await);
        // Slow runnable at origin 0 takes 5 s and re-anchors; the follower at
        // origin 1.0 lands at wall 6.0.
        let wall = (Instant::now() - start).as_secs_f64();
        assert!((wall - 6.0).abs() < 0.1, "run took {wall}");
    }

    // -----------------------------------------------------------------------
    // Reschedule
    // -----------------------------------------------------------------------

    struct BreakTask {
        advance: f64,
        resume_offset: f64,
        reached: Mutex<Option<oneshot::Sender<()>>>,
        resume: Mutex<Option<oneshot::Receiver<()>>>,
    }

    impl BreakTask {
        fn new(advance: f64, resume_offset: f64) -> (Self, oneshot::Receiver<()>, oneshot::Sender<()>) {
            let (reached_tx, reached_rx) = oneshot::channel();
            let (resume_tx, resume_rx) = oneshot::channel();
            (
                BreakTask {
                    advance,
                    resume_offset,
                    reached: Mutex::new(Some(reached_tx)),
                    resume: Mutex::new(Some(resume_rx)),
                },
                reached_rx,
                resume_tx,
            )
        }
    }

    struct ReachedRunnable {
        context: Context,
        origin: f64,
        reached: Option<oneshot::Sender<()>>,
    }

    #[async_trait]
    impl Runnable for ReachedRunnable {
        fn origin(&self) -> f64 {
            self.origin
        }

        fn context(&self) -> &Context {
            &self.context
        }

        async fn execute(&mut self) -> bool {
            if let Some(tx) = self.reached.take() {
                let _ = tx.send(());
            }
            false
        }
    }

    struct ResumeRunnable {
        context: Context,
        origin: f64,
        resume: Option<oneshot::Receiver<()>>,
    }

    #[async_trait]
    impl Runnable for ResumeRunnable {
        fn origin(&self) -> f64 {
            self.origin
        }

        fn context(&self) -> &Context {
            &self.context
        }

        async fn execute(&mut self) -> bool {
            if let Some(rx) = self.resume.take() {
                let _ = rx.await;
            }
            true
        }
    }

    impl Task for BreakTask {
        fn origin_advance(&self) -> f64 {
            self.advance
        }

        fn schedule(&self, context: &Context) -> Vec<Box<dyn Runnable>> {
            vec![
                Box::new(ReachedRunnable {
                    context: context.clone(),
                    origin: context.origin,
                    reached: self.reached.lock().unwrap().take(),
                }),
                Box::new(ResumeRunnable {
                    context: context.clone(),
                    origin: context.origin + self.resume_offset,
                    resume: self.resume.lock().unwrap().take(),
                }),
            ]
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_pending_tasks() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let (break_task, reached, resume) = BreakTask::new(1.0, 0.5);
        let mut exe = Execute::new(
            vec![
                named(TraceTask::new(&trace, 1)),
                named(TraceTask::new(&trace, 2)),
                named(break_task),
                named(TraceTask::new(&trace, 3)),
                named(TraceTask::new(&trace, 98)),
                named(TraceTask::new(&trace, 99)),
            ],
            test_sink(),
        );
        let schedule = exe.schedule();

        let append: Vec<NamedTask> = vec![
            named(TraceTask::new(&trace, 4)),
            named(TraceTask::new(&trace, 5)),
            named(TraceTask::new(&trace, 6)),
        ];
        let driver = tokio::spawn(async move {
            reached.await.unwrap();
            let op = tokio::spawn({
                let schedule = schedule.clone();
                async move { schedule.reschedule(Some(4), append).await }
            });
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = resume.send(());
            op.await.unwrap()
        });

        assert!(exe.execute(test_interface()).await);
        driver.await.unwrap().unwrap();
        assert_eq!(*trace.lock().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_rejects_removing_activated_task() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let (break_task, reached, resume) = BreakTask::new(1.0, 0.5);
        let mut exe = Execute::new(
            vec![
                named(TraceTask::new(&trace, 1)),
                named(TraceTask::new(&trace, 2)),
                named(break_task),
                named(TraceTask::new(&trace, 3)),
            ],
            test_sink(),
        );
        let schedule = exe.schedule();

        let driver = tokio::spawn(async move {
            reached.await.unwrap();
            let op = tokio::spawn({
                let schedule = schedule.clone();
                async move { schedule.reschedule(Some(1), Vec::new()).await }
            });
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = resume.send(());
            op.await.unwrap()
        });

        assert!(exe.execute(test_interface()).await);
        assert_eq!(driver.await.unwrap(), Err(RescheduleError::TaskActive));
        assert_eq!(*trace.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_rejects_append_in_the_past() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let (break_task, reached, resume) = BreakTask::new(0.0, 1.0);
        let mut exe = Execute::new(
            vec![
                named(TraceTask::new(&trace, 1).advance(0.5)),
                named(TraceTask::new(&trace, 2).advance(0.5)),
                named(break_task),
            ],
            test_sink(),
        );
        let schedule = exe.schedule();

        // The appended context origin (1.0) is already in the past when the
        // mutation applies (elapsed ~2.0), so the past runnable rejects.
        let append = vec![named(TraceTask::new(&trace, 99).offset(-10.0))];
        let driver = tokio::spawn(async move {
            reached.await.unwrap();
            let op = tokio::spawn({
                let schedule = schedule.clone();
                async move { schedule.reschedule(None, append).await }
            });
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = resume.send(());
            op.await.unwrap()
        });

        assert!(exe.execute(test_interface()).await);
        assert_eq!(driver.await.unwrap(), Err(RescheduleError::ActionInPast));
        assert_eq!(*trace.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_suppresses_stale_preparation_for_future_cycle() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let (break_task, reached, resume) = BreakTask::new(30.0, 1.0);
        let mut exe = Execute::new(
            vec![named(TraceTask::new(&trace, 1).advance(0.5)), named(break_task)],
            test_sink(),
        );
        let schedule = exe.schedule();

        // Appended context origin is 30.5 (future); its preparation runnable
        // at 30.5 - 40 is already past and silently dropped, while the main
        // runnable still executes.
        struct PrepTask {
            trace: Trace,
        }
        impl Task for PrepTask {
            fn origin_advance(&self) -> f64 {
                1.0
            }

            fn schedule(&self, context: &Context) -> Vec<Box<dyn Runnable>> {
                vec![
                    Box::new(TraceRunnable {
                        context: context.clone(),
                        origin: context.origin - 40.0,
                        trace: self.trace.clone(),
                        key: 77,
                        set_events: Vec::new(),
                        clear_events: Vec::new(),
                        executed_at: None,
                    }),
                    Box::new(TraceRunnable {
                        context: context.clone(),
                        origin: context.origin,
                        trace: self.trace.clone(),
                        key: 7,
                        set_events: Vec::new(),
                        clear_events: Vec::new(),
                        executed_at: None,
                    }),
                ]
            }
        }

        let append = vec![named(PrepTask {
            trace: trace.clone(),
        })];
        let driver = tokio::spawn(async move {
            reached.await.unwrap();
            let op = tokio::spawn({
                let schedule = schedule.clone();
                async move { schedule.reschedule(None, append).await }
            });
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = resume.send(());
            op.await.unwrap()
        });

        assert!(exe.execute(test_interface()).await);
        driver.await.unwrap().unwrap();
        let trace = trace.lock().unwrap();
        assert!(trace.contains(&7));
        assert!(!trace.contains(&77));
    }

    // -----------------------------------------------------------------------
    // Gate and abort point
    // -----------------------------------------------------------------------

    struct GateTask {
        trace: Trace,
    }

    struct ReleaseRunnable {
        context: Context,
        origin: f64,
        trace: Trace,
        key: u32,
        release: GateRelease,
    }

    #[async_trait]
    impl Runnable for ReleaseRunnable {
        fn origin(&self) -> f64 {
            self.origin
        }

        fn context(&self) -> &Context {
            &self.context
        }

        async fn execute(&mut self) -> bool {
            self.trace.lock().unwrap().push(self.key);
            self.release.release();
            false
        }
    }

    impl Task for GateTask {
        fn schedule(&self, context: &Context) -> Vec<Box<dyn Runnable>> {
            let mut gate = Gate::new(context, context.origin + 0.01);
            let mut out: Vec<Box<dyn Runnable>> = Vec::new();
            for key in 1..=3 {
                out.push(Box::new(ReleaseRunnable {
                    context: context.clone(),
                    origin: context.origin,
                    trace: self.trace.clone(),
                    key,
                    release: gate.add_release(),
                }));
            }
            out.push(Box::new(gate));
            out.push(Box::new(TraceRunnable {
                context: context.clone(),
                origin: context.origin + 0.02,
                trace: self.trace.clone(),
                key: 4,
                set_events: Vec::new(),
                clear_events: Vec::new(),
                executed_at: None,
            }));
            out
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gate_waits_for_all_releases() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let mut exe = Execute::new(
            vec![named(GateTask {
                trace: trace.clone(),
            })],
            test_sink(),
        );
        assert!(exe.execute(test_interface()).await);
        assert_eq!(*trace.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    struct ArmingTask {
        trace: Trace,
        message: &'static str,
    }

    struct ArmingRunnable {
        context: Context,
        origin: f64,
        trace: Trace,
        handle: AbortHandle,
        message: &'static str,
    }

    #[async_trait]
    impl Runnable for ArmingRunnable {
        fn origin(&self) -> f64 {
            self.origin
        }

        fn context(&self) -> &Context {
            &self.context
        }

        async fn execute(&mut self) -> bool {
            self.trace.lock().unwrap().push(10);
            self.handle.arm(Some(self.message));
            false
        }
    }

    impl Task for ArmingTask {
        fn origin_advance(&self) -> f64 {
            0.01
        }

        fn schedule(&self, context: &Context) -> Vec<Box<dyn Runnable>> {
            let point = AbortPoint::new(context, context.origin + 0.02);
            vec![
                Box::new(ArmingRunnable {
                    context: context.clone(),
                    origin: context.origin,
                    trace: self.trace.clone(),
                    handle: point.handle(),
                    message: self.message,
                }),
                Box::new(TraceRunnable {
                    context: context.clone(),
                    origin: context.origin + 0.01,
                    trace: self.trace.clone(),
                    key: 11,
                    set_events: Vec::new(),
                    clear_events: Vec::new(),
                    executed_at: None,
                }),
                Box::new(point),
            ]
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abort_point_defers_abort_past_cleanup() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let mut exe = Execute::new(
            vec![
                named(ArmingTask {
                    trace: trace.clone(),
                    message: "deferred",
                }),
                named(TraceTask::new(&trace, 99)),
            ],
            test_sink(),
        );
        let schedule = exe.schedule();
        assert!(!exe.execute(test_interface()).await);
        // Cleanup between the arm and the abort point still ran; the task
        // after the abort point did not.
        assert_eq!(*trace.lock().unwrap(), vec![10, 11]);
        assert_eq!(schedule.abort_message().as_deref(), Some("deferred"));
    }
}
