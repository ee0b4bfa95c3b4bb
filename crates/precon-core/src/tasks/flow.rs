//! Sample flow control: setpoints, feedback ramps, in-sample maintenance and
//! low-flow detection.
//!
//! Several of these schedule overlapping actuation windows; they cooperate by
//! all writing the same flow-control output, so whichever acted last wins.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::output::CycleHandle;
use crate::schedule::{AbortHandle, Context, Runnable};

/// Callback receiving `(flow signal, flow-control output)`.
pub type FlowRecorder = Arc<dyn Fn(Option<f64>, Option<f64>) + Send + Sync>;

/// Voltage steps applied on a low-flow first strike (0.02 V per step).
const LOW_FLOW_NUDGE: f64 = 5.0;

/// Zero the flow reading against a no-flow baseline, averaged in the
/// background over the window.
pub struct ZeroFlow {
    context: Context,
    origin: f64,
    duration: f64,
}

impl ZeroFlow {
    pub fn new(context: &Context, origin: f64) -> Self {
        ZeroFlow {
            context: context.clone(),
            origin,
            duration: 20.0,
        }
    }
}

#[async_trait]
impl Runnable for ZeroFlow {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        let interface = self.context.interface.clone();
        let duration = self.duration;
        self.context.schedule.start_background(async move {
            interface.set_flow_zero_offset(0.0);
            let end = Instant::now() + Duration::from_secs_f64(duration);
            let mut sum = 0.0;
            let mut count = 0u32;
            while Instant::now() <= end {
                if let Some(flow) = interface.get_flow_signal().await {
                    sum += flow;
                    count += 1;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            if count == 0 || sum <= 0.0 {
                return;
            }
            let zero = sum / f64::from(count);
            interface.set_flow_zero_offset(-zero);
            log::info!("Measured zero flow as {zero:.1}");
        });
        false
    }
}

/// Open the flow controller fully.
pub struct FullFlow {
    context: Context,
    origin: f64,
}

impl FullFlow {
    pub fn new(context: &Context, origin: f64) -> Self {
        FullFlow {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for FullFlow {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.set_flow(f64::INFINITY).await;
        log::info!("Set flow to fully open");
        false
    }
}

/// Set a fixed flow target with no feedback.
pub struct StaticFlow {
    context: Context,
    origin: f64,
    flow: f64,
}

impl StaticFlow {
    pub fn new(context: &Context, origin: f64, flow: f64) -> Self {
        StaticFlow {
            context: context.clone(),
            origin,
            flow,
        }
    }
}

#[async_trait]
impl Runnable for StaticFlow {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.set_flow(self.flow).await;
        log::info!("Set flow to {:.1}", self.flow);
        false
    }
}

/// Set a flow target and converge on it with a bounded background feedback
/// loop.
pub struct FeedbackFlow {
    context: Context,
    origin: f64,
    flow: f64,
}

impl FeedbackFlow {
    const DEADBAND: f64 = 0.15;
    const SETTLING_TIME: f64 = 0.3;

    pub fn new(context: &Context, origin: f64, flow: f64) -> Self {
        FeedbackFlow {
            context: context.clone(),
            origin,
            flow,
        }
    }
}

#[async_trait]
impl Runnable for FeedbackFlow {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.set_flow(self.flow).await;
        let interface = self.context.interface.clone();
        let flow = self.flow;
        self.context.schedule.start_background(async move {
            for _ in 0..15 {
                if let Some(signal) = interface.get_flow_signal().await {
                    if (signal - flow).abs() <= FeedbackFlow::DEADBAND {
                        return;
                    }
                    interface.adjust_flow(flow).await;
                }
                tokio::time::sleep(Duration::from_secs_f64(FeedbackFlow::SETTLING_TIME)).await;
            }
            log::warn!("Flow control feedback failed");
        });
        log::info!("Setting flow to {:.1} with feedback", self.flow);
        false
    }
}

/// Stops a running [`MaintainFlow`] monitor.
#[derive(Clone, Default)]
pub struct MaintainStop(Arc<AtomicBool>);

impl MaintainStop {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Keep the flow inside a band for a window by nudging the control output,
/// monitored in the background once per second.
pub struct MaintainFlow {
    context: Context,
    origin: f64,
    end: f64,
    flow: f64,
    lower: Option<f64>,
    upper: Option<f64>,
    stop: MaintainStop,
}

impl MaintainFlow {
    pub fn new(
        context: &Context,
        origin: f64,
        end: f64,
        flow: f64,
        lower: Option<f64>,
        upper: Option<f64>,
    ) -> Self {
        MaintainFlow {
            context: context.clone(),
            origin,
            end,
            flow,
            lower,
            upper,
            stop: MaintainStop::default(),
        }
    }

    /// Handle that stops the monitor early.
    pub fn stop_handle(&self) -> MaintainStop {
        self.stop.clone()
    }
}

#[async_trait]
impl Runnable for MaintainFlow {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        let interface = self.context.interface.clone();
        let duration = (self.end - self.origin).max(0.0);
        let flow = self.flow;
        let lower = self.lower;
        let upper = self.upper;
        let stop = self.stop.clone();
        self.context.schedule.start_background(async move {
            let end = Instant::now() + Duration::from_secs_f64(duration);
            while Instant::now() <= end && !stop.is_stopped() {
                if let Some(measured) = interface.get_flow_signal().await {
                    if lower.is_some_and(|lower| measured < lower) {
                        interface.increment_flow(flow, 1.0).await;
                        log::info!("Increased flow");
                    } else if upper.is_some_and(|upper| measured > upper) {
                        interface.increment_flow(flow, -1.0).await;
                        log::info!("Decreased flow");
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
        false
    }
}

/// What the second low-flow strike closes while giving up on the sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowFlowAction {
    CloseOverflow,
    CloseVacuum,
}

/// Watch for the flow signal collapsing during the sample window.
///
/// First strike: record it and nudge the flow up by 0.1 V. If the signal
/// stays low past the trigger window, second strike: stop the maintain
/// monitor, close the configured valve and mark the cycle low-flow.
pub struct DetectLowFlow {
    context: Context,
    origin: f64,
    end: f64,
    flow: f64,
    threshold: f64,
    stop: Option<MaintainStop>,
    action: LowFlowAction,
    data: CycleHandle,
}

impl DetectLowFlow {
    const TRIGGER_SECONDS: f64 = 2.0;

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: &Context,
        origin: f64,
        end: f64,
        flow: f64,
        threshold: f64,
        stop: Option<MaintainStop>,
        action: LowFlowAction,
        data: &CycleHandle,
    ) -> Self {
        DetectLowFlow {
            context: context.clone(),
            origin,
            end,
            flow,
            threshold,
            stop,
            action,
            data: data.clone(),
        }
    }
}

#[async_trait]
impl Runnable for DetectLowFlow {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        let interface = self.context.interface.clone();
        let duration = (self.end - self.origin).max(0.0);
        let flow = self.flow;
        let threshold = self.threshold;
        let stop = self.stop.clone();
        let action = self.action;
        let data = self.data.clone();
        self.context.schedule.start_background(async move {
            let end = Instant::now() + Duration::from_secs_f64(duration);
            let mut low_begin: Option<Instant> = None;
            while Instant::now() <= end {
                if let Some(measured) = interface.get_flow_signal().await {
                    if measured < threshold {
                        match low_begin {
                            None => {
                                low_begin = Some(Instant::now());
                                data.lock().unwrap().low_flow_strike();
                                interface.increment_flow(flow, LOW_FLOW_NUDGE).await;
                                log::info!("Low flow detected");
                            }
                            Some(begin)
                                if begin.elapsed().as_secs_f64()
                                    >= DetectLowFlow::TRIGGER_SECONDS =>
                            {
                                if let Some(stop) = &stop {
                                    stop.stop();
                                }
                                match action {
                                    LowFlowAction::CloseOverflow => {
                                        interface.set_overflow(false).await
                                    }
                                    LowFlowAction::CloseVacuum => interface.set_vacuum(false).await,
                                }
                                data.lock().unwrap().mark_low_flow();
                                log::info!("Extended low flow detected");
                                return;
                            }
                            Some(_) => {}
                        }
                    } else {
                        low_begin = None;
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
        false
    }
}

/// Log the current flow signal.
pub struct LogFlow {
    context: Context,
    origin: f64,
}

impl LogFlow {
    pub fn new(context: &Context, origin: f64) -> Self {
        LogFlow {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for LogFlow {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        match self.context.interface.get_flow_signal().await {
            Some(flow) => log::info!("Sample flow at {flow:.3}"),
            None => log::info!("Sample flow unknown"),
        }
        false
    }
}

/// Record the final flow reading and the flow-control output.
pub struct RecordLastFlow {
    context: Context,
    origin: f64,
    record: FlowRecorder,
}

impl RecordLastFlow {
    pub fn new(context: &Context, origin: f64, record: FlowRecorder) -> Self {
        RecordLastFlow {
            context: context.clone(),
            origin,
            record,
        }
    }
}

#[async_trait]
impl Runnable for RecordLastFlow {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        let flow = self.context.interface.get_flow_signal().await;
        let control = self.context.interface.get_flow_control_output().await;
        (self.record)(flow, control);
        false
    }
}

/// Arm the cycle's abort point when the sample flow has gone negative.
pub struct CheckNegativeFlow {
    context: Context,
    origin: f64,
    abort: AbortHandle,
}

impl CheckNegativeFlow {
    pub fn new(context: &Context, origin: f64, abort: AbortHandle) -> Self {
        CheckNegativeFlow {
            context: context.clone(),
            origin,
            abort,
        }
    }
}

#[async_trait]
impl Runnable for CheckNegativeFlow {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        if let Some(flow) = self.context.interface.get_flow_signal().await {
            if flow < 0.0 {
                log::info!("Sample flow is negative ({flow:.3}), cycle will abort");
                self.abort.arm(Some("Sample flow is negative"));
            }
        }
        false
    }
}
