//! PFP flask sampling: the base cycle plus flask-valve control, manifold
//! pressure bookkeeping and pre-cycle evacuation of the next flask.

use std::sync::Arc;

use async_trait::async_trait;

use crate::output::CycleHandle;
use crate::schedule::{AbortPoint, Context, Runnable, Task};
use crate::tasks::flow::{
    CheckNegativeFlow, DetectLowFlow, FeedbackFlow, FullFlow, LowFlowAction, MaintainFlow,
    StaticFlow,
};
use crate::tasks::sample::{base_cycle, new_cycle_data};
use crate::tasks::valve::{EvacuateOff, EvacuateOn, OverflowOff, OverflowOn, SetSsv};
use crate::tasks::{
    CYCLE_SECONDS, LOW_FLOW_THRESHOLD, LOWER_SAMPLE_FLOW, PFP_INITIAL_FLOW, SAMPLE_FLOW,
    SAMPLE_OPEN_AT, SAMPLE_SECONDS, UPPER_SAMPLE_FLOW,
};

/// Manifold pressure at or below which the PFP counts as evacuated.
const REQUIRED_PRESSURE_SIGNAL: f64 = 2.5;

/// Callback receiving one PFP pressure observation.
pub type PfpPressureRecorder = Arc<dyn Fn(f64) + Send + Sync>;

/// Callback receiving the PFP valve response message.
pub type PfpResponseRecorder = Arc<dyn Fn(String) + Send + Sync>;

/// Read the PFP manifold pressure; optionally record it.
pub struct MeasurePfpPressure {
    context: Context,
    origin: f64,
    ssv: u8,
    record: Option<PfpPressureRecorder>,
}

impl MeasurePfpPressure {
    pub fn new(
        context: &Context,
        origin: f64,
        ssv: u8,
        record: Option<PfpPressureRecorder>,
    ) -> Self {
        MeasurePfpPressure {
            context: context.clone(),
            origin,
            ssv,
            record,
        }
    }
}

#[async_trait]
impl Runnable for MeasurePfpPressure {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        match self.context.interface.get_pfp_pressure(Some(self.ssv)).await {
            Some(pressure) => {
                log::info!("PFP pressure {pressure:.2}");
                if let Some(record) = &self.record {
                    record(pressure);
                }
            }
            None => log::warn!("PFP pressure unavailable"),
        }
        false
    }
}

/// Abort the cycle unless the PFP inlet reads evacuated.
pub struct CheckPfpEvacuated {
    context: Context,
    origin: f64,
    ssv: u8,
}

impl CheckPfpEvacuated {
    pub fn new(context: &Context, origin: f64, ssv: u8) -> Self {
        CheckPfpEvacuated {
            context: context.clone(),
            origin,
            ssv,
        }
    }
}

#[async_trait]
impl Runnable for CheckPfpEvacuated {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        match self.context.interface.get_pfp_pressure(Some(self.ssv)).await {
            Some(pressure) if pressure <= REQUIRED_PRESSURE_SIGNAL => {}
            Some(pressure) => {
                self.context.schedule.abort(Some(&format!(
                    "PFP not evacuated (pressure {pressure:.2} > {REQUIRED_PRESSURE_SIGNAL})"
                )));
            }
            None => {
                self.context
                    .schedule
                    .abort(Some("PFP pressure unavailable before sampling"));
            }
        }
        false
    }
}

/// Open one PFP flask valve and record the firmware response. A protocol
/// fault aborts the cycle.
pub struct PfpValveOpen {
    context: Context,
    origin: f64,
    ssv: u8,
    valve: u8,
    record: PfpResponseRecorder,
}

impl PfpValveOpen {
    pub fn new(
        context: &Context,
        origin: f64,
        ssv: u8,
        valve: u8,
        record: PfpResponseRecorder,
    ) -> Self {
        PfpValveOpen {
            context: context.clone(),
            origin,
            ssv,
            valve,
            record,
        }
    }
}

#[async_trait]
impl Runnable for PfpValveOpen {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        match self
            .context
            .interface
            .set_pfp_valve(Some(self.ssv), self.valve, true)
            .await
        {
            Ok(response) => {
                log::info!("PFP valve {} open: {response}", self.valve);
                (self.record)(response);
            }
            Err(err) => {
                log::error!("PFP valve {} open failed: {err}", self.valve);
                self.context
                    .schedule
                    .abort(Some(&format!("PFP valve open failed: {err}")));
            }
        }
        false
    }
}

/// Close one PFP flask valve and record the firmware response.
pub struct PfpValveClose {
    context: Context,
    origin: f64,
    ssv: u8,
    valve: u8,
    record: PfpResponseRecorder,
}

impl PfpValveClose {
    pub fn new(
        context: &Context,
        origin: f64,
        ssv: u8,
        valve: u8,
        record: PfpResponseRecorder,
    ) -> Self {
        PfpValveClose {
            context: context.clone(),
            origin,
            ssv,
            valve,
            record,
        }
    }
}

#[async_trait]
impl Runnable for PfpValveClose {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        match self
            .context
            .interface
            .set_pfp_valve(Some(self.ssv), self.valve, false)
            .await
        {
            Ok(response) => {
                log::info!("PFP valve {} closed: {response}", self.valve);
                (self.record)(response);
            }
            Err(err) => {
                // The sample is already taken; log and keep the cycle.
                log::error!("PFP valve {} close failed: {err}", self.valve);
                (self.record)(format!("FAILED: {err}"));
            }
        }
        false
    }
}

/// One sample cycle drawing from flask `pfp` of the package on SSV position
/// `ssv`. Evacuation of the package runs through the position below it.
pub struct PfpFlask {
    pfp: u8,
    ssv: u8,
}

impl PfpFlask {
    pub fn new(pfp: u8, ssv: u8) -> Self {
        PfpFlask { pfp, ssv }
    }
}

impl Task for PfpFlask {
    fn origin_advance(&self) -> f64 {
        CYCLE_SECONDS
    }

    fn schedule(&self, context: &Context) -> Vec<Box<dyn Runnable>> {
        let o = context.origin;
        let p = o + SAMPLE_OPEN_AT;
        let q = p + SAMPLE_SECONDS;
        // Sample-close time of the previous cycle, for evacuation chaining.
        let prior_q = o - CYCLE_SECONDS + SAMPLE_OPEN_AT + SAMPLE_SECONDS;

        let data: CycleHandle = new_cycle_data(context, "flask");
        {
            let mut data = data.lock().unwrap();
            data.ssv_pos = Some(self.ssv);
            data.pfp_index = Some(self.pfp);
        }

        let handle = data.clone();
        let record_open: PfpResponseRecorder = Arc::new(move |response| {
            handle.lock().unwrap().record_pfp_open(response);
        });
        let handle = data.clone();
        let record_close: PfpResponseRecorder = Arc::new(move |response| {
            handle.lock().unwrap().record_pfp_close(response);
        });
        let pressure_slot = |slot: usize| -> Option<PfpPressureRecorder> {
            let handle = data.clone();
            Some(Arc::new(move |pressure| {
                handle.lock().unwrap().record_pfp_pressure(slot, pressure);
            }))
        };

        let abort_flow_invalid = AbortPoint::new(context, q + 160.0);
        let flow_abort = abort_flow_invalid.handle();

        let maintain = MaintainFlow::new(
            context,
            p + 2.0,
            q,
            SAMPLE_FLOW,
            Some(LOWER_SAMPLE_FLOW),
            Some(UPPER_SAMPLE_FLOW),
        );
        let maintain_stop = maintain.stop_handle();

        let mut run = base_cycle(context, &data);

        // Flow plumbing: a gentle initial draw, then ramp to sample flow,
        // then release the controller after injection.
        run.push(Box::new(StaticFlow::new(context, o + 3.0, PFP_INITIAL_FLOW)));
        run.push(Box::new(OverflowOn::new(context, o + 5.0)));
        run.push(Box::new(CheckNegativeFlow::new(
            context,
            o + 6.0,
            flow_abort.clone(),
        )));
        run.push(Box::new(FeedbackFlow::new(context, o + 6.0, PFP_INITIAL_FLOW)));
        run.push(Box::new(StaticFlow::new(context, o + 81.0, PFP_INITIAL_FLOW)));
        run.push(Box::new(CheckNegativeFlow::new(
            context,
            o + 83.0,
            flow_abort.clone(),
        )));
        run.push(Box::new(FeedbackFlow::new(context, o + 83.0, SAMPLE_FLOW)));
        run.push(Box::new(CheckNegativeFlow::new(
            context,
            o + 126.0,
            flow_abort.clone(),
        )));
        run.push(Box::new(FeedbackFlow::new(context, o + 126.0, SAMPLE_FLOW)));
        run.push(Box::new(StaticFlow::new(
            context,
            q + 175.0,
            PFP_INITIAL_FLOW,
        )));
        run.push(Box::new(FullFlow::new(context, q + 176.0)));
        run.push(Box::new(MaintainFlow::new(
            context,
            o + 111.0,
            p,
            SAMPLE_FLOW,
            Some(LOWER_SAMPLE_FLOW),
            None,
        )));
        run.push(Box::new(maintain));
        run.push(Box::new(DetectLowFlow::new(
            context,
            p + 1.0,
            q,
            SAMPLE_FLOW,
            LOW_FLOW_THRESHOLD,
            Some(maintain_stop),
            LowFlowAction::CloseOverflow,
            &data,
        )));

        // Manifold bookkeeping around the sample.
        run.push(Box::new(MeasurePfpPressure::new(context, o + 3.0, self.ssv, None)));
        run.push(Box::new(MeasurePfpPressure::new(
            context,
            o + 30.0,
            self.ssv,
            None,
        )));
        run.push(Box::new(PfpValveClose::new(
            context,
            q + 30.0,
            self.ssv,
            self.pfp,
            record_close,
        )));
        for offset in [6.0, 10.0, 20.0] {
            run.push(Box::new(MeasurePfpPressure::new(
                context,
                q + offset,
                self.ssv,
                None,
            )));
        }
        run.push(Box::new(MeasurePfpPressure::new(
            context,
            q + 15.0,
            self.ssv,
            pressure_slot(2),
        )));
        run.push(Box::new(abort_flow_invalid));

        // Evacuate the package for the next cycle once this sample is away.
        if prior_q > 0.0 {
            let evac_ssv = self.ssv.saturating_sub(1);
            run.push(Box::new(OverflowOff::new(context, prior_q + 182.0)));
            run.push(Box::new(SetSsv::new(context, prior_q + 182.0, evac_ssv)));
            run.push(Box::new(EvacuateOn::new(context, prior_q + 198.0)));
        }

        if o > 0.0 {
            run.push(Box::new(SetSsv::new(context, o - 30.0, self.ssv)));
            run.push(Box::new(EvacuateOff::new(context, o - 240.0)));
            run.push(Box::new(MeasurePfpPressure::new(
                context,
                o - 123.0,
                self.ssv,
                pressure_slot(0),
            )));
            run.push(Box::new(MeasurePfpPressure::new(
                context,
                o - 103.0,
                self.ssv,
                pressure_slot(1),
            )));
            run.push(Box::new(CheckPfpEvacuated::new(context, o - 120.0, self.ssv)));
            run.push(Box::new(PfpValveOpen::new(
                context,
                o - 115.0,
                self.ssv,
                self.pfp,
                record_open,
            )));
        } else {
            // Failsafes so the first cycle starts from a sane state.
            run.push(Box::new(SetSsv::new(context, o, self.ssv)));
            run.push(Box::new(EvacuateOff::new(context, o)));
            run.push(Box::new(PfpValveOpen::new(
                context,
                o + 2.0,
                self.ssv,
                self.pfp,
                record_open,
            )));
        }

        run
    }
}
