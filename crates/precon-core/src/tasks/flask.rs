//! Flask sampling: the base cycle plus managed flow and inlet selection.

use crate::output::CycleHandle;
use crate::schedule::{Context, Runnable, Task};
use crate::tasks::flow::{
    DetectLowFlow, FeedbackFlow, LowFlowAction, MaintainFlow, StaticFlow,
};
use crate::tasks::sample::{base_cycle, new_cycle_data};
use crate::tasks::valve::{HighPressureOn, OverflowOn, SetSsv};
use crate::tasks::{
    CYCLE_SECONDS, INITIAL_FLOW, LOW_FLOW_THRESHOLD, LOWER_SAMPLE_FLOW, SAMPLE_FLOW,
    SAMPLE_OPEN_AT, SAMPLE_SECONDS, UPPER_SAMPLE_FLOW,
};

/// Base cycle plus feedback ramps, the in-sample maintenance band, low-flow
/// detection and SSV pre-positioning. Shared by flask and zero cycles.
pub(crate) fn flow_managed_cycle(
    context: &Context,
    data: &CycleHandle,
    ssv: u8,
    low_flow_action: LowFlowAction,
) -> Vec<Box<dyn Runnable>> {
    let o = context.origin;
    let p = o + SAMPLE_OPEN_AT;
    let q = p + SAMPLE_SECONDS;

    let mut run = base_cycle(context, data);

    let maintain = MaintainFlow::new(
        context,
        p + 2.0,
        q,
        SAMPLE_FLOW,
        Some(LOWER_SAMPLE_FLOW),
        Some(UPPER_SAMPLE_FLOW),
    );
    let maintain_stop = maintain.stop_handle();

    run.push(Box::new(StaticFlow::new(context, o + 69.0, SAMPLE_FLOW)));
    run.push(Box::new(FeedbackFlow::new(context, o + 71.0, SAMPLE_FLOW)));
    run.push(Box::new(FeedbackFlow::new(context, o + 123.0, SAMPLE_FLOW)));
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
        low_flow_action,
        data,
    )));

    if o > 0.0 {
        // Long-horizon prep: swing the SSV early and settle an initial flow
        // on the new inlet well before the cycle starts.
        run.push(Box::new(SetSsv::new(context, o - 814.0, ssv)));
        run.push(Box::new(FeedbackFlow::new(context, o - 813.0, INITIAL_FLOW)));
        run.push(Box::new(OverflowOn::new(context, o - 180.0)));
        run.push(Box::new(HighPressureOn::new(context, o - 180.0)));
        run.push(Box::new(FeedbackFlow::new(context, o + 6.0, SAMPLE_FLOW)));
    } else {
        run.push(Box::new(OverflowOn::new(context, o)));
        run.push(Box::new(SetSsv::new(context, o, ssv)));
        run.push(Box::new(HighPressureOn::new(context, o)));
        run.push(Box::new(FeedbackFlow::new(context, o + 6.0, INITIAL_FLOW)));
    }

    run
}

/// One sample cycle drawing from a flask on the given SSV position.
pub struct Flask {
    ssv: u8,
}

impl Flask {
    pub fn new(ssv: u8) -> Self {
        Flask { ssv }
    }
}

impl Task for Flask {
    fn origin_advance(&self) -> f64 {
        CYCLE_SECONDS
    }

    fn schedule(&self, context: &Context) -> Vec<Box<dyn Runnable>> {
        let data = new_cycle_data(context, "flask");
        data.lock().unwrap().ssv_pos = Some(self.ssv);
        flow_managed_cycle(context, &data, self.ssv, LowFlowAction::CloseOverflow)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::hw::sim::SimulatedInstrument;
    use crate::output::OutputSink;
    use crate::schedule::{Execute, NamedTask};

    struct Probe {
        at_origin: f64,
        origins: Arc<Mutex<Vec<f64>>>,
    }

    impl crate::schedule::Task for Probe {
        fn schedule(&self, context: &Context) -> Vec<Box<dyn Runnable>> {
            let context = Context {
                origin: self.at_origin,
                ..context.clone()
            };
            let expanded = Flask::new(4).schedule(&context);
            *self.origins.lock().unwrap() = expanded.iter().map(|r| r.origin()).collect();
            Vec::new()
        }
    }

    async fn origins_at(origin: f64) -> Vec<f64> {
        let origins = Arc::new(Mutex::new(Vec::new()));
        let mut exe = Execute::new(
            vec![NamedTask::unnamed(Arc::new(Probe {
                at_origin: origin,
                origins: origins.clone(),
            }))],
            Arc::new(OutputSink::new()),
        );
        assert!(exe.execute(Arc::new(SimulatedInstrument::new())).await);
        let origins = origins.lock().unwrap().clone();
        origins
    }

    #[tokio::test(start_paused = true)]
    async fn first_cycle_selects_inlet_at_origin() {
        let origins = origins_at(0.0).await;
        assert!(origins.iter().all(|&o| o >= 0.0));
        // Inlet selection and flow ramp happen inside the cycle itself.
        assert!(origins.contains(&0.0));
        assert!(origins.contains(&6.0));
        assert!(origins.contains(&71.0));
        assert!(origins.contains(&123.0));
    }

    #[tokio::test(start_paused = true)]
    async fn later_cycles_swing_ssv_long_before_origin() {
        let o = CYCLE_SECONDS;
        let origins = origins_at(o).await;
        for prep in [o - 814.0, o - 813.0, o - 180.0] {
            assert!(origins.contains(&prep), "missing prep origin {prep}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sampling_window_is_monitored() {
        let origins = origins_at(0.0).await;
        let p = SAMPLE_OPEN_AT;
        assert!(origins.contains(&(p + 1.0))); // low-flow detection
        assert!(origins.contains(&(p + 2.0))); // maintenance band
        assert!(origins.contains(&111.0)); // pre-open maintenance
    }
}
