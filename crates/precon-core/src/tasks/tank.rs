//! Tank sampling: fully open flow, no feedback.

use crate::output::CycleHandle;
use crate::schedule::{Context, Runnable, Task};
use crate::tasks::flow::{DetectLowFlow, FullFlow, LowFlowAction};
use crate::tasks::sample::{base_cycle, new_cycle_data};
use crate::tasks::valve::{HighPressureOn, OverflowOn, SetSsv};
use crate::tasks::{
    CYCLE_SECONDS, LOW_FLOW_THRESHOLD, SAMPLE_FLOW, SAMPLE_OPEN_AT, SAMPLE_SECONDS,
};

/// One sample cycle drawing from a high-pressure tank.
///
/// Tanks deliver ample pressure, so the flow controller is simply opened
/// fully; only the low-flow guard watches the sampling window.
pub struct Tank {
    ssv: u8,
}

impl Tank {
    pub fn new(ssv: u8) -> Self {
        Tank { ssv }
    }
}

impl Task for Tank {
    fn origin_advance(&self) -> f64 {
        CYCLE_SECONDS
    }

    fn schedule(&self, context: &Context) -> Vec<Box<dyn Runnable>> {
        let o = context.origin;
        let p = o + SAMPLE_OPEN_AT;
        let q = p + SAMPLE_SECONDS;

        let data: CycleHandle = new_cycle_data(context, "tank");
        data.lock().unwrap().ssv_pos = Some(self.ssv);

        let mut run = base_cycle(context, &data);
        run.push(Box::new(FullFlow::new(context, o + 6.0)));
        run.push(Box::new(DetectLowFlow::new(
            context,
            p + 1.0,
            q,
            SAMPLE_FLOW,
            LOW_FLOW_THRESHOLD,
            None,
            LowFlowAction::CloseOverflow,
            &data,
        )));

        if o > 0.0 {
            run.push(Box::new(SetSsv::new(context, o - 814.0, self.ssv)));
            run.push(Box::new(OverflowOn::new(context, o - 180.0)));
            run.push(Box::new(HighPressureOn::new(context, o - 180.0)));
        } else {
            run.push(Box::new(OverflowOn::new(context, o)));
            run.push(Box::new(SetSsv::new(context, o, self.ssv)));
            run.push(Box::new(HighPressureOn::new(context, o)));
        }

        run
    }
}
