//! Zero-gas sampling: a flask cycle drawn from the zero air line.

use crate::schedule::{Context, Runnable, Task};
use crate::tasks::flask::flow_managed_cycle;
use crate::tasks::flow::LowFlowAction;
use crate::tasks::sample::new_cycle_data;
use crate::tasks::{CYCLE_SECONDS, ZERO_GAS_SSV};

/// One sample cycle drawing from the zero-gas line.
///
/// Zero gas has no flask to protect, so a persistent flow loss closes the
/// vacuum side instead of the overflow.
pub struct Zero;

impl Task for Zero {
    fn origin_advance(&self) -> f64 {
        CYCLE_SECONDS
    }

    fn schedule(&self, context: &Context) -> Vec<Box<dyn Runnable>> {
        let data = new_cycle_data(context, "zero");
        data.lock().unwrap().ssv_pos = Some(ZERO_GAS_SSV);
        flow_managed_cycle(context, &data, ZERO_GAS_SSV, LowFlowAction::CloseVacuum)
    }
}
