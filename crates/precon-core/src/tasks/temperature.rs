//! Oven temperature interlocks around the injection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::schedule::{AbortHandle, Context, Runnable};

/// Oven signal that counts as cooled (and, inverted, as heated).
const REQUIRED_TEMPERATURE_SIGNAL: f64 = 2.5;

/// Callback fired every time the oven needed another cool-down wait.
pub type CoolingRetry = Arc<dyn Fn() + Send + Sync>;

/// Hold the schedule until the oven signal has cooled below the threshold,
/// retrying up to four times with 15 second gaps. Exhaustion arms the cycle's
/// deferred abort point so the injection cleanup still runs.
pub struct WaitForOvenCool {
    context: Context,
    origin: f64,
    retry: CoolingRetry,
    abort: AbortHandle,
}

impl WaitForOvenCool {
    pub fn new(context: &Context, origin: f64, retry: CoolingRetry, abort: AbortHandle) -> Self {
        WaitForOvenCool {
            context: context.clone(),
            origin,
            retry,
            abort,
        }
    }
}

#[async_trait]
impl Runnable for WaitForOvenCool {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        for attempt in 0..4 {
            let signal = self.context.interface.get_oven_temperature_signal().await;
            if let Some(signal) = signal {
                if signal <= REQUIRED_TEMPERATURE_SIGNAL {
                    log::info!("Oven cooled");
                    // Waiting consumed schedule time; shift the rest.
                    return attempt > 0;
                }
                log::info!(
                    "Oven temperature too high ({signal:.3} > {REQUIRED_TEMPERATURE_SIGNAL}), \
                     waiting for 15 seconds"
                );
            }
            (self.retry)();
            tokio::time::sleep(Duration::from_secs(15)).await;
        }

        log::info!("Oven failed to reach {REQUIRED_TEMPERATURE_SIGNAL}, cycle will abort");
        self.abort.arm(Some("Oven failed to cool"));
        true
    }
}

/// Verify the oven signal rose back above the threshold after injection;
/// abort the cycle when it did not.
pub struct CheckSampleTemperature {
    context: Context,
    origin: f64,
}

impl CheckSampleTemperature {
    pub fn new(context: &Context, origin: f64) -> Self {
        CheckSampleTemperature {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for CheckSampleTemperature {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        let signal = self.context.interface.get_oven_temperature_signal().await;
        if let Some(signal) = signal {
            if signal > REQUIRED_TEMPERATURE_SIGNAL {
                return false;
            }
            log::info!(
                "GC temperature too low ({signal:.3} < {REQUIRED_TEMPERATURE_SIGNAL}), aborting"
            );
        }
        self.context.schedule.abort(Some("Oven failed to heat"));
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::hw::sim::SimulatedInstrument;
    use crate::output::OutputSink;
    use crate::schedule::{AbortPoint, Execute, NamedTask, Task};

    struct OvenTask {
        retries: Arc<AtomicU32>,
    }

    impl Task for OvenTask {
        fn schedule(&self, context: &Context) -> Vec<Box<dyn Runnable>> {
            let point = AbortPoint::new(context, context.origin + 100.0);
            let retries = self.retries.clone();
            let retry: CoolingRetry = Arc::new(move || {
                retries.fetch_add(1, Ordering::SeqCst);
            });
            vec![
                Box::new(WaitForOvenCool::new(
                    context,
                    context.origin,
                    retry,
                    point.handle(),
                )),
                Box::new(point),
            ]
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hot_oven_arms_deferred_abort_after_retries() {
        let retries = Arc::new(AtomicU32::new(0));
        let sim = Arc::new(SimulatedInstrument::new());
        sim.set_oven_signal(4.0);

        let mut exe = Execute::new(
            vec![NamedTask::unnamed(Arc::new(OvenTask {
                retries: retries.clone(),
            }))],
            Arc::new(OutputSink::new()),
        );
        let schedule = exe.schedule();
        assert!(!exe.execute(sim).await);
        assert_eq!(retries.load(Ordering::SeqCst), 4);
        assert_eq!(schedule.abort_message().as_deref(), Some("Oven failed to cool"));
    }

    #[tokio::test(start_paused = true)]
    async fn cool_oven_passes_without_retry() {
        let retries = Arc::new(AtomicU32::new(0));
        let sim = Arc::new(SimulatedInstrument::new());
        sim.set_oven_signal(2.0);

        let mut exe = Execute::new(
            vec![NamedTask::unnamed(Arc::new(OvenTask {
                retries: retries.clone(),
            }))],
            Arc::new(OutputSink::new()),
        );
        assert!(exe.execute(sim).await);
        assert_eq!(retries.load(Ordering::SeqCst), 0);
    }

    struct HeatCheckTask;

    impl Task for HeatCheckTask {
        fn schedule(&self, context: &Context) -> Vec<Box<dyn Runnable>> {
            vec![Box::new(CheckSampleTemperature::new(context, context.origin))]
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cold_oven_after_injection_aborts() {
        let sim = Arc::new(SimulatedInstrument::new());
        sim.set_oven_signal(2.0);
        let mut exe = Execute::new(
            vec![NamedTask::unnamed(Arc::new(HeatCheckTask))],
            Arc::new(OutputSink::new()),
        );
        let schedule = exe.schedule();
        assert!(!exe.execute(sim).await);
        assert_eq!(schedule.abort_message().as_deref(), Some("Oven failed to heat"));
    }

    #[tokio::test(start_paused = true)]
    async fn hot_oven_after_injection_passes() {
        let sim = Arc::new(SimulatedInstrument::new());
        sim.set_oven_signal(4.0);
        let mut exe = Execute::new(
            vec![NamedTask::unnamed(Arc::new(HeatCheckTask))],
            Arc::new(OutputSink::new()),
        );
        assert!(exe.execute(sim).await);
    }
}
