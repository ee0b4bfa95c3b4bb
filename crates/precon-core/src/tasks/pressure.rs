//! Chamber pressure measurement windows.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use statrs::statistics::Statistics;
use tokio::time::Instant;

use crate::schedule::{Context, Runnable};

/// Callback receiving `(mean, stddev, raw series)` of a measurement window.
pub type PressureRecorder = Arc<dyn Fn(f64, f64, Vec<f64>) + Send + Sync>;

/// Sample the chamber pressure once per second over a window, then record
/// the mean, sample standard deviation and raw series. The sampling runs in
/// the background so the schedule keeps moving.
pub struct MeasurePressure {
    context: Context,
    origin: f64,
    duration: f64,
    record: PressureRecorder,
}

impl MeasurePressure {
    pub fn new(context: &Context, origin: f64, duration: f64, record: PressureRecorder) -> Self {
        MeasurePressure {
            context: context.clone(),
            origin,
            duration,
            record,
        }
    }
}

#[async_trait]
impl Runnable for MeasurePressure {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        let interface = self.context.interface.clone();
        let duration = self.duration;
        let record = self.record.clone();
        self.context.schedule.start_background(async move {
            let end = Instant::now() + Duration::from_secs_f64(duration);
            let mut readings: Vec<f64> = Vec::new();
            while Instant::now() <= end {
                if let Some(pressure) = interface.get_pressure().await {
                    readings.push(pressure);
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            if readings.len() < 2 {
                log::warn!("Pressure window produced {} readings", readings.len());
                return;
            }
            let mean = Statistics::mean(&readings);
            let stddev = Statistics::std_dev(&readings);
            log::debug!("Measured pressure {mean:.1} with stddev {stddev:.2}");
            record(mean, stddev, readings);
        });
        log::info!("Collecting pressure data");
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::hw::sim::SimulatedInstrument;
    use crate::output::OutputSink;
    use crate::schedule::{Execute, NamedTask, Task};

    struct OneMeasurement {
        record: PressureRecorder,
    }

    impl Task for OneMeasurement {
        fn schedule(&self, context: &Context) -> Vec<Box<dyn Runnable>> {
            vec![Box::new(MeasurePressure::new(
                context,
                context.origin,
                7.0,
                self.record.clone(),
            ))]
        }
    }

    #[tokio::test(start_paused = true)]
    async fn records_mean_and_stddev_over_window() {
        let captured: Arc<Mutex<Option<(f64, f64, usize)>>> = Arc::new(Mutex::new(None));
        let target = captured.clone();
        let record: PressureRecorder = Arc::new(move |mean, stddev, series| {
            *target.lock().unwrap() = Some((mean, stddev, series.len()));
        });

        let sim = Arc::new(SimulatedInstrument::new());
        sim.set_pressure(740.0);

        let mut exe = Execute::new(
            vec![NamedTask::unnamed(Arc::new(OneMeasurement { record }))],
            Arc::new(OutputSink::new()),
        );
        assert!(exe.execute(sim).await);

        let (mean, stddev, count) = captured.lock().unwrap().expect("window recorded");
        assert!((mean - 740.0).abs() < 1e-9);
        assert_eq!(stddev, 0.0);
        assert!((7..=8).contains(&count));
    }
}
