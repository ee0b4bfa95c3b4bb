//! The base sample cycle: begin/end bookkeeping, sample valve, and the
//! shared choreography every inlet variant builds on.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::hw::Interface;
use crate::output::{CycleHandle, SampleData};
use crate::schedule::{AbortPoint, Context, Runnable};
use crate::tasks::column::{PreColumnIn, PreColumnOut};
use crate::tasks::cryogen::{
    CryoHeaterOff, CryoHeaterOn, DisableCryogen, DisableGcCryogen, EnableCryogen, EnableGcCryogen,
};
use crate::tasks::flow::{
    FlowRecorder, LogFlow, RecordLastFlow, StaticFlow, ZeroFlow,
};
use crate::tasks::gc::{GcReady, GcSample};
use crate::tasks::pressure::{MeasurePressure, PressureRecorder};
use crate::tasks::temperature::{CheckSampleTemperature, CoolingRetry, WaitForOvenCool};
use crate::tasks::vacuum::{VacuumOff, VacuumOn};
use crate::tasks::valve::{
    HighPressureOff, InjectSwitch, LoadSwitch, OverflowOff, OverflowOn,
};
use crate::tasks::{CYCLE_SECONDS, SAMPLE_OPEN_AT, SAMPLE_SECONDS};

pub struct SampleOpen {
    context: Context,
    origin: f64,
}

impl SampleOpen {
    pub fn new(context: &Context, origin: f64) -> Self {
        SampleOpen {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for SampleOpen {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    fn set_events(&self) -> &[&'static str] {
        &["sample_open"]
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.set_sample(true).await;
        log::info!("Sample valve open");
        false
    }
}

pub struct SampleClose {
    context: Context,
    origin: f64,
}

impl SampleClose {
    pub fn new(context: &Context, origin: f64) -> Self {
        SampleClose {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for SampleClose {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    fn set_events(&self) -> &[&'static str] {
        &["sample_close"]
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.set_sample(false).await;
        log::info!("Sample valve closed");
        false
    }
}

/// First runnable of a cycle: publishes the active cycle record and starts
/// the background temperature log.
pub struct CycleBegin {
    context: Context,
    origin: f64,
    data: CycleHandle,
}

impl CycleBegin {
    pub fn new(context: &Context, origin: f64, data: &CycleHandle) -> Self {
        CycleBegin {
            context: context.clone(),
            origin,
            data: data.clone(),
        }
    }
}

#[async_trait]
impl Runnable for CycleBegin {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    fn clear_events(&self) -> &[&'static str] {
        &["sample_open", "sample_close", "gc_trigger", "cycle_end"]
    }

    async fn execute(&mut self) -> bool {
        self.context.mark_started();
        self.context.schedule.sink().begin_cycle(self.data.clone());
        start_temperature_log(&self.context, &self.data);
        false
    }
}

/// Last runnable of a cycle: stops the temperature log, drains background
/// work and flushes the cycle record.
pub struct CycleEnd {
    context: Context,
    origin: f64,
    data: CycleHandle,
}

impl CycleEnd {
    pub fn new(context: &Context, origin: f64, data: &CycleHandle) -> Self {
        CycleEnd {
            context: context.clone(),
            origin,
            data: data.clone(),
        }
    }
}

#[async_trait]
impl Runnable for CycleEnd {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    fn set_events(&self) -> &[&'static str] {
        &["cycle_end"]
    }

    fn clear_events(&self) -> &[&'static str] {
        &["sample_open", "sample_close", "gc_trigger"]
    }

    async fn execute(&mut self) -> bool {
        let stop = self.data.lock().unwrap().temp_log_stop.take();
        if let Some(stop) = stop {
            let _ = stop.send(true);
        }
        self.context.schedule.complete_background().await;
        self.context.mark_completed();
        self.context.schedule.sink().complete_cycle();
        true
    }
}

fn temperature_log_path(context: &Context) -> Option<PathBuf> {
    let data_file = context.schedule.sink().data_file_name()?;
    let dir = data_file.parent().map(PathBuf::from).unwrap_or_default();
    let task_name = context
        .task_name
        .as_deref()
        .map(str::to_string)
        .unwrap_or_else(|| format!("Task_{}", context.task_index + 1));
    let safe_name: String = task_name
        .chars()
        .map(|c| match c {
            '/' | '\\' => '-',
            c => c,
        })
        .filter(|c| *c != ' ')
        .collect();
    let timestamp = chrono::Local::now().format("%Y-%m-%d-%H%M%S");
    Some(dir.join(format!("temps_{timestamp}_{safe_name}.csv")))
}

fn start_temperature_log(context: &Context, data: &CycleHandle) {
    let Some(path) = temperature_log_path(context) else {
        log::warn!("No output file set; skipping temperature logging");
        return;
    };
    let (stop_tx, stop_rx) = watch::channel(false);
    data.lock().unwrap().temp_log_stop = Some(stop_tx);
    let interface = context.interface.clone();
    context
        .schedule
        .start_background(log_temperatures(interface, stop_rx, path));
}

async fn log_temperatures(
    interface: Arc<dyn Interface>,
    mut stop: watch::Receiver<bool>,
    path: PathBuf,
) {
    use std::io::Write;

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path);
    let mut file = match file {
        Ok(file) => file,
        Err(err) => {
            log::warn!("Temperature log failed to open: {err}");
            return;
        }
    };
    match file.metadata() {
        Ok(meta) if meta.len() == 0 => {
            let _ = file.write_all(b"datetime,therm0,therm1\n");
        }
        _ => {}
    }

    let mut therm1_enabled = true;
    loop {
        let therm0 = interface.get_thermocouple_temperature(0).await;
        let therm1 = if therm1_enabled {
            let reading = interface.get_thermocouple_temperature(1).await;
            if reading.is_none() {
                therm1_enabled = false;
                log::warn!("Therm1 read failed; disabling Therm1 logging");
            }
            reading
        } else {
            None
        };

        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let therm0_text = therm0.map_or_else(|| "NA".to_string(), |t| format!("{t:.3}"));
        let therm1_text = therm1.map_or_else(|| "NA".to_string(), |t| format!("{t:.3}"));
        if let Err(err) = writeln!(file, "{stamp},{therm0_text},{therm1_text}") {
            log::warn!("Temperature log write failed: {err}");
            return;
        }
        let _ = file.flush();

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return;
                }
            }
        }
    }
}

/// Create the cycle record for a cycle starting at `context.origin`.
pub(crate) fn new_cycle_data(context: &Context, sample_type: &str) -> CycleHandle {
    Arc::new(Mutex::new(SampleData {
        sample_number: Some((context.origin / CYCLE_SECONDS) as u32 + 1),
        sample_type: Some(sample_type.to_string()),
        ..SampleData::default()
    }))
}

/// The base sample choreography shared by every inlet variant.
///
/// For origin `O`, the sample valve opens at `P = O + SAMPLE_OPEN_AT` and
/// closes at `Q = P + SAMPLE_SECONDS`; injection and trap cleanup follow Q.
/// Cycles after the first also get a preparation window at negative offsets
/// that precools and prepositions the hardware.
pub(crate) fn base_cycle(context: &Context, data: &CycleHandle) -> Vec<Box<dyn Runnable>> {
    let o = context.origin;
    let p = o + SAMPLE_OPEN_AT;
    let q = p + SAMPLE_SECONDS;

    let abort_after_injection = AbortPoint::new(context, q + 8.0);
    let injection_abort = abort_after_injection.handle();

    let handle = data.clone();
    let record_start: PressureRecorder = Arc::new(move |mean, stddev, series| {
        handle.lock().unwrap().record_pressure_start(mean, stddev, series);
    });
    let handle = data.clone();
    let record_end: PressureRecorder = Arc::new(move |mean, stddev, series| {
        handle.lock().unwrap().record_pressure_end(mean, stddev, series);
    });
    let handle = data.clone();
    let record_last: FlowRecorder = Arc::new(move |flow, control| {
        handle.lock().unwrap().record_last_flow(flow, control);
    });
    let handle = data.clone();
    let cryo_retry: CoolingRetry = Arc::new(move || {
        handle.lock().unwrap().cryo_extended();
    });

    let mut run: Vec<Box<dyn Runnable>> = vec![
        Box::new(CycleBegin::new(context, o, data)),
        Box::new(EnableCryogen::new(context, o + 1.0)),
        Box::new(VacuumOn::new(context, o + 120.0)),
        Box::new(MeasurePressure::new(context, p - 8.0, 7.0, record_start)),
        Box::new(LogFlow::new(context, p - 1.0)),
        Box::new(SampleOpen::new(context, p)),
        Box::new(EnableGcCryogen::new(context, q - 240.0)),
        Box::new(PreColumnIn::new(context, q - 120.0)),
        Box::new(WaitForOvenCool::new(
            context,
            q - 15.0,
            cryo_retry,
            injection_abort.clone(),
        )),
        Box::new(DisableCryogen::new(context, q - 5.0)),
        Box::new(RecordLastFlow::new(context, q - 2.0, record_last)),
        Box::new(SampleClose::new(context, q)),
        Box::new(GcReady::new(context, q + 1.0)),
        Box::new(InjectSwitch::new(context, q + 1.0)),
        Box::new(GcSample::new(context, q + 2.0)),
        Box::new(CryoHeaterOn::new(context, q + 2.0)),
        Box::new(StaticFlow::new(context, q + 2.0, 3.0)),
        Box::new(HighPressureOff::new(context, q + 3.0)),
        Box::new(OverflowOff::new(context, q + 3.0)),
        Box::new(MeasurePressure::new(context, q + 4.0, 16.0, record_end)),
        Box::new(abort_after_injection),
        Box::new(LoadSwitch::new(context, q + 57.0)),
        Box::new(VacuumOff::new(context, q + 59.0)),
        Box::new(CheckSampleTemperature::new(context, q + 69.0)),
        Box::new(PreColumnOut::new(context, q + 150.0)),
        Box::new(DisableGcCryogen::new(context, q + 360.0)),
        Box::new(CycleEnd::new(context, o + CYCLE_SECONDS, data)),
    ];

    if o > 0.0 {
        run.push(Box::new(CryoHeaterOff::new(context, o - 300.0)));
        run.push(Box::new(OverflowOff::new(context, o - 435.0)));
        run.push(Box::new(ZeroFlow::new(context, o - 230.0)));
        run.push(Box::new(EnableCryogen::new(context, o - 100.0)));
        run.push(Box::new(OverflowOn::new(context, o - 50.0)));
    }

    run
}
