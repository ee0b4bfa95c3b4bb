//! Cycle data sink: the log file / data file pair and the active cycle
//! record.
//!
//! The sink owns the output destinations for the whole process. File handles
//! are opened per write in append mode (tolerating concurrent external
//! access) and writes are serialized by the sink's mutex. The data file
//! header is written exactly once per file, checked by file length.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// One row of the tab-delimited data file.
const DATA_HEADER: [&str; 22] = [
    "Filename",
    "Date",
    "Time",
    "Sample#",
    "SSVPos",
    "SampType",
    "NetPressure",
    "InitP",
    "FinalP",
    "InitP_RSD",
    "FinalP_RSD",
    "LowFlow?",
    "cryocount",
    "loflocount",
    "LastFlow",
    "LastVFlow",
    "pfpFlask",
    "pfpOPEN",
    "pfpCLOSE",
    "PRESS#1",
    "PRESS#2",
    "PRESS#3",
];

/// A per-cycle record the sink can flush or abort.
pub trait CycleRecord: Send {
    /// Compose and emit the cycle's data row and log block.
    fn finish(&mut self, sink: &OutputSink);

    /// Emit the data row and the abort banner.
    fn abort(&mut self, sink: &OutputSink, message: Option<&str>);
}

/// Shared handle to the cycle record being filled in by cycle runnables.
pub type CycleHandle = Arc<Mutex<SampleData>>;

#[derive(Default)]
struct SinkState {
    log_file: Option<PathBuf>,
    data_file: Option<PathBuf>,
    active: Option<Arc<Mutex<dyn CycleRecord>>>,
}

/// The process's output destinations plus the active cycle record.
#[derive(Default)]
pub struct OutputSink {
    state: Mutex<SinkState>,
}

impl OutputSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the output pair from a base path: `<base>.txt` for the log,
    /// `<base>.xl` for the data file. An empty base clears both.
    pub fn set_output_name(&self, base: &str) {
        let mut state = self.state.lock().unwrap();
        if base.is_empty() {
            state.log_file = None;
            state.data_file = None;
            return;
        }
        state.log_file = Some(PathBuf::from(format!("{base}.txt")));
        state.data_file = Some(PathBuf::from(format!("{base}.xl")));
    }

    /// Current data file path, if outputs are configured.
    pub fn data_file_name(&self) -> Option<PathBuf> {
        self.state.lock().unwrap().data_file.clone()
    }

    /// Current log file path, if outputs are configured.
    pub fn log_file_name(&self) -> Option<PathBuf> {
        self.state.lock().unwrap().log_file.clone()
    }

    /// Append one line to the log file.
    pub fn log_message(&self, line: &str) {
        let state = self.state.lock().unwrap();
        let Some(path) = &state.log_file else { return };
        if let Err(err) = append_line(path, line) {
            log::warn!("Log file write failed: {err}");
        }
    }

    /// Append one row to the data file.
    pub fn write_record(&self, line: &str) {
        let state = self.state.lock().unwrap();
        let Some(path) = &state.data_file else { return };
        if let Err(err) = append_line(path, line) {
            log::warn!("Data file write failed: {err}");
        }
    }

    /// Write the column header, only if the data file is empty.
    pub fn write_header_once(&self) {
        let state = self.state.lock().unwrap();
        let Some(path) = &state.data_file else { return };
        let result = (|| -> std::io::Result<()> {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            if file.metadata()?.len() != 0 {
                return Ok(());
            }
            file.write_all(DATA_HEADER.join("\t").as_bytes())?;
            file.write_all(b"\n")?;
            Ok(())
        })();
        if let Err(err) = result {
            log::warn!("Data file header write failed: {err}");
        }
    }

    /// Install the active cycle record.
    pub fn begin_cycle(&self, record: Arc<Mutex<dyn CycleRecord>>) {
        self.state.lock().unwrap().active = Some(record);
    }

    /// Detach the active cycle record and flush it.
    pub fn complete_cycle(&self) {
        let record = self.state.lock().unwrap().active.take();
        if let Some(record) = record {
            record.lock().unwrap().finish(self);
        }
    }

    /// Detach the active cycle record and flush it with an abort banner.
    pub fn abort_cycle(&self, message: Option<&str>) {
        let record = self.state.lock().unwrap().active.take();
        if let Some(record) = record {
            record.lock().unwrap().abort(self, message);
        }
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(value) => format!("{value:.precision$}"),
        None => "NONE".to_string(),
    }
}

fn fmt_opt_sci(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{value:.2e}"),
        None => "NONE".to_string(),
    }
}

/// One sample cycle's measurements.
///
/// Created by the cycle's first runnable, mutated through injected callbacks
/// while the cycle runs, and flushed by the cycle's last runnable (or by the
/// engine's abort path).
#[derive(Default)]
pub struct SampleData {
    pub sample_number: Option<u32>,
    pub sample_type: Option<String>,
    pub ssv_pos: Option<u8>,
    pub pfp_index: Option<u8>,

    pub mean1: Option<f64>,
    pub stddev1: Option<f64>,
    pub series1: Option<Vec<f64>>,

    pub mean2: Option<f64>,
    pub stddev2: Option<f64>,
    pub series2: Option<Vec<f64>>,

    pub low_flow: bool,
    pub low_flow_count: u32,
    pub cryo_extra_count: u32,

    pub last_flow: Option<f64>,
    pub last_flow_control: Option<f64>,

    pub pfp_open: Option<String>,
    pub pfp_close: Option<String>,
    pub pfp_pressures: [Option<f64>; 3],

    /// Stop signal for the background temperature logger.
    pub temp_log_stop: Option<watch::Sender<bool>>,
}

impl SampleData {
    pub fn record_pressure_start(&mut self, mean: f64, stddev: f64, series: Vec<f64>) {
        self.mean1 = Some(mean);
        self.stddev1 = Some(stddev);
        self.series1 = Some(series);
    }

    pub fn record_pressure_end(&mut self, mean: f64, stddev: f64, series: Vec<f64>) {
        self.mean2 = Some(mean);
        self.stddev2 = Some(stddev);
        self.series2 = Some(series);
    }

    pub fn record_last_flow(&mut self, flow: Option<f64>, control: Option<f64>) {
        self.last_flow = flow;
        self.last_flow_control = control;
    }

    pub fn cryo_extended(&mut self) {
        self.cryo_extra_count += 1;
    }

    pub fn low_flow_strike(&mut self) {
        self.low_flow_count += 1;
    }

    pub fn mark_low_flow(&mut self) {
        self.low_flow = true;
    }

    pub fn record_pfp_open(&mut self, response: String) {
        self.pfp_open = Some(response);
    }

    pub fn record_pfp_close(&mut self, response: String) {
        self.pfp_close = Some(response);
    }

    pub fn record_pfp_pressure(&mut self, slot: usize, pressure: f64) {
        if let Some(entry) = self.pfp_pressures.get_mut(slot) {
            *entry = Some(pressure);
        }
    }

    fn net_pressure(&self) -> Option<f64> {
        Some(self.mean2? - self.mean1?)
    }

    fn rsd(mean: Option<f64>, stddev: Option<f64>) -> Option<f64> {
        let mean = mean?;
        if mean == 0.0 {
            return None;
        }
        Some(stddev.unwrap_or_default() / mean)
    }

    /// The columns after `Sample#`, formatted per the data file contract.
    fn record_fields(&self) -> Vec<String> {
        vec![
            self.ssv_pos
                .map_or_else(|| "NONE".to_string(), |v| v.to_string()),
            self.sample_type.clone().unwrap_or_else(|| "NONE".to_string()),
            fmt_opt(self.net_pressure(), 3),
            fmt_opt(self.mean1, 3),
            fmt_opt(self.mean2, 3),
            fmt_opt_sci(Self::rsd(self.mean1, self.stddev1)),
            fmt_opt_sci(Self::rsd(self.mean2, self.stddev2)),
            if self.low_flow { "Y" } else { "N" }.to_string(),
            self.cryo_extra_count.to_string(),
            self.low_flow_count.to_string(),
            fmt_opt(self.last_flow, 3),
            fmt_opt(self.last_flow_control, 3),
            self.pfp_index
                .map_or_else(|| "NONE".to_string(), |v| v.to_string()),
            self.pfp_open.clone().unwrap_or_else(|| "NONE".to_string()),
            self.pfp_close.clone().unwrap_or_else(|| "NONE".to_string()),
            fmt_opt(self.pfp_pressures[0], 2),
            fmt_opt(self.pfp_pressures[1], 2),
            fmt_opt(self.pfp_pressures[2], 2),
        ]
    }

    fn log_fields(sink: &OutputSink, fields: &[String]) {
        sink.log_message(&fields.join(","));
    }

    fn write_row(&self, sink: &OutputSink) {
        sink.write_header_once();

        let now = chrono::Local::now();
        let filename = sink
            .data_file_name()
            .map_or_else(|| "NONE".to_string(), |p| p.display().to_string());
        let date = now.format("%Y-%m-%d").to_string();
        let time = now.format("%H:%M:%S").to_string();
        let sample = self
            .sample_number
            .map_or_else(|| "NONE".to_string(), |v| v.to_string());

        let mut fields = vec![filename.clone(), date.clone(), time.clone(), sample.clone()];
        fields.extend(self.record_fields());
        sink.write_record(&fields.join("\t"));

        sink.log_message("-------------------------------------------------------------");
        Self::log_fields(sink, &[
            "date".to_string(),
            "time".to_string(),
            "filename".to_string(),
            "sample#".to_string(),
        ]);
        Self::log_fields(sink, &[date, time, filename, sample]);
        sink.log_message("");

        Self::log_fields(sink, &[
            "data (torr)".to_string(),
            "mean".to_string(),
            "std dev".to_string(),
            "net change".to_string(),
        ]);
        if let Some(series) = &self.series1 {
            let values: Vec<String> = series.iter().map(|v| format!("{v:.3}")).collect();
            Self::log_fields(sink, &values);
        }
        Self::log_fields(sink, &[
            "XXXXXXXXX".to_string(),
            fmt_opt(self.mean1, 3),
            fmt_opt(self.stddev1, 3),
        ]);

        if let Some(series) = &self.series2 {
            let values: Vec<String> = series.iter().map(|v| format!("{v:.3}")).collect();
            Self::log_fields(sink, &values);
        }
        Self::log_fields(sink, &[
            "XXXXXXXXX".to_string(),
            fmt_opt(self.mean2, 3),
            fmt_opt(self.stddev2, 3),
            fmt_opt(self.net_pressure(), 3),
        ]);
        sink.log_message("");
    }
}

impl CycleRecord for SampleData {
    fn finish(&mut self, sink: &OutputSink) {
        self.write_row(sink);
    }

    fn abort(&mut self, sink: &OutputSink, message: Option<&str>) {
        self.write_row(sink);
        match message {
            Some(message) => sink.log_message(&format!("SAMPLING ABORTED: {message}")),
            None => sink.log_message("SAMPLING ABORTED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink_in(dir: &tempfile::TempDir) -> (OutputSink, String) {
        let base = dir.path().join("run1").display().to_string();
        let sink = OutputSink::new();
        sink.set_output_name(&base);
        (sink, base)
    }

    #[test]
    fn output_name_derives_file_pair() {
        let sink = OutputSink::new();
        sink.set_output_name("out/run7");
        assert_eq!(sink.log_file_name(), Some(PathBuf::from("out/run7.txt")));
        assert_eq!(sink.data_file_name(), Some(PathBuf::from("out/run7.xl")));

        // Setting the same name twice produces identical destinations.
        let log = sink.log_file_name();
        sink.set_output_name("out/run7");
        assert_eq!(sink.log_file_name(), log);

        sink.set_output_name("");
        assert_eq!(sink.log_file_name(), None);
        assert_eq!(sink.data_file_name(), None);
    }

    #[test]
    fn header_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, base) = sink_in(&dir);
        sink.write_header_once();
        sink.write_header_once();
        sink.write_record("row");
        let content = std::fs::read_to_string(format!("{base}.xl")).unwrap();
        assert_eq!(content.matches("Filename\tDate").count(), 1);
        assert!(content.ends_with("row\n"));
    }

    #[test]
    fn unmeasured_fields_render_as_none() {
        let data = SampleData::default();
        let fields = data.record_fields();
        assert_eq!(fields[0], "NONE"); // SSVPos
        assert_eq!(fields[2], "NONE"); // NetPressure
        assert_eq!(fields[7], "N"); // LowFlow?
        assert_eq!(fields[8], "0"); // cryocount
        assert_eq!(fields[15], "NONE"); // PRESS#1
    }

    #[test]
    fn measured_fields_use_fixed_precision() {
        let mut data = SampleData::default();
        data.ssv_pos = Some(9);
        data.sample_type = Some("zero".to_string());
        data.record_pressure_start(740.0, 0.37, vec![739.7, 740.3]);
        data.record_pressure_end(745.5, 0.5, vec![745.0, 746.0]);
        data.record_last_flow(Some(7.1919), Some(2.96));
        let fields = data.record_fields();
        assert_eq!(fields[2], "5.500");
        assert_eq!(fields[3], "740.000");
        assert_eq!(fields[5], format!("{:.2e}", 0.37 / 740.0));
        assert_eq!(fields[10], "7.192");
    }

    #[test]
    fn completed_cycle_writes_row_and_log_block() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, base) = sink_in(&dir);

        let data = Arc::new(Mutex::new(SampleData {
            sample_number: Some(1),
            sample_type: Some("flask".to_string()),
            ssv_pos: Some(3),
            ..SampleData::default()
        }));
        data.lock().unwrap().record_pressure_start(740.0, 0.3, vec![740.0]);

        sink.begin_cycle(data);
        sink.complete_cycle();

        let rows = std::fs::read_to_string(format!("{base}.xl")).unwrap();
        let mut lines = rows.lines();
        assert!(lines.next().unwrap().starts_with("Filename\t"));
        let row = lines.next().unwrap();
        assert!(row.contains("\tflask\t"));
        assert!(row.ends_with("NONE\tNONE\tNONE\tNONE\tNONE\tNONE"));

        let log = std::fs::read_to_string(format!("{base}.txt")).unwrap();
        assert!(log.contains("date,time,filename,sample#"));
        assert!(log.contains("740.000"));
        assert!(!log.contains("SAMPLING ABORTED"));
    }

    #[test]
    fn aborted_cycle_writes_banner() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, base) = sink_in(&dir);
        sink.begin_cycle(Arc::new(Mutex::new(SampleData::default())));
        sink.abort_cycle(Some("Oven failed to cool"));
        let log = std::fs::read_to_string(format!("{base}.txt")).unwrap();
        assert!(log.contains("SAMPLING ABORTED: Oven failed to cool"));

        // Aborting with no active cycle is a no-op.
        sink.abort_cycle(None);
    }

    #[test]
    fn writes_without_configured_output_are_dropped() {
        let sink = OutputSink::new();
        sink.log_message("nowhere");
        sink.write_record("nowhere");
        sink.write_header_once();
        assert_eq!(sink.data_file_name(), None);
    }
}
