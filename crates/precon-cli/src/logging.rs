//! Log routing: console via env_logger plus INFO-and-up records appended to
//! the active output log file.

use std::sync::Arc;

use log::{Level, LevelFilter, Log, Metadata, Record};
use precon_core::OutputSink;

struct FanoutLogger {
    console: env_logger::Logger,
    sink: Arc<OutputSink>,
}

impl Log for FanoutLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.console.enabled(metadata) || metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        self.console.log(record);
        if record.level() <= Level::Info {
            let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
            self.sink.log_message(&format!("{stamp}: {}", record.args()));
        }
    }

    fn flush(&self) {
        self.console.flush();
    }
}

/// Install the combined logger. `debug` raises the console level.
pub fn init(debug: bool, sink: Arc<OutputSink>) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let console = env_logger::Builder::new().filter_level(level).build();
    log::set_max_level(level);
    if log::set_boxed_logger(Box::new(FanoutLogger { console, sink })).is_err() {
        eprintln!("logger already installed");
    }
}
