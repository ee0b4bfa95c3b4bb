//! Command line runner for the precon gas sampler.
//!
//! Loads task-list files, brings the instrument (or its simulator) into a
//! known state, executes the schedule and leaves the hardware idle. Exit
//! code 0 on a completed run, 1 on an aborted schedule, 2 on startup
//! failure.

mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use precon_core::hw::instrument::{Instrument, InstrumentConfig};
use precon_core::hw::sim::SimulatedInstrument;
use precon_core::settings::Settings;
use precon_core::tasks::registry::Registry;
use precon_core::{Execute, Interface, NamedTask, OutputSink};

#[derive(Parser)]
#[command(name = "precon")]
#[command(about = "precon — automated flask/tank gas sampling for a GC/MS")]
#[command(version = precon_core::VERSION)]
struct Cli {
    /// Verbose console logging
    #[arg(long)]
    debug: bool,

    /// Run against the deterministic simulated instrument
    #[arg(long)]
    simulate: bool,

    /// Base path for the output pair (<base>.txt and <base>.xl)
    #[arg(long)]
    output: Option<String>,

    /// Settings file path
    #[arg(long, default_value = "precon-settings.json")]
    settings: PathBuf,

    /// Serial port of the DAQ front-end
    #[arg(long)]
    daq_port: Option<String>,

    /// Serial port of the pressure reporter
    #[arg(long)]
    pressure_port: Option<String>,

    /// Serial port of the stream selection valve
    #[arg(long)]
    ssv_port: Option<String>,

    /// PFP package as SSV:PORT (repeatable), e.g. 1:/dev/ttyUSB3
    #[arg(long, value_parser = parse_pfp_port)]
    pfp_port: Vec<(u8, String)>,

    /// List the registered task names and exit
    #[arg(long)]
    list_tasks: bool,

    /// Task-list files to execute, in order
    task_files: Vec<PathBuf>,
}

fn parse_pfp_port(value: &str) -> Result<(u8, String), String> {
    let (ssv, port) = value
        .split_once(':')
        .ok_or_else(|| format!("expected SSV:PORT, got {value:?}"))?;
    let ssv = ssv
        .parse::<u8>()
        .map_err(|_| format!("invalid SSV position {ssv:?}"))?;
    Ok((ssv, port.to_string()))
}

fn main() {
    let cli = Cli::parse();

    let sink = Arc::new(OutputSink::new());
    logging::init(cli.debug, sink.clone());

    let registry = Registry::standard();
    if cli.list_tasks {
        for name in registry.names() {
            println!("{name}");
        }
        return;
    }

    let mut settings = match Settings::load(&cli.settings) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("Error loading settings: {err}");
            std::process::exit(2);
        }
    };

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| settings.output_name.clone());
    sink.set_output_name(&output);
    settings.output_name = output;

    let task_files = if cli.task_files.is_empty() {
        settings.task_files.clone()
    } else {
        cli.task_files.clone()
    };
    if task_files.is_empty() {
        eprintln!("No task files given (and none remembered in settings)");
        std::process::exit(2);
    }
    settings.task_files = task_files.clone();

    let mut tasks: Vec<NamedTask> = Vec::new();
    for file in &task_files {
        let entries = match registry.load_task_list(file) {
            Ok(entries) => entries,
            Err(err) => {
                eprintln!("Error loading {}: {err}", file.display());
                std::process::exit(2);
            }
        };
        match registry.resolve(&entries) {
            Ok(resolved) => tasks.extend(resolved),
            Err(err) => {
                eprintln!("Error resolving {}: {err}", file.display());
                std::process::exit(2);
            }
        }
    }
    if tasks.is_empty() {
        eprintln!("Task files contained no tasks");
        std::process::exit(2);
    }

    if let Err(err) = settings.save(&cli.settings) {
        log::warn!("Could not save settings: {err}");
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error starting runtime: {err}");
            std::process::exit(2);
        }
    };

    let code = runtime.block_on(run(&cli, sink, tasks));
    std::process::exit(code);
}

fn connect_hardware(cli: &Cli) -> Result<Arc<dyn Interface>, String> {
    let daq_port = cli.daq_port.clone().ok_or("missing required --daq-port")?;
    let pressure_port = cli
        .pressure_port
        .clone()
        .ok_or("missing required --pressure-port")?;
    let ssv_port = cli.ssv_port.clone().ok_or("missing required --ssv-port")?;
    let config = InstrumentConfig {
        daq_port,
        pressure_port,
        ssv_port,
        pfp_ports: cli.pfp_port.clone(),
    };
    let instrument = Instrument::connect(&config).map_err(|err| err.to_string())?;
    if !instrument.has_pfp() {
        log::info!("No PFP package detected");
    }
    Ok(Arc::new(instrument))
}

async fn run(cli: &Cli, sink: Arc<OutputSink>, tasks: Vec<NamedTask>) -> i32 {
    let interface: Arc<dyn Interface> = if cli.simulate {
        log::info!("Running against the simulated instrument");
        Arc::new(SimulatedInstrument::new())
    } else {
        match connect_hardware(cli) {
            Ok(interface) => interface,
            Err(err) => {
                eprintln!("Instrument startup failed: {err}");
                return 2;
            }
        }
    };

    interface.initialization().await;

    let mut execute = Execute::new(tasks, sink);
    let schedule = execute.schedule();

    let interrupt = schedule.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        interrupt.abort(Some("Interrupted by operator"));
    }) {
        log::warn!("Could not install interrupt handler: {err}");
    }

    let completed = execute.execute(interface.clone()).await;
    interface.shutdown().await;

    if completed {
        log::info!("Tasks completed");
        0
    } else {
        match schedule.abort_message() {
            Some(message) => eprintln!("Task execution aborted: {message}"),
            None => eprintln!("Task execution aborted"),
        }
        1
    }
}
