//! Programmable flask package (PFP) driver.
//!
//! The PFP firmware is menu-driven. Every operation must start from the
//! `UNLOAD>` prompt; depending on where the firmware last was, reaching it
//! takes up to five `Q` retreats to the top-level `AS>` prompt followed by a
//! single `U`. Commands from `UNLOAD>`: `P` reads the manifold pressure,
//! `O`/`C` followed by a valve number open or close one flask valve.

use std::io::{Read, Write};
use std::sync::mpsc;
use std::time::Duration;

use tokio::sync::oneshot;

use super::{HwError, open_port, read_line, write_command};

const BAUD: u32 = 9600;
const TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum `Q` retreats while hunting for the `AS>` prompt.
const MAX_RETREATS: u8 = 5;

enum Request {
    ReadPressure(oneshot::Sender<Result<f64, HwError>>),
    SetValve(u8, bool, oneshot::Sender<Result<String, HwError>>),
}

/// Async facade over one PFP manifold's serial port.
pub struct Pfp {
    requests: mpsc::Sender<Request>,
}

impl Pfp {
    /// Open the PFP on the given port and start its worker thread.
    ///
    /// Fails when the UNLOAD prompt cannot be reached, so a dead or absent
    /// package is detected at startup rather than mid-cycle.
    pub fn open(path: &str) -> Result<Self, HwError> {
        let mut port = open_port(path, BAUD, TIMEOUT)?;
        reach_unload_prompt(&mut *port)?;
        let (requests, worker) = mpsc::channel();
        std::thread::Builder::new()
            .name("pfp".to_string())
            .spawn(move || run_worker(port, worker))
            .map_err(HwError::Io)?;
        log::debug!("Opened PFP on {path}");
        Ok(Pfp { requests })
    }

    /// Read the manifold pressure.
    pub async fn read_pressure(&self) -> Result<f64, HwError> {
        let (reply, result) = oneshot::channel();
        self.requests
            .send(Request::ReadPressure(reply))
            .map_err(|_| HwError::Disconnected)?;
        result.await.map_err(|_| HwError::Disconnected)?
    }

    /// Open one flask valve; returns the firmware's status message.
    pub async fn open_valve(&self, valve: u8) -> Result<String, HwError> {
        self.set_valve(valve, true).await
    }

    /// Close one flask valve; returns the firmware's status message.
    pub async fn close_valve(&self, valve: u8) -> Result<String, HwError> {
        self.set_valve(valve, false).await
    }

    async fn set_valve(&self, valve: u8, open: bool) -> Result<String, HwError> {
        let (reply, result) = oneshot::channel();
        self.requests
            .send(Request::SetValve(valve, open, reply))
            .map_err(|_| HwError::Disconnected)?;
        result.await.map_err(|_| HwError::Disconnected)?
    }
}

fn run_worker(mut port: Box<dyn serialport::SerialPort>, requests: mpsc::Receiver<Request>) {
    while let Ok(request) = requests.recv() {
        match request {
            Request::ReadPressure(reply) => {
                let _ = reply.send(read_pressure(&mut *port));
            }
            Request::SetValve(valve, open, reply) => {
                let _ = reply.send(set_valve(&mut *port, valve, open));
            }
        }
    }
}

/// Where the prompt hunt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PromptState {
    /// Probing with a blank line to see which prompt answers.
    Probe,
    /// Retreating toward the top-level `AS>` prompt; counts `Q`s sent.
    Retreating(u8),
    /// At `AS>`; one `U` away from the goal.
    AtTopLevel,
    /// At `UNLOAD>`.
    AtUnload,
}

/// Drive the firmware to the `UNLOAD>` prompt.
fn reach_unload_prompt<T: Read + Write + ?Sized>(port: &mut T) -> Result<(), HwError> {
    let mut state = PromptState::Probe;
    loop {
        state = match state {
            PromptState::Probe => {
                write_command(port, " ")?;
                match read_line(port) {
                    Ok(line) if line.contains("UNLOAD>") => PromptState::AtUnload,
                    Ok(line) if line.contains("AS>") => PromptState::AtTopLevel,
                    _ => PromptState::Retreating(0),
                }
            }
            PromptState::Retreating(count) => {
                if count >= MAX_RETREATS {
                    return Err(HwError::UnloadPrompt);
                }
                write_command(port, "Q")?;
                write_command(port, " ")?;
                match read_line(port) {
                    Ok(line) if line.contains("UNLOAD>") => PromptState::AtUnload,
                    Ok(line) if line.contains("AS>") => PromptState::AtTopLevel,
                    _ => PromptState::Retreating(count + 1),
                }
            }
            PromptState::AtTopLevel => {
                write_command(port, "U")?;
                match read_line(port) {
                    Ok(line) if line.contains("UNLOAD>") => PromptState::AtUnload,
                    _ => return Err(HwError::UnloadPrompt),
                }
            }
            PromptState::AtUnload => return Ok(()),
        };
    }
}

fn read_pressure<T: Read + Write + ?Sized>(port: &mut T) -> Result<f64, HwError> {
    reach_unload_prompt(port)?;
    write_command(port, "P")?;
    let line = read_line(port)?;
    parse_pressure(&line)
}

fn parse_pressure(line: &str) -> Result<f64, HwError> {
    // Response shape: "P = 1.87 psia"; take the first numeric field.
    line.split_whitespace()
        .find_map(|field| field.parse::<f64>().ok())
        .ok_or_else(|| HwError::Protocol(line.to_string()))
}

fn set_valve<T: Read + Write + ?Sized>(
    port: &mut T,
    valve: u8,
    open: bool,
) -> Result<String, HwError> {
    reach_unload_prompt(port)?;
    write_command(port, if open { "O" } else { "C" })?;
    write_command(port, &valve.to_string())?;
    let line = read_line(port)?;
    Ok(status_message(&line))
}

/// The status tail of a valve response, after the echoed menu text.
fn status_message(line: &str) -> String {
    let tail = line.get(26..).unwrap_or(line);
    tail.trim().to_string()
}
