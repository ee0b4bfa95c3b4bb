//! Chamber pressure reporter driver.
//!
//! The reporter answers a `p` command with a line like `742.13 T`; the first
//! field is the pressure in torr.

use std::io::{Read, Write};
use std::sync::mpsc;
use std::time::Duration;

use tokio::sync::oneshot;

use super::{HwError, open_port, read_line, write_command};

const BAUD: u32 = 9600;
const TIMEOUT: Duration = Duration::from_secs(2);

enum Request {
    Read(oneshot::Sender<Result<f64, HwError>>),
}

/// Async facade over the pressure reporter's serial port.
pub struct PressureSensor {
    requests: mpsc::Sender<Request>,
}

impl PressureSensor {
    /// Open the reporter on the given port and start its worker thread.
    /// Fails when nothing answering like a pressure reporter is attached.
    pub fn open(path: &str) -> Result<Self, HwError> {
        let mut port = open_port(path, BAUD, TIMEOUT)?;
        if !is_on_port(&mut *port) {
            return Err(HwError::Protocol(format!("no pressure reporter on {path}")));
        }
        let (requests, worker) = mpsc::channel();
        std::thread::Builder::new()
            .name("pressure".to_string())
            .spawn(move || run_worker(port, worker))
            .map_err(HwError::Io)?;
        log::debug!("Opened pressure reporter on {path}");
        Ok(PressureSensor { requests })
    }

    /// Read the current pressure in torr.
    pub async fn read(&self) -> Result<f64, HwError> {
        let (reply, result) = oneshot::channel();
        self.requests
            .send(Request::Read(reply))
            .map_err(|_| HwError::Disconnected)?;
        result.await.map_err(|_| HwError::Disconnected)?
    }
}

fn run_worker(mut port: Box<dyn serialport::SerialPort>, requests: mpsc::Receiver<Request>) {
    while let Ok(request) = requests.recv() {
        match request {
            Request::Read(reply) => {
                let _ = reply.send(read_pressure(&mut *port));
            }
        }
    }
}

fn read_pressure<T: Read + Write + ?Sized>(port: &mut T) -> Result<f64, HwError> {
    write_command(port, "p")?;
    let line = read_line(port)?;
    parse_pressure(&line)
}

fn parse_pressure(line: &str) -> Result<f64, HwError> {
    line.split_whitespace()
        .next()
        .and_then(|field| field.parse::<f64>().ok())
        .ok_or_else(|| HwError::Protocol(line.to_string()))
}

/// Probe whether a pressure reporter answers on this port: a `p` command must
/// come back with a plausible torr reading.
pub(crate) fn is_on_port<T: Read + Write + ?Sized>(port: &mut T) -> bool {
    match read_pressure(port) {
        Ok(value) => value > -0.1 && value < 1500.0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::ScriptedPort;
    use super::*;

    #[test]
    fn reads_first_field_as_torr() {
        let mut port = ScriptedPort::new();
        port.respond("742.13 T\r\n");
        assert_eq!(read_pressure(&mut port).unwrap(), 742.13);
        assert_eq!(port.written_text(), "p\r");
    }

    #[test]
    fn rejects_garbage() {
        let mut port = ScriptedPort::new();
        port.respond("???\r\n");
        assert!(read_pressure(&mut port).is_err());
    }

    #[test]
    fn probe_rejects_out_of_range() {
        let mut port = ScriptedPort::new();
        port.respond("99999.0 T\r\n");
        assert!(!is_on_port(&mut port));
    }
}
