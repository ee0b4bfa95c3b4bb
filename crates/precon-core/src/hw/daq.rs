//! Multifunction DAQ front-end driver.
//!
//! The DAQ carries every analog channel (pressure transducer spare, oven
//! signal, flow signal, flow-control output) and the bank of digital valve
//! lines. The wire protocol is line-oriented: `AINn` reads an analog input,
//! `DACn v` sets an analog output, `DIO name state` drives a digital line.

use std::io::{Read, Write};
use std::sync::mpsc;
use std::time::Duration;

use tokio::sync::oneshot;

use super::{HwError, open_port, read_line, write_command};

const BAUD: u32 = 115_200;
const TIMEOUT: Duration = Duration::from_secs(2);

enum Request {
    ReadAnalog(u8, oneshot::Sender<Result<f64, HwError>>),
    WriteAnalog(u8, f64, oneshot::Sender<Result<(), HwError>>),
    WriteDigital(&'static str, bool, oneshot::Sender<Result<(), HwError>>),
}

/// Async facade over the DAQ serial port.
pub struct Daq {
    requests: mpsc::Sender<Request>,
}

impl Daq {
    /// Open the DAQ on the given port and start its worker thread.
    pub fn open(path: &str) -> Result<Self, HwError> {
        let port = open_port(path, BAUD, TIMEOUT)?;
        let (requests, worker) = mpsc::channel();
        std::thread::Builder::new()
            .name("daq".to_string())
            .spawn(move || run_worker(port, worker))
            .map_err(HwError::Io)?;
        log::debug!("Opened DAQ on {path}");
        Ok(Daq { requests })
    }

    /// Read one analog input channel.
    pub async fn read_analog(&self, channel: u8) -> Result<f64, HwError> {
        let (reply, result) = oneshot::channel();
        self.requests
            .send(Request::ReadAnalog(channel, reply))
            .map_err(|_| HwError::Disconnected)?;
        result.await.map_err(|_| HwError::Disconnected)?
    }

    /// Set one analog output channel.
    pub async fn write_analog(&self, channel: u8, value: f64) -> Result<(), HwError> {
        let (reply, result) = oneshot::channel();
        self.requests
            .send(Request::WriteAnalog(channel, value, reply))
            .map_err(|_| HwError::Disconnected)?;
        result.await.map_err(|_| HwError::Disconnected)?
    }

    /// Drive one digital line.
    pub async fn write_digital(&self, line: &'static str, state: bool) -> Result<(), HwError> {
        let (reply, result) = oneshot::channel();
        self.requests
            .send(Request::WriteDigital(line, state, reply))
            .map_err(|_| HwError::Disconnected)?;
        result.await.map_err(|_| HwError::Disconnected)?
    }
}

fn run_worker(mut port: Box<dyn serialport::SerialPort>, requests: mpsc::Receiver<Request>) {
    while let Ok(request) = requests.recv() {
        match request {
            Request::ReadAnalog(channel, reply) => {
                let result = read_analog(&mut *port, channel);
                if let Ok(value) = &result {
                    log::debug!("Read DAQ analog channel {channel}: {value:.4}");
                }
                let _ = reply.send(result);
            }
            Request::WriteAnalog(channel, value, reply) => {
                log::debug!("Write DAQ analog channel {channel}: {value:.2}");
                let _ = reply.send(write_analog(&mut *port, channel, value));
            }
            Request::WriteDigital(line, state, reply) => {
                log::debug!(
                    "Write DAQ digital line {line}: {}",
                    if state { "HIGH" } else { "LOW" }
                );
                let _ = reply.send(write_digital(&mut *port, line, state));
            }
        }
    }
}

fn read_analog<T: Read + Write + ?Sized>(port: &mut T, channel: u8) -> Result<f64, HwError> {
    write_command(port, &format!("AIN{channel}"))?;
    let line = read_line(port)?;
    line.trim()
        .parse::<f64>()
        .map_err(|_| HwError::Protocol(line))
}

fn write_analog<T: Read + Write + ?Sized>(
    port: &mut T,
    channel: u8,
    value: f64,
) -> Result<(), HwError> {
    write_command(port, &format!("DAC{channel} {value:.3}"))?;
    expect_ok(port)
}

fn write_digital<T: Read + Write + ?Sized>(
    port: &mut T,
    line: &str,
    state: bool,
) -> Result<(), HwError> {
    write_command(port, &format!("DIO {line} {}", u8::from(state)))?;
    expect_ok(port)
}

fn expect_ok<T: Read + Write + ?Sized>(port: &mut T) -> Result<(), HwError> {
    let line = read_line(port)?;
    if line.trim() == "OK" {
        Ok(())
    } else {
        Err(HwError::Protocol(line))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::ScriptedPort;
    use super::*;

    #[test]
    fn analog_read_parses_float() {
        let mut port = ScriptedPort::new();
        port.respond("2.6312\r\n");
        assert_eq!(read_analog(&mut port, 12).unwrap(), 2.6312);
        assert_eq!(port.written_text(), "AIN12\r");
    }

    #[test]
    fn digital_write_checks_acknowledgement() {
        let mut port = ScriptedPort::new();
        port.respond("OK\r\n");
        write_digital(&mut port, "CIO1", true).unwrap();
        assert_eq!(port.written_text(), "DIO CIO1 1\r");

        let mut port = ScriptedPort::new();
        port.respond("ERR\r\n");
        assert!(write_digital(&mut port, "CIO1", false).is_err());
    }

    #[test]
    fn analog_write_formats_three_decimals() {
        let mut port = ScriptedPort::new();
        port.respond("OK\r\n");
        write_analog(&mut port, 1, 2.6).unwrap();
        assert_eq!(port.written_text(), "DAC1 2.600\r");
    }
}
