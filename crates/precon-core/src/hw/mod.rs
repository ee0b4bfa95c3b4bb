//! Hardware capability surface and device drivers.
//!
//! [`Interface`] is the polymorphic surface the schedule engine drives.
//! Readings return `None` when the hardware declined to answer; callers treat
//! that as "skip this update". Actuations log failures and return. The PFP
//! operations are the one place a protocol fault surfaces as an error, which
//! cycle logic converts into an abort.
//!
//! Every serial-backed driver owns its port on a dedicated thread and exposes
//! an async facade: requests are marshalled over an mpsc channel and the
//! caller awaits a oneshot reply. The interface itself is not thread-safe in
//! the locking sense; callers are cooperative consumers on one executor.

pub mod daq;
pub mod instrument;
pub mod pfp;
pub mod pressure;
pub mod sim;
pub mod ssv;

use std::io::{Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Failures raised by the device drivers.
#[derive(Debug, Error)]
pub enum HwError {
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed response: {0:?}")]
    Protocol(String),
    #[error("failed to reach UNLOAD prompt")]
    UnloadPrompt,
    #[error("device worker is gone")]
    Disconnected,
}

/// The abstract interface to the instrument.
///
/// All operations are asynchronous; serial-backed implementations suspend
/// while their driver thread talks to the device.
#[async_trait]
pub trait Interface: Send + Sync {
    // --- readings ---

    /// Chamber pressure in torr.
    async fn get_pressure(&self) -> Option<f64>;

    /// PFP manifold pressure; `ssv` selects the package, defaulting to the
    /// currently selected position.
    async fn get_pfp_pressure(&self, ssv: Option<u8>) -> Option<f64>;

    /// Last PFP pressure reading without touching the serial line.
    async fn get_display_pfp_pressure(&self) -> Option<f64>;

    /// Sample flow signal (zero-offset corrected).
    async fn get_flow_signal(&self) -> Option<f64>;

    /// Present flow-control output voltage.
    async fn get_flow_control_output(&self) -> Option<f64>;

    /// Oven temperature signal (volts, not calibrated).
    async fn get_oven_temperature_signal(&self) -> Option<f64>;

    /// Thermocouple temperature for channel `index`.
    async fn get_thermocouple_temperature(&self, index: usize) -> Option<f64>;

    /// Current stream selection valve position.
    async fn get_ssv_position(&self) -> Option<u8>;

    // --- actuations ---

    async fn set_cryogen(&self, enable: bool);
    async fn set_gc_cryogen(&self, enable: bool);
    async fn set_vacuum(&self, enable: bool);
    async fn set_sample(&self, enable: bool);
    async fn set_cryo_heater(&self, enable: bool);
    async fn set_overflow(&self, enable: bool);

    /// Evacuation valve for the currently selected SSV position; a position
    /// without a mapped valve is a no-op.
    async fn set_evacuation_valve(&self, enable: bool);

    /// High-pressure valve for the currently selected SSV position; a
    /// position without a mapped valve is a no-op.
    async fn set_high_pressure_valve(&self, enable: bool);

    /// Set the flow target directly. The control voltage is clamped to the
    /// safe output range.
    async fn set_flow(&self, flow: f64);

    /// Open or close one PFP flask valve. Returns the device's response
    /// message; fails fast when the PFP prompt is unreachable.
    async fn set_pfp_valve(&self, ssv: Option<u8>, valve: u8, open: bool) -> Result<String, HwError>;

    // --- pulses ---

    async fn valve_load(&self);
    async fn valve_inject(&self);
    async fn precolumn_in(&self);
    async fn precolumn_out(&self);

    // --- procedures ---

    /// Change the stream selection valve, polling until convergence or
    /// timeout. May take tens of seconds. Manual moves also close the
    /// high-pressure valves and leave the selected one open at full flow.
    async fn set_ssv(&self, index: u8, manual: bool);

    /// One closed-loop ratchet of the flow-control voltage toward `flow`.
    async fn adjust_flow(&self, flow: f64);

    /// Single-step nudge of the flow-control voltage; `multiplier` sets the
    /// direction and magnitude.
    async fn increment_flow(&self, flow: f64, multiplier: f64);

    /// Prepare the GC/MS trigger line.
    async fn ready_gcms(&self);

    /// Fire the GC/MS trigger.
    async fn trigger_gcms(&self);

    /// Put the instrument into its known startup state.
    async fn initialization(&self);

    /// Put the instrument into a safe idle state.
    async fn shutdown(&self);

    // --- flow zero calibration ---

    /// Offset added to the raw flow signal.
    fn flow_zero_offset(&self) -> f64;

    /// Install a new flow zero offset.
    fn set_flow_zero_offset(&self, offset: f64);
}

/// Default serial parameters shared by the instrument's RS-232 devices.
pub(crate) fn open_port(
    path: &str,
    baud: u32,
    timeout: Duration,
) -> Result<Box<dyn serialport::SerialPort>, HwError> {
    let port = serialport::new(path, baud).timeout(timeout).open()?;
    Ok(port)
}

/// Read one CR/LF-terminated line from a device, without the terminator.
///
/// Stops at the first `\n` or `\r`, or when the port's read timeout expires
/// with data already buffered. An empty read with no data is an error.
pub(crate) fn read_line<T: Read + ?Sized>(port: &mut T) -> Result<String, HwError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match port.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                if byte[0] == b'\n' || byte[0] == b'\r' {
                    if line.is_empty() {
                        continue;
                    }
                    break;
                }
                line.push(byte[0]);
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut && !line.is_empty() => break,
            Err(err) => return Err(err.into()),
        }
    }
    if line.is_empty() {
        return Err(HwError::Protocol("empty response".to_string()));
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Write a command terminated with a carriage return.
pub(crate) fn write_command<T: Write + ?Sized>(port: &mut T, command: &str) -> Result<(), HwError> {
    port.write_all(command.as_bytes())?;
    port.write_all(b"\r")?;
    port.flush()?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};

    /// In-memory transport with scripted responses, standing in for a serial
    /// port in driver tests.
    pub struct ScriptedPort {
        pub written: Vec<u8>,
        responses: VecDeque<Vec<u8>>,
        current: VecDeque<u8>,
    }

    impl ScriptedPort {
        pub fn new() -> Self {
            ScriptedPort {
                written: Vec::new(),
                responses: VecDeque::new(),
                current: VecDeque::new(),
            }
        }

        /// Queue a response returned for the next read sequence.
        pub fn respond(&mut self, response: &str) -> &mut Self {
            self.responses.push_back(response.as_bytes().to_vec());
            self
        }

        pub fn written_text(&self) -> String {
            String::from_utf8_lossy(&self.written).into_owned()
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.current.is_empty() {
                match self.responses.pop_front() {
                    Some(next) => self.current = next.into(),
                    None => return Err(io::Error::new(io::ErrorKind::TimedOut, "no response")),
                }
            }
            let mut n = 0;
            while n < buf.len() {
                match self.current.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }
    }

    impl Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
