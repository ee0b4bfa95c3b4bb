//! Stream selection valve driver.
//!
//! A rotary 16-position valve. `CP` reports the current position (1-based on
//! the wire, 0-based in this API); `GOn` commands a move.

use std::io::{Read, Write};
use std::sync::mpsc;
use std::time::Duration;

use tokio::sync::oneshot;

use super::{HwError, open_port, read_line, write_command};

const BAUD: u32 = 9600;
const TIMEOUT: Duration = Duration::from_secs(2);

enum Request {
    Read(oneshot::Sender<Result<u8, HwError>>),
    Set(u8, oneshot::Sender<Result<(), HwError>>),
}

/// Async facade over the SSV serial port.
pub struct SsvValve {
    requests: mpsc::Sender<Request>,
}

impl SsvValve {
    /// Open the valve on the given port and start its worker thread. Fails
    /// when nothing answering like an SSV is attached.
    pub fn open(path: &str) -> Result<Self, HwError> {
        let mut port = open_port(path, BAUD, TIMEOUT)?;
        if !is_on_port(&mut *port) {
            return Err(HwError::Protocol(format!("no SSV on {path}")));
        }
        let (requests, worker) = mpsc::channel();
        std::thread::Builder::new()
            .name("ssv".to_string())
            .spawn(move || run_worker(port, worker))
            .map_err(HwError::Io)?;
        log::debug!("Opened SSV on {path}");
        Ok(SsvValve { requests })
    }

    /// Read the current position.
    pub async fn read(&self) -> Result<u8, HwError> {
        let (reply, result) = oneshot::channel();
        self.requests
            .send(Request::Read(reply))
            .map_err(|_| HwError::Disconnected)?;
        result.await.map_err(|_| HwError::Disconnected)?
    }

    /// Command a move to `position`. The valve converges on its own time;
    /// callers poll [`read`](Self::read) for completion.
    pub async fn set(&self, position: u8) -> Result<(), HwError> {
        let (reply, result) = oneshot::channel();
        self.requests
            .send(Request::Set(position, reply))
            .map_err(|_| HwError::Disconnected)?;
        result.await.map_err(|_| HwError::Disconnected)?
    }
}

fn run_worker(mut port: Box<dyn serialport::SerialPort>, requests: mpsc::Receiver<Request>) {
    while let Ok(request) = requests.recv() {
        match request {
            Request::Read(reply) => {
                let _ = reply.send(read_position(&mut *port));
            }
            Request::Set(position, reply) => {
                let _ = reply.send(set_position(&mut *port, position));
            }
        }
    }
}

fn read_position<T: Read + Write + ?Sized>(port: &mut T) -> Result<u8, HwError> {
    write_command(port, "CP")?;
    let line = read_line(port)?;
    let wire: u8 = line
        .trim()
        .parse()
        .map_err(|_| HwError::Protocol(line.clone()))?;
    wire.checked_sub(1).ok_or(HwError::Protocol(line))
}

fn set_position<T: Read + Write + ?Sized>(port: &mut T, position: u8) -> Result<(), HwError> {
    write_command(port, &format!("GO{}", position + 1))
}

/// Probe whether an SSV answers on this port: `CP` must report 1..=16.
pub(crate) fn is_on_port<T: Read + Write + ?Sized>(port: &mut T) -> bool {
    match read_position(port) {
        Ok(position) => position <= 15,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::ScriptedPort;
    use super::*;

    #[test]
    fn position_is_zero_based() {
        let mut port = ScriptedPort::new();
        port.respond("3\r");
        assert_eq!(read_position(&mut port).unwrap(), 2);
    }

    #[test]
    fn move_is_one_based() {
        let mut port = ScriptedPort::new();
        set_position(&mut port, 8).unwrap();
        assert_eq!(port.written_text(), "GO9\r");
    }

    #[test]
    fn zero_position_is_protocol_error() {
        let mut port = ScriptedPort::new();
        port.respond("0\r");
        assert!(read_position(&mut port).is_err());
    }
}
