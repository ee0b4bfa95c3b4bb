//! The physical instrument: DAQ, pressure reporter, SSV and PFP packages
//! behind the [`Interface`] capability surface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::daq::Daq;
use super::pfp::Pfp;
use super::pressure::PressureSensor;
use super::ssv::SsvValve;
use super::{HwError, Interface};

// Analog input channels.
const AIN_OVEN_TEMPERATURE: u8 = 11;
const AIN_FLOW: u8 = 12;
const AIN_THERMOCOUPLES: [u8; 2] = [4, 5];

// Analog output channels.
const AOT_FLOW: u8 = 1;

// Digital valve lines.
const DOT_CRYOGEN_TO_TRAP: &str = "CIO1";
const DOT_GC_CRYOGEN: &str = "EIO3";
const DOT_VACUUM_PUMP: &str = "CIO2";
const DOT_SAMPLE_TO_CHAMBER: &str = "EIO4";
const DOT_INJECT: &str = "FIO2";
const DOT_HEAT_CRYO_TRAP: &str = "FIO3";
const DOT_OVERFLOW: &str = "CIO0";
const DOT_LOAD: &str = "FIO1";
const DOT_PRECOLUMN_IN: &str = "FIO6";
const DOT_PRECOLUMN_OUT: &str = "FIO5";
const DOT_GCMS_START: &str = "FIO0";
const DOT_EVAC_PORT_1: &str = "FIO7";
const DOT_EVAC_PORT_12: &str = "CIO3";

/// SSV position -> high-pressure valve line.
const HIGH_PRESSURE_VALVES: [(u8, &str); 5] = [
    (2, "EIO5"),
    (13, "EIO1"),
    (14, "EIO0"),
    (15, "EIO6"),
    (16, "EIO7"),
];

/// SSV position -> evacuation valve line. Evacuation happens one position
/// below the PFP itself, so these sit at positions 0 and 11.
const EVACUATION_VALVES: [(u8, &str); 2] = [(0, DOT_EVAC_PORT_1), (11, DOT_EVAC_PORT_12)];

/// Safety ceiling on the flow-control voltage.
const MAX_FLOW_VOLTAGE: f64 = 5.0;

/// Serial port assignments for one bench.
#[derive(Debug, Clone, Default)]
pub struct InstrumentConfig {
    pub daq_port: String,
    pub pressure_port: String,
    pub ssv_port: String,
    /// PFP packages by the SSV position they sit on.
    pub pfp_ports: Vec<(u8, String)>,
}

fn clamp(value: f64, minimum: f64, maximum: f64) -> f64 {
    value.max(minimum).min(maximum)
}

fn to_flow_control_voltage(flow: f64) -> f64 {
    clamp(flow * 0.05 + 2.6, 0.0, MAX_FLOW_VOLTAGE)
}

fn to_adjustment_increment(delta: f64) -> f64 {
    (delta.abs() * 2.0 + 1.0) * 0.01
}

/// The hardware-backed interface implementation.
pub struct Instrument {
    daq: Daq,
    pressure: PressureSensor,
    ssv: SsvValve,
    /// PFP packages keyed by SSV position, including the evacuation-position
    /// aliases (position - 1).
    pfp: HashMap<u8, Arc<Pfp>>,
    default_pfp: Option<Arc<Pfp>>,
    selected_ssv: Mutex<Option<u8>>,
    flow_control_voltage: Mutex<Option<f64>>,
    pfp_pressure_cache: Mutex<Option<f64>>,
    flow_zero_offset: Mutex<f64>,
}

impl Instrument {
    /// Connect every configured device. Missing DAQ/pressure/SSV is fatal; a
    /// PFP that does not answer is skipped with a warning.
    pub fn connect(config: &InstrumentConfig) -> Result<Self, HwError> {
        let daq = Daq::open(&config.daq_port)?;
        let pressure = PressureSensor::open(&config.pressure_port)?;
        let ssv = SsvValve::open(&config.ssv_port)?;

        let mut pfp: HashMap<u8, Arc<Pfp>> = HashMap::new();
        let mut default_pfp = None;
        for (position, path) in &config.pfp_ports {
            match Pfp::open(path) {
                Ok(package) => {
                    let package = Arc::new(package);
                    pfp.insert(*position, package.clone());
                    if let Some(evac) = position.checked_sub(1) {
                        pfp.insert(evac, package.clone());
                    }
                    if default_pfp.is_none() {
                        default_pfp = Some(package);
                    }
                }
                Err(err) => {
                    log::warn!("PFP at SSV {position} on {path} not detected: {err}");
                }
            }
        }

        Ok(Instrument {
            daq,
            pressure,
            ssv,
            pfp,
            default_pfp,
            selected_ssv: Mutex::new(None),
            flow_control_voltage: Mutex::new(None),
            pfp_pressure_cache: Mutex::new(None),
            flow_zero_offset: Mutex::new(0.0),
        })
    }

    /// Whether any PFP package was detected.
    pub fn has_pfp(&self) -> bool {
        !self.pfp.is_empty()
    }

    fn pfp_for(&self, ssv: Option<u8>) -> Option<Arc<Pfp>> {
        let position = ssv.or(*self.selected_ssv.lock().unwrap());
        match position {
            Some(position) => self.pfp.get(&position).cloned(),
            None => self.default_pfp.clone(),
        }
    }

    async fn write_flow_voltage(&self, voltage: f64) {
        if let Err(err) = self.daq.write_analog(AOT_FLOW, voltage).await {
            log::warn!("Flow control write failed: {err}");
        }
    }

    async fn read_analog(&self, channel: u8) -> Option<f64> {
        match self.daq.read_analog(channel).await {
            Ok(value) => Some(value),
            Err(err) => {
                log::warn!("Analog read of channel {channel} failed: {err}");
                None
            }
        }
    }

    async fn write_digital(&self, line: &'static str, state: bool) {
        if let Err(err) = self.daq.write_digital(line, state).await {
            log::warn!("Digital write to {line} failed: {err}");
        }
    }
}

#[async_trait]
impl Interface for Instrument {
    async fn get_pressure(&self) -> Option<f64> {
        match self.pressure.read().await {
            Ok(value) => Some(value),
            Err(err) => {
                log::warn!("Pressure read failed: {err}");
                None
            }
        }
    }

    async fn get_pfp_pressure(&self, ssv: Option<u8>) -> Option<f64> {
        let package = self.pfp_for(ssv)?;
        match package.read_pressure().await {
            Ok(value) => {
                *self.pfp_pressure_cache.lock().unwrap() = Some(value);
                Some(value)
            }
            Err(err) => {
                log::warn!("PFP pressure read failed: {err}");
                None
            }
        }
    }

    async fn get_display_pfp_pressure(&self) -> Option<f64> {
        *self.pfp_pressure_cache.lock().unwrap()
    }

    async fn get_flow_signal(&self) -> Option<f64> {
        let raw = self.read_analog(AIN_FLOW).await?;
        Some(raw + self.flow_zero_offset())
    }

    async fn get_flow_control_output(&self) -> Option<f64> {
        *self.flow_control_voltage.lock().unwrap()
    }

    async fn get_oven_temperature_signal(&self) -> Option<f64> {
        self.read_analog(AIN_OVEN_TEMPERATURE).await
    }

    async fn get_thermocouple_temperature(&self, index: usize) -> Option<f64> {
        let channel = *AIN_THERMOCOUPLES.get(index)?;
        self.read_analog(channel).await
    }

    async fn get_ssv_position(&self) -> Option<u8> {
        match self.ssv.read().await {
            Ok(position) => Some(position),
            Err(err) => {
                log::warn!("SSV position read failed: {err}");
                None
            }
        }
    }

    async fn set_cryogen(&self, enable: bool) {
        self.write_digital(DOT_CRYOGEN_TO_TRAP, enable).await;
    }

    async fn set_gc_cryogen(&self, enable: bool) {
        self.write_digital(DOT_GC_CRYOGEN, enable).await;
    }

    async fn set_vacuum(&self, enable: bool) {
        self.write_digital(DOT_VACUUM_PUMP, enable).await;
    }

    async fn set_sample(&self, enable: bool) {
        self.write_digital(DOT_SAMPLE_TO_CHAMBER, enable).await;
    }

    async fn set_cryo_heater(&self, enable: bool) {
        self.write_digital(DOT_HEAT_CRYO_TRAP, enable).await;
    }

    async fn set_overflow(&self, enable: bool) {
        self.write_digital(DOT_OVERFLOW, enable).await;
    }

    async fn set_evacuation_valve(&self, enable: bool) {
        let selected = *self.selected_ssv.lock().unwrap();
        let Some(position) = selected else { return };
        let Some(&(_, line)) = EVACUATION_VALVES.iter().find(|(p, _)| *p == position) else {
            return;
        };
        self.write_digital(line, enable).await;
        log::info!("Evacuation valve {}", if enable { "ON" } else { "OFF" });
    }

    async fn set_high_pressure_valve(&self, enable: bool) {
        let selected = *self.selected_ssv.lock().unwrap();
        let Some(position) = selected else { return };
        let Some(&(_, line)) = HIGH_PRESSURE_VALVES.iter().find(|(p, _)| *p == position) else {
            return;
        };
        self.write_digital(line, enable).await;
        log::info!("High pressure valve {}", if enable { "ON" } else { "OFF" });
    }

    async fn set_flow(&self, flow: f64) {
        let voltage = to_flow_control_voltage(flow);
        *self.flow_control_voltage.lock().unwrap() = Some(voltage);
        self.write_flow_voltage(voltage).await;
    }

    async fn set_pfp_valve(&self, ssv: Option<u8>, valve: u8, open: bool) -> Result<String, HwError> {
        let Some(package) = self.pfp_for(ssv) else {
            return Ok(String::new());
        };
        if open {
            package.open_valve(valve).await
        } else {
            package.close_valve(valve).await
        }
    }

    async fn valve_load(&self) {
        self.write_digital(DOT_LOAD, true).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.write_digital(DOT_LOAD, false).await;
    }

    async fn valve_inject(&self) {
        self.write_digital(DOT_INJECT, true).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        self.write_digital(DOT_INJECT, false).await;
    }

    async fn precolumn_in(&self) {
        self.write_digital(DOT_PRECOLUMN_IN, true).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        self.write_digital(DOT_PRECOLUMN_IN, false).await;
    }

    async fn precolumn_out(&self) {
        self.write_digital(DOT_PRECOLUMN_OUT, true).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        self.write_digital(DOT_PRECOLUMN_OUT, false).await;
    }

    async fn set_ssv(&self, index: u8, manual: bool) {
        if manual {
            // Close every high pressure valve before a manual move.
            for (_, line) in HIGH_PRESSURE_VALVES {
                self.write_digital(line, false).await;
            }
            self.set_overflow(true).await;
        }

        if self.get_ssv_position().await != Some(index) {
            // Vent through the overflow while the position changes.
            self.set_overflow(true).await;

            if let Err(err) = self.ssv.set(index).await {
                log::warn!("SSV move command failed: {err}");
            }
            let mut converged = false;
            for _ in 0..30 {
                if self.get_ssv_position().await == Some(index) {
                    converged = true;
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            if !converged {
                log::warn!("Failed to change SSV to {index}");
            }
        }

        *self.selected_ssv.lock().unwrap() = Some(index);
        log::info!("SSV position is {index}");

        if manual {
            self.set_high_pressure_valve(true).await;
            self.set_flow(f64::INFINITY).await;
        } else {
            self.set_overflow(false).await;
        }
    }

    async fn adjust_flow(&self, flow: f64) {
        if self.flow_control_voltage.lock().unwrap().is_none() {
            self.set_flow(flow).await;
        }

        let deadband = 0.15;
        let mut measured = None;
        for _ in 0..15 {
            let Some(signal) = self.get_flow_signal().await else {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };
            measured = Some(signal);
            let delta = signal - flow;
            log::debug!("Adjusting flow {signal:.2} to target {flow:.2}, delta {delta:.2}");
            if delta.abs() < deadband {
                return;
            }

            let voltage = {
                let mut guard = self.flow_control_voltage.lock().unwrap();
                let voltage = guard.unwrap_or_default();
                let voltage = if delta < 0.0 {
                    voltage + to_adjustment_increment(delta)
                } else {
                    voltage - to_adjustment_increment(delta)
                };
                let voltage = clamp(voltage, 0.0, MAX_FLOW_VOLTAGE);
                *guard = Some(voltage);
                voltage
            };
            self.write_flow_voltage(voltage).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        if let Some(measured) = measured {
            log::info!("Failed to adjust flow {measured:.2} to target {flow:.2}");
        }
    }

    async fn increment_flow(&self, flow: f64, multiplier: f64) {
        if self.flow_control_voltage.lock().unwrap().is_none() {
            self.set_flow(flow).await;
        }
        let voltage = {
            let mut guard = self.flow_control_voltage.lock().unwrap();
            let voltage = clamp(
                guard.unwrap_or_default() + multiplier * 0.02,
                0.0,
                MAX_FLOW_VOLTAGE,
            );
            *guard = Some(voltage);
            voltage
        };
        self.write_flow_voltage(voltage).await;
    }

    async fn ready_gcms(&self) {
        self.write_digital(DOT_GCMS_START, true).await;
    }

    async fn trigger_gcms(&self) {
        self.write_digital(DOT_GCMS_START, false).await;
    }

    async fn initialization(&self) {
        self.set_ssv(2, false).await;
        for line in ["CIO1", "CIO2", "CIO3"] {
            self.write_digital(line, false).await;
        }
        for line in [
            "EIO0", "EIO1", "EIO2", "EIO3", "EIO4", "EIO5", "EIO6", "EIO7",
        ] {
            self.write_digital(line, false).await;
        }
        for line in [
            "FIO0", "FIO1", "FIO2", "FIO3", "FIO4", "FIO5", "FIO6", "FIO7",
        ] {
            self.write_digital(line, false).await;
        }
    }

    async fn shutdown(&self) {
        self.initialization().await;
        self.set_high_pressure_valve(true).await;
        self.set_flow(3.0).await;
        self.set_overflow(true).await;
        *self.flow_control_voltage.lock().unwrap() = None;
    }

    fn flow_zero_offset(&self) -> f64 {
        *self.flow_zero_offset.lock().unwrap()
    }

    fn set_flow_zero_offset(&self, offset: f64) {
        *self.flow_zero_offset.lock().unwrap() = offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_voltage_is_clamped_to_safe_range() {
        assert_eq!(to_flow_control_voltage(0.0), 2.6);
        assert_eq!(to_flow_control_voltage(f64::INFINITY), MAX_FLOW_VOLTAGE);
        assert_eq!(to_flow_control_voltage(-1000.0), 0.0);
    }

    #[test]
    fn adjustment_increment_scales_with_delta() {
        assert!(to_adjustment_increment(0.0) > 0.0);
        assert!(to_adjustment_increment(2.0) > to_adjustment_increment(0.5));
        assert_eq!(to_adjustment_increment(-1.0), to_adjustment_increment(1.0));
    }
}
