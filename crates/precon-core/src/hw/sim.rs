//! Deterministic simulated instrument for `--simulate` runs and tests.
//!
//! Every reading comes from in-memory state that tests (or a frontend) can
//! script through the setter methods. A few couplings mimic the bench:
//! cryogen pulls the oven signal down to 2.0, the trap heater up to 4.0, and
//! the evacuation valve bleeds the PFP manifold down to 2.0. Flow follows
//! the setpoint exactly.

use std::sync::Mutex;

use async_trait::async_trait;

use super::{HwError, Interface};

#[derive(Debug, Clone)]
struct SimState {
    pressure: f64,
    flow: f64,
    flow_control_voltage: Option<f64>,
    oven_signal: f64,
    thermocouples: [f64; 2],
    ssv: u8,
    pfp_pressure: f64,
    pfp_pressure_cache: Option<f64>,
    flow_zero_offset: f64,
    cryogen: bool,
    gc_cryogen: bool,
    vacuum: bool,
    sample: bool,
    cryo_heater: bool,
    overflow: bool,
    high_pressure: bool,
    gcms_line: bool,
}

impl Default for SimState {
    fn default() -> Self {
        SimState {
            pressure: 740.0,
            flow: 0.0,
            flow_control_voltage: None,
            oven_signal: 2.0,
            thermocouples: [21.5, 22.0],
            ssv: 2,
            pfp_pressure: 1.5,
            pfp_pressure_cache: None,
            flow_zero_offset: 0.0,
            cryogen: false,
            gc_cryogen: false,
            vacuum: false,
            sample: false,
            cryo_heater: false,
            overflow: false,
            high_pressure: false,
            gcms_line: false,
        }
    }
}

/// In-memory stand-in for the bench hardware.
#[derive(Default)]
pub struct SimulatedInstrument {
    state: Mutex<SimState>,
}

impl SimulatedInstrument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pressure(&self, torr: f64) {
        self.state.lock().unwrap().pressure = torr;
    }

    pub fn set_flow_signal(&self, flow: f64) {
        self.state.lock().unwrap().flow = flow;
    }

    pub fn set_oven_signal(&self, signal: f64) {
        self.state.lock().unwrap().oven_signal = signal;
    }

    pub fn set_pfp_manifold_pressure(&self, signal: f64) {
        self.state.lock().unwrap().pfp_pressure = signal;
    }

    pub fn flow_setpoint(&self) -> f64 {
        self.state.lock().unwrap().flow
    }

    pub fn sample_valve_open(&self) -> bool {
        self.state.lock().unwrap().sample
    }

    pub fn overflow_open(&self) -> bool {
        self.state.lock().unwrap().overflow
    }

    pub fn vacuum_open(&self) -> bool {
        self.state.lock().unwrap().vacuum
    }
}

#[async_trait]
impl Interface for SimulatedInstrument {
    async fn get_pressure(&self) -> Option<f64> {
        Some(self.state.lock().unwrap().pressure)
    }

    async fn get_pfp_pressure(&self, _ssv: Option<u8>) -> Option<f64> {
        let mut state = self.state.lock().unwrap();
        state.pfp_pressure_cache = Some(state.pfp_pressure);
        Some(state.pfp_pressure)
    }

    async fn get_display_pfp_pressure(&self) -> Option<f64> {
        self.state.lock().unwrap().pfp_pressure_cache
    }

    async fn get_flow_signal(&self) -> Option<f64> {
        let state = self.state.lock().unwrap();
        Some(state.flow + state.flow_zero_offset)
    }

    async fn get_flow_control_output(&self) -> Option<f64> {
        self.state.lock().unwrap().flow_control_voltage
    }

    async fn get_oven_temperature_signal(&self) -> Option<f64> {
        Some(self.state.lock().unwrap().oven_signal)
    }

    async fn get_thermocouple_temperature(&self, index: usize) -> Option<f64> {
        self.state.lock().unwrap().thermocouples.get(index).copied()
    }

    async fn get_ssv_position(&self) -> Option<u8> {
        Some(self.state.lock().unwrap().ssv)
    }

    async fn set_cryogen(&self, enable: bool) {
        let mut state = self.state.lock().unwrap();
        state.cryogen = enable;
        if enable && state.oven_signal > 2.0 {
            state.oven_signal = 2.0;
        }
    }

    async fn set_gc_cryogen(&self, enable: bool) {
        self.state.lock().unwrap().gc_cryogen = enable;
    }

    async fn set_vacuum(&self, enable: bool) {
        self.state.lock().unwrap().vacuum = enable;
    }

    async fn set_sample(&self, enable: bool) {
        self.state.lock().unwrap().sample = enable;
    }

    async fn set_cryo_heater(&self, enable: bool) {
        let mut state = self.state.lock().unwrap();
        state.cryo_heater = enable;
        if enable && state.oven_signal < 4.0 {
            state.oven_signal = 4.0;
        }
    }

    async fn set_overflow(&self, enable: bool) {
        self.state.lock().unwrap().overflow = enable;
    }

    async fn set_evacuation_valve(&self, enable: bool) {
        let mut state = self.state.lock().unwrap();
        if enable && state.pfp_pressure > 2.0 {
            state.pfp_pressure = 2.0;
        }
    }

    async fn set_high_pressure_valve(&self, enable: bool) {
        self.state.lock().unwrap().high_pressure = enable;
    }

    async fn set_flow(&self, flow: f64) {
        let mut state = self.state.lock().unwrap();
        state.flow_control_voltage = Some((flow * 0.05 + 2.6).clamp(0.0, 5.0));
        if flow.is_finite() {
            state.flow = flow;
        } else {
            state.flow = 48.0; // wide open
        }
    }

    async fn set_pfp_valve(
        &self,
        _ssv: Option<u8>,
        _valve: u8,
        _open: bool,
    ) -> Result<String, HwError> {
        Ok("OK".to_string())
    }

    async fn valve_load(&self) {}

    async fn valve_inject(&self) {}

    async fn precolumn_in(&self) {}

    async fn precolumn_out(&self) {}

    async fn set_ssv(&self, index: u8, manual: bool) {
        let mut state = self.state.lock().unwrap();
        state.ssv = index;
        if manual {
            state.high_pressure = true;
        }
    }

    async fn adjust_flow(&self, flow: f64) {
        self.state.lock().unwrap().flow = flow;
    }

    async fn increment_flow(&self, _flow: f64, multiplier: f64) {
        let mut state = self.state.lock().unwrap();
        state.flow += 0.25 * multiplier;
    }

    async fn ready_gcms(&self) {
        self.state.lock().unwrap().gcms_line = true;
    }

    async fn trigger_gcms(&self) {
        self.state.lock().unwrap().gcms_line = false;
    }

    async fn initialization(&self) {
        let mut state = self.state.lock().unwrap();
        let mut fresh = SimState::default();
        // Ambient readings survive an initialization; actuator state does not.
        fresh.pressure = state.pressure;
        fresh.oven_signal = state.oven_signal;
        fresh.pfp_pressure = state.pfp_pressure;
        fresh.thermocouples = state.thermocouples;
        *state = fresh;
    }

    async fn shutdown(&self) {
        self.initialization().await;
        let mut state = self.state.lock().unwrap();
        state.flow = 3.0;
        state.overflow = true;
        state.flow_control_voltage = None;
    }

    fn flow_zero_offset(&self) -> f64 {
        self.state.lock().unwrap().flow_zero_offset
    }

    fn set_flow_zero_offset(&self, offset: f64) {
        self.state.lock().unwrap().flow_zero_offset = offset;
    }
}
