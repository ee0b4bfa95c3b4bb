//! Sample cycle composition: leaf runnables and the task variants built
//! from them.
//!
//! Offsets inside a cycle are expressed against three anchors: the cycle
//! origin `O`, the sample-open time `P = O + SAMPLE_OPEN_AT`, and the
//! sample-close time `Q = P + SAMPLE_SECONDS`. The composition in
//! [`sample`] lays out the base choreography; [`flask`], [`tank`],
//! [`zero`] and [`pfpflask`] specialize it per inlet source.

pub mod column;
pub mod cryogen;
pub mod flask;
pub mod flow;
pub mod gc;
pub mod pfpflask;
pub mod pressure;
pub mod registry;
pub mod sample;
pub mod tank;
pub mod temperature;
pub mod vacuum;
pub mod valve;
pub mod zero;

/// Nominal cycle length in seconds.
pub const CYCLE_SECONDS: f64 = 900.0;

/// Offset of the sample valve open within the cycle.
pub const SAMPLE_OPEN_AT: f64 = 180.0;

/// How long the sample valve stays open.
pub const SAMPLE_SECONDS: f64 = 420.0;

/// Target sample flow while the sample valve is open.
pub const SAMPLE_FLOW: f64 = 7.2;

/// First-ramp flow for flask and zero cycles.
pub const INITIAL_FLOW: f64 = 6.9;

/// First-ramp flow for PFP cycles.
pub const PFP_INITIAL_FLOW: f64 = 3.0;

/// Flow band maintained while sampling.
pub const LOWER_SAMPLE_FLOW: f64 = 0.5;
pub const UPPER_SAMPLE_FLOW: f64 = 1.3;

/// Below this signal the flow counts as lost.
pub const LOW_FLOW_THRESHOLD: f64 = 0.2;

/// SSV position of the zero-gas line.
pub const ZERO_GAS_SSV: u8 = 9;
