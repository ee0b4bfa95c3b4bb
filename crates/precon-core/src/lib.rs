//! # precon-core
//!
//! Automation library for a laboratory gas sample pre-concentrator: a rack of
//! valves, a stream selection valve (SSV), a flow controller, a vacuum system,
//! cryogen delivery, a GC/MS trigger line and programmable flask packages
//! (PFPs), driven through a fixed real-time choreography to collect
//! atmospheric samples.
//!
//! ## Architecture
//!
//! Tasks → Runnables → Schedule engine → Interface → Drivers
//!
//! A [`Task`](schedule::Task) expands into a set of [`Runnable`]s anchored at
//! schedule-relative origins. The [`Execute`](schedule::Execute) engine merges
//! every task's runnables into one origin-sorted run list and walks it in real
//! time, honoring pause/resume (which suspends wall time), cooperative abort,
//! atomic mid-run reschedule and background coroutines. Hardware access goes
//! through the async [`Interface`](hw::Interface) capability surface; each
//! serial-backed driver owns its own thread behind an async facade.
//!
//! Cycle results are collected into a [`SampleData`](output::SampleData)
//! record and emitted through the [`OutputSink`](output::OutputSink) as a
//! tab-delimited data row plus a human-readable log block.
//!
//! [`Runnable`]: schedule::Runnable

pub mod controller;
pub mod hw;
pub mod output;
pub mod schedule;
pub mod settings;
pub mod tasks;

pub use controller::{Controller, InterfaceEvent, MonitoredInterface};
pub use hw::{HwError, Interface};
pub use output::{OutputSink, SampleData};
pub use schedule::{
    Context, Event, Execute, NamedTask, RescheduleError, Runnable, Schedule, Task,
};
pub use tasks::registry::{Registry, TaskEntry, TaskListError};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
