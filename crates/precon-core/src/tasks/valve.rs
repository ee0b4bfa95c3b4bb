//! Inlet plumbing: overflow, high-pressure, evacuation valves, the SSV, and
//! the load/inject switching valve.

use async_trait::async_trait;

use crate::schedule::{Context, Runnable};

pub struct OverflowOn {
    context: Context,
    origin: f64,
}

impl OverflowOn {
    pub fn new(context: &Context, origin: f64) -> Self {
        OverflowOn {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for OverflowOn {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.set_overflow(true).await;
        log::info!("Overflow valve ON");
        false
    }
}

pub struct OverflowOff {
    context: Context,
    origin: f64,
}

impl OverflowOff {
    pub fn new(context: &Context, origin: f64) -> Self {
        OverflowOff {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for OverflowOff {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.set_overflow(false).await;
        log::info!("Overflow valve OFF");
        false
    }
}

pub struct HighPressureOn {
    context: Context,
    origin: f64,
}

impl HighPressureOn {
    pub fn new(context: &Context, origin: f64) -> Self {
        HighPressureOn {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for HighPressureOn {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.set_high_pressure_valve(true).await;
        false
    }
}

pub struct HighPressureOff {
    context: Context,
    origin: f64,
}

impl HighPressureOff {
    pub fn new(context: &Context, origin: f64) -> Self {
        HighPressureOff {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for HighPressureOff {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.set_high_pressure_valve(false).await;
        false
    }
}

pub struct EvacuateOn {
    context: Context,
    origin: f64,
}

impl EvacuateOn {
    pub fn new(context: &Context, origin: f64) -> Self {
        EvacuateOn {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for EvacuateOn {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.set_evacuation_valve(true).await;
        false
    }
}

pub struct EvacuateOff {
    context: Context,
    origin: f64,
}

impl EvacuateOff {
    pub fn new(context: &Context, origin: f64) -> Self {
        EvacuateOff {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for EvacuateOff {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.set_evacuation_valve(false).await;
        false
    }
}

/// Move the stream selection valve. Blocks the schedule while the valve
/// converges, which can take tens of seconds.
pub struct SetSsv {
    context: Context,
    origin: f64,
    position: u8,
}

impl SetSsv {
    pub fn new(context: &Context, origin: f64, position: u8) -> Self {
        SetSsv {
            context: context.clone(),
            origin,
            position,
        }
    }
}

#[async_trait]
impl Runnable for SetSsv {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.set_ssv(self.position, false).await;
        false
    }
}

/// Pulse the switching valve to LOAD.
pub struct LoadSwitch {
    context: Context,
    origin: f64,
}

impl LoadSwitch {
    pub fn new(context: &Context, origin: f64) -> Self {
        LoadSwitch {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for LoadSwitch {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.valve_load().await;
        log::debug!("Switching valve to LOAD");
        false
    }
}

/// Pulse the switching valve to INJECT.
pub struct InjectSwitch {
    context: Context,
    origin: f64,
}

impl InjectSwitch {
    pub fn new(context: &Context, origin: f64) -> Self {
        InjectSwitch {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for InjectSwitch {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.valve_inject().await;
        log::debug!("Switching valve to INJECT");
        false
    }
}
