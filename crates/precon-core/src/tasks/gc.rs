//! GC/MS trigger handshake.

use async_trait::async_trait;

use crate::schedule::{Context, Runnable};

/// Prepare the external trigger line.
pub struct GcReady {
    context: Context,
    origin: f64,
}

impl GcReady {
    pub fn new(context: &Context, origin: f64) -> Self {
        GcReady {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for GcReady {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.ready_gcms().await;
        false
    }
}

/// Fire the trigger, starting the GC/MS run.
pub struct GcSample {
    context: Context,
    origin: f64,
}

impl GcSample {
    pub fn new(context: &Context, origin: f64) -> Self {
        GcSample {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for GcSample {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    fn set_events(&self) -> &[&'static str] {
        &["gc_trigger"]
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.trigger_gcms().await;
        log::info!("GC started");
        false
    }
}
