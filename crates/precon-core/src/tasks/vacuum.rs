//! Vacuum pump isolation valve.

use async_trait::async_trait;

use crate::schedule::{Context, Runnable};

pub struct VacuumOn {
    context: Context,
    origin: f64,
}

impl VacuumOn {
    pub fn new(context: &Context, origin: f64) -> Self {
        VacuumOn {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for VacuumOn {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.set_vacuum(true).await;
        log::info!("Vacuum valve ON");
        false
    }
}

pub struct VacuumOff {
    context: Context,
    origin: f64,
}

impl VacuumOff {
    pub fn new(context: &Context, origin: f64) -> Self {
        VacuumOff {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for VacuumOff {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.set_vacuum(false).await;
        log::debug!("Vacuum valve OFF");
        false
    }
}
