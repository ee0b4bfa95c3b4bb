//! Pre-column switching. The pulse takes a couple of seconds, so it runs in
//! the background rather than holding up the schedule.

use async_trait::async_trait;

use crate::schedule::{Context, Runnable};

pub struct PreColumnIn {
    context: Context,
    origin: f64,
}

impl PreColumnIn {
    pub fn new(context: &Context, origin: f64) -> Self {
        PreColumnIn {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for PreColumnIn {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        let interface = self.context.interface.clone();
        self.context
            .schedule
            .start_background(async move { interface.precolumn_in().await });
        log::info!("Pre column in line");
        false
    }
}

pub struct PreColumnOut {
    context: Context,
    origin: f64,
}

impl PreColumnOut {
    pub fn new(context: &Context, origin: f64) -> Self {
        PreColumnOut {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for PreColumnOut {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        let interface = self.context.interface.clone();
        self.context
            .schedule
            .start_background(async move { interface.precolumn_out().await });
        log::info!("Pre column out of line");
        false
    }
}
