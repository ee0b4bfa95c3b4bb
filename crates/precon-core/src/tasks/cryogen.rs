//! Cryogen delivery and the cryo-trap heater.

use async_trait::async_trait;

use crate::schedule::{Context, Runnable};

pub struct EnableCryogen {
    context: Context,
    origin: f64,
}

impl EnableCryogen {
    pub fn new(context: &Context, origin: f64) -> Self {
        EnableCryogen {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for EnableCryogen {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    fn set_events(&self) -> &[&'static str] {
        &["cryogen"]
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.set_cryogen(true).await;
        log::info!("Activated cryogen");
        false
    }
}

pub struct DisableCryogen {
    context: Context,
    origin: f64,
}

impl DisableCryogen {
    pub fn new(context: &Context, origin: f64) -> Self {
        DisableCryogen {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for DisableCryogen {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    fn clear_events(&self) -> &[&'static str] {
        &["cryogen"]
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.set_cryogen(false).await;
        log::info!("Deactivated cryogen");
        false
    }
}

pub struct EnableGcCryogen {
    context: Context,
    origin: f64,
}

impl EnableGcCryogen {
    pub fn new(context: &Context, origin: f64) -> Self {
        EnableGcCryogen {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for EnableGcCryogen {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    fn set_events(&self) -> &[&'static str] {
        &["gc_cryogen"]
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.set_gc_cryogen(true).await;
        log::info!("Activated GC cryogen");
        false
    }
}

pub struct DisableGcCryogen {
    context: Context,
    origin: f64,
}

impl DisableGcCryogen {
    pub fn new(context: &Context, origin: f64) -> Self {
        DisableGcCryogen {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for DisableGcCryogen {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    fn clear_events(&self) -> &[&'static str] {
        &["gc_cryogen"]
    }

    async fn execute(&mut self) -> bool {
        self.context.interface.set_gc_cryogen(false).await;
        log::info!("Deactivated GC cryogen");
        false
    }
}

pub struct CryoHeaterOn {
    context: Context,
    origin: f64,
}

impl CryoHeaterOn {
    pub fn new(context: &Context, origin: f64) -> Self {
        CryoHeaterOn {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for CryoHeaterOn {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        log::debug!("Cryo trap heater ON");
        self.context.interface.set_cryo_heater(true).await;
        false
    }
}

pub struct CryoHeaterOff {
    context: Context,
    origin: f64,
}

impl CryoHeaterOff {
    pub fn new(context: &Context, origin: f64) -> Self {
        CryoHeaterOff {
            context: context.clone(),
            origin,
        }
    }
}

#[async_trait]
impl Runnable for CryoHeaterOff {
    fn origin(&self) -> f64 {
        self.origin
    }

    fn context(&self) -> &Context {
        &self.context
    }

    async fn execute(&mut self) -> bool {
        log::debug!("Cryo trap heater OFF");
        self.context.interface.set_cryo_heater(false).await;
        false
    }
}
