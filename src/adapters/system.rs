//! Restart and deep sleep.
//!
//! Neither call returns on hardware. The simulation only counts them.

use std::sync::atomic::{AtomicU32, Ordering};

use log::info;

use crate::app::ports::SystemPort;

#[cfg(target_os = "espidf")]
#[derive(Debug, Default, Clone, Copy)]
pub struct EspSystem;

#[cfg(target_os = "espidf")]
impl SystemPort for EspSystem {
    fn restart(&self) {
        // SAFETY: radios are already stopped; does not return.
        unsafe { esp_idf_svc::sys::esp_restart() };
    }

    fn deep_sleep(&self) {
        // No wake source is armed: only a reset or power cycle wakes the
        // device, which is what a flat cell needs.
        // SAFETY: radios are already stopped; does not return.
        unsafe { esp_idf_svc::sys::esp_deep_sleep_start() };
    }
}

/// Counts power actions instead of performing them.
#[derive(Debug, Default)]
pub struct SimSystem {
    restarts: AtomicU32,
    sleeps: AtomicU32,
}

impl SimSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn sleeps(&self) -> u32 {
        self.sleeps.load(Ordering::SeqCst)
    }
}

impl SystemPort for SimSystem {
    fn restart(&self) {
        info!("System(sim): restart");
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }

    fn deep_sleep(&self) {
        info!("System(sim): deep sleep");
        self.sleeps.fetch_add(1, Ordering::SeqCst);
    }
}
