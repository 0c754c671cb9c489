//! Monotonic time.
//!
//! - **`target_os = "espidf"`**: `esp_timer_get_time()`, microseconds
//!   since boot.
//! - **host**: `std::time::Instant` from the first call.

use core::time::Duration;

use crate::app::ports::ClockPort;

/// Time since boot.
#[cfg(target_os = "espidf")]
pub fn monotonic_now() -> Duration {
    // SAFETY: esp_timer is started by the IDF before app_main.
    let us = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
    Duration::from_micros(u64::try_from(us).unwrap_or(0))
}

/// Time since the first call in this process.
#[cfg(not(target_os = "espidf"))]
pub fn monotonic_now() -> Duration {
    use std::sync::OnceLock;
    use std::time::Instant;

    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed()
}

/// [`ClockPort`] over [`monotonic_now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl ClockPort for MonotonicClock {
    fn now_secs(&self) -> u64 {
        monotonic_now().as_secs()
    }
}
