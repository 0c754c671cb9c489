//! Battery telemetry and the graceful shutdown path.
//!
//! The cell is a single Li-ion behind a 1:2 divider. Level is linear
//! between 3.2 V (empty) and 4.2 V (full); below 3.1 V the bridge stops
//! both radios and sleeps before the brown-out detector trips.
//!
//! Restart and deep sleep never happen inside a radio callback. They are
//! queued as a [`ShutdownKind`] and run by [`run_shutdown`] on a task of
//! their own.

use std::time::Duration;

use log::{info, warn};

use crate::app::ports::{ClassicPort, GattPort, SystemPort};

pub const BATTERY_EMPTY_MV: u32 = 3200;
pub const BATTERY_FULL_MV: u32 = 4200;
pub const BATTERY_CUTOFF_MV: u32 = 3100;

/// ADC input sees half the cell voltage.
pub const DIVIDER_RATIO: u32 = 2;

/// Percent charge for a cell voltage, clamped to 0..=100.
pub fn battery_level_percent(millivolts: u32) -> u8 {
    let span = BATTERY_FULL_MV - BATTERY_EMPTY_MV;
    let above = millivolts.saturating_sub(BATTERY_EMPTY_MV).min(span);
    (above * 100 / span) as u8
}

/// Latest battery sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatteryStatus {
    pub millivolts: u32,
    pub level: u8,
}

impl BatteryStatus {
    pub fn from_millivolts(millivolts: u32) -> Self {
        Self {
            millivolts,
            level: battery_level_percent(millivolts),
        }
    }

    /// Below the cutoff; the device must shut down.
    pub fn is_critical(&self) -> bool {
        self.millivolts < BATTERY_CUTOFF_MV
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// Warm restart (after settings erase or a committed update).
    Restart,
    DeepSleep,
}

/// Stop both transports, wait `grace`, then restart or sleep.
pub fn run_shutdown(
    kind: ShutdownKind,
    gatt: &dyn GattPort,
    classic: &dyn ClassicPort,
    system: &dyn SystemPort,
    grace: Duration,
) {
    info!("Power: {:?} requested, stopping radios", kind);
    classic.shutdown();
    gatt.shutdown();
    std::thread::sleep(grace);
    match kind {
        ShutdownKind::Restart => {
            info!("Power: restarting");
            system.restart();
        }
        ShutdownKind::DeepSleep => {
            warn!("Power: entering deep sleep");
            system.deep_sleep();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_is_linear_and_clamped() {
        assert_eq!(battery_level_percent(3000), 0);
        assert_eq!(battery_level_percent(3200), 0);
        assert_eq!(battery_level_percent(3700), 50);
        assert_eq!(battery_level_percent(4200), 100);
        assert_eq!(battery_level_percent(4500), 100);
    }

    #[test]
    fn cutoff_is_below_empty() {
        assert!(BatteryStatus::from_millivolts(3099).is_critical());
        assert!(!BatteryStatus::from_millivolts(3100).is_critical());
        assert_eq!(BatteryStatus::from_millivolts(3150).level, 0);
    }
}
