//! Bridge configuration parameters
//!
//! Everything the phone can change through the configuration
//! characteristics, persisted as one blob by the
//! [`ConfigPort`](crate::app::ports::ConfigPort) adapter, plus the fixed
//! engine timings that are not user-tunable.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::link::BtAddress;

/// Maximum advertised device name length in bytes.
pub const MAX_NAME_LEN: usize = 32;
/// Maximum stored display name length for the target device.
pub const MAX_TARGET_NAME_LEN: usize = 64;
/// Largest pairing passcode a six-digit keypad can enter.
pub const MAX_PIN: u32 = 999_999;

const FALLBACK_NAME: &str = "X1 Bridge";
const FALLBACK_PIN: u32 = 123_456;

pub type DeviceName = heapless::String<MAX_NAME_LEN>;
pub type TargetName = heapless::String<MAX_TARGET_NAME_LEN>;

/// The Bluetooth Classic peripheral the bridge relays to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDevice {
    pub address: BtAddress,
    /// Display name remembered from the scan; may be empty.
    pub name: TargetName,
}

/// Persistent bridge configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Advertised name, shared by BLE and Bluetooth Classic.
    pub name: DeviceName,
    /// Static passkey used for BLE pairing.
    pub pin_code: u32,
    /// Stored target for BT Connect, `None` when cleared.
    pub target: Option<TargetDevice>,
    /// Seconds without activity before a connected peer is dropped (0 = never).
    pub connected_idle_timeout_secs: u32,
    /// Seconds without a peer before deep sleep (0 = never).
    pub disconnected_idle_timeout_secs: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            pin_code: default_pin(),
            target: None,
            connected_idle_timeout_secs: 600,
            disconnected_idle_timeout_secs: 1800,
        }
    }
}

/// Build-time default name (`BRIDGE_DEFAULT_NAME`), falling back to "X1 Bridge".
fn default_name() -> DeviceName {
    let raw = option_env!("BRIDGE_DEFAULT_NAME").unwrap_or(FALLBACK_NAME);
    DeviceName::try_from(raw)
        .or_else(|_| DeviceName::try_from(FALLBACK_NAME))
        .unwrap_or_default()
}

/// Build-time default PIN (`BRIDGE_DEFAULT_PIN`), falling back to 123456.
fn default_pin() -> u32 {
    option_env!("BRIDGE_DEFAULT_PIN")
        .and_then(|raw| raw.trim().parse().ok())
        .filter(|pin| *pin <= MAX_PIN)
        .unwrap_or(FALLBACK_PIN)
}

/// Range-check a configuration before it is persisted.
pub fn validate_config(config: &BridgeConfig) -> Result<(), &'static str> {
    if config.name.is_empty() {
        return Err("name must not be empty");
    }
    if config.pin_code > MAX_PIN {
        return Err("pin_code must be at most six digits");
    }
    Ok(())
}

// ── Engine timings ────────────────────────────────────────────

/// Fixed periods and bounds used by the background tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Idle-timeout sweep period.
    pub idle_sweep: Duration,
    /// Interval between discovery polls (each poll clears the dedup cache).
    pub scan_poll: Duration,
    /// Polls before a scan finishes on its own.
    pub scan_polls: u16,
    /// Liveness poll period while a target link is up.
    pub link_poll: Duration,
    /// Connect attempts made by BT Connect.
    pub connect_attempts: u8,
    /// Pause after transport teardown before restart or deep sleep.
    pub shutdown_grace: Duration,
    /// Battery sampling period.
    pub battery_poll: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            idle_sweep: Duration::from_secs(30),
            scan_poll: Duration::from_millis(1280),
            scan_polls: 0x30,
            link_poll: Duration::from_millis(1000),
            connect_attempts: 5,
            shutdown_grace: Duration::from_secs(5),
            battery_poll: Duration::from_secs(60),
        }
    }
}

impl Timings {
    /// Same bounds with every wait collapsed to zero, for host tests.
    pub fn immediate() -> Self {
        Self {
            idle_sweep: Duration::ZERO,
            scan_poll: Duration::ZERO,
            link_poll: Duration::ZERO,
            shutdown_grace: Duration::ZERO,
            battery_poll: Duration::ZERO,
            ..Self::default()
        }
    }
}
