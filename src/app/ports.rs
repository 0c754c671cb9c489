//! Port traits: the hexagonal boundary between the bridge engines and the radio and flash world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ BridgeService / Runtime (domain)
//! ```
//!
//! Driven adapters (Bluedroid GATT server, SPP transport, NVS, OTA
//! partitions, system control) implement these traits. The engines
//! consume them through generics or `Arc<dyn …>`, so none of the state
//! machines touch ESP-IDF directly and all of them run on the host.
//!
//! ## Contract notes
//!
//! - **ClassicPort::connect** blocks until the link is up or has failed.
//!   It is only ever called from a dedicated connect task.
//! - **GattPort::notify** may be called from any task except the BLE
//!   event-delivery context.
//! - **FirmwareUpdate** aborts the partition write when dropped without
//!   `commit`.

use core::fmt;

use crate::config::BridgeConfig;
use crate::link::BtAddress;
use crate::protocol::CharId;

// ───────────────────────────────────────────────────────────────
// Configuration port (driven adapter: domain ↔ persistent settings)
// ───────────────────────────────────────────────────────────────

/// Loads and persists the bridge configuration.
///
/// Implementations MUST validate before persisting and MUST make
/// [`erase`](ConfigPort::erase) remove every field in one operation.
pub trait ConfigPort {
    /// Load the stored configuration; `NotFound` on first boot.
    fn load(&self) -> Result<BridgeConfig, ConfigError>;

    /// Check ranges, then write every field.
    fn save(&mut self, config: &BridgeConfig) -> Result<(), ConfigError>;

    /// Wipe all stored settings.
    fn erase(&mut self) -> Result<(), ConfigError>;
}

// ───────────────────────────────────────────────────────────────
// Key-value storage (NVS underneath the settings store)
// ───────────────────────────────────────────────────────────────

/// Namespaced key-value storage underneath [`ConfigPort`].
pub trait StoragePort {
    /// Copy the stored blob into `buf`, returning its length.
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Store `data` under `key` and commit before returning.
    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Remove `key`. A missing key is not an error.
    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError>;

    /// `true` if `key` holds a value.
    fn exists(&self, namespace: &str, key: &str) -> bool;

    /// Remove every key in `namespace` and commit.
    fn erase_namespace(&mut self, namespace: &str) -> Result<(), StorageError>;
}

// ───────────────────────────────────────────────────────────────
// Bluetooth Classic port (driven adapter: domain → SPP transport)
// ───────────────────────────────────────────────────────────────

/// Serial-profile transport to the target device.
///
/// Discovered devices and inbound bytes flow the other way, as
/// [`BridgeEvent`](crate::events::BridgeEvent)s.
pub trait ClassicPort: Send + Sync {
    /// Begin inquiry. `false` if the stack refused.
    fn start_discovery(&self) -> bool;

    /// Forget already-reported devices so they are reported again.
    fn clear_discovery_cache(&self);

    /// Stop inquiry (no-op if not running).
    fn stop_discovery(&self);

    /// One blocking connect attempt.
    fn connect(&self, address: &BtAddress) -> bool;

    /// Whether the SPP link is currently open.
    fn is_connected(&self) -> bool;

    /// Close the SPP link (no-op if closed).
    fn disconnect(&self);

    /// Queue bytes on the open link. `false` if there is none.
    fn write(&self, data: &[u8]) -> bool;

    /// Stop the transport before restart or sleep.
    fn shutdown(&self);
}

// ───────────────────────────────────────────────────────────────
// GATT port (driven adapter: domain → BLE server)
// ───────────────────────────────────────────────────────────────

/// The BLE GATT server as seen by the domain.
pub trait GattPort: Send + Sync {
    /// Push a value to the peer (indication when `confirm` is set).
    fn notify(&self, conn_id: u16, ch: CharId, value: &[u8], confirm: bool) -> bool;

    /// Drop the connection `conn_id`.
    fn disconnect_peer(&self, conn_id: u16);

    /// Resume advertising after a disconnect.
    fn start_advertising(&self);

    /// Stop the BLE stack before restart or sleep.
    fn shutdown(&self);
}

// ───────────────────────────────────────────────────────────────
// Firmware partition port (driven adapter: domain → OTA flash)
// ───────────────────────────────────────────────────────────────

/// Opens the inactive application partition for an update.
pub trait FirmwarePort {
    type Update: FirmwareUpdate;

    /// Select and erase the next OTA partition for `image_size` bytes.
    fn begin(&mut self, image_size: u32) -> Result<Self::Update, FirmwareError>;
}

/// An open partition write. Dropping it without `commit` aborts.
pub trait FirmwareUpdate {
    fn write(&mut self, data: &[u8]) -> Result<(), FirmwareError>;

    /// Finalize the image and make it the next boot partition.
    fn commit(self) -> Result<(), FirmwareError>;
}

// ───────────────────────────────────────────────────────────────
// System, clock and battery ports
// ───────────────────────────────────────────────────────────────

/// Irreversible power actions. On hardware neither returns.
pub trait SystemPort: Send + Sync {
    fn restart(&self);
    fn deep_sleep(&self);
}

/// Monotonic time since boot.
pub trait ClockPort: Send + Sync {
    fn now_secs(&self) -> u64;
}

/// Battery voltage source.
pub trait BatteryPort: Send {
    /// Battery voltage in millivolts, `None` if the sample failed.
    fn read_millivolts(&mut self) -> Option<u32>;
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Why the settings could not be loaded or stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Nothing stored yet; defaults apply.
    NotFound,
    /// A stored field could not be decoded.
    Corrupted,
    /// Names the field that is out of range.
    ValidationFailed(&'static str),
    /// NVS has no free pages left.
    StorageFull,
    /// Any other NVS failure.
    IoError,
}

/// Failures reported by a [`StoragePort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Key absent from the namespace.
    NotFound,
    /// No room for the value.
    Full,
    /// Open, read or commit failed.
    IoError,
}

/// Errors from [`FirmwarePort`] / [`FirmwareUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareError {
    /// No inactive OTA partition exists.
    NoPartition,
    /// Partition could not be opened or erased.
    BeginFailed,
    /// Flash write failed.
    WriteFailed,
    /// Image rejected at finalize (bad header or checksum).
    FinalizeFailed,
    /// Boot partition could not be switched.
    BootSetFailed,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("no stored settings"),
            Self::Corrupted => f.write_str("stored settings unreadable"),
            Self::ValidationFailed(field) => write!(f, "{field} out of range"),
            Self::StorageFull => f.write_str("settings storage full"),
            Self::IoError => f.write_str("settings storage failed"),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("no such key"),
            Self::Full => f.write_str("nvs full"),
            Self::IoError => f.write_str("nvs access failed"),
        }
    }
}

impl fmt::Display for FirmwareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPartition => f.write_str("no inactive OTA partition"),
            Self::BeginFailed => f.write_str("partition open failed"),
            Self::WriteFailed => f.write_str("flash write failed"),
            Self::FinalizeFailed => f.write_str("image finalize failed"),
            Self::BootSetFailed => f.write_str("could not switch boot partition"),
        }
    }
}

impl From<StorageError> for ConfigError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound => Self::NotFound,
            StorageError::Full => Self::StorageFull,
            StorageError::IoError => Self::IoError,
        }
    }
}
