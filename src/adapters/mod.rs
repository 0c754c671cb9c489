//! Driven adapters: ESP-IDF implementations of the port traits, each with
//! a host simulation behind the same type name or a `Sim*` sibling.
//!
//! | Adapter     | Port(s)                       | ESP-IDF backend          |
//! |-------------|-------------------------------|--------------------------|
//! | `ble`       | `GattPort`                    | Bluedroid GATTS / GAP    |
//! | `classic`   | `ClassicPort`                 | GAP BT inquiry + SPP     |
//! | `nvs`       | `StoragePort`, `ConfigPort`   | NVS blob                 |
//! | `partition` | `FirmwarePort`                | `esp-ota`                |
//! | `system`    | `SystemPort`                  | `esp_restart`, deep sleep|
//! | `battery`   | `BatteryPort`                 | ADC oneshot              |
//! | `time`      | `ClockPort`                   | `esp_timer`              |

pub mod battery;
pub mod ble;
pub mod classic;
pub mod nvs;
pub mod partition;
pub mod system;
pub mod time;

use std::sync::{Arc, OnceLock};

use log::{debug, warn};

use crate::app::runtime::EventHandler;
use crate::events::BridgeEvent;
use crate::protocol::codec::AttrValue;

/// Where a stack's callbacks deliver their events.
///
/// C callbacks cannot capture state, so the ESP adapters keep one of these
/// in a `static`. The handler is installed once the runtime exists; events
/// arriving before that are dropped.
pub struct HandlerSlot(OnceLock<Arc<dyn EventHandler>>);

impl HandlerSlot {
    pub const fn new() -> Self {
        Self(OnceLock::new())
    }

    pub fn install(&self, handler: Arc<dyn EventHandler>) {
        if self.0.set(handler).is_err() {
            warn!("Adapters: event handler already installed");
        }
    }

    pub fn dispatch(&self, event: BridgeEvent<'_>) -> Option<AttrValue> {
        match self.0.get() {
            Some(handler) => handler.on_event(event),
            None => {
                debug!("Adapters: no handler yet, dropping {:?}", event);
                None
            }
        }
    }
}

impl Default for HandlerSlot {
    fn default() -> Self {
        Self::new()
    }
}
