//! GATT characteristic table.
//!
//! One primary bridge service plus the standard battery service. Every
//! characteristic is described once here, and the BLE adapter registers
//! exactly what this table lists.
//!
//! | UUID (prefix) | Characteristic            | R | W | N |
//! |---------------|---------------------------|---|---|---|
//! | `2000`        | Battery Voltage (mV)      | ✓ |   |   |
//! | `2001`        | Serial Data               |   | ✓ | ✓ |
//! | `2002`        | BT Scan                   | ✓ | ✓ | ✓ |
//! | `2003`        | BT Connect                | ✓ | ✓ | ✓ |
//! | `2004`        | Config: Name              | ✓ | ✓ |   |
//! | `2005`        | Config: PIN               |   | ✓ |   |
//! | `2006`        | Config: Target Address    | ✓ | ✓ |   |
//! | `2007`        | Debug Log                 |   |   | ✓ |
//! | `2008`        | Restart                   |   | ✓ |   |
//! | `2009`        | OTA Update                |   | ✓ | ✓ |
//! | `200A`        | Connected Idle Timeout    | ✓ | ✓ |   |
//! | `200B`        | Disconnected Idle Timeout | ✓ | ✓ |   |
//! | `200C`        | Sleep                     |   | ✓ |   |
//! | `200D`        | MTU                       | ✓ |   |   |
//! | `2A19` (SIG)  | Battery Level (%)         | ✓ |   | ✓ |
//!
//! Bridge UUIDs are `xxxxxxxx-7858-48fb-b797-8613e960da6a` with the
//! prefix above; the bridge service itself is `00001000-…`.

pub mod codec;

use core::fmt;

/// Bridge UUID with the variable leading 32 bits zeroed.
const UUID_BASE: u128 = 0x0000_0000_7858_48fb_b797_8613_e960_da6a;

/// 128-bit UUID from a bridge prefix.
pub const fn bridge_uuid(prefix: u32) -> u128 {
    UUID_BASE | ((prefix as u128) << 96)
}

pub const BRIDGE_SERVICE_UUID: u128 = bridge_uuid(0x1000);
pub const BATTERY_SERVICE_UUID: u16 = 0x180F;

pub const USER_DESCRIPTION_UUID: u16 = 0x2901;
pub const CCCD_UUID: u16 = 0x2902;
pub const PRESENTATION_FORMAT_UUID: u16 = 0x2904;

/// Handles reserved when the bridge service is created.
pub const BRIDGE_SERVICE_HANDLES: u16 = 56;
/// Handles reserved for the battery service.
pub const BATTERY_SERVICE_HANDLES: u16 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharId {
    BatteryVoltage,
    SerialData,
    BtScan,
    BtConnect,
    ConfigName,
    ConfigPin,
    ConfigTarget,
    DebugLog,
    Restart,
    OtaUpdate,
    ConnectedIdleTimeout,
    DisconnectedIdleTimeout,
    Sleep,
    MtuInfo,
    BatteryLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Uuid {
    Sig16(u16),
    Bridge128(u128),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceId {
    Bridge,
    Battery,
}

/// Characteristic property bits (Bluetooth Core Vol 3, Part G, 3.3.1.1).
pub mod props {
    pub const READ: u8 = 0x02;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;
}

/// Attribute permission level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Readable without pairing.
    Open,
    /// Requires an encrypted, MITM-authenticated link.
    EncryptedMitm,
}

/// Characteristic Presentation Format descriptor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationFormat {
    pub format: u8,
    pub exponent: i8,
    pub unit: u16,
    pub namespace: u8,
    pub description: u16,
}

impl PresentationFormat {
    pub const UINT32: u8 = 0x08;
    pub const UNIT_VOLT: u16 = 0x2728;

    /// Seven-byte descriptor encoding.
    pub fn encode(&self) -> [u8; 7] {
        let unit = self.unit.to_le_bytes();
        let desc = self.description.to_le_bytes();
        [
            self.format,
            self.exponent as u8,
            unit[0],
            unit[1],
            self.namespace,
            desc[0],
            desc[1],
        ]
    }
}

/// One row of the GATT table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharDef {
    pub id: CharId,
    pub service: ServiceId,
    pub uuid: Uuid,
    pub properties: u8,
    pub access: Access,
    pub description: &'static str,
    pub format: Option<PresentationFormat>,
}

impl CharDef {
    pub fn notifies(&self) -> bool {
        self.properties & (props::NOTIFY | props::INDICATE) != 0
    }

    pub fn readable(&self) -> bool {
        self.properties & props::READ != 0
    }

    pub fn writable(&self) -> bool {
        self.properties & props::WRITE != 0
    }

    /// Descriptors registered after the value, in order.
    pub fn descriptors(&self) -> heapless::Vec<u16, 3> {
        let mut d = heapless::Vec::new();
        let _ = d.push(USER_DESCRIPTION_UUID);
        if self.format.is_some() {
            let _ = d.push(PRESENTATION_FORMAT_UUID);
        }
        if self.notifies() {
            let _ = d.push(CCCD_UUID);
        }
        d
    }

    /// Attribute handles this characteristic occupies.
    pub fn handle_count(&self) -> u16 {
        2 + self.descriptors().len() as u16
    }
}

const fn bridge(
    id: CharId,
    prefix: u32,
    properties: u8,
    description: &'static str,
) -> CharDef {
    CharDef {
        id,
        service: ServiceId::Bridge,
        uuid: Uuid::Bridge128(bridge_uuid(prefix)),
        properties,
        access: Access::EncryptedMitm,
        description,
        format: None,
    }
}

use props::{NOTIFY, READ, WRITE};

static TABLE: [CharDef; 15] = [
    // Readable before pairing, like the standard battery level.
    CharDef {
        access: Access::Open,
        format: Some(PresentationFormat {
            format: PresentationFormat::UINT32,
            exponent: -3,
            unit: PresentationFormat::UNIT_VOLT,
            namespace: 1,
            description: 0,
        }),
        ..bridge(CharId::BatteryVoltage, 0x2000, READ, "Battery Voltage")
    },
    bridge(CharId::SerialData, 0x2001, WRITE | NOTIFY, "Serial Data"),
    bridge(CharId::BtScan, 0x2002, READ | WRITE | NOTIFY, "BT Scan"),
    bridge(CharId::BtConnect, 0x2003, READ | WRITE | NOTIFY, "BT Connect"),
    bridge(CharId::ConfigName, 0x2004, READ | WRITE, "Name"),
    bridge(CharId::ConfigPin, 0x2005, WRITE, "PIN"),
    bridge(CharId::ConfigTarget, 0x2006, READ | WRITE, "BT Address"),
    bridge(CharId::DebugLog, 0x2007, NOTIFY, "Debug Log"),
    bridge(CharId::Restart, 0x2008, WRITE, "Restart"),
    bridge(CharId::OtaUpdate, 0x2009, WRITE | NOTIFY, "OTA Update"),
    bridge(CharId::ConnectedIdleTimeout, 0x200A, READ | WRITE, "Connected Idle Timeout"),
    bridge(CharId::DisconnectedIdleTimeout, 0x200B, READ | WRITE, "Disconnected Idle Timeout"),
    bridge(CharId::Sleep, 0x200C, WRITE, "Sleep"),
    bridge(CharId::MtuInfo, 0x200D, READ, "MTU"),
    CharDef {
        id: CharId::BatteryLevel,
        service: ServiceId::Battery,
        uuid: Uuid::Sig16(0x2A19),
        properties: READ | NOTIFY,
        access: Access::Open,
        description: "Battery Level",
        format: None,
    },
];

/// Table row for `id`.
pub fn char_def(id: CharId) -> &'static CharDef {
    // Every CharId has exactly one row.
    TABLE.iter().find(|c| c.id == id).unwrap_or(&TABLE[0])
}

/// Characteristics registered for `service`. The OTA characteristic is
/// left out entirely when no verification key is available.
pub fn characteristics(service: ServiceId, ota_available: bool) -> impl Iterator<Item = &'static CharDef> {
    TABLE
        .iter()
        .filter(move |c| c.service == service)
        .filter(move |c| ota_available || c.id != CharId::OtaUpdate)
}

/// Handles needed by `service`, including the service declaration.
pub fn handles_required(service: ServiceId, ota_available: bool) -> u16 {
    1 + characteristics(service, ota_available)
        .map(CharDef::handle_count)
        .sum::<u16>()
}

/// Handle table too small for the characteristics it must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleBudgetError {
    pub service: ServiceId,
    pub required: u16,
    pub reserved: u16,
}

impl fmt::Display for HandleBudgetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} service needs {} handles but only {} are reserved",
            self.service, self.required, self.reserved
        )
    }
}

/// Check a reserved handle count before creating `service`.
pub fn check_handle_budget(service: ServiceId, reserved: u16, ota_available: bool) -> Result<(), HandleBudgetError> {
    let required = handles_required(service, ota_available);
    if required > reserved {
        return Err(HandleBudgetError {
            service,
            required,
            reserved,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_uuid_layout() {
        assert_eq!(
            BRIDGE_SERVICE_UUID,
            0x0000_1000_7858_48fb_b797_8613_e960_da6a
        );
        assert_eq!(
            bridge_uuid(0x200A),
            0x0000_200a_7858_48fb_b797_8613_e960_da6a
        );
    }

    #[test]
    fn idle_timeouts_have_distinct_uuids() {
        assert_ne!(
            char_def(CharId::ConnectedIdleTimeout).uuid,
            char_def(CharId::DisconnectedIdleTimeout).uuid
        );
    }

    #[test]
    fn all_uuids_unique() {
        for (i, a) in TABLE.iter().enumerate() {
            for b in &TABLE[i + 1..] {
                assert_ne!(a.uuid, b.uuid, "{:?} and {:?} collide", a.id, b.id);
            }
        }
    }

    #[test]
    fn reserved_handles_fit_full_table() {
        assert!(check_handle_budget(ServiceId::Bridge, BRIDGE_SERVICE_HANDLES, true).is_ok());
        assert!(check_handle_budget(ServiceId::Battery, BATTERY_SERVICE_HANDLES, true).is_ok());
    }

    #[test]
    fn undersized_table_is_detected() {
        let err = check_handle_budget(ServiceId::Bridge, 12, true).unwrap_err();
        assert_eq!(err.reserved, 12);
        assert!(err.required > 12);
    }

    #[test]
    fn ota_omitted_without_key() {
        assert!(characteristics(ServiceId::Bridge, false).all(|c| c.id != CharId::OtaUpdate));
        assert!(characteristics(ServiceId::Bridge, true).any(|c| c.id == CharId::OtaUpdate));
    }

    #[test]
    fn voltage_carries_presentation_format() {
        let v = char_def(CharId::BatteryVoltage);
        assert_eq!(v.descriptors().as_slice(), &[USER_DESCRIPTION_UUID, PRESENTATION_FORMAT_UUID]);
        assert_eq!(
            v.format.unwrap().encode(),
            [0x08, 0xFD, 0x28, 0x27, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn notifying_chars_get_cccd() {
        for c in &TABLE {
            assert_eq!(c.notifies(), c.descriptors().contains(&CCCD_UUID), "{:?}", c.id);
        }
    }

    #[test]
    fn battery_telemetry_is_open() {
        assert_eq!(char_def(CharId::BatteryLevel).access, Access::Open);
        assert_eq!(char_def(CharId::BatteryVoltage).access, Access::Open);
        assert_eq!(char_def(CharId::SerialData).access, Access::EncryptedMitm);
    }
}
