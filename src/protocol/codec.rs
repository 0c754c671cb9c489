//! Characteristic payload encoding.
//!
//! Every write is length-checked here before a single byte is
//! interpreted. Multi-byte integers are little-endian.
//!
//! OTA Update messages:
//!
//! ```text
//! ┌─────┬──────────────────────────────────────────┐
//! │ tag │ body                                     │
//! ├─────┼──────────────────────────────────────────┤
//! │ 01  │ format (u8) + image size (u32 LE)        │
//! │ 02  │ image bytes                              │
//! │ 03  │ DER ECDSA signature                      │
//! └─────┴──────────────────────────────────────────┘
//! ```
//!
//! Scan results: `address(6) + rssi(i8) + name(UTF-8)`.

use core::fmt;

use crate::config::{
    BridgeConfig, DeviceName, MAX_NAME_LEN, MAX_PIN, MAX_TARGET_NAME_LEN, TargetDevice, TargetName,
};
use crate::link::{BtAddress, DiscoveredDevice};

/// Largest GATT attribute value.
pub const MAX_ATTR_LEN: usize = 512;

pub type AttrValue = heapless::Vec<u8, MAX_ATTR_LEN>;

pub const STATE_IDLE: u8 = 0;
pub const STATE_ACTIVE: u8 = 1;
pub const STATE_UNAVAILABLE: u8 = 0xFF;

pub const OTA_STATUS_FAILURE: u8 = 0;
pub const OTA_STATUS_SUCCESS: u8 = 1;

const OTA_TAG_START: u8 = 1;
const OTA_TAG_CHUNK: u8 = 2;
const OTA_TAG_FINISH: u8 = 3;
/// DER ECDSA P-256 signatures are at most 72 bytes.
const MAX_SIGNATURE_LEN: usize = 72;

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    WrongLength { expected: usize, got: usize },
    TooShort { min: usize, got: usize },
    TooLong { max: usize, got: usize },
    UnknownTag(u8),
    OutOfRange(&'static str),
    InvalidUtf8,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongLength { expected, got } => {
                write!(f, "expected {} bytes, got {}", expected, got)
            }
            Self::TooShort { min, got } => write!(f, "need at least {} bytes, got {}", min, got),
            Self::TooLong { max, got } => write!(f, "at most {} bytes allowed, got {}", max, got),
            Self::UnknownTag(t) => write!(f, "unknown message tag 0x{:02x}", t),
            Self::OutOfRange(what) => write!(f, "{} out of range", what),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8"),
        }
    }
}

fn exact<const N: usize>(data: &[u8]) -> Result<[u8; N], ProtocolError> {
    data.try_into().map_err(|_| ProtocolError::WrongLength {
        expected: N,
        got: data.len(),
    })
}

// ── Scalars ───────────────────────────────────────────────────

/// Single command byte; nonzero is `true`.
pub fn decode_flag(data: &[u8]) -> Result<bool, ProtocolError> {
    let [b] = exact::<1>(data)?;
    Ok(b != 0)
}

pub fn decode_u32(data: &[u8]) -> Result<u32, ProtocolError> {
    exact::<4>(data).map(u32::from_le_bytes)
}

pub fn encode_u32(value: u32) -> AttrValue {
    value_from(&value.to_le_bytes())
}

/// Six-digit pairing passcode.
pub fn decode_pin(data: &[u8]) -> Result<u32, ProtocolError> {
    let pin = decode_u32(data)?;
    if pin > MAX_PIN {
        return Err(ProtocolError::OutOfRange("PIN"));
    }
    Ok(pin)
}

pub fn decode_name(data: &[u8]) -> Result<DeviceName, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::TooShort { min: 1, got: 0 });
    }
    if data.len() > MAX_NAME_LEN {
        return Err(ProtocolError::TooLong {
            max: MAX_NAME_LEN,
            got: data.len(),
        });
    }
    let s = core::str::from_utf8(data).map_err(|_| ProtocolError::InvalidUtf8)?;
    DeviceName::try_from(s).map_err(|()| ProtocolError::TooLong {
        max: MAX_NAME_LEN,
        got: data.len(),
    })
}

// ── Target address ────────────────────────────────────────────

/// Empty payload clears the target; otherwise `address(6) + name`.
pub fn decode_target(data: &[u8]) -> Result<Option<TargetDevice>, ProtocolError> {
    if data.is_empty() {
        return Ok(None);
    }
    let Some((addr, name)) = data.split_first_chunk::<6>() else {
        return Err(ProtocolError::TooShort {
            min: 6,
            got: data.len(),
        });
    };
    if name.len() > MAX_TARGET_NAME_LEN {
        return Err(ProtocolError::TooLong {
            max: 6 + MAX_TARGET_NAME_LEN,
            got: data.len(),
        });
    }
    let name = core::str::from_utf8(name).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(Some(TargetDevice {
        address: BtAddress(*addr),
        name: TargetName::try_from(name).map_err(|()| ProtocolError::InvalidUtf8)?,
    }))
}

pub fn encode_target(target: Option<&TargetDevice>) -> AttrValue {
    let mut out = AttrValue::new();
    if let Some(t) = target {
        let _ = out.extend_from_slice(&t.address.0);
        let _ = out.extend_from_slice(t.name.as_bytes());
    }
    out
}

// ── Scan results ──────────────────────────────────────────────

pub fn encode_scan_result(device: &DiscoveredDevice) -> AttrValue {
    let mut out = AttrValue::new();
    let _ = out.extend_from_slice(&device.address.0);
    let _ = out.push(device.rssi as u8);
    let _ = out.extend_from_slice(device.name.as_bytes());
    out
}

/// Inverse of [`encode_scan_result`], for clients and tests.
pub fn decode_scan_result(data: &[u8]) -> Result<DiscoveredDevice, ProtocolError> {
    let Some((addr, rest)) = data.split_first_chunk::<6>() else {
        return Err(ProtocolError::TooShort {
            min: 7,
            got: data.len(),
        });
    };
    let Some((rssi, name)) = rest.split_first() else {
        return Err(ProtocolError::TooShort {
            min: 7,
            got: data.len(),
        });
    };
    let name = core::str::from_utf8(name).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(DiscoveredDevice {
        address: BtAddress(*addr),
        name: TargetName::try_from(name).map_err(|()| ProtocolError::TooLong {
            max: 7 + MAX_TARGET_NAME_LEN,
            got: data.len(),
        })?,
        rssi: *rssi as i8,
    })
}

// ── OTA messages ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaMessage<'a> {
    Start { format: u8, size: u32 },
    Chunk(&'a [u8]),
    Finish { signature: &'a [u8] },
}

impl<'a> OtaMessage<'a> {
    pub fn decode(data: &'a [u8]) -> Result<Self, ProtocolError> {
        let Some((&tag, body)) = data.split_first() else {
            return Err(ProtocolError::TooShort { min: 1, got: 0 });
        };
        match tag {
            OTA_TAG_START => {
                let [format, s0, s1, s2, s3] = exact::<5>(body).map_err(|_| {
                    ProtocolError::WrongLength {
                        expected: 6,
                        got: data.len(),
                    }
                })?;
                Ok(Self::Start {
                    format,
                    size: u32::from_le_bytes([s0, s1, s2, s3]),
                })
            }
            OTA_TAG_CHUNK if body.is_empty() => Err(ProtocolError::TooShort { min: 2, got: 1 }),
            OTA_TAG_CHUNK => Ok(Self::Chunk(body)),
            OTA_TAG_FINISH if body.is_empty() => Err(ProtocolError::TooShort { min: 2, got: 1 }),
            OTA_TAG_FINISH if body.len() > MAX_SIGNATURE_LEN => Err(ProtocolError::TooLong {
                max: 1 + MAX_SIGNATURE_LEN,
                got: data.len(),
            }),
            OTA_TAG_FINISH => Ok(Self::Finish { signature: body }),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }

    /// Wire form, as a client sends it.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Self::Start { format, size } => {
                let mut out = vec![OTA_TAG_START, format];
                out.extend_from_slice(&size.to_le_bytes());
                out
            }
            Self::Chunk(bytes) => [&[OTA_TAG_CHUNK][..], bytes].concat(),
            Self::Finish { signature } => [&[OTA_TAG_FINISH][..], signature].concat(),
        }
    }
}

// ── Read projections ──────────────────────────────────────────

pub fn value_from(bytes: &[u8]) -> AttrValue {
    let mut out = AttrValue::new();
    let take = bytes.len().min(MAX_ATTR_LEN);
    let _ = out.extend_from_slice(&bytes[..take]);
    out
}

pub fn encode_name(config: &BridgeConfig) -> AttrValue {
    value_from(config.name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_needs_exactly_one_byte() {
        assert_eq!(decode_flag(&[0]), Ok(false));
        assert_eq!(decode_flag(&[7]), Ok(true));
        assert!(decode_flag(&[]).is_err());
        assert!(decode_flag(&[1, 1]).is_err());
    }

    #[test]
    fn u32_is_little_endian() {
        assert_eq!(decode_u32(&[0x40, 0xE2, 0x01, 0x00]), Ok(123_456));
        assert_eq!(encode_u32(123_456).as_slice(), &[0x40, 0xE2, 0x01, 0x00]);
        assert_eq!(
            decode_u32(&[1, 2, 3]),
            Err(ProtocolError::WrongLength {
                expected: 4,
                got: 3
            })
        );
    }

    #[test]
    fn pin_range_enforced() {
        assert_eq!(decode_pin(&999_999u32.to_le_bytes()), Ok(999_999));
        assert_eq!(
            decode_pin(&1_000_000u32.to_le_bytes()),
            Err(ProtocolError::OutOfRange("PIN"))
        );
    }

    #[test]
    fn name_bounds() {
        assert_eq!(decode_name(b"Bridge").unwrap().as_str(), "Bridge");
        assert!(decode_name(b"").is_err());
        assert!(decode_name(&[b'a'; MAX_NAME_LEN + 1]).is_err());
        assert_eq!(decode_name(&[0xFF, 0xFE]), Err(ProtocolError::InvalidUtf8));
    }

    #[test]
    fn empty_target_clears() {
        assert_eq!(decode_target(&[]), Ok(None));
    }

    #[test]
    fn six_byte_target_has_empty_name() {
        let t = decode_target(&[1, 2, 3, 4, 5, 6]).unwrap().unwrap();
        assert_eq!(t.address, BtAddress([1, 2, 3, 4, 5, 6]));
        assert!(t.name.is_empty());
    }

    #[test]
    fn target_with_name() {
        let t = decode_target(b"\x01\x02\x03\x04\x05\x06X1 Printer").unwrap().unwrap();
        assert_eq!(t.name.as_str(), "X1 Printer");
        assert_eq!(encode_target(Some(&t)).as_slice(), b"\x01\x02\x03\x04\x05\x06X1 Printer");
    }

    #[test]
    fn short_target_rejected() {
        assert_eq!(
            decode_target(&[1, 2, 3]),
            Err(ProtocolError::TooShort { min: 6, got: 3 })
        );
    }

    #[test]
    fn scan_result_layout() {
        let d = DiscoveredDevice {
            address: BtAddress([0xA, 0xB, 0xC, 0xD, 0xE, 0xF]),
            name: TargetName::try_from("X1").unwrap(),
            rssi: -60,
        };
        let v = encode_scan_result(&d);
        assert_eq!(v.as_slice(), &[0xA, 0xB, 0xC, 0xD, 0xE, 0xF, 0xC4, b'X', b'1']);
        assert_eq!(decode_scan_result(&v), Ok(d));
    }

    #[test]
    fn ota_start_decodes() {
        assert_eq!(
            OtaMessage::decode(&[1, 1, 0x10, 0x27, 0, 0]),
            Ok(OtaMessage::Start {
                format: 1,
                size: 10_000
            })
        );
    }

    #[test]
    fn ota_start_wrong_length() {
        assert_eq!(
            OtaMessage::decode(&[1, 1, 0x10, 0x27, 0]),
            Err(ProtocolError::WrongLength {
                expected: 6,
                got: 5
            })
        );
    }

    #[test]
    fn ota_unknown_tag() {
        assert_eq!(OtaMessage::decode(&[9, 1]), Err(ProtocolError::UnknownTag(9)));
        assert!(OtaMessage::decode(&[]).is_err());
    }

    #[test]
    fn ota_empty_chunk_rejected() {
        assert!(OtaMessage::decode(&[2]).is_err());
        assert_eq!(OtaMessage::decode(&[2, 7, 8]), Ok(OtaMessage::Chunk(&[7, 8])));
    }

    #[test]
    fn ota_oversized_signature_rejected() {
        let mut msg = vec![3];
        msg.extend_from_slice(&[0x30; 80]);
        assert!(matches!(OtaMessage::decode(&msg), Err(ProtocolError::TooLong { .. })));
    }

    #[test]
    fn ota_start_encodes_like_client() {
        // struct.pack("<BBI", 1, 1, size)
        assert_eq!(
            OtaMessage::Start { format: 1, size: 0x0102_0304 }.encode(),
            vec![1, 1, 4, 3, 2, 1]
        );
    }
}
