//! Unified error type for characteristic writes.
//!
//! Each subsystem keeps its own error enum; the service converts them into
//! [`Error`] so a rejected write is reported through one log line at the
//! GATT boundary. All variants are `Copy`.

use core::fmt;

use crate::app::ports::ConfigError;
use crate::link::LinkError;
use crate::ota::OtaError;
use crate::protocol::CharId;
use crate::protocol::codec::ProtocolError;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Payload was malformed for the characteristic.
    Protocol(ProtocolError),
    /// The target link refused the request.
    Link(LinkError),
    Ota(OtaError),
    /// The settings could not be persisted.
    Config(ConfigError),
    /// Characteristic has no write semantics.
    NotWritable(CharId),
    /// Serial data written while no target is connected.
    NotConnected,
    /// Connect requested with no stored target.
    NoTarget,
    /// Built without an update verification key.
    OtaUnavailable,
    /// A radio stack call failed.
    Transport(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol: {e}"),
            Self::Link(e) => write!(f, "link: {e}"),
            Self::Ota(e) => write!(f, "ota: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::NotWritable(ch) => write!(f, "{ch:?} is not writable"),
            Self::NotConnected => write!(f, "target not connected"),
            Self::NoTarget => write!(f, "no target configured"),
            Self::OtaUnavailable => write!(f, "updates disabled in this build"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<LinkError> for Error {
    fn from(e: LinkError) -> Self {
        Self::Link(e)
    }
}

impl From<OtaError> for Error {
    fn from(e: OtaError) -> Self {
        Self::Ota(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_subsystem() {
        let e: Error = ProtocolError::WrongLength {
            expected: 1,
            got: 3,
        }
        .into();
        assert_eq!(e.to_string(), "protocol: expected 1 bytes, got 3");
        assert_eq!(
            Error::NotWritable(CharId::BatteryLevel).to_string(),
            "BatteryLevel is not writable"
        );
    }
}
