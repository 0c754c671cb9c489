//! Signed, chunked firmware update over BLE.
//!
//! Flow: Start → N × Chunk → Finish → (deferred) reboot
//!
//! ```text
//!  Idle ──Start──▶ Receiving(size, written) ──Finish──▶ Verifying ──▶ Committed
//!   ▲                  │ overflow / write error          │ bad size / bad signature
//!   │                  ▼                                 ▼
//!   └──Start──────  Failed(reason) ◀──────────────────────┘
//! ```
//!
//! Chunks are written straight into the inactive partition and folded
//! into a SHA-256 digest. Finish verifies an ECDSA P-256 signature over
//! that digest before the partition is committed and made bootable; an
//! abort at any point drops the open partition handle, which discards
//! the partial image.

pub mod verify;

use core::fmt;

use log::{info, warn};

use crate::app::ports::{FirmwareError, FirmwarePort, FirmwareUpdate};
use verify::{ImageDigest, SignatureError};

/// Only image format understood by Start.
pub const IMAGE_FORMAT_RAW: u8 = 1;

const MAX_FIRMWARE_SIZE: u32 = 4 * 1024 * 1024; // 4 MB

/// Uncompressed SEC1 point is the largest key encoding.
const MAX_KEY_LEN: usize = 65;

// ── Error type ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaError {
    AlreadyInProgress,
    RebootPending,
    UnsupportedFormat(u8),
    InvalidSize,
    NotReceiving,
    Overflow { expected: u32, attempted: u32 },
    SizeMismatch { expected: u32, written: u32 },
    Firmware(FirmwareError),
    Signature(SignatureError),
    /// The peer went away mid-transfer.
    Interrupted,
}

impl fmt::Display for OtaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInProgress => write!(f, "OTA session already in progress"),
            Self::RebootPending => write!(f, "update committed, reboot pending"),
            Self::UnsupportedFormat(v) => write!(f, "unsupported image format {}", v),
            Self::InvalidSize => write!(f, "firmware size out of range (max 4 MB)"),
            Self::NotReceiving => write!(f, "no active OTA session"),
            Self::Overflow {
                expected,
                attempted,
            } => write!(f, "chunk would grow image to {} of {} bytes", attempted, expected),
            Self::SizeMismatch { expected, written } => {
                write!(f, "finish after {} of {} bytes", written, expected)
            }
            Self::Firmware(e) => write!(f, "partition: {}", e),
            Self::Signature(e) => write!(f, "signature: {}", e),
            Self::Interrupted => write!(f, "peer disconnected"),
        }
    }
}

impl From<FirmwareError> for OtaError {
    fn from(e: FirmwareError) -> Self {
        Self::Firmware(e)
    }
}

// ── State machine ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaPhase {
    Idle,
    Receiving { expected_size: u32, bytes_written: u32 },
    Verifying,
    Committed,
    Failed(OtaError),
}

/// Single OTA session over a [`FirmwarePort`].
pub struct OtaEngine<F: FirmwarePort> {
    phase: OtaPhase,
    firmware: F,
    update: Option<F::Update>,
    digest: ImageDigest,
    public_key: heapless::Vec<u8, MAX_KEY_LEN>,
}

impl<F: FirmwarePort> OtaEngine<F> {
    /// Engine verifying against the SEC1 `public_key`.
    ///
    /// The key is only parsed at Finish, so a bad key fails every update
    /// instead of the boot.
    pub fn new(firmware: F, public_key: &[u8]) -> Self {
        let mut key = heapless::Vec::new();
        if key.extend_from_slice(public_key).is_err() {
            warn!("OTA: public key longer than {} bytes ignored", MAX_KEY_LEN);
        }
        Self {
            phase: OtaPhase::Idle,
            firmware,
            update: None,
            digest: ImageDigest::new(),
            public_key: key,
        }
    }

    pub fn phase(&self) -> OtaPhase {
        self.phase
    }

    pub fn firmware(&self) -> &F {
        &self.firmware
    }

    /// Open the inactive partition for `total_size` bytes.
    ///
    /// On error the phase is left as it was (Idle or Failed).
    pub fn start(&mut self, format: u8, total_size: u32) -> Result<(), OtaError> {
        match self.phase {
            OtaPhase::Idle | OtaPhase::Failed(_) => {}
            OtaPhase::Committed => return Err(OtaError::RebootPending),
            OtaPhase::Receiving { .. } | OtaPhase::Verifying => {
                return Err(OtaError::AlreadyInProgress);
            }
        }
        if format != IMAGE_FORMAT_RAW {
            return Err(OtaError::UnsupportedFormat(format));
        }
        if total_size == 0 || total_size > MAX_FIRMWARE_SIZE {
            return Err(OtaError::InvalidSize);
        }

        let update = self.firmware.begin(total_size).inspect_err(|e| {
            warn!("OTA: partition begin failed: {}", e);
        })?;
        self.update = Some(update);
        self.digest = ImageDigest::new();
        self.phase = OtaPhase::Receiving {
            expected_size: total_size,
            bytes_written: 0,
        };
        info!("OTA: begin ({} bytes)", total_size);
        Ok(())
    }

    /// Write the next chunk. Returns total bytes written so far.
    pub fn chunk(&mut self, data: &[u8]) -> Result<u32, OtaError> {
        let OtaPhase::Receiving {
            expected_size,
            bytes_written,
        } = self.phase
        else {
            return Err(OtaError::NotReceiving);
        };

        let attempted = u32::try_from(data.len())
            .ok()
            .and_then(|len| bytes_written.checked_add(len))
            .unwrap_or(u32::MAX);
        if attempted > expected_size {
            return Err(self.abort(OtaError::Overflow {
                expected: expected_size,
                attempted,
            }));
        }

        let written = match self.update.as_mut() {
            Some(update) => update.write(data),
            None => Err(FirmwareError::WriteFailed),
        };
        if let Err(e) = written {
            return Err(self.abort(e.into()));
        }
        self.digest.update(data);

        self.phase = OtaPhase::Receiving {
            expected_size,
            bytes_written: attempted,
        };
        Ok(attempted)
    }

    /// Verify `signature` and commit the image.
    pub fn finish(&mut self, signature: &[u8]) -> Result<(), OtaError> {
        let OtaPhase::Receiving {
            expected_size,
            bytes_written,
        } = self.phase
        else {
            return Err(OtaError::NotReceiving);
        };
        if bytes_written != expected_size {
            return Err(self.abort(OtaError::SizeMismatch {
                expected: expected_size,
                written: bytes_written,
            }));
        }

        self.phase = OtaPhase::Verifying;
        let digest = core::mem::take(&mut self.digest).finalize();
        if let Err(e) = verify::verify_signature(&self.public_key, &digest, signature) {
            return Err(self.abort(OtaError::Signature(e)));
        }

        let Some(update) = self.update.take() else {
            return Err(self.abort(OtaError::Firmware(FirmwareError::FinalizeFailed)));
        };
        if let Err(e) = update.commit() {
            return Err(self.abort(e.into()));
        }

        self.phase = OtaPhase::Committed;
        info!("OTA: image verified and committed ({} bytes)", expected_size);
        Ok(())
    }

    /// Drop an in-flight session because the peer disconnected.
    pub fn interrupt(&mut self) {
        if matches!(self.phase, OtaPhase::Receiving { .. }) {
            self.abort(OtaError::Interrupted);
        }
    }

    /// Abort the session, discarding the partial partition write.
    fn abort(&mut self, reason: OtaError) -> OtaError {
        // Dropping the handle aborts the write.
        self.update = None;
        self.digest = ImageDigest::new();
        self.phase = OtaPhase::Failed(reason);
        warn!("OTA: aborted: {}", reason);
        reason
    }
}
