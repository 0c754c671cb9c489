//! Image digest and signature check.
//!
//! The release tool hashes the image with SHA-256 and signs the digest
//! (prehashed ECDSA over P-256, DER-encoded signature). The device
//! repeats the hash while chunks stream in and checks the signature
//! against the public key embedded at build time.

use core::fmt;

use log::warn;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};

include!(concat!(env!("OUT_DIR"), "/ota_key.rs"));

/// The build-embedded SEC1 public key, if the build provided one.
pub fn embedded_public_key() -> Option<&'static [u8]> {
    OTA_PUBLIC_KEY
}

/// Running SHA-256 over every image byte, in arrival order.
pub struct ImageDigest(hmac_sha256::Hash);

impl Default for ImageDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageDigest {
    pub fn new() -> Self {
        Self(hmac_sha256::Hash::new())
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    pub fn finalize(self) -> [u8; 32] {
        self.0.finalize()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// The embedded key is not a valid P-256 point.
    PublicKey,
    /// The supplied bytes are not a DER ECDSA signature.
    Encoding,
    /// Well-formed signature that does not match the digest.
    Mismatch,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublicKey => write!(f, "invalid public key"),
            Self::Encoding => write!(f, "malformed signature"),
            Self::Mismatch => write!(f, "signature does not match image"),
        }
    }
}

/// Verify a DER signature over `digest` under the SEC1 `public_key`.
pub fn verify_signature(public_key: &[u8], digest: &[u8; 32], signature: &[u8]) -> Result<(), SignatureError> {
    let key = VerifyingKey::from_sec1_bytes(public_key).map_err(|e| {
        warn!("OTA: public key parse: {}", e);
        SignatureError::PublicKey
    })?;
    let signature = Signature::from_der(signature).map_err(|e| {
        warn!("OTA: signature parse: {}", e);
        SignatureError::Encoding
    })?;
    key.verify_prehash(digest, &signature).map_err(|e| {
        warn!("OTA: signature verify: {}", e);
        SignatureError::Mismatch
    })
}
