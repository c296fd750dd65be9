//! Values exchanged with the signing device.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of an unsigned transaction digest.
pub const HASH_LEN: usize = 32;

/// A chain address as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 32-byte digest of an unsigned transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHash([u8; HASH_LEN]);

impl TxHash {
    pub fn new(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse exactly 64 hex characters.
    pub fn from_hex(value: &str) -> Result<Self, HashError> {
        if value.is_empty() {
            return Err(HashError::Empty);
        }
        if value.len() != HASH_LEN * 2 {
            return Err(HashError::Length(value.len()));
        }
        let mut bytes = [0u8; HASH_LEN];
        hex::decode_to_slice(value, &mut bytes).map_err(|_| HashError::NotHex)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Why a digest string was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashError {
    #[error("empty value. Value must be a hex-string with 32 bytes of raw unsigned tx data")]
    Empty,
    #[error(
        "invalid raw tx length {0}. Value must be a hex-string with 32 bytes of raw unsigned tx data"
    )]
    Length(usize),
    #[error("value is not a hex-string. Value must be a hex-string with 32 bytes of raw unsigned tx data")]
    NotHex,
}

/// Recoverable secp256k1 signature as returned by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub v: u8,
}

impl Signature {
    pub fn r_hex(&self) -> String {
        hex::encode(self.r)
    }

    pub fn s_hex(&self) -> String {
        hex::encode(self.s)
    }

    pub fn v_hex(&self) -> String {
        hex::encode([self.v])
    }
}
