//! Core types for ledgerbridge.
//!
//! This crate provides the protocol primitives shared by the device session and
//! the gateway: connection state, the wire message envelope, and the values
//! passed to and from the signing device.

mod message;
mod state;
mod types;

pub use message::{GatewayMessage, MessageKind, ProtocolError};
pub use state::{ConnectionState, DeviceSessionConfig, StateParseError};
pub use types::{Address, HASH_LEN, HashError, Signature, TxHash};

/// A digest to sign and the key derivation index to sign it with.
///
/// Produced per request and consumed by exactly one sign call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningRequest {
    pub unsigned_hash: TxHash,
    pub derive_index: u32,
}

impl SigningRequest {
    pub fn new(unsigned_hash: TxHash, derive_index: u32) -> Self {
        Self {
            unsigned_hash,
            derive_index,
        }
    }
}
