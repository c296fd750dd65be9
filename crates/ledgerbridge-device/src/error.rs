use crate::transport::{TransportError, status};
use ledgerbridge_core::ConnectionState;

pub(crate) const RECONNECT_HINT: &str =
    "Please try to disconnect the device and connect it back";

/// Errors surfaced by a device session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The session is not in `APP_OPENED`; nothing was sent to the device.
    #[error("Can't proceed request: device is in invalid state: {state}")]
    DeviceNotReady { state: ConnectionState },
    /// Another signature is already waiting for confirmation.
    #[error("Device is busy: another transaction is waiting for confirmation")]
    DeviceBusy,
    #[error("Unable to get address: {0}")]
    AddressResolutionFailed(String),
    /// The device refused to sign, usually because the user pressed reject.
    #[error("Device rejected the request: {}", status::name(*code))]
    UserRejected { code: u16 },
    #[error("Device session has stopped")]
    Stopped,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    pub(crate) fn not_ready(state: ConnectionState) -> Self {
        SessionError::DeviceNotReady { state }
    }
}
