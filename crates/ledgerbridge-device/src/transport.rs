//! The seam to the physical device.
//!
//! A [`Transport`] speaks the device's wire protocol. Implementations are
//! blocking and are only ever driven from a session's own thread.

use ledgerbridge_core::{Address, ConnectionState, Signature, TxHash};

/// Device status words.
pub mod status {
    pub const SUCCESS: u16 = 0x9000;
    pub const USER_REJECTED: u16 = 0x6985;
    pub const SECURITY_STATUS: u16 = 0x6982;
    pub const WRONG_LENGTH: u16 = 0x6700;
    pub const INVALID_DATA: u16 = 0x6a80;
    pub const INS_NOT_SUPPORTED: u16 = 0x6d00;
    pub const CLA_NOT_SUPPORTED: u16 = 0x6e00;
    pub const NO_STATUS_RESULT: u16 = 0x6f00;

    /// Symbolic name of a status word.
    pub fn name(code: u16) -> &'static str {
        match code {
            SUCCESS => "CODE_SUCCESS",
            USER_REJECTED => "CODE_USER_REJECTED",
            SECURITY_STATUS => "CODE_SECURITY_STATUS_NOT_SATISFIED",
            WRONG_LENGTH => "CODE_WRONG_LENGTH",
            INVALID_DATA => "CODE_INVALID_DATA",
            INS_NOT_SUPPORTED => "CODE_INS_NOT_SUPPORTED",
            CLA_NOT_SUPPORTED => "CODE_CLA_NOT_SUPPORTED",
            NO_STATUS_RESULT => "CODE_NO_STATUS_RESULT",
            _ => "CODE_UNKNOWN",
        }
    }
}

/// An application installed on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
}

/// Errors raised by a transport call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The device answered with a truncated or inconsistent buffer.
    #[error("inconsistent device buffer")]
    BufferOutOfRange,
    /// The device answered with a non-success status word.
    #[error("device returned {} ({code:#06x})", status::name(*code))]
    Exchange { code: u16 },
    #[error("access to the device was denied: {0}")]
    Permission(String),
    #[error("device not found")]
    NotFound,
    #[error("device i/o failed: {0}")]
    Io(String),
}

/// Blocking interface to a signing device.
pub trait Transport: Send + 'static {
    /// Process id of the app currently open on the device, `0` for the dashboard.
    fn opened_app_pid(&mut self) -> Result<u16, TransportError>;

    /// Handshake against the device's system (dashboard) interface.
    fn init_ext_root(&mut self) -> Result<ConnectionState, TransportError>;

    /// Handshake against the interface of the app with `pid`.
    fn init_ext(&mut self, pid: u16) -> Result<ConnectionState, TransportError>;

    /// Close and reopen the channel bound to the app with `pid`.
    fn reopen_with_app(&mut self, pid: u16) -> Result<ConnectionState, TransportError>;

    fn close(&mut self);

    fn get_address(&mut self, derive_index: u32, silent: bool) -> Result<Address, TransportError>;

    /// Ask the device to sign; blocks until the user confirms or rejects.
    fn sign(&mut self, hash: &TxHash, derive_index: u32) -> Result<Signature, TransportError>;

    fn list_apps(&mut self) -> Result<Vec<AppInfo>, TransportError>;

    /// Launch an app by name, returning its pid.
    fn run_app(&mut self, name: &str) -> Result<u16, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn opened_app_pid(&mut self) -> Result<u16, TransportError> {
        (**self).opened_app_pid()
    }

    fn init_ext_root(&mut self) -> Result<ConnectionState, TransportError> {
        (**self).init_ext_root()
    }

    fn init_ext(&mut self, pid: u16) -> Result<ConnectionState, TransportError> {
        (**self).init_ext(pid)
    }

    fn reopen_with_app(&mut self, pid: u16) -> Result<ConnectionState, TransportError> {
        (**self).reopen_with_app(pid)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn get_address(&mut self, derive_index: u32, silent: bool) -> Result<Address, TransportError> {
        (**self).get_address(derive_index, silent)
    }

    fn sign(&mut self, hash: &TxHash, derive_index: u32) -> Result<Signature, TransportError> {
        (**self).sign(hash, derive_index)
    }

    fn list_apps(&mut self) -> Result<Vec<AppInfo>, TransportError> {
        (**self).list_apps()
    }

    fn run_app(&mut self, name: &str) -> Result<u16, TransportError> {
        (**self).run_app(name)
    }
}
