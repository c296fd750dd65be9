//! Signing device sessions.
//!
//! A session owns the connection to a signing device and keeps a
//! [`ConnectionState`](ledgerbridge_core::ConnectionState) up to date by probing
//! it on a dedicated thread. Requests (address, signature, app management)
//! are only forwarded while the signing app is open.
//!
//! Two backends implement [`DeviceBackend`]:
//!
//! - [`LedgerSession`] drives a hardware device through a [`Transport`]
//! - [`MnemonicSigner`] signs in software with a key derived from a phrase

mod device;
mod error;
mod looper;
mod mnemonic;
mod session;
mod settings;
mod transport;

#[cfg(test)]
mod mock;

pub use device::{Device, DeviceBackend};
pub use error::SessionError;
pub use looper::SessionEvent;
pub use mnemonic::{DEFAULT_CONFIRM_DELAY, MnemonicError, MnemonicSigner};
pub use session::LedgerSession;
pub use settings::{FileSettings, KEY_APP_PID, MemorySettings, SettingsError, SettingsStore};
pub use transport::{AppInfo, Transport, TransportError, status};
