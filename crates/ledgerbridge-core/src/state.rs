//! Device connection state and session tuning.
//!
//! State strings on the wire:
//! - `DISCONNECTED` - no device attached
//! - `APP_NOT_OPENED` - device attached, signing app closed
//! - `PERMISSION_ERROR` - the OS refused access to the device
//! - `APP_OPENED` - signing app open and ready

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Observed state of the single hardware connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConnectionState {
    #[default]
    Disconnected = 0,
    AppNotOpened = 1,
    PermissionError = 2,
    AppOpened = 3,
}

impl ConnectionState {
    /// Stable wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::AppNotOpened => "APP_NOT_OPENED",
            ConnectionState::PermissionError => "PERMISSION_ERROR",
            ConnectionState::AppOpened => "APP_OPENED",
        }
    }

    /// Only an opened signing app may be talked to.
    pub fn can_interact(self) -> bool {
        self == ConnectionState::AppOpened
    }

    /// Raw discriminant, used for lock-free snapshots.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Inverse of [`ConnectionState::to_u8`]. Unknown values read as disconnected.
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::AppNotOpened,
            2 => ConnectionState::PermissionError,
            3 => ConnectionState::AppOpened,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionState {
    type Err = StateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DISCONNECTED" => Ok(ConnectionState::Disconnected),
            "APP_NOT_OPENED" => Ok(ConnectionState::AppNotOpened),
            "PERMISSION_ERROR" => Ok(ConnectionState::PermissionError),
            "APP_OPENED" => Ok(ConnectionState::AppOpened),
            other => Err(StateParseError(other.to_string())),
        }
    }
}

/// Error parsing a state string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown connection state: {0}")]
pub struct StateParseError(String);

/// Tuning knobs for a device session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSessionConfig {
    /// Leave the device closed and skip probing, without stopping the loop.
    pub skip_connection_check: bool,
    /// Publish the state on every tick, even when unchanged.
    pub infinite_emitting: bool,
    /// Period between probes.
    pub poll_interval: Duration,
    /// Name of the signing application on the device.
    pub app_name: String,
}

impl Default for DeviceSessionConfig {
    fn default() -> Self {
        Self {
            skip_connection_check: false,
            infinite_emitting: true,
            poll_interval: Duration::from_secs(1),
            app_name: "Minter".to_string(),
        }
    }
}
