//! Daemon configuration.
//!
//! Values come from an optional TOML file, then CLI flags (and their
//! environment variables) override individual keys.

use clap::Parser;
use ledgerbridge_core::DeviceSessionConfig;
use ledgerbridge_device::{
    Device, FileSettings, MemorySettings, MnemonicError, SettingsError, SettingsStore, Transport,
};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "ledgerbridge", about = "Expose a signing device to local clients", version)]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long, short, env = "LEDGERBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to bind.
    #[arg(long, env = "LEDGERBRIDGE_ADDRESS")]
    pub address: Option<IpAddr>,

    #[arg(long, short, env = "LEDGERBRIDGE_PORT")]
    pub port: Option<u16>,

    /// Phrase for the software signer.
    #[arg(long, env = "LEDGERBRIDGE_MNEMONIC", hide_env_values = true)]
    pub mnemonic: Option<String>,

    /// Log filter directive, e.g. `ledgerbridge=debug`.
    #[arg(long, env = "LEDGERBRIDGE_LOG")]
    pub log_level: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("the mnemonic backend needs a phrase (--mnemonic or [device] mnemonic)")]
    MissingMnemonic,
    #[error("the ledger backend needs a device transport, none was supplied")]
    NoTransport,
    #[error(transparent)]
    Mnemonic(#[from] MnemonicError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub device: DeviceConfig,
    pub gate: GateConfig,
    /// Where the remembered app pid is persisted.
    pub settings_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub address: IpAddr,
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8081,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Mnemonic,
    Ledger,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: Backend,
    pub mnemonic: Option<String>,
    pub app_name: String,
    pub poll_interval_ms: u64,
    pub infinite_emitting: bool,
    pub skip_connection_check: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let session = DeviceSessionConfig::default();
        Self {
            backend: Backend::default(),
            mnemonic: None,
            app_name: session.app_name,
            poll_interval_ms: session.poll_interval.as_millis() as u64,
            infinite_emitting: session.infinite_emitting,
            skip_connection_check: session.skip_connection_check,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GateConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            url: "https://gate-api.testnet.minter.network/api/v2/".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// File (if given) with CLI overrides applied.
    pub fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(address) = cli.address {
            config.server.address = address;
        }
        if let Some(port) = cli.port {
            config.server.port = port;
        }
        if let Some(mnemonic) = &cli.mnemonic {
            config.device.mnemonic = Some(mnemonic.clone());
        }
        Ok(config)
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.address, self.server.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    pub fn session(&self) -> DeviceSessionConfig {
        DeviceSessionConfig {
            skip_connection_check: self.device.skip_connection_check,
            infinite_emitting: self.device.infinite_emitting,
            poll_interval: Duration::from_millis(self.device.poll_interval_ms.max(1)),
            app_name: self.device.app_name.clone(),
        }
    }

    /// Open the settings store, if one is configured.
    pub fn open_settings(&self) -> Result<Option<Arc<FileSettings>>, ConfigError> {
        match &self.settings_path {
            Some(path) => Ok(Some(Arc::new(FileSettings::open(path)?))),
            None => Ok(None),
        }
    }
}

/// Construct the configured device backend.
///
/// Hardware sessions need a [`Transport`] supplied by the embedder; the stock
/// binary passes `None` and can only build the software signer.
pub fn build_device(
    config: &Config,
    transport: Option<Box<dyn Transport>>,
) -> Result<Device, ConfigError> {
    match config.device.backend {
        Backend::Mnemonic => {
            let phrase = config
                .device
                .mnemonic
                .as_deref()
                .ok_or(ConfigError::MissingMnemonic)?;
            Ok(Device::mnemonic(phrase, config.session())?)
        }
        Backend::Ledger => {
            let transport = transport.ok_or(ConfigError::NoTransport)?;
            let settings: Arc<dyn SettingsStore> = match config.open_settings()? {
                Some(file) => file,
                None => Arc::new(MemorySettings::new()),
            };
            Ok(Device::ledger(transport, settings, config.session()))
        }
    }
}
