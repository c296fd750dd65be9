//! Persisted key-value settings.
//!
//! The session only needs a handful of small integers (the remembered app pid),
//! so the store is intentionally narrow. [`FileSettings`] keeps them in a TOML
//! file that is rewritten on every change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Key of the remembered signing-app pid.
pub const KEY_APP_PID: &str = "app_pid";

/// Injected settings store.
pub trait SettingsStore: Send + Sync {
    fn get_u16(&self, key: &str) -> Option<u16>;

    fn set_u16(&self, key: &str, value: u16) -> Result<(), SettingsError>;

    fn remove(&self, key: &str) -> Result<(), SettingsError>;

    /// Persist pending changes.
    fn flush(&self) -> Result<(), SettingsError>;

    fn has(&self, key: &str) -> bool {
        self.get_u16(key).is_some()
    }
}

/// Error loading or saving settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings file is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unable to encode settings: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Volatile store, for tests and for the software signer.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, u16>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get_u16(&self, key: &str) -> Option<u16> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(key).copied()
    }

    fn set_u16(&self, key: &str, value: u16) -> Result<(), SettingsError> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SettingsError> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.remove(key);
        Ok(())
    }

    fn flush(&self) -> Result<(), SettingsError> {
        Ok(())
    }
}

/// TOML-file backed store.
#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    table: Mutex<toml::Table>,
}

impl FileSettings {
    /// Load settings from `path`. A missing file starts empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();
        let table = match std::fs::read_to_string(&path) {
            Ok(text) => text.parse::<toml::Table>()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => toml::Table::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), keys = table.len(), "settings loaded");
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, table: &toml::Table) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, toml::to_string(table)?)?;
        Ok(())
    }
}

impl SettingsStore for FileSettings {
    fn get_u16(&self, key: &str) -> Option<u16> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table
            .get(key)
            .and_then(toml::Value::as_integer)
            .and_then(|v| u16::try_from(v).ok())
    }

    fn set_u16(&self, key: &str, value: u16) -> Result<(), SettingsError> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.insert(key.to_string(), toml::Value::Integer(value.into()));
        self.write(&table)
    }

    fn remove(&self, key: &str) -> Result<(), SettingsError> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if table.remove(key).is_some() {
            self.write(&table)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), SettingsError> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        self.write(&table)
    }
}
