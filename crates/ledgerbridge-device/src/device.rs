//! Backend-agnostic device handle.

use crate::looper::SessionEvent;
use crate::mnemonic::{MnemonicError, MnemonicSigner};
use crate::session::LedgerSession;
use crate::settings::SettingsStore;
use crate::transport::Transport;
use crate::SessionError;
use async_trait::async_trait;
use ledgerbridge_core::{Address, ConnectionState, DeviceSessionConfig, Signature, SigningRequest};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Operations every signing backend provides.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    fn state(&self) -> ConnectionState;

    fn can_interact(&self) -> bool {
        self.state().can_interact()
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    fn set_skip_check(&self, skip: bool);

    fn set_infinite_emitting(&self, on: bool);

    fn is_running(&self) -> bool;

    /// Start the backend's polling loop.
    fn run(&self) -> std::io::Result<()>;

    /// Stop the polling loop. Idempotent.
    fn stop(&self);

    /// Wait for the polling loop to exit after [`DeviceBackend::stop`].
    fn join(&self);

    async fn get_address(&self, derive_index: u32, silent: bool) -> Result<Address, SessionError>;

    /// Blocks until the user decides. Do not call from an async executor thread.
    fn sign_tx(&self, request: SigningRequest) -> Result<Signature, SessionError> {
        self.sign_tx_with(request, &mut || {})
    }

    /// Like [`DeviceBackend::sign_tx`], calling `on_dispatch` once the request
    /// holds the signing slot and is on its way to the user. Requests refused
    /// up front (not ready, busy) never call it.
    fn sign_tx_with(
        &self,
        request: SigningRequest,
        on_dispatch: &mut (dyn FnMut() + Send),
    ) -> Result<Signature, SessionError>;

    async fn check_app_installed(&self) -> Result<bool, SessionError>;

    async fn open_app(&self) -> Result<bool, SessionError>;
}

#[async_trait]
impl DeviceBackend for LedgerSession {
    fn state(&self) -> ConnectionState {
        LedgerSession::state(self)
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        LedgerSession::subscribe(self)
    }

    fn set_skip_check(&self, skip: bool) {
        LedgerSession::set_skip_check(self, skip)
    }

    fn set_infinite_emitting(&self, on: bool) {
        LedgerSession::set_infinite_emitting(self, on)
    }

    fn is_running(&self) -> bool {
        LedgerSession::is_running(self)
    }

    fn run(&self) -> std::io::Result<()> {
        LedgerSession::run(self)
    }

    fn stop(&self) {
        LedgerSession::stop(self)
    }

    fn join(&self) {
        LedgerSession::join(self)
    }

    async fn get_address(&self, derive_index: u32, silent: bool) -> Result<Address, SessionError> {
        LedgerSession::get_address(self, derive_index, silent).await
    }

    fn sign_tx_with(
        &self,
        request: SigningRequest,
        on_dispatch: &mut (dyn FnMut() + Send),
    ) -> Result<Signature, SessionError> {
        LedgerSession::sign_tx_with(self, request, on_dispatch)
    }

    async fn check_app_installed(&self) -> Result<bool, SessionError> {
        LedgerSession::check_app_installed(self).await
    }

    async fn open_app(&self) -> Result<bool, SessionError> {
        LedgerSession::open_app(self).await
    }
}

#[async_trait]
impl DeviceBackend for MnemonicSigner {
    fn state(&self) -> ConnectionState {
        MnemonicSigner::state(self)
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        MnemonicSigner::subscribe(self)
    }

    fn set_skip_check(&self, skip: bool) {
        MnemonicSigner::set_skip_check(self, skip)
    }

    fn set_infinite_emitting(&self, on: bool) {
        MnemonicSigner::set_infinite_emitting(self, on)
    }

    fn is_running(&self) -> bool {
        MnemonicSigner::is_running(self)
    }

    fn run(&self) -> std::io::Result<()> {
        MnemonicSigner::run(self)
    }

    fn stop(&self) {
        MnemonicSigner::stop(self)
    }

    fn join(&self) {
        MnemonicSigner::join(self)
    }

    async fn get_address(&self, derive_index: u32, silent: bool) -> Result<Address, SessionError> {
        MnemonicSigner::get_address(self, derive_index, silent).await
    }

    fn sign_tx_with(
        &self,
        request: SigningRequest,
        on_dispatch: &mut (dyn FnMut() + Send),
    ) -> Result<Signature, SessionError> {
        MnemonicSigner::sign_tx_with(self, request, on_dispatch)
    }

    async fn check_app_installed(&self) -> Result<bool, SessionError> {
        MnemonicSigner::check_app_installed(self).await
    }

    async fn open_app(&self) -> Result<bool, SessionError> {
        MnemonicSigner::open_app(self).await
    }
}

/// Shared handle to whichever backend is in use.
#[derive(Clone)]
pub struct Device {
    backend: Arc<dyn DeviceBackend>,
}

impl Device {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self { backend }
    }

    /// Hardware session over `transport`.
    pub fn ledger(
        transport: impl Transport,
        settings: Arc<dyn SettingsStore>,
        config: DeviceSessionConfig,
    ) -> Self {
        Self::new(Arc::new(LedgerSession::new(transport, settings, config)))
    }

    /// Software signer keyed by `phrase`.
    pub fn mnemonic(phrase: &str, config: DeviceSessionConfig) -> Result<Self, MnemonicError> {
        Ok(Self::new(Arc::new(MnemonicSigner::new(phrase, config)?)))
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }
}

impl std::ops::Deref for Device {
    type Target = dyn DeviceBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("state", &self.backend.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::settings::MemorySettings;
    use std::time::Duration;

    #[tokio::test]
    async fn ledger_device_reports_through_facade() {
        let mock = MockTransport::new();
        mock.set_opened_pid(2);
        let config = DeviceSessionConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let device = Device::ledger(mock, Arc::new(MemorySettings::new()), config);
        let mut events = device.subscribe();
        device.run().unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, SessionEvent::StateChanged(ConnectionState::AppOpened));
        assert!(device.can_interact());

        let clone = device.clone();
        clone.stop();
        device.join();
        assert!(!device.is_running());
    }

    #[test]
    fn mnemonic_device_rejects_empty_phrase() {
        assert!(Device::mnemonic("", DeviceSessionConfig::default()).is_err());
    }
}
