//! In-memory device backend for gateway and pipeline tests.

use crate::gate::{GateError, GateRepository, SendOutcome, TxInitData};
use async_trait::async_trait;
use ledgerbridge_core::{Address, ConnectionState, Signature, SigningRequest};
use ledgerbridge_device::{Device, DeviceBackend, SessionError, SessionEvent};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

pub(crate) struct FakeBackend {
    state: AtomicU8,
    sign_result: Mutex<Result<Signature, SessionError>>,
    sign_calls: AtomicUsize,
    address_calls: AtomicUsize,
    events: broadcast::Sender<SessionEvent>,
}

impl FakeBackend {
    fn with_state(state: ConnectionState) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            state: AtomicU8::new(state.to_u8()),
            sign_result: Mutex::new(Ok(Self::signature())),
            sign_calls: AtomicUsize::new(0),
            address_calls: AtomicUsize::new(0),
            events,
        })
    }

    pub(crate) fn opened() -> Arc<Self> {
        Self::with_state(ConnectionState::AppOpened)
    }

    pub(crate) fn closed() -> Arc<Self> {
        Self::with_state(ConnectionState::AppNotOpened)
    }

    pub(crate) fn signature() -> Signature {
        Signature {
            r: [0xaa; 32],
            s: [0xbb; 32],
            v: 27,
        }
    }

    pub(crate) fn address() -> Address {
        Address::new("Mx0000000000000000000000000000000000000001")
    }

    pub(crate) fn device(self: &Arc<Self>) -> Device {
        Device::new(self.clone())
    }

    pub(crate) fn reject_with(&self, code: u16) {
        *self.sign_result.lock().unwrap() = Err(SessionError::UserRejected { code });
    }

    pub(crate) fn fail_with(&self, err: SessionError) {
        *self.sign_result.lock().unwrap() = Err(err);
    }

    /// Change the state and publish it like a polling loop would.
    pub(crate) fn transition(&self, state: ConnectionState) {
        self.state.store(state.to_u8(), Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::StateChanged(state));
    }

    pub(crate) fn finish(&self) {
        let _ = self.events.send(SessionEvent::Finished);
    }

    pub(crate) fn sign_calls(&self) -> usize {
        self.sign_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn address_calls(&self) -> usize {
        self.address_calls.load(Ordering::SeqCst)
    }

    fn guard(&self) -> Result<(), SessionError> {
        let state = self.state();
        if state.can_interact() {
            Ok(())
        } else {
            Err(SessionError::DeviceNotReady { state })
        }
    }
}

#[async_trait]
impl DeviceBackend for FakeBackend {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn set_skip_check(&self, _skip: bool) {}

    fn set_infinite_emitting(&self, _on: bool) {}

    fn is_running(&self) -> bool {
        true
    }

    fn run(&self) -> std::io::Result<()> {
        Ok(())
    }

    fn stop(&self) {}

    fn join(&self) {}

    async fn get_address(&self, _derive_index: u32, _silent: bool) -> Result<Address, SessionError> {
        self.guard()?;
        self.address_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::address())
    }

    fn sign_tx_with(
        &self,
        _request: SigningRequest,
        on_dispatch: &mut (dyn FnMut() + Send),
    ) -> Result<Signature, SessionError> {
        self.guard()?;
        let result = self.sign_result.lock().unwrap().clone();
        if let Err(SessionError::DeviceBusy) = result {
            return result;
        }
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        on_dispatch();
        result
    }

    async fn check_app_installed(&self) -> Result<bool, SessionError> {
        Ok(true)
    }

    async fn open_app(&self) -> Result<bool, SessionError> {
        Ok(true)
    }
}

/// Gate that is never expected to be reached.
pub(crate) struct OfflineGate;

#[async_trait]
impl GateRepository for OfflineGate {
    async fn tx_init_data(&self, _address: &Address) -> Result<TxInitData, GateError> {
        Err(GateError::Malformed("offline".into()))
    }

    async fn send_tx(&self, _signed_tx: &str) -> Result<SendOutcome, GateError> {
        Err(GateError::Malformed("offline".into()))
    }
}
