//! Scripted transport for session tests.

use crate::transport::{AppInfo, Transport, TransportError};
use ledgerbridge_core::{Address, ConnectionState, Signature, TxHash};
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    OpenedPid,
    InitExtRoot,
    InitExt(u16),
    ReopenWithApp(u16),
    Close,
    GetAddress(u32),
    Sign,
    ListApps,
    RunApp(String),
}

struct Script {
    opened_pid: Result<u16, TransportError>,
    handshake: ConnectionState,
    addresses: VecDeque<Result<Address, TransportError>>,
    sign_result: Result<Signature, TransportError>,
    sign_gate: Option<mpsc::Receiver<()>>,
    sign_entered: bool,
    signs_in_flight: usize,
    max_signs_in_flight: usize,
    apps: Vec<AppInfo>,
    run_pid: u16,
    calls: Vec<Call>,
}

#[derive(Clone)]
pub(crate) struct MockTransport {
    script: Arc<Mutex<Script>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        let script = Script {
            opened_pid: Ok(0),
            handshake: ConnectionState::AppOpened,
            addresses: VecDeque::new(),
            sign_result: Ok(Signature {
                r: [1; 32],
                s: [2; 32],
                v: 27,
            }),
            sign_gate: None,
            sign_entered: false,
            signs_in_flight: 0,
            max_signs_in_flight: 0,
            apps: vec![AppInfo {
                name: "Minter".into(),
                version: "1.2.0".into(),
            }],
            run_pid: 0,
            calls: Vec::new(),
        };
        Self {
            script: Arc::new(Mutex::new(script)),
        }
    }

    pub(crate) fn default_address() -> Address {
        Address::new("Mx7633980c000139dd3bd24a3f54e06474fa941e16")
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub(crate) fn set_opened_pid(&self, pid: u16) {
        self.lock().opened_pid = Ok(pid);
    }

    pub(crate) fn fail_opened_pid(&self, err: TransportError) {
        self.lock().opened_pid = Err(err);
    }

    pub(crate) fn set_handshake(&self, state: ConnectionState) {
        self.lock().handshake = state;
    }

    pub(crate) fn script_addresses(
        &self,
        results: impl IntoIterator<Item = Result<Address, TransportError>>,
    ) {
        self.lock().addresses.extend(results);
    }

    pub(crate) fn set_sign_result(&self, result: Result<Signature, TransportError>) {
        self.lock().sign_result = result;
    }

    /// Make the next sign block until the returned sender fires.
    pub(crate) fn gate_sign(&self) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        self.lock().sign_gate = Some(rx);
        tx
    }

    pub(crate) fn sign_entered(&self) -> bool {
        self.lock().sign_entered
    }

    pub(crate) fn max_concurrent_signs(&self) -> usize {
        self.lock().max_signs_in_flight
    }

    pub(crate) fn set_apps(&self, apps: Vec<AppInfo>) {
        self.lock().apps = apps;
    }

    pub(crate) fn set_run_pid(&self, pid: u16) {
        self.lock().run_pid = pid;
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: Call) -> MutexGuard<'_, Script> {
        let mut script = self.lock();
        script.calls.push(call);
        script
    }
}

impl Transport for MockTransport {
    fn opened_app_pid(&mut self) -> Result<u16, TransportError> {
        self.record(Call::OpenedPid).opened_pid.clone()
    }

    fn init_ext_root(&mut self) -> Result<ConnectionState, TransportError> {
        Ok(self.record(Call::InitExtRoot).handshake)
    }

    fn init_ext(&mut self, pid: u16) -> Result<ConnectionState, TransportError> {
        Ok(self.record(Call::InitExt(pid)).handshake)
    }

    fn reopen_with_app(&mut self, pid: u16) -> Result<ConnectionState, TransportError> {
        Ok(self.record(Call::ReopenWithApp(pid)).handshake)
    }

    fn close(&mut self) {
        drop(self.record(Call::Close));
    }

    fn get_address(&mut self, derive_index: u32, _silent: bool) -> Result<Address, TransportError> {
        self.record(Call::GetAddress(derive_index))
            .addresses
            .pop_front()
            .unwrap_or_else(|| Ok(Self::default_address()))
    }

    fn sign(&mut self, _hash: &TxHash, _derive_index: u32) -> Result<Signature, TransportError> {
        let gate = {
            let mut script = self.record(Call::Sign);
            script.sign_entered = true;
            script.signs_in_flight += 1;
            script.max_signs_in_flight = script.max_signs_in_flight.max(script.signs_in_flight);
            script.sign_gate.take()
        };
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        let mut script = self.lock();
        script.signs_in_flight -= 1;
        script.sign_result.clone()
    }

    fn list_apps(&mut self) -> Result<Vec<AppInfo>, TransportError> {
        Ok(self.record(Call::ListApps).apps.clone())
    }

    fn run_app(&mut self, name: &str) -> Result<u16, TransportError> {
        Ok(self.record(Call::RunApp(name.to_string())).run_pid)
    }
}
