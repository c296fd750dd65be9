//! Hardware device session.
//!
//! One dedicated thread owns the [`Transport`]. It probes the device once per
//! poll interval and, between probes, serves queued commands (address
//! resolution, signing, app management). No other thread ever touches the
//! transport, so device calls are strictly serialized.

use crate::error::RECONNECT_HINT;
use crate::looper::{Looper, SessionEvent};
use crate::settings::{KEY_APP_PID, SettingsStore};
use crate::transport::{Transport, TransportError};
use crate::SessionError;
use ledgerbridge_core::{Address, ConnectionState, DeviceSessionConfig, Signature, SigningRequest};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::{broadcast, oneshot};

/// Address reads retried on inconsistent buffers.
const ADDRESS_ATTEMPTS: u32 = 3;

enum Command {
    GetAddress {
        derive_index: u32,
        silent: bool,
        reply: oneshot::Sender<Result<Address, SessionError>>,
    },
    Sign {
        request: SigningRequest,
        reply: SyncSender<Result<Signature, SessionError>>,
    },
    CheckAppInstalled {
        reply: oneshot::Sender<Result<bool, SessionError>>,
    },
    OpenApp {
        reply: oneshot::Sender<Result<bool, SessionError>>,
    },
    /// Interrupts the inter-tick wait, used by `stop`.
    Wake,
}

/// Session over a real device transport.
pub struct LedgerSession {
    looper: Arc<Looper>,
    commands: Sender<Command>,
    pending: Mutex<Option<Worker>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LedgerSession {
    /// Create a session. The polling thread starts on [`LedgerSession::run`].
    pub fn new(
        transport: impl Transport,
        settings: Arc<dyn SettingsStore>,
        config: DeviceSessionConfig,
    ) -> Self {
        let looper = Arc::new(Looper::new(&config));
        let (commands, rx) = mpsc::channel();
        let worker = Worker::new(Box::new(transport), settings, looper.clone(), rx);
        Self {
            looper,
            commands,
            pending: Mutex::new(Some(worker)),
            thread: Mutex::new(None),
        }
    }

    /// Start the polling thread. Calling it again is a no-op.
    pub fn run(&self) -> std::io::Result<()> {
        let worker = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(worker) = worker else {
            return Ok(());
        };
        let handle = std::thread::Builder::new()
            .name("device-session".to_string())
            .spawn(move || worker.run())?;
        *self.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Ask the loop to exit after the call in flight, if any, returns.
    pub fn stop(&self) {
        if self.looper.stop() {
            tracing::info!("stopping device session");
        }
        let _ = self.commands.send(Command::Wake);
    }

    /// Wait for the polling thread to exit.
    pub fn join(&self) {
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            tracing::error!("device session thread panicked");
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.looper.state()
    }

    pub fn can_interact(&self) -> bool {
        self.looper.can_interact()
    }

    pub fn is_running(&self) -> bool {
        self.looper.is_running()
    }

    pub fn set_skip_check(&self, skip: bool) {
        self.looper.set_skip_check(skip);
    }

    pub fn set_infinite_emitting(&self, on: bool) {
        self.looper.set_infinite_emitting(on);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.looper.subscribe()
    }

    /// Resolve the address at `derive_index` on the session thread.
    pub async fn get_address(&self, derive_index: u32, silent: bool) -> Result<Address, SessionError> {
        self.looper.ensure_ready()?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetAddress {
            derive_index,
            silent,
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }

    /// Sign a digest. Blocks the caller until the user confirms or rejects on
    /// the device; call it off any async executor thread.
    pub fn sign_tx(&self, request: SigningRequest) -> Result<Signature, SessionError> {
        self.sign_tx_with(request, || {})
    }

    /// [`LedgerSession::sign_tx`], calling `on_dispatch` once the request is
    /// queued for the device.
    pub fn sign_tx_with(
        &self,
        request: SigningRequest,
        on_dispatch: impl FnOnce(),
    ) -> Result<Signature, SessionError> {
        self.looper.ensure_ready()?;
        let _slot = self.looper.claim_signing().ok_or(SessionError::DeviceBusy)?;
        let (reply, rx) = mpsc::sync_channel(1);
        self.send(Command::Sign { request, reply })?;
        on_dispatch();
        rx.recv().map_err(|_| SessionError::Stopped)?
    }

    /// Check whether the signing app is installed on the device.
    pub async fn check_app_installed(&self) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CheckAppInstalled { reply })?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }

    /// Launch the signing app on the device.
    pub async fn open_app(&self) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::OpenApp { reply })?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }

    fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Stopped)
    }
}

impl Drop for LedgerSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The polling thread's side of a session.
struct Worker {
    transport: Box<dyn Transport>,
    settings: Arc<dyn SettingsStore>,
    looper: Arc<Looper>,
    commands: Receiver<Command>,
}

impl Worker {
    fn new(
        transport: Box<dyn Transport>,
        settings: Arc<dyn SettingsStore>,
        looper: Arc<Looper>,
        commands: Receiver<Command>,
    ) -> Self {
        Self {
            transport,
            settings,
            looper,
            commands,
        }
    }

    fn run(mut self) {
        tracing::info!("device session loop started");
        while self.looper.is_running() {
            self.tick();
            if !self.looper.is_running() {
                break;
            }
            self.serve_until(Instant::now() + self.looper.poll_interval());
        }
        self.transport.close();
        if let Err(err) = self.settings.flush() {
            tracing::warn!(%err, "unable to flush settings");
        }
        self.looper.finish();
        tracing::info!("device session loop finished");
    }

    /// One state-machine step.
    fn tick(&mut self) {
        if self.looper.skip_check() {
            self.transport.close();
            return;
        }
        let observed = self.probe().unwrap_or_else(|err| {
            tracing::debug!(%err, "device probe failed");
            ConnectionState::PermissionError
        });
        self.looper.publish(observed);
    }

    fn probe(&mut self) -> Result<ConnectionState, TransportError> {
        let live_pid = self.transport.opened_app_pid()?;
        let remembered = self.settings.get_u16(KEY_APP_PID);

        match remembered {
            Some(_) if live_pid == 0 => self.transport.init_ext_root(),
            Some(pid) if self.looper.state() == ConnectionState::AppNotOpened => {
                self.transport.reopen_with_app(pid)
            }
            Some(pid) => self.transport.init_ext(pid),
            None if live_pid != 0 => {
                let state = self.transport.reopen_with_app(live_pid)?;
                if state == ConnectionState::AppNotOpened {
                    self.transport.init_ext(0)
                } else {
                    Ok(state)
                }
            }
            None => self.transport.init_ext_root(),
        }
    }

    fn serve_until(&mut self, deadline: Instant) {
        while self.looper.is_running() {
            let Some(timeout) = deadline.checked_duration_since(Instant::now()) else {
                return;
            };
            match self.commands.recv_timeout(timeout) {
                Ok(command) => self.execute(command),
                Err(RecvTimeoutError::Timeout) => return,
                Err(RecvTimeoutError::Disconnected) => {
                    self.looper.stop();
                    return;
                }
            }
        }
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::GetAddress {
                derive_index,
                silent,
                reply,
            } => {
                let _ = reply.send(self.resolve_address(derive_index, silent));
            }
            Command::Sign { request, reply } => {
                let _ = reply.send(self.sign(request));
            }
            Command::CheckAppInstalled { reply } => {
                let _ = reply.send(self.check_app_installed());
            }
            Command::OpenApp { reply } => {
                let _ = reply.send(self.open_app());
            }
            Command::Wake => {}
        }
    }

    fn resolve_address(&mut self, derive_index: u32, silent: bool) -> Result<Address, SessionError> {
        self.looper.ensure_ready()?;
        for attempt in 1..=ADDRESS_ATTEMPTS {
            match self.transport.get_address(derive_index, silent) {
                Ok(address) => {
                    self.remember_opened_app();
                    return Ok(address);
                }
                Err(TransportError::BufferOutOfRange) => {
                    tracing::debug!(attempt, "inconsistent buffer while reading address, retrying");
                    if !self.looper.can_interact() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "address resolution failed");
                    return Err(SessionError::AddressResolutionFailed(format!(
                        "{err}. {RECONNECT_HINT}"
                    )));
                }
            }
        }
        Err(SessionError::AddressResolutionFailed(format!(
            "possibly due to an inconsistent buffer. {RECONNECT_HINT}"
        )))
    }

    /// A successful address read proves the signing app is the one open.
    fn remember_opened_app(&mut self) {
        if self.settings.has(KEY_APP_PID) {
            return;
        }
        match self.transport.opened_app_pid() {
            Ok(0) => {}
            Ok(pid) => {
                tracing::info!(pid, "remembering signing app pid");
                if let Err(err) = self.settings.set_u16(KEY_APP_PID, pid) {
                    tracing::warn!(%err, "unable to persist app pid");
                }
            }
            Err(err) => tracing::warn!(%err, "unable to read opened app pid"),
        }
    }

    fn sign(&mut self, request: SigningRequest) -> Result<Signature, SessionError> {
        self.looper.ensure_ready()?;
        tracing::info!(
            hash = %request.unsigned_hash.to_hex(),
            derive_index = request.derive_index,
            "waiting for user confirmation on device"
        );
        self.transport
            .sign(&request.unsigned_hash, request.derive_index)
            .map_err(|err| match err {
                TransportError::Exchange { code } => SessionError::UserRejected { code },
                other => other.into(),
            })
    }

    fn check_app_installed(&mut self) -> Result<bool, SessionError> {
        let apps = self.transport.list_apps()?;
        let installed = apps.iter().any(|app| app.name == self.looper.app_name());
        if !installed {
            tracing::info!(app = self.looper.app_name(), "signing app is not installed");
            if let Err(err) = self.settings.remove(KEY_APP_PID) {
                tracing::warn!(%err, "unable to forget app pid");
            }
        }
        Ok(installed)
    }

    /// Leaves the remembered pid untouched; only an address read records it.
    fn open_app(&mut self) -> Result<bool, SessionError> {
        let pid = self.transport.run_app(self.looper.app_name())?;
        tracing::info!(pid, app = self.looper.app_name(), "signing app launched");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Call, MockTransport};
    use crate::settings::MemorySettings;
    use crate::transport::{AppInfo, status};
    use ledgerbridge_core::TxHash;
    use std::time::Duration;

    fn worker(mock: &MockTransport, settings: Arc<MemorySettings>) -> Worker {
        worker_with(mock, settings, DeviceSessionConfig::default())
    }

    fn worker_with(
        mock: &MockTransport,
        settings: Arc<MemorySettings>,
        config: DeviceSessionConfig,
    ) -> Worker {
        let (_tx, rx) = mpsc::channel();
        Worker::new(Box::new(mock.clone()), settings, Arc::new(Looper::new(&config)), rx)
    }

    fn fast_config() -> DeviceSessionConfig {
        DeviceSessionConfig {
            poll_interval: Duration::from_millis(10),
            infinite_emitting: false,
            ..Default::default()
        }
    }

    fn hash() -> TxHash {
        TxHash::new([7; 32])
    }

    async fn wait_for_state(session: &LedgerSession, state: ConnectionState) {
        for _ in 0..200 {
            if session.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never reached {state}");
    }

    #[test]
    fn no_remembered_pid_and_no_live_app_does_root_handshake() {
        let mock = MockTransport::new();
        let mut worker = worker(&mock, Arc::new(MemorySettings::new()));
        worker.tick();
        assert_eq!(mock.calls(), vec![Call::OpenedPid, Call::InitExtRoot]);
    }

    #[test]
    fn remembered_pid_without_live_app_still_does_root_handshake() {
        let mock = MockTransport::new();
        let settings = Arc::new(MemorySettings::new());
        settings.set_u16(KEY_APP_PID, 7).unwrap();
        let mut worker = worker(&mock, settings);
        worker.tick();
        assert_eq!(mock.calls(), vec![Call::OpenedPid, Call::InitExtRoot]);
    }

    #[test]
    fn remembered_pid_with_live_app_opens_remembered() {
        let mock = MockTransport::new();
        mock.set_opened_pid(3);
        let settings = Arc::new(MemorySettings::new());
        settings.set_u16(KEY_APP_PID, 7).unwrap();
        let mut worker = worker(&mock, settings);
        worker.tick();
        assert_eq!(mock.calls(), vec![Call::OpenedPid, Call::InitExt(7)]);
    }

    #[test]
    fn remembered_pid_reopens_after_app_not_opened() {
        let mock = MockTransport::new();
        mock.set_opened_pid(3);
        mock.set_handshake(ConnectionState::AppNotOpened);
        let settings = Arc::new(MemorySettings::new());
        settings.set_u16(KEY_APP_PID, 7).unwrap();
        let mut worker = worker(&mock, settings);

        worker.tick();
        assert_eq!(worker.looper.state(), ConnectionState::AppNotOpened);
        mock.clear_calls();

        worker.tick();
        assert_eq!(mock.calls(), vec![Call::OpenedPid, Call::ReopenWithApp(7)]);
    }

    #[test]
    fn live_app_without_remembered_pid_reopens_live() {
        let mock = MockTransport::new();
        mock.set_opened_pid(5);
        let mut worker = worker(&mock, Arc::new(MemorySettings::new()));
        worker.tick();
        assert_eq!(mock.calls(), vec![Call::OpenedPid, Call::ReopenWithApp(5)]);
        assert_eq!(worker.looper.state(), ConnectionState::AppOpened);
    }

    #[test]
    fn live_app_falls_back_to_init_ext_when_still_not_opened() {
        let mock = MockTransport::new();
        mock.set_opened_pid(5);
        mock.set_handshake(ConnectionState::AppNotOpened);
        let mut worker = worker(&mock, Arc::new(MemorySettings::new()));
        worker.tick();
        assert_eq!(
            mock.calls(),
            vec![Call::OpenedPid, Call::ReopenWithApp(5), Call::InitExt(0)]
        );
    }

    #[test]
    fn probe_errors_become_permission_error() {
        let mock = MockTransport::new();
        mock.fail_opened_pid(TransportError::Permission("EACCES".into()));
        let mut worker = worker(&mock, Arc::new(MemorySettings::new()));
        worker.tick();
        assert_eq!(worker.looper.state(), ConnectionState::PermissionError);
    }

    #[test]
    fn skip_check_closes_instead_of_probing() {
        let mock = MockTransport::new();
        let config = DeviceSessionConfig {
            skip_connection_check: true,
            ..Default::default()
        };
        let mut worker = worker_with(&mock, Arc::new(MemorySettings::new()), config);
        worker.tick();
        assert_eq!(mock.calls(), vec![Call::Close]);
    }

    #[test]
    fn infinite_emitting_publishes_every_tick() {
        let mock = MockTransport::new();
        mock.set_opened_pid(5);
        let config = DeviceSessionConfig {
            infinite_emitting: true,
            ..Default::default()
        };
        let mut worker = worker_with(&mock, Arc::new(MemorySettings::new()), config);
        let mut events = worker.looper.subscribe();
        for _ in 0..4 {
            worker.tick();
        }
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            assert_eq!(event, SessionEvent::StateChanged(ConnectionState::AppOpened));
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[test]
    fn state_events_only_on_change_without_infinite_emitting() {
        let mock = MockTransport::new();
        let mut worker = worker_with(&mock, Arc::new(MemorySettings::new()), fast_config());
        let mut events = worker.looper.subscribe();

        mock.set_handshake(ConnectionState::AppOpened);
        worker.tick();
        worker.tick();
        mock.set_handshake(ConnectionState::Disconnected);
        worker.tick();
        worker.tick();

        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::StateChanged(ConnectionState::AppOpened)
        );
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::StateChanged(ConnectionState::Disconnected)
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn address_retries_transient_failures() {
        let mock = MockTransport::new();
        mock.set_opened_pid(9);
        mock.script_addresses([
            Err(TransportError::BufferOutOfRange),
            Err(TransportError::BufferOutOfRange),
            Ok(Address::new("Mx01")),
        ]);
        let settings = Arc::new(MemorySettings::new());
        let mut worker = worker(&mock, settings.clone());
        worker.tick();

        let address = worker.resolve_address(0, true).unwrap();
        assert_eq!(address, Address::new("Mx01"));
        assert_eq!(mock.count(|c| matches!(c, Call::GetAddress(_))), 3);
        assert_eq!(settings.get_u16(KEY_APP_PID), Some(9));
    }

    #[test]
    fn address_gives_up_after_three_transient_failures() {
        let mock = MockTransport::new();
        mock.set_opened_pid(9);
        mock.script_addresses([
            Err(TransportError::BufferOutOfRange),
            Err(TransportError::BufferOutOfRange),
            Err(TransportError::BufferOutOfRange),
            Ok(Address::new("Mx01")),
        ]);
        let settings = Arc::new(MemorySettings::new());
        let mut worker = worker(&mock, settings.clone());
        worker.tick();

        let err = worker.resolve_address(0, true).unwrap_err();
        assert!(matches!(err, SessionError::AddressResolutionFailed(_)));
        assert_eq!(mock.count(|c| matches!(c, Call::GetAddress(_))), 3);
        assert_eq!(settings.get_u16(KEY_APP_PID), None);
    }

    #[test]
    fn address_fails_fast_on_other_errors() {
        let mock = MockTransport::new();
        mock.set_opened_pid(9);
        mock.script_addresses([Err(TransportError::Io("pipe".into()))]);
        let mut worker = worker(&mock, Arc::new(MemorySettings::new()));
        worker.tick();

        let err = worker.resolve_address(0, true).unwrap_err();
        assert!(matches!(err, SessionError::AddressResolutionFailed(msg) if msg.contains("pipe")));
        assert_eq!(mock.count(|c| matches!(c, Call::GetAddress(_))), 1);
    }

    #[test]
    fn existing_remembered_pid_is_not_overwritten() {
        let mock = MockTransport::new();
        mock.set_opened_pid(9);
        let settings = Arc::new(MemorySettings::new());
        settings.set_u16(KEY_APP_PID, 4).unwrap();
        let mut worker = worker(&mock, settings.clone());
        worker.tick();
        worker.resolve_address(0, true).unwrap();
        assert_eq!(settings.get_u16(KEY_APP_PID), Some(4));
    }

    #[test]
    fn device_rejection_maps_to_user_rejected() {
        let mock = MockTransport::new();
        mock.set_opened_pid(9);
        mock.set_sign_result(Err(TransportError::Exchange {
            code: status::USER_REJECTED,
        }));
        let mut worker = worker(&mock, Arc::new(MemorySettings::new()));
        worker.tick();
        let err = worker.sign(SigningRequest::new(hash(), 0)).unwrap_err();
        assert_eq!(
            err,
            SessionError::UserRejected {
                code: status::USER_REJECTED
            }
        );
    }

    #[test]
    fn missing_app_forgets_remembered_pid() {
        let mock = MockTransport::new();
        mock.set_apps(vec![AppInfo {
            name: "Bitcoin".into(),
            version: "2.1.0".into(),
        }]);
        let settings = Arc::new(MemorySettings::new());
        settings.set_u16(KEY_APP_PID, 4).unwrap();
        let mut worker = worker(&mock, settings.clone());

        assert!(!worker.check_app_installed().unwrap());
        assert_eq!(settings.get_u16(KEY_APP_PID), None);
    }

    #[test]
    fn launching_app_does_not_remember_pid() {
        let mock = MockTransport::new();
        mock.set_run_pid(12);
        let settings = Arc::new(MemorySettings::new());
        let mut worker = worker(&mock, settings.clone());

        assert!(worker.open_app().unwrap());
        assert_eq!(mock.calls(), vec![Call::RunApp("Minter".into())]);
        assert_eq!(settings.get_u16(KEY_APP_PID), None);
    }

    #[tokio::test]
    async fn guard_rejects_calls_before_app_is_opened() {
        let mock = MockTransport::new();
        let session = LedgerSession::new(mock.clone(), Arc::new(MemorySettings::new()), fast_config());

        let err = session.get_address(0, true).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::DeviceNotReady {
                state: ConnectionState::Disconnected
            }
        );
        let err = session.sign_tx(SigningRequest::new(hash(), 0)).unwrap_err();
        assert!(matches!(err, SessionError::DeviceNotReady { .. }));

        assert_eq!(mock.count(|c| matches!(c, Call::GetAddress(_) | Call::Sign)), 0);
    }

    #[tokio::test]
    async fn session_serves_address_once_opened() {
        let mock = MockTransport::new();
        mock.set_opened_pid(9);
        let session = LedgerSession::new(mock.clone(), Arc::new(MemorySettings::new()), fast_config());
        session.run().unwrap();
        wait_for_state(&session, ConnectionState::AppOpened).await;

        let address = session.get_address(0, true).await.unwrap();
        assert_eq!(address, MockTransport::default_address());

        session.stop();
        session.join();
    }

    #[tokio::test]
    async fn second_concurrent_sign_is_rejected_as_busy() {
        let mock = MockTransport::new();
        mock.set_opened_pid(9);
        let release = mock.gate_sign();
        let session = Arc::new(LedgerSession::new(
            mock.clone(),
            Arc::new(MemorySettings::new()),
            fast_config(),
        ));
        session.run().unwrap();
        wait_for_state(&session, ConnectionState::AppOpened).await;

        let first = {
            let session = session.clone();
            std::thread::spawn(move || session.sign_tx(SigningRequest::new(hash(), 0)))
        };
        for _ in 0..200 {
            if mock.sign_entered() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(mock.sign_entered());

        let mut announced = false;
        let second = session.sign_tx_with(SigningRequest::new(hash(), 0), || announced = true);
        assert_eq!(second.unwrap_err(), SessionError::DeviceBusy);
        assert!(!announced);

        release.send(()).unwrap();
        assert!(first.join().unwrap().is_ok());
        assert_eq!(mock.max_concurrent_signs(), 1);
        assert_eq!(mock.count(|c| matches!(c, Call::Sign)), 1);

        session.stop();
        session.join();
    }

    #[tokio::test]
    async fn concurrent_stops_finish_once() {
        let mock = MockTransport::new();
        let session = Arc::new(LedgerSession::new(
            mock.clone(),
            Arc::new(MemorySettings::new()),
            fast_config(),
        ));
        let mut events = session.subscribe();
        session.run().unwrap();

        let stoppers: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                std::thread::spawn(move || session.stop())
            })
            .collect();
        for stopper in stoppers {
            stopper.join().unwrap();
        }
        session.join();
        assert!(!session.is_running());

        let mut finished = 0;
        while let Ok(event) = events.try_recv() {
            if event == SessionEvent::Finished {
                finished += 1;
            }
        }
        assert_eq!(finished, 1);
    }

    #[tokio::test]
    async fn stop_lets_in_flight_sign_finish() {
        let mock = MockTransport::new();
        mock.set_opened_pid(9);
        let release = mock.gate_sign();
        let session = Arc::new(LedgerSession::new(
            mock.clone(),
            Arc::new(MemorySettings::new()),
            fast_config(),
        ));
        let mut events = session.subscribe();
        session.run().unwrap();
        wait_for_state(&session, ConnectionState::AppOpened).await;

        let (dispatched_tx, dispatched_rx) = std::sync::mpsc::channel();
        let signing = {
            let session = session.clone();
            std::thread::spawn(move || {
                session.sign_tx_with(SigningRequest::new(hash(), 0), || {
                    dispatched_tx.send(()).unwrap();
                })
            })
        };
        dispatched_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        for _ in 0..200 {
            if mock.sign_entered() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(mock.sign_entered());

        session.stop();
        session.stop();
        release.send(()).unwrap();
        assert!(signing.join().unwrap().is_ok());
        session.join();
        assert!(!session.is_running());

        let mut finished = 0;
        while let Ok(event) = events.try_recv() {
            if event == SessionEvent::Finished {
                finished += 1;
            }
        }
        assert_eq!(finished, 1);
    }

    #[tokio::test]
    async fn commands_after_stop_report_stopped() {
        let mock = MockTransport::new();
        let session = LedgerSession::new(mock, Arc::new(MemorySettings::new()), fast_config());
        session.run().unwrap();
        session.stop();
        session.join();

        assert_eq!(session.check_app_installed().await.unwrap_err(), SessionError::Stopped);
    }
}
