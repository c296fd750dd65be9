//! State shared between a session handle and its polling thread.

use ledgerbridge_core::{ConnectionState, DeviceSessionConfig};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Notifications published by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// The polling loop has exited. Sent once.
    Finished,
}

pub(crate) struct Looper {
    state: AtomicU8,
    running: AtomicBool,
    skip_check: AtomicBool,
    infinite_emitting: AtomicBool,
    signing: AtomicBool,
    poll_interval: Duration,
    app_name: String,
    events: broadcast::Sender<SessionEvent>,
    sleeper: (Mutex<()>, Condvar),
}

impl Looper {
    pub(crate) fn new(config: &DeviceSessionConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected.to_u8()),
            running: AtomicBool::new(true),
            skip_check: AtomicBool::new(config.skip_connection_check),
            infinite_emitting: AtomicBool::new(config.infinite_emitting),
            signing: AtomicBool::new(false),
            poll_interval: config.poll_interval,
            app_name: config.app_name.clone(),
            events,
            sleeper: (Mutex::new(()), Condvar::new()),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn can_interact(&self) -> bool {
        self.state().can_interact()
    }

    pub(crate) fn ensure_ready(&self) -> Result<(), crate::SessionError> {
        let state = self.state();
        if state.can_interact() {
            Ok(())
        } else {
            Err(crate::SessionError::not_ready(state))
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Returns `true` for the call that actually stopped the loop.
    pub(crate) fn stop(&self) -> bool {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        let _guard = self.sleeper.0.lock().unwrap_or_else(|e| e.into_inner());
        self.sleeper.1.notify_all();
        was_running
    }

    pub(crate) fn skip_check(&self) -> bool {
        self.skip_check.load(Ordering::Acquire)
    }

    pub(crate) fn set_skip_check(&self, skip: bool) {
        self.skip_check.store(skip, Ordering::Release);
    }

    pub(crate) fn infinite_emitting(&self) -> bool {
        self.infinite_emitting.load(Ordering::Acquire)
    }

    pub(crate) fn set_infinite_emitting(&self, on: bool) {
        self.infinite_emitting.store(on, Ordering::Release);
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub(crate) fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Record a probe result. Publishes when the state changed or when
    /// infinite emitting is on; returns whether an event went out.
    pub(crate) fn publish(&self, observed: ConnectionState) -> bool {
        let previous = self.state();
        if observed == previous && !self.infinite_emitting() {
            return false;
        }
        self.state.store(observed.to_u8(), Ordering::Release);
        if observed != previous {
            tracing::info!(from = %previous, to = %observed, "device state changed");
        }
        // No subscribers is fine.
        let _ = self.events.send(SessionEvent::StateChanged(observed));
        true
    }

    pub(crate) fn finish(&self) {
        let _ = self.events.send(SessionEvent::Finished);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Sleep one poll interval, waking early on `stop`.
    pub(crate) fn sleep_tick(&self) {
        let guard = self.sleeper.0.lock().unwrap_or_else(|e| e.into_inner());
        if !self.is_running() {
            return;
        }
        let _ = self
            .sleeper
            .1
            .wait_timeout(guard, self.poll_interval)
            .unwrap_or_else(|e| e.into_inner());
    }

    /// Claim the single signing slot.
    pub(crate) fn claim_signing(&self) -> Option<SigningSlot<'_>> {
        self.signing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SigningSlot { looper: self })
    }
}

/// Held while a signature is outstanding.
pub(crate) struct SigningSlot<'a> {
    looper: &'a Looper,
}

impl Drop for SigningSlot<'_> {
    fn drop(&mut self) {
        self.looper.signing.store(false, Ordering::Release);
    }
}
