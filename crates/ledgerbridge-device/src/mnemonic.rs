//! Software signer for development without hardware.
//!
//! Holds the secp256k1 key a wallet derives from a BIP-39 phrase at
//! [`DERIVATION_PATH`] and pretends to be a device that always has its app
//! open. Every confirmation takes a fixed delay so clients see the same
//! pacing as with a real device.

use crate::looper::{Looper, SessionEvent};
use crate::transport::{TransportError, status};
use crate::SessionError;
use bip32::{DerivationPath, XPrv};
use bip39::Mnemonic;
use k256::ecdsa::SigningKey;
use ledgerbridge_core::{Address, ConnectionState, DeviceSessionConfig, Signature, SigningRequest};
use sha3::{Digest, Keccak256};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::broadcast;

/// Default simulated user confirmation time.
pub const DEFAULT_CONFIRM_DELAY: Duration = Duration::from_secs(1);

/// First account of the wallet.
pub const DERIVATION_PATH: &str = "m/44'/60'/0'/0/0";

#[derive(Debug, thiserror::Error)]
pub enum MnemonicError {
    #[error("mnemonic phrase is empty")]
    Empty,
    #[error("invalid mnemonic phrase: {0}")]
    InvalidPhrase(#[from] bip39::Error),
    #[error("phrase does not derive a valid secp256k1 key: {0}")]
    InvalidKey(#[from] bip32::Error),
}

/// Device backend that signs with a key held in memory.
pub struct MnemonicSigner {
    key: SigningKey,
    address: Address,
    confirm_delay: Duration,
    looper: Arc<Looper>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MnemonicSigner {
    pub fn new(phrase: &str, config: DeviceSessionConfig) -> Result<Self, MnemonicError> {
        let phrase = phrase.trim();
        if phrase.is_empty() {
            return Err(MnemonicError::Empty);
        }
        let seed = Mnemonic::parse_normalized(phrase)?.to_seed("");
        let path: DerivationPath = DERIVATION_PATH.parse()?;
        let key = XPrv::derive_from_path(seed, &path)?.private_key().clone();
        let address = address_of(&key);
        tracing::debug!(%address, "software signer ready");
        Ok(Self {
            key,
            address,
            confirm_delay: DEFAULT_CONFIRM_DELAY,
            looper: Arc::new(Looper::new(&config)),
            thread: Mutex::new(None),
        })
    }

    pub fn with_confirm_delay(mut self, delay: Duration) -> Self {
        self.confirm_delay = delay;
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Start publishing `APP_OPENED`. Calling it again is a no-op.
    pub fn run(&self) -> std::io::Result<()> {
        let mut thread = self.thread.lock().unwrap_or_else(|e| e.into_inner());
        if thread.is_some() || !self.looper.is_running() {
            return Ok(());
        }
        let looper = self.looper.clone();
        *thread = Some(
            std::thread::Builder::new()
                .name("mnemonic-session".to_string())
                .spawn(move || {
                    while looper.is_running() {
                        if !looper.skip_check() {
                            looper.publish(ConnectionState::AppOpened);
                        }
                        looper.sleep_tick();
                    }
                    looper.finish();
                })?,
        );
        Ok(())
    }

    pub fn stop(&self) {
        if self.looper.stop() {
            tracing::info!("stopping software signer");
        }
    }

    pub fn join(&self) {
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            tracing::error!("software signer thread panicked");
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

    /// The same address for every derivation index.
    pub async fn get_address(&self, _derive_index: u32, _silent: bool) -> Result<Address, SessionError> {
        self.looper.ensure_ready()?;
        tokio::time::sleep(self.confirm_delay).await;
        Ok(self.address.clone())
    }

    /// Blocks for the confirmation delay, then signs the digest.
    pub fn sign_tx(&self, request: SigningRequest) -> Result<Signature, SessionError> {
        self.sign_tx_with(request, || {})
    }

    pub fn sign_tx_with(
        &self,
        request: SigningRequest,
        on_dispatch: impl FnOnce(),
    ) -> Result<Signature, SessionError> {
        self.looper.ensure_ready()?;
        let _slot = self.looper.claim_signing().ok_or(SessionError::DeviceBusy)?;
        on_dispatch();
        std::thread::sleep(self.confirm_delay);
        self.sign_digest(request.unsigned_hash.as_bytes())
    }

    pub async fn check_app_installed(&self) -> Result<bool, SessionError> {
        tokio::time::sleep(self.confirm_delay).await;
        Ok(true)
    }

    pub async fn open_app(&self) -> Result<bool, SessionError> {
        tokio::time::sleep(self.confirm_delay).await;
        Ok(true)
    }

    fn sign_digest(&self, digest: &[u8; 32]) -> Result<Signature, SessionError> {
        let (sig, recid) = self.key.sign_prehash_recoverable(digest).map_err(|err| {
            tracing::warn!(%err, "software signing failed");
            SessionError::Transport(TransportError::Exchange {
                code: status::NO_STATUS_RESULT,
            })
        })?;
        let bytes = sig.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        Ok(Signature {
            r,
            s,
            v: recid.to_byte() + 27,
        })
    }
}

impl Drop for MnemonicSigner {
    fn drop(&mut self) {
        self.looper.stop();
    }
}

/// `Mx` followed by the last 20 bytes of the Keccak-256 of the public key.
fn address_of(key: &SigningKey) -> Address {
    let point = key.verifying_key().to_encoded_point(false);
    let digest = Keccak256::digest(&point.as_bytes()[1..]);
    Address::new(format!("Mx{}", hex::encode(&digest[12..])))
}
