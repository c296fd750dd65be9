//! Address → init data → unsigned tx → device signature → broadcast.

use crate::gate::{GateError, GateRepository, SendOutcome, TxInitData};
use ledgerbridge_core::{Signature, SigningRequest, TxHash};
use ledgerbridge_device::{Device, SessionError};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Init,
    AwaitingInitData,
    AwaitingUserApproval,
    AwaitingBroadcast,
    Done,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("network failure: {0}")]
    Network(#[from] GateError),
    #[error("unable to build transaction: {0}")]
    Build(String),
}

impl PipelineError {
    /// True when the user declined on the device.
    pub fn is_user_rejection(&self) -> bool {
        matches!(self, PipelineError::Session(SessionError::UserRejected { .. }))
    }
}

/// A transaction the user is preparing, not yet bound to a nonce or fee.
pub trait TxDraft: Send {
    fn build(self: Box<Self>, init: &TxInitData) -> Result<Box<dyn UnsignedTx>, PipelineError>;
}

/// A fully specified transaction waiting for its signature.
pub trait UnsignedTx: Send {
    fn unsigned_hash(&self) -> TxHash;

    /// Attach the signature and return the encoded signed bytes.
    fn sign_external(self: Box<Self>, signature: &Signature) -> Vec<u8>;
}

pub type ProgressFn = Box<dyn Fn(PipelineStage) + Send + Sync>;

pub struct SigningPipeline {
    device: Device,
    gate: Arc<dyn GateRepository>,
    progress: Option<ProgressFn>,
}

impl SigningPipeline {
    pub fn new(device: Device, gate: Arc<dyn GateRepository>) -> Self {
        Self {
            device,
            gate,
            progress: None,
        }
    }

    pub fn on_progress(mut self, progress: impl Fn(PipelineStage) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn enter(&self, stage: PipelineStage) {
        tracing::debug!(?stage, "pipeline stage");
        if let Some(progress) = &self.progress {
            progress(stage);
        }
    }

    /// Run `draft` through every stage. One sign attempt, no resubmission.
    pub async fn submit(
        &self,
        draft: Box<dyn TxDraft>,
        derive_index: u32,
    ) -> Result<SendOutcome, PipelineError> {
        self.enter(PipelineStage::Init);
        let result = self.run(draft, derive_index).await;
        match &result {
            Ok(outcome) => {
                tracing::info!(?outcome, "pipeline finished");
                self.enter(PipelineStage::Done);
            }
            Err(err) => {
                tracing::warn!(%err, "pipeline failed");
                self.enter(PipelineStage::Failed);
            }
        }
        result
    }

    async fn run(&self, draft: Box<dyn TxDraft>, derive_index: u32) -> Result<SendOutcome, PipelineError> {
        let address = self.device.get_address(derive_index, true).await?;

        self.enter(PipelineStage::AwaitingInitData);
        let init = self.gate.tx_init_data(&address).await?;

        let unsigned = draft.build(&init)?;
        let hash = unsigned.unsigned_hash();

        self.enter(PipelineStage::AwaitingUserApproval);
        let signature = self.sign_digest(hash, derive_index).await?;
        let signed = unsigned.sign_external(&signature);

        self.enter(PipelineStage::AwaitingBroadcast);
        Ok(self.gate.send_tx(&hex::encode(signed)).await?)
    }

    /// Sign a digest on the blocking pool.
    pub async fn sign_digest(&self, hash: TxHash, derive_index: u32) -> Result<Signature, PipelineError> {
        self.sign_digest_with(hash, derive_index, || {}).await
    }

    /// [`SigningPipeline::sign_digest`], calling `on_dispatch` once the device
    /// has accepted the request and is waiting on the user.
    pub async fn sign_digest_with(
        &self,
        hash: TxHash,
        derive_index: u32,
        on_dispatch: impl FnOnce() + Send + 'static,
    ) -> Result<Signature, PipelineError> {
        let device = self.device.clone();
        let request = SigningRequest::new(hash, derive_index);
        let mut on_dispatch = Some(on_dispatch);
        tokio::task::spawn_blocking(move || {
            device.sign_tx_with(request, &mut || {
                if let Some(notify) = on_dispatch.take() {
                    notify();
                }
            })
        })
            .await
            .map_err(|e| PipelineError::Build(format!("signing task failed: {e}")))?
            .map_err(PipelineError::from)
    }
}
