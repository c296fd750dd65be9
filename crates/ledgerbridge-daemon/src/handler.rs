//! Gateway protocol: turns client actions into device calls and device
//! outcomes into wire messages.
//!
//! Stream clients get intermediate events (`event_user_action_required`,
//! `event_user_action_result`) before the result. HTTP clients get exactly one
//! terminal message per request.

use crate::pipeline::{PipelineError, SigningPipeline};
use crate::registry::{ConnectionId, ConnectionRegistry};
use ledgerbridge_core::{ConnectionState, GatewayMessage, MessageKind, Signature, TxHash};
use ledgerbridge_device::{Device, SessionError, SessionEvent, status};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Derivation index used for gateway requests.
const DERIVE_INDEX: u32 = 0;

pub struct Gateway {
    pipeline: Arc<SigningPipeline>,
    registry: Arc<ConnectionRegistry>,
    request_timeout: Duration,
}

impl Gateway {
    pub fn new(pipeline: Arc<SigningPipeline>, request_timeout: Duration) -> Self {
        Self {
            pipeline,
            registry: Arc::new(ConnectionRegistry::new()),
            request_timeout,
        }
    }

    pub fn device(&self) -> &Device {
        self.pipeline.device()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn state_message(&self) -> GatewayMessage {
        state_changed(self.device().state())
    }

    /// Register a stream client and greet it with the current state.
    pub async fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<GatewayMessage>) {
        let (id, rx) = self.registry.register().await;
        self.registry.send(id, self.state_message()).await;
        (id, rx)
    }

    pub async fn disconnect(&self, id: ConnectionId) {
        self.registry.deregister(id).await;
    }

    /// Handle one text frame from a stream client.
    pub async fn handle_text(&self, id: ConnectionId, text: &str) {
        match GatewayMessage::parse(text) {
            Ok(message) if message.kind.is_action() => self.handle_stream(id, message).await,
            Ok(message) => tracing::debug!(id, kind = %message.kind, "ignoring non-action message"),
            Err(err) => {
                tracing::debug!(id, %err, "unparseable frame");
                self.registry.send(id, GatewayMessage::error(err.to_string())).await;
            }
        }
    }

    pub async fn handle_stream(&self, id: ConnectionId, message: GatewayMessage) {
        tracing::debug!(id, kind = %message.kind, "stream action");
        match message.kind {
            MessageKind::ActionGetDeviceState => {
                let reply = GatewayMessage::with_value(
                    MessageKind::ResultGetDeviceState,
                    self.device().state().as_str(),
                );
                self.registry.send(id, reply).await;
            }
            MessageKind::ActionGetAddress => {
                let reply = self.get_address().await;
                self.registry.send(id, reply).await;
            }
            MessageKind::ActionSignTx => self.stream_sign(id, &message).await,
            other => tracing::debug!(id, kind = %other, "not an action"),
        }
    }

    async fn stream_sign(&self, id: ConnectionId, message: &GatewayMessage) {
        if let Err(err) = self.ensure_ready() {
            self.registry.send(id, session_failure(&err)).await;
            return;
        }
        let raw = message
            .payload_str("tx")
            .or(message.value.as_deref())
            .unwrap_or_default();
        let hash = match TxHash::from_hex(raw) {
            Ok(hash) => hash,
            Err(err) => {
                let reply = GatewayMessage::error(format!("Unable to sign tx: {err}"));
                self.registry.send(id, reply).await;
                return;
            }
        };

        let (dispatched_tx, dispatched) = oneshot::channel();
        let signing = self.pipeline.sign_digest_with(hash, DERIVE_INDEX, move || {
            let _ = dispatched_tx.send(());
        });
        // Announce only once the device holds the request.
        let announce = async {
            if dispatched.await.is_ok() {
                self.registry
                    .send(id, GatewayMessage::new(MessageKind::EventUserActionRequired))
                    .await;
            }
        };
        let (signed, ()) = tokio::join!(signing, announce);
        match signed {
            Ok(signature) => {
                self.registry.send(id, user_action_result(status::SUCCESS)).await;
                self.registry.send(id, sign_result(&signature)).await;
            }
            Err(err) => self.registry.send(id, pipeline_failure(&err)).await,
        }
    }

    /// Serve one HTTP action, bounded by the request timeout.
    ///
    /// On timeout a pending device call keeps running on its own thread.
    pub async fn handle_http(&self, kind: MessageKind, tx: Option<&str>) -> GatewayMessage {
        match tokio::time::timeout(self.request_timeout, self.http_action(kind, tx)).await {
            Ok(reply) => reply,
            Err(_) => {
                tracing::warn!(%kind, "request timed out");
                GatewayMessage::error(format!(
                    "Request timed out after {}s waiting for the device",
                    self.request_timeout.as_secs()
                ))
            }
        }
    }

    async fn http_action(&self, kind: MessageKind, tx: Option<&str>) -> GatewayMessage {
        match kind {
            MessageKind::ActionGetDeviceState => GatewayMessage::with_value(
                MessageKind::ResultGetDeviceState,
                self.device().state().as_str(),
            ),
            MessageKind::ActionGetAddress => self.get_address().await,
            MessageKind::ActionSignTx => {
                if let Err(err) = self.ensure_ready() {
                    return session_failure(&err);
                }
                let Some(raw) = tx else {
                    return GatewayMessage::error("GET parameter tx is required");
                };
                let hash = match TxHash::from_hex(raw) {
                    Ok(hash) => hash,
                    Err(err) => return GatewayMessage::error(format!("GET parameter tx has {err}")),
                };
                match self.pipeline.sign_digest(hash, DERIVE_INDEX).await {
                    Ok(signature) => sign_result(&signature),
                    Err(err) => pipeline_failure(&err),
                }
            }
            other => GatewayMessage::error(format!("Unsupported action: {other}")),
        }
    }

    async fn get_address(&self) -> GatewayMessage {
        if let Err(err) = self.ensure_ready() {
            return session_failure(&err);
        }
        match self.device().get_address(DERIVE_INDEX, true).await {
            Ok(address) => GatewayMessage::with_value(MessageKind::ResultGetAddress, address.as_str()),
            Err(err) => session_failure(&err),
        }
    }

    fn ensure_ready(&self) -> Result<(), SessionError> {
        let state = self.device().state();
        if state.can_interact() {
            Ok(())
        } else {
            Err(SessionError::DeviceNotReady { state })
        }
    }

    /// Forward device state changes to every stream client until the
    /// session finishes.
    pub fn spawn_state_broadcast(&self) -> JoinHandle<()> {
        let mut events = self.device().subscribe();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::StateChanged(state)) => {
                        let delivered = registry.broadcast(&state_changed(state)).await;
                        tracing::trace!(%state, delivered, "state broadcast");
                    }
                    Ok(SessionEvent::Finished) | Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "state broadcaster lagged");
                    }
                }
            }
            tracing::debug!("state broadcaster finished");
        })
    }
}

fn state_changed(state: ConnectionState) -> GatewayMessage {
    GatewayMessage::with_value(MessageKind::EventDeviceStateChanged, state.as_str())
}

fn user_action_result(code: u16) -> GatewayMessage {
    let value = if code == status::SUCCESS {
        "success"
    } else {
        status::name(code)
    };
    GatewayMessage::with_value(MessageKind::EventUserActionResult, value).with_payload("status_code", code)
}

fn sign_result(signature: &Signature) -> GatewayMessage {
    GatewayMessage::new(MessageKind::ResultSignTx)
        .with_payload("r", signature.r_hex())
        .with_payload("s", signature.s_hex())
        .with_payload("v", signature.v_hex())
}

fn session_failure(err: &SessionError) -> GatewayMessage {
    match err {
        SessionError::UserRejected { code } => user_action_result(*code),
        SessionError::DeviceNotReady { state } => {
            GatewayMessage::error(err.to_string()).with_payload("state", state.as_str())
        }
        other => GatewayMessage::error(other.to_string()),
    }
}

fn pipeline_failure(err: &PipelineError) -> GatewayMessage {
    match err {
        PipelineError::Session(err) => session_failure(err),
        other => GatewayMessage::error(other.to_string()),
    }
}
