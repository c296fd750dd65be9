//! Gateway wire messages.
//!
//! Every frame is a JSON object `{type, value, payload}`. Outbound messages always
//! carry `payload.type_code`, the numeric backing of `type`, for clients that
//! dispatch on integers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Closed set of message types. Codes are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Device state changed, or a new client needs the current one.
    EventDeviceStateChanged = 0,
    /// The device waits for the user to approve or reject.
    EventUserActionRequired = 1,
    /// Outcome of the user's decision on the device.
    EventUserActionResult = 2,
    EventError = 3,
    ActionGetAddress = 4,
    ResultGetAddress = 5,
    ActionSignTx = 6,
    ResultSignTx = 7,
    ActionGetDeviceState = 8,
    ResultGetDeviceState = 9,
}

impl MessageKind {
    /// Kinds a client may send.
    pub const ACTIONS: [MessageKind; 3] = [
        MessageKind::ActionGetAddress,
        MessageKind::ActionSignTx,
        MessageKind::ActionGetDeviceState,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => MessageKind::EventDeviceStateChanged,
            1 => MessageKind::EventUserActionRequired,
            2 => MessageKind::EventUserActionResult,
            3 => MessageKind::EventError,
            4 => MessageKind::ActionGetAddress,
            5 => MessageKind::ResultGetAddress,
            6 => MessageKind::ActionSignTx,
            7 => MessageKind::ResultSignTx,
            8 => MessageKind::ActionGetDeviceState,
            9 => MessageKind::ResultGetDeviceState,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::EventDeviceStateChanged => "event_device_state_changed",
            MessageKind::EventUserActionRequired => "event_user_action_required",
            MessageKind::EventUserActionResult => "event_user_action_result",
            MessageKind::EventError => "event_error",
            MessageKind::ActionGetAddress => "action_get_address",
            MessageKind::ResultGetAddress => "result_get_address",
            MessageKind::ActionSignTx => "action_sign_tx",
            MessageKind::ResultSignTx => "result_sign_tx",
            MessageKind::ActionGetDeviceState => "action_get_device_state",
            MessageKind::ResultGetDeviceState => "result_get_device_state",
        }
    }

    pub fn is_action(self) -> bool {
        Self::ACTIONS.contains(&self)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        (0..=9)
            .filter_map(MessageKind::from_code)
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownKind(s.to_string()))
    }
}

/// A single gateway message.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayMessage {
    pub kind: MessageKind,
    pub value: Option<String>,
    pub payload: Map<String, Value>,
}

/// Raw frame shape, lenient about `value` and `payload` types.
#[derive(Serialize, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    payload: Value,
}

impl GatewayMessage {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            value: None,
            payload: Map::new(),
        }
    }

    /// Message with a value. Empty strings are stored as no value.
    pub fn with_value(kind: MessageKind, value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            kind,
            value: (!value.is_empty()).then_some(value),
            payload: Map::new(),
        }
    }

    /// Generic `event_error` with a human-readable message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::with_value(MessageKind::EventError, message)
    }

    /// Add a payload entry, builder style.
    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// String payload entry, if present and a string.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Parse an inbound frame.
    ///
    /// A non-string `value` or non-object `payload` is ignored rather than
    /// rejected.
    pub fn parse(body: &str) -> Result<Self, ProtocolError> {
        let frame: Frame = serde_json::from_str(body)?;
        let kind = frame.kind.ok_or(ProtocolError::MissingType)?.parse()?;
        let value = match frame.value {
            Value::String(s) if !s.is_empty() => Some(s),
            _ => None,
        };
        let payload = match frame.payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(Self {
            kind,
            value,
            payload,
        })
    }

    /// Encode for the wire, stamping `payload.type_code`.
    pub fn encode(&self) -> String {
        let mut payload = self.payload.clone();
        payload.insert("type_code".to_string(), Value::from(self.kind.code()));
        let frame = Frame {
            kind: Some(self.kind.as_str().to_string()),
            value: self.value.clone().map_or(Value::Null, Value::String),
            payload: Value::Object(payload),
        };
        // A Frame holds only strings and JSON values; serializing it cannot fail.
        serde_json::to_string(&frame).unwrap_or_default()
    }
}

/// Error decoding a wire message.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unable to parse request message: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Unable to parse request message: missing type")]
    MissingType,
    #[error("Unable to parse request message: unknown message type: {0}")]
    UnknownKind(String),
}
