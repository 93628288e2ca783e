//! Message types for executor communication
//!
//! Executors exchange [`Message`]s: a JSON payload tagged with a runtime
//! [`MessageType`]. Executors declare the tags they accept, and edge runners
//! use the tag to decide whether a sink can handle a message.
//!
//! While a message is in flight it travels inside a [`MessageEnvelope`],
//! which records where it came from and, optionally, the single executor it
//! is addressed to.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::executor::ExecutorId;

/// Runtime type tag of a message
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(pub String);

impl MessageType {
    /// Create a new MessageType
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The tag registered for payload type `T`
    pub fn of<T: MessagePayload>() -> Self {
        Self(T::TYPE_NAME.to_string())
    }

    /// Get the tag as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A Rust type that can travel as a message payload
///
/// `TYPE_NAME` is the tag stored next to the payload. Two Rust types sharing
/// a tag are treated as the same message type.
pub trait MessagePayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
}

macro_rules! impl_message_payload {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl MessagePayload for $ty {
                const TYPE_NAME: &'static str = $name;
            }
        )*
    };
}

impl_message_payload! {
    String => "string",
    bool => "bool",
    i64 => "i64",
    u64 => "u64",
    f64 => "f64",
    Value => "json",
}

/// A typed message payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    message_type: MessageType,
    payload: Value,
}

impl Message {
    /// Encode a payload, tagging it with its registered type
    pub fn new<T: MessagePayload>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_type: MessageType::of::<T>(),
            payload: serde_json::to_value(value)?,
        })
    }

    /// Build a message from an explicit tag and an already encoded payload
    ///
    /// The payload is not checked here; see [`payload_conforms`](Self::payload_conforms).
    pub fn from_parts(message_type: impl Into<MessageType>, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
        }
    }

    /// Create a `string` message
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::of::<String>(),
            payload: Value::String(text.into()),
        }
    }

    pub fn message_type(&self) -> &MessageType {
        &self.message_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// Whether the payload has the JSON shape its built-in scalar tag implies
    ///
    /// Tags without a built-in shape (structs, `json`) always conform.
    pub fn payload_conforms(&self) -> bool {
        let payload = &self.payload;
        match self.message_type.as_str() {
            t if t == <String as MessagePayload>::TYPE_NAME => payload.is_string(),
            t if t == <bool as MessagePayload>::TYPE_NAME => payload.is_boolean(),
            t if t == <i64 as MessagePayload>::TYPE_NAME => payload.is_i64(),
            t if t == <u64 as MessagePayload>::TYPE_NAME => payload.is_u64(),
            t if t == <f64 as MessagePayload>::TYPE_NAME => payload.is_number(),
            _ => true,
        }
    }

    /// Check whether the message carries payload type `T`
    pub fn is<T: MessagePayload>(&self) -> bool {
        self.message_type.as_str() == T::TYPE_NAME
    }

    /// Decode the payload as `T`
    ///
    /// Fails when the message is tagged with a different type, even if the
    /// JSON would happen to deserialize.
    pub fn decode<T: MessagePayload>(&self) -> Result<T, serde_json::Error> {
        if !self.is::<T>() {
            return Err(serde::de::Error::custom(format!(
                "expected message of type {}, found {}",
                T::TYPE_NAME,
                self.message_type
            )));
        }
        T::deserialize(&self.payload)
    }
}

/// Per-run sequence number identifying an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(pub u64);

impl std::fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A message in flight between supersteps
///
/// Envelopes are immutable once created. `source` is `None` for messages
/// injected from outside the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    id: EnvelopeId,
    message: Message,
    source: Option<ExecutorId>,
    target: Option<ExecutorId>,
}

impl MessageEnvelope {
    pub fn new(
        id: EnvelopeId,
        message: Message,
        source: Option<ExecutorId>,
        target: Option<ExecutorId>,
    ) -> Self {
        Self {
            id,
            message,
            source,
            target,
        }
    }

    pub fn id(&self) -> EnvelopeId {
        self.id
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn message_type(&self) -> &MessageType {
        self.message.message_type()
    }

    /// Executor that produced the message
    pub fn source(&self) -> Option<&ExecutorId> {
        self.source.as_ref()
    }

    /// Explicit recipient, bypassing fan-out to other sinks
    pub fn target(&self) -> Option<&ExecutorId> {
        self.target.as_ref()
    }

    /// Whether the message was injected from outside the workflow
    pub fn is_external(&self) -> bool {
        self.source.is_none()
    }

    /// Whether an explicit target, if any, allows delivery to `id`
    pub fn allows_target(&self, id: &ExecutorId) -> bool {
        self.target.as_ref().map_or(true, |target| target == id)
    }
}
