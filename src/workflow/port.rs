//! External request/response ports
//!
//! An executor that needs input from outside the workflow (a human approval,
//! a call into another service) raises an [`ExternalRequest`] on an
//! [`InputPort`]. The run halts until the caller answers with an
//! [`ExternalResponse`] carrying the same request id.

use serde::{Deserialize, Serialize};

use super::executor::ExecutorId;
use super::message::{Message, MessagePayload, MessageType};

/// Typed contract for external requests
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputPort {
    id: String,
    request_type: MessageType,
    response_type: MessageType,
}

impl InputPort {
    /// Port whose requests carry `Req` and whose responses must carry `Resp`
    pub fn new<Req: MessagePayload, Resp: MessagePayload>(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            request_type: MessageType::of::<Req>(),
            response_type: MessageType::of::<Resp>(),
        }
    }

    pub fn from_types(
        id: impl Into<String>,
        request_type: impl Into<MessageType>,
        response_type: impl Into<MessageType>,
    ) -> Self {
        Self {
            id: id.into(),
            request_type: request_type.into(),
            response_type: response_type.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request_type(&self) -> &MessageType {
        &self.request_type
    }

    pub fn response_type(&self) -> &MessageType {
        &self.response_type
    }
}

/// A pending request for external input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRequest {
    /// Correlation id the response must echo
    pub request_id: String,
    pub port: InputPort,
    /// Executor that raised the request and will receive the response
    pub source: ExecutorId,
    pub data: Message,
}

impl ExternalRequest {
    /// Decode the request payload
    pub fn decode<T: MessagePayload>(&self) -> Result<T, serde_json::Error> {
        self.data.decode()
    }

    /// Build the response to this request
    pub fn create_response<T: MessagePayload>(&self, value: &T) -> Result<ExternalResponse, serde_json::Error> {
        ExternalResponse::from_value(self.request_id.clone(), value)
    }
}

/// Answer to an [`ExternalRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalResponse {
    pub request_id: String,
    pub data: Message,
}

impl ExternalResponse {
    pub fn new(request_id: impl Into<String>, data: Message) -> Self {
        Self {
            request_id: request_id.into(),
            data,
        }
    }

    /// Encode a typed payload as the response data
    pub fn from_value<T: MessagePayload>(
        request_id: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(request_id, Message::new(value)?))
    }

    /// Decode the response payload
    pub fn decode<T: MessagePayload>(&self) -> Result<T, serde_json::Error> {
        self.data.decode()
    }
}

impl MessagePayload for ExternalRequest {
    const TYPE_NAME: &'static str = "external_request";
}

impl MessagePayload for ExternalResponse {
    const TYPE_NAME: &'static str = "external_response";
}
