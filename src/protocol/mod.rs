//! Peer protocol: message envelope, protocol ids and the receiver-side
//! handlers for each protocol.

pub mod ask;
pub mod finality;
pub mod get;
pub mod handler;
pub mod publish;
pub mod update;
pub mod validation;
pub mod wire;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorType, NodeError};
use crate::operation::{OperationId, OperationKind};

pub use handler::{handle_protocol_message, ProtocolDispatcher, ProtocolHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    ProtocolInit,
    ProtocolRequest,
    Ack,
    Nack,
    Busy,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::ProtocolInit => "PROTOCOL_INIT",
            MessageType::ProtocolRequest => "PROTOCOL_REQUEST",
            MessageType::Ack => "ACK",
            MessageType::Nack => "NACK",
            MessageType::Busy => "BUSY",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub operation_id: OperationId,
}

/// Request sent to a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub header: MessageHeader,
    pub data: Value,
}

impl ProtocolMessage {
    pub fn init(operation_id: OperationId, data: Value) -> Self {
        Self {
            header: MessageHeader {
                message_type: MessageType::ProtocolInit,
                operation_id,
            },
            data,
        }
    }

    pub fn request(operation_id: OperationId, data: Value) -> Self {
        Self {
            header: MessageHeader {
                message_type: MessageType::ProtocolRequest,
                operation_id,
            },
            data,
        }
    }
}

/// Reply envelope: `{messageType, messageData}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolResponse {
    pub message_type: MessageType,
    pub message_data: Value,
}

impl ProtocolResponse {
    pub fn ack(data: Value) -> Self {
        Self {
            message_type: MessageType::Ack,
            message_data: data,
        }
    }

    pub fn nack(data: Value) -> Self {
        Self {
            message_type: MessageType::Nack,
            message_data: data,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.message_type == MessageType::Ack
    }

    /// `errorMessage` of a NACK, or a generic description.
    pub fn error_message(&self) -> String {
        self.message_data
            .get("errorMessage")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} without error message", self.message_type))
    }
}

/// Versioned peer protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Store,
    Get,
    Update,
    Ask,
    Finality,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::Store,
        Protocol::Get,
        Protocol::Update,
        Protocol::Ask,
        Protocol::Finality,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Protocol::Store => "/store/1.0.0",
            Protocol::Get => "/get/1.0.0",
            Protocol::Update => "/update/1.0.0",
            Protocol::Ask => "/ask/1.0.0",
            Protocol::Finality => "/finality/1.0.0",
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Protocol::Store => OperationKind::Publish,
            Protocol::Get => OperationKind::Get,
            Protocol::Update => OperationKind::Update,
            Protocol::Ask => OperationKind::Ask,
            Protocol::Finality => OperationKind::Finality,
        }
    }

    /// Tag recorded on the receiver-side record when handling fails.
    pub fn remote_error_type(&self) -> ErrorType {
        match self {
            Protocol::Store => ErrorType::PublishRemoteError,
            Protocol::Get => ErrorType::GetRequestRemoteError,
            Protocol::Update => ErrorType::UpdateRemoteError,
            Protocol::Ask => ErrorType::AskRequestRemoteError,
            Protocol::Finality => ErrorType::FinalityRequestRemoteError,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Protocol {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Protocol::ALL
            .iter()
            .find(|p| p.id() == s)
            .copied()
            .ok_or_else(|| NodeError::Validation(format!("unsupported protocol {}", s)))
    }
}
