// Message types: the typed view of every frame that crosses the wire

use serde_json::Value;
use std::fmt;

/// Correlates an outbound operation with its ack. Always fits in 63 bits.
pub type AckId = u64;

/// Per-logical-session ordering counter carried on inbound data frames.
pub type SequenceId = u64;

/// How the `data` field of a data frame is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Structured JSON value
    Json,
    /// Raw UTF-8 string
    Text,
    /// Base64 encoded bytes
    Binary,
    /// Base64 encoded protobuf bytes, passed through unvalidated
    Protobuf,
}

impl DataType {
    /// Wire name of the data type
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Json => "json",
            DataType::Text => "text",
            DataType::Binary => "binary",
            DataType::Protobuf => "protobuf",
        }
    }

    /// Parse a wire name, `None` for anything outside the closed set
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "json" => Some(DataType::Json),
            "text" => Some(DataType::Text),
            "binary" => Some(DataType::Binary),
            "protobuf" => Some(DataType::Protobuf),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a data message. The variant carries the data type.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageData {
    Json(Value),
    Text(String),
    Binary(Vec<u8>),
    Protobuf(Vec<u8>),
}

impl MessageData {
    /// Create a text payload
    pub fn text(text: impl Into<String>) -> Self {
        MessageData::Text(text.into())
    }

    /// Create a JSON payload
    pub fn json(value: Value) -> Self {
        MessageData::Json(value)
    }

    /// Create a binary payload
    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        MessageData::Binary(bytes.into())
    }

    /// Create a protobuf payload from already-encoded bytes
    pub fn protobuf(bytes: impl Into<Vec<u8>>) -> Self {
        MessageData::Protobuf(bytes.into())
    }

    pub fn data_type(&self) -> DataType {
        match self {
            MessageData::Json(_) => DataType::Json,
            MessageData::Text(_) => DataType::Text,
            MessageData::Binary(_) => DataType::Binary,
            MessageData::Protobuf(_) => DataType::Protobuf,
        }
    }

    /// Text content (only for text payloads)
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageData::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Raw bytes (binary and protobuf payloads)
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            MessageData::Binary(bytes) | MessageData::Protobuf(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// JSON value (only for json payloads)
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            MessageData::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// Error names the service may attach to a failed ack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckErrorName {
    Forbidden,
    InternalServerError,
    Duplicate,
    BadRequest,
}

impl AckErrorName {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckErrorName::Forbidden => "Forbidden",
            AckErrorName::InternalServerError => "InternalServerError",
            AckErrorName::Duplicate => "Duplicate",
            AckErrorName::BadRequest => "BadRequest",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Forbidden" => Some(AckErrorName::Forbidden),
            "InternalServerError" => Some(AckErrorName::InternalServerError),
            "Duplicate" => Some(AckErrorName::Duplicate),
            "BadRequest" => Some(AckErrorName::BadRequest),
            _ => None,
        }
    }
}

impl fmt::Display for AckErrorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error detail carried by an unsuccessful ack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckErrorDetail {
    pub name: AckErrorName,
    pub message: String,
}

impl fmt::Display for AckErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// `system/connected`: a transport session is ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedMessage {
    pub connection_id: String,
    pub user_id: Option<String>,
    /// Present only when the server supports recoverable reconnects
    pub reconnection_token: Option<String>,
}

/// `system/disconnected`: the server is ending the logical session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectedMessage {
    pub reason: String,
}

/// Acknowledgement of an ack-tracked operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMessage {
    pub ack_id: AckId,
    pub success: bool,
    pub error: Option<AckErrorDetail>,
}

impl AckMessage {
    /// The server reports that this ack id was already processed
    pub fn is_duplicate(&self) -> bool {
        matches!(
            &self.error,
            Some(AckErrorDetail {
                name: AckErrorName::Duplicate,
                ..
            })
        )
    }
}

/// Data published to a group the client has joined
#[derive(Debug, Clone, PartialEq)]
pub struct GroupDataMessage {
    pub sequence_id: Option<SequenceId>,
    pub group: String,
    pub data: MessageData,
    pub from_user_id: Option<String>,
}

/// Data sent to this connection by the server
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDataMessage {
    pub sequence_id: Option<SequenceId>,
    pub data: MessageData,
}

/// Every inbound frame decodes to exactly one of these
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Connected(ConnectedMessage),
    Disconnected(DisconnectedMessage),
    Ack(AckMessage),
    GroupData(GroupDataMessage),
    ServerData(ServerDataMessage),
}

impl WireMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Connected(_) => "Connected",
            WireMessage::Disconnected(_) => "Disconnected",
            WireMessage::Ack(_) => "Ack",
            WireMessage::GroupData(_) => "GroupData",
            WireMessage::ServerData(_) => "ServerData",
        }
    }

    /// Sequence id of a data frame, if the server assigned one
    pub fn sequence_id(&self) -> Option<SequenceId> {
        match self {
            WireMessage::GroupData(msg) => msg.sequence_id,
            WireMessage::ServerData(msg) => msg.sequence_id,
            _ => None,
        }
    }
}

/// Operations the client sends to the service
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    JoinGroup {
        group: String,
        ack_id: Option<AckId>,
    },
    LeaveGroup {
        group: String,
        ack_id: Option<AckId>,
    },
    SendToGroup {
        group: String,
        data: MessageData,
        ack_id: Option<AckId>,
        no_echo: bool,
    },
    SendEvent {
        event: String,
        data: MessageData,
        ack_id: Option<AckId>,
    },
    /// Reliable protocol only: highest sequence id received so far
    SequenceAck { sequence_id: SequenceId },
}

impl OutboundMessage {
    /// Ack id requested by this operation, `None` for fire-and-forget
    pub fn ack_id(&self) -> Option<AckId> {
        match self {
            OutboundMessage::JoinGroup { ack_id, .. }
            | OutboundMessage::LeaveGroup { ack_id, .. }
            | OutboundMessage::SendToGroup { ack_id, .. }
            | OutboundMessage::SendEvent { ack_id, .. } => *ack_id,
            OutboundMessage::SequenceAck { .. } => None,
        }
    }

    /// Wire `type` of the operation
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::JoinGroup { .. } => "joinGroup",
            OutboundMessage::LeaveGroup { .. } => "leaveGroup",
            OutboundMessage::SendToGroup { .. } => "sendToGroup",
            OutboundMessage::SendEvent { .. } => "event",
            OutboundMessage::SequenceAck { .. } => "sequenceAck",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_type_names() {
        for data_type in [
            DataType::Json,
            DataType::Text,
            DataType::Binary,
            DataType::Protobuf,
        ] {
            assert_eq!(DataType::parse(data_type.as_str()), Some(data_type));
        }
        assert_eq!(DataType::parse("xml"), None);
        assert_eq!(DataType::Binary.to_string(), "binary");
    }

    #[test]
    fn test_message_data_accessors() {
        let text = MessageData::text("hello");
        assert_eq!(text.data_type(), DataType::Text);
        assert_eq!(text.as_text(), Some("hello"));
        assert!(text.as_bytes().is_none());

        let bytes = MessageData::protobuf(vec![1, 2, 3]);
        assert_eq!(bytes.data_type(), DataType::Protobuf);
        assert_eq!(bytes.as_bytes(), Some(&[1u8, 2, 3][..]));

        let value = MessageData::json(json!({"a": 1}));
        assert_eq!(value.as_json(), Some(&json!({"a": 1})));
    }

    #[test]
    fn test_ack_duplicate_flag() {
        let ack = AckMessage {
            ack_id: 7,
            success: false,
            error: Some(AckErrorDetail {
                name: AckErrorName::Duplicate,
                message: "already done".to_string(),
            }),
        };
        assert!(ack.is_duplicate());

        let forbidden = AckMessage {
            ack_id: 8,
            success: false,
            error: Some(AckErrorDetail {
                name: AckErrorName::Forbidden,
                message: "no".to_string(),
            }),
        };
        assert!(!forbidden.is_duplicate());
    }

    #[test]
    fn test_outbound_ack_id() {
        let join = OutboundMessage::JoinGroup {
            group: "g".to_string(),
            ack_id: Some(3),
        };
        assert_eq!(join.ack_id(), Some(3));
        assert_eq!(join.kind(), "joinGroup");

        let seq = OutboundMessage::SequenceAck { sequence_id: 9 };
        assert_eq!(seq.ack_id(), None);
    }
}
