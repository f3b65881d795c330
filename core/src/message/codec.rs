// Message codec: JSON frames to typed messages and back, with size limits

use super::types::{
    AckErrorDetail, AckErrorName, AckMessage, ConnectedMessage, DataType, DisconnectedMessage,
    GroupDataMessage, MessageData, OutboundMessage, ServerDataMessage, WireMessage,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum accepted frame size: 1 MiB, the service's own message limit
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Largest ack id that survives the wire (63 bits)
pub const MAX_ACK_ID: u64 = i64::MAX as u64;

/// Structural problems with an inbound frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Missing field `{field}` for {kind} frame")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("Unknown frame type: {0}")]
    UnknownType(String),
    #[error("Unknown system event: {0}")]
    UnknownEvent(String),
    #[error("Unknown message source: {0}")]
    UnknownSource(String),
    #[error("Unknown data type: {0}")]
    UnknownDataType(String),
    #[error("Unknown ack error name: {0}")]
    UnknownErrorName(String),
    #[error("Invalid {field}: {value}")]
    NegativeId { field: &'static str, value: i64 },
    #[error("Invalid {data_type} payload: {reason}")]
    InvalidPayload {
        data_type: DataType,
        reason: String,
    },
}

/// Problems turning an operation into a frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("Ack id {0} exceeds 63 bits")]
    AckIdOutOfRange(u64),
    #[error("Sequence id {0} exceeds 63 bits")]
    SequenceIdOutOfRange(u64),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reconnection_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ack_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RawAckError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_type: Option<String>,
    // `null` is a legitimate json payload, so presence is tracked separately
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    from_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    no_echo: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawAckError {
    name: Option<String>,
    message: Option<String>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

fn parse_raw(frame: &str) -> Result<RawFrame, DecodeError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(DecodeError::FrameTooLarge(frame.len()));
    }
    serde_json::from_str(frame).map_err(|e| DecodeError::Malformed(e.to_string()))
}

fn require<T>(value: Option<T>, kind: &'static str, field: &'static str) -> Result<T, DecodeError> {
    value.ok_or(DecodeError::MissingField { kind, field })
}

fn non_negative(value: i64, field: &'static str) -> Result<u64, DecodeError> {
    u64::try_from(value).map_err(|_| DecodeError::NegativeId { field, value })
}

fn optional_sequence_id(raw: &RawFrame) -> Result<Option<u64>, DecodeError> {
    raw.sequence_id
        .map(|id| non_negative(id, "sequenceId"))
        .transpose()
}

fn decode_data(raw: &mut RawFrame, kind: &'static str) -> Result<MessageData, DecodeError> {
    let name = require(raw.data_type.take(), kind, "dataType")?;
    let data_type = DataType::parse(&name).ok_or(DecodeError::UnknownDataType(name))?;
    let data = require(raw.data.take(), kind, "data")?;

    match data_type {
        DataType::Json => Ok(MessageData::Json(data)),
        DataType::Text => match data {
            Value::String(text) => Ok(MessageData::Text(text)),
            other => Err(DecodeError::InvalidPayload {
                data_type,
                reason: format!("expected string, got {}", json_kind(&other)),
            }),
        },
        DataType::Binary | DataType::Protobuf => {
            let encoded = match data {
                Value::String(encoded) => encoded,
                other => {
                    return Err(DecodeError::InvalidPayload {
                        data_type,
                        reason: format!("expected base64 string, got {}", json_kind(&other)),
                    })
                }
            };
            let bytes = BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| DecodeError::InvalidPayload {
                    data_type,
                    reason: e.to_string(),
                })?;
            if data_type == DataType::Binary {
                Ok(MessageData::Binary(bytes))
            } else {
                Ok(MessageData::Protobuf(bytes))
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn encode_data(raw: &mut RawFrame, data: &MessageData) {
    raw.data_type = Some(data.data_type().as_str().to_string());
    raw.data = Some(match data {
        MessageData::Json(value) => value.clone(),
        MessageData::Text(text) => Value::String(text.clone()),
        MessageData::Binary(bytes) | MessageData::Protobuf(bytes) => {
            Value::String(BASE64.encode(bytes))
        }
    });
}

fn wire_ack_id(ack_id: Option<u64>) -> Result<Option<i64>, EncodeError> {
    ack_id
        .map(|id| i64::try_from(id).map_err(|_| EncodeError::AckIdOutOfRange(id)))
        .transpose()
}

fn wire_sequence_id(sequence_id: Option<u64>) -> Result<Option<i64>, EncodeError> {
    sequence_id
        .map(|id| i64::try_from(id).map_err(|_| EncodeError::SequenceIdOutOfRange(id)))
        .transpose()
}

fn to_frame(raw: &RawFrame) -> Result<String, EncodeError> {
    serde_json::to_string(raw).map_err(|e| EncodeError::Serialization(e.to_string()))
}

/// Decode an inbound frame into exactly one message variant
pub fn decode(frame: &str) -> Result<WireMessage, DecodeError> {
    let mut raw = parse_raw(frame)?;
    let kind = require(raw.kind.take(), "inbound", "type")?;

    match kind.as_str() {
        "system" => {
            let event = require(raw.event.take(), "system", "event")?;
            match event.as_str() {
                "connected" => Ok(WireMessage::Connected(ConnectedMessage {
                    connection_id: require(raw.connection_id, "connected", "connectionId")?,
                    user_id: raw.user_id,
                    reconnection_token: raw.reconnection_token,
                })),
                "disconnected" => Ok(WireMessage::Disconnected(DisconnectedMessage {
                    reason: raw.message.unwrap_or_default(),
                })),
                _ => Err(DecodeError::UnknownEvent(event)),
            }
        }
        "ack" => {
            let ack_id = non_negative(require(raw.ack_id, "ack", "ackId")?, "ackId")?;
            let success = require(raw.success, "ack", "success")?;
            let error = match raw.error {
                Some(error) => {
                    let name = require(error.name, "ack", "error.name")?;
                    let name = AckErrorName::parse(&name).ok_or(DecodeError::UnknownErrorName(name))?;
                    Some(AckErrorDetail {
                        name,
                        message: error.message.unwrap_or_default(),
                    })
                }
                None if !success => {
                    return Err(DecodeError::MissingField {
                        kind: "ack",
                        field: "error",
                    })
                }
                None => None,
            };
            Ok(WireMessage::Ack(AckMessage {
                ack_id,
                success,
                error,
            }))
        }
        "message" => {
            let from = require(raw.from.take(), "message", "from")?;
            let sequence_id = optional_sequence_id(&raw)?;
            match from.as_str() {
                "group" => {
                    let group = require(raw.group.take(), "group message", "group")?;
                    let data = decode_data(&mut raw, "group message")?;
                    Ok(WireMessage::GroupData(GroupDataMessage {
                        sequence_id,
                        group,
                        data,
                        from_user_id: raw.from_user_id,
                    }))
                }
                "server" => {
                    let data = decode_data(&mut raw, "server message")?;
                    Ok(WireMessage::ServerData(ServerDataMessage { sequence_id, data }))
                }
                _ => Err(DecodeError::UnknownSource(from)),
            }
        }
        _ => Err(DecodeError::UnknownType(kind)),
    }
}

/// Encode an outbound operation into a frame
pub fn encode(message: &OutboundMessage) -> Result<String, EncodeError> {
    let mut raw = RawFrame {
        kind: Some(message.kind().to_string()),
        ack_id: wire_ack_id(message.ack_id())?,
        ..Default::default()
    };

    match message {
        OutboundMessage::JoinGroup { group, .. } | OutboundMessage::LeaveGroup { group, .. } => {
            raw.group = Some(group.clone());
        }
        OutboundMessage::SendToGroup {
            group,
            data,
            no_echo,
            ..
        } => {
            raw.group = Some(group.clone());
            raw.no_echo = Some(*no_echo);
            encode_data(&mut raw, data);
        }
        OutboundMessage::SendEvent { event, data, .. } => {
            raw.event = Some(event.clone());
            encode_data(&mut raw, data);
        }
        OutboundMessage::SequenceAck { sequence_id } => {
            raw.sequence_id = wire_sequence_id(Some(*sequence_id))?;
        }
    }

    to_frame(&raw)
}

/// Encode an inbound-shaped message, as the service would send it
pub fn encode_wire(message: &WireMessage) -> Result<String, EncodeError> {
    let mut raw = RawFrame::default();

    match message {
        WireMessage::Connected(connected) => {
            raw.kind = Some("system".to_string());
            raw.event = Some("connected".to_string());
            raw.connection_id = Some(connected.connection_id.clone());
            raw.user_id = connected.user_id.clone();
            raw.reconnection_token = connected.reconnection_token.clone();
        }
        WireMessage::Disconnected(disconnected) => {
            raw.kind = Some("system".to_string());
            raw.event = Some("disconnected".to_string());
            raw.message = Some(disconnected.reason.clone());
        }
        WireMessage::Ack(ack) => {
            raw.kind = Some("ack".to_string());
            raw.ack_id = wire_ack_id(Some(ack.ack_id))?;
            raw.success = Some(ack.success);
            raw.error = ack.error.as_ref().map(|error| RawAckError {
                name: Some(error.name.as_str().to_string()),
                message: Some(error.message.clone()),
            });
        }
        WireMessage::GroupData(group) => {
            raw.kind = Some("message".to_string());
            raw.from = Some("group".to_string());
            raw.group = Some(group.group.clone());
            raw.sequence_id = wire_sequence_id(group.sequence_id)?;
            raw.from_user_id = group.from_user_id.clone();
            encode_data(&mut raw, &group.data);
        }
        WireMessage::ServerData(server) => {
            raw.kind = Some("message".to_string());
            raw.from = Some("server".to_string());
            raw.sequence_id = wire_sequence_id(server.sequence_id)?;
            encode_data(&mut raw, &server.data);
        }
    }

    to_frame(&raw)
}

/// Decode a frame produced by [`encode`]; used by test servers and tooling
pub fn decode_outbound(frame: &str) -> Result<OutboundMessage, DecodeError> {
    let mut raw = parse_raw(frame)?;
    let kind = require(raw.kind.take(), "outbound", "type")?;
    let ack_id = raw
        .ack_id
        .map(|id| non_negative(id, "ackId"))
        .transpose()?;

    match kind.as_str() {
        "joinGroup" => Ok(OutboundMessage::JoinGroup {
            group: require(raw.group, "joinGroup", "group")?,
            ack_id,
        }),
        "leaveGroup" => Ok(OutboundMessage::LeaveGroup {
            group: require(raw.group, "leaveGroup", "group")?,
            ack_id,
        }),
        "sendToGroup" => {
            let group = require(raw.group.take(), "sendToGroup", "group")?;
            let data = decode_data(&mut raw, "sendToGroup")?;
            Ok(OutboundMessage::SendToGroup {
                group,
                data,
                ack_id,
                no_echo: raw.no_echo.unwrap_or(false),
            })
        }
        "event" => {
            let event = require(raw.event.take(), "event", "event")?;
            let data = decode_data(&mut raw, "event")?;
            Ok(OutboundMessage::SendEvent { event, data, ack_id })
        }
        "sequenceAck" => {
            let sequence_id = require(raw.sequence_id, "sequenceAck", "sequenceId")?;
            Ok(OutboundMessage::SequenceAck {
                sequence_id: non_negative(sequence_id, "sequenceId")?,
            })
        }
        _ => Err(DecodeError::UnknownType(kind)),
    }
}
