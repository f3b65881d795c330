// Message module: wire types and the JSON frame codec

pub mod codec;
pub mod types;

pub use codec::{decode, decode_outbound, encode, encode_wire, DecodeError, EncodeError};
pub use types::{
    AckErrorDetail, AckErrorName, AckId, AckMessage, ConnectedMessage, DataType,
    DisconnectedMessage, GroupDataMessage, MessageData, OutboundMessage, SequenceId,
    ServerDataMessage, WireMessage,
};
