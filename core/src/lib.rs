// WebPubSub Core: client protocol engine
//
// A client for publish/subscribe messaging over a duplex transport:
// join and leave groups, publish to groups, raise events, and receive
// group and server messages, with acknowledgements, de-duplication and
// automatic recovery of the logical session across transport drops.
//
// Layers, bottom up:
//   message   : typed wire messages and the JSON frame codec
//   transport : session abstraction, WebSocket and in-memory transports
//   client    : ack tracking, state machine driver, recovery, the facade

pub mod client;
pub mod credential;
pub mod error;
pub mod message;
pub mod transport;

pub use client::{
    BlockingClient, ConnectedEvent, ConnectionState, DisconnectedEvent, GroupMessageEvent,
    ListenerId, Protocol, RejoinGroupFailedEvent, RetryPolicy, SendEventOptions, SendResult,
    SendToGroupOptions, ServerMessageEvent, StoppedEvent, WebPubSubClient, WebPubSubClientOptions,
};
pub use credential::{ClientCredential, CredentialError, StaticUrlCredential, UrlProviderCredential};
pub use error::{ClientError, SendFailureReason};
pub use message::{
    AckErrorDetail, AckErrorName, AckId, DataType, DecodeError, EncodeError, MessageData,
    OutboundMessage, SequenceId, WireMessage,
};
pub use transport::{
    CloseKind, CloseReason, MemoryTransport, Transport, TransportError, TransportSession,
    WebSocketTransport,
};
