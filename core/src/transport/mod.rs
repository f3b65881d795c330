// Transport module: duplex session contract and its implementations

pub mod abstraction;
pub mod memory;
pub mod websocket;

pub use abstraction::{
    CloseKind, CloseReason, EventSink, SessionEvent, SessionId, Transport, TransportError,
    TransportSession,
};
pub use memory::MemoryTransport;
pub use websocket::WebSocketTransport;
