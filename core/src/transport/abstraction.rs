//! Transport abstraction for the client engine
//!
//! The engine never talks to a socket directly. It asks a [`Transport`] for a
//! session, writes frames through the returned [`TransportSession`], and
//! receives everything the session observes as [`SessionEvent`]s pushed into
//! an [`EventSink`]. All sinks of one client feed a single channel, so the
//! engine sees inbound traffic strictly in order.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Engine-assigned identifier of one physical transport session
pub type SessionId = u64;

/// Why a transport session ended, as far as reconnect policy cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseKind {
    /// The server asked the client to stop (policy violation, revoked token)
    Stop,
    /// Network failure or an unexplained close
    Transient,
    /// The server is going away and advises reconnecting
    ReconnectAdvised,
}

impl fmt::Display for CloseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseKind::Stop => write!(f, "Stop"),
            CloseKind::Transient => write!(f, "Transient"),
            CloseKind::ReconnectAdvised => write!(f, "ReconnectAdvised"),
        }
    }
}

/// Close status reported by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub kind: CloseKind,
    /// WebSocket close code, when the transport has one
    pub code: Option<u16>,
    pub description: String,
}

/// WebSocket close code for policy violations
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// WebSocket close code for a service restart
pub const CLOSE_SERVICE_RESTART: u16 = 1012;
/// WebSocket close code asking the client to try again later
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

impl CloseReason {
    pub fn new(kind: CloseKind, code: Option<u16>, description: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            description: description.into(),
        }
    }

    /// Server-requested stop
    pub fn stop(description: impl Into<String>) -> Self {
        Self::new(CloseKind::Stop, Some(CLOSE_POLICY_VIOLATION), description)
    }

    /// Network-level failure without a status code
    pub fn transient(description: impl Into<String>) -> Self {
        Self::new(CloseKind::Transient, None, description)
    }

    /// Server advises reconnecting
    pub fn reconnect_advised(description: impl Into<String>) -> Self {
        Self::new(CloseKind::ReconnectAdvised, Some(CLOSE_SERVICE_RESTART), description)
    }

    /// Classify a WebSocket close code
    pub fn from_close_code(code: u16, description: impl Into<String>) -> Self {
        let kind = match code {
            CLOSE_POLICY_VIOLATION => CloseKind::Stop,
            CLOSE_SERVICE_RESTART | CLOSE_TRY_AGAIN_LATER => CloseKind::ReconnectAdvised,
            _ => CloseKind::Transient,
        };
        Self::new(kind, Some(code), description)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({}): {}", self.kind, code, self.description),
            None => write!(f, "{}: {}", self.kind, self.description),
        }
    }
}

/// Something a session observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A text frame arrived
    Frame(String),
    /// The session ended; no further events follow for it
    Closed(CloseReason),
}

/// Where a session delivers its events, tagged with the session id
#[derive(Debug, Clone)]
pub struct EventSink {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<(SessionId, SessionEvent)>,
}

impl EventSink {
    pub fn new(session_id: SessionId, tx: mpsc::UnboundedSender<(SessionId, SessionEvent)>) -> Self {
        Self { session_id, tx }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Deliver an inbound frame. Dropped silently once the engine is gone.
    pub fn frame(&self, frame: impl Into<String>) {
        let _ = self
            .tx
            .send((self.session_id, SessionEvent::Frame(frame.into())));
    }

    /// Report the end of the session
    pub fn closed(&self, reason: CloseReason) {
        let _ = self.tx.send((self.session_id, SessionEvent::Closed(reason)));
    }
}

/// Transport failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Session closed")]
    Closed,
}

/// Opens duplex sessions
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a session to `url` speaking `protocol`.
    ///
    /// Returns once the session is open. Inbound frames and the final close
    /// go to `sink`, in order, from whatever task the transport runs.
    async fn connect(
        &self,
        url: &str,
        protocol: &str,
        sink: EventSink,
    ) -> Result<Arc<dyn TransportSession>, TransportError>;
}

/// An open session. Safe to call from several tasks at once.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn send(&self, frame: String) -> Result<(), TransportError>;

    /// Close deliberately. The transport need not report a `Closed` event.
    async fn close(&self, reason: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_classification() {
        assert_eq!(CloseReason::from_close_code(1008, "policy").kind, CloseKind::Stop);
        assert_eq!(
            CloseReason::from_close_code(1012, "restart").kind,
            CloseKind::ReconnectAdvised
        );
        assert_eq!(
            CloseReason::from_close_code(1013, "later").kind,
            CloseKind::ReconnectAdvised
        );
        assert_eq!(CloseReason::from_close_code(1006, "abnormal").kind, CloseKind::Transient);
        assert_eq!(CloseReason::from_close_code(1000, "normal").kind, CloseKind::Transient);
    }

    #[test]
    fn test_close_reason_display() {
        let reason = CloseReason::from_close_code(1008, "token expired");
        assert_eq!(reason.to_string(), "Stop (1008): token expired");
        assert_eq!(CloseReason::transient("reset").to_string(), "Transient: reset");
    }

    #[tokio::test]
    async fn test_event_sink_tags_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(7, tx);
        sink.frame("hello");
        sink.closed(CloseReason::transient("gone"));

        assert_eq!(rx.recv().await, Some((7, SessionEvent::Frame("hello".to_string()))));
        assert_eq!(
            rx.recv().await,
            Some((7, SessionEvent::Closed(CloseReason::transient("gone"))))
        );
    }

    #[test]
    fn test_event_sink_after_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = EventSink::new(1, tx);
        sink.frame("ignored");
    }
}
