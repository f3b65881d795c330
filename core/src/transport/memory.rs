// In-memory transport: a scriptable stand-in for the service
//
// Plays the server side of the protocol inside the process: greets every new
// session with a `connected` system message, acknowledges ack-tracked
// operations, records everything the client sends, and lets the caller
// inject frames, close the session with a chosen reason, or fail connects.

use super::abstraction::{
    CloseReason, EventSink, SessionId, Transport, TransportError, TransportSession,
};
use crate::message::{
    decode_outbound, encode_wire, AckErrorDetail, AckErrorName, AckMessage, ConnectedMessage,
    OutboundMessage, WireMessage,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct SessionRecord {
    session_id: SessionId,
    sink: EventSink,
    open: bool,
}

#[derive(Debug)]
struct MemoryState {
    connect_urls: Vec<String>,
    protocols: Vec<String>,
    fail_next_connects: usize,
    sessions: Vec<SessionRecord>,
    sent: Vec<String>,
    auto_ack: bool,
    greet: bool,
    issue_reconnection_tokens: bool,
    rejected_groups: HashMap<String, AckErrorName>,
    next_connection: u64,
}

/// Scriptable in-process transport. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
    notify: Arc<Notify>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Greets sessions, issues reconnection tokens and auto-acks everything
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                connect_urls: Vec::new(),
                protocols: Vec::new(),
                fail_next_connects: 0,
                sessions: Vec::new(),
                sent: Vec::new(),
                auto_ack: true,
                greet: true,
                issue_reconnection_tokens: true,
                rejected_groups: HashMap::new(),
                next_connection: 1,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Stop answering ack-tracked operations
    pub fn set_auto_ack(&self, enabled: bool) {
        self.state.lock().auto_ack = enabled;
    }

    /// Skip the `connected` greeting on new sessions
    pub fn set_greeting(&self, enabled: bool) {
        self.state.lock().greet = enabled;
    }

    /// Whether greetings carry a reconnection token
    pub fn set_reconnection_tokens(&self, enabled: bool) {
        self.state.lock().issue_reconnection_tokens = enabled;
    }

    /// Fail the next `count` connect attempts
    pub fn fail_next_connects(&self, count: usize) {
        self.state.lock().fail_next_connects = count;
    }

    /// Answer joins of `group` with an error ack
    pub fn reject_group(&self, group: &str, name: AckErrorName) {
        self.state
            .lock()
            .rejected_groups
            .insert(group.to_string(), name);
    }

    /// Accept joins of `group` again
    pub fn accept_group(&self, group: &str) {
        self.state.lock().rejected_groups.remove(group);
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connect_urls.len()
    }

    /// URLs of every connect attempt, failed ones included
    pub fn connect_urls(&self) -> Vec<String> {
        self.state.lock().connect_urls.clone()
    }

    pub fn protocols(&self) -> Vec<String> {
        self.state.lock().protocols.clone()
    }

    /// Raw frames sent by the client, across all sessions
    pub fn sent_frames(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Sent frames that decode as outbound operations
    pub fn sent_messages(&self) -> Vec<OutboundMessage> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|frame| decode_outbound(frame).ok())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    /// Whether the most recent session is still open
    pub fn is_open(&self) -> bool {
        self.state
            .lock()
            .sessions
            .last()
            .map(|s| s.open)
            .unwrap_or(false)
    }

    /// Deliver a raw frame on the current session
    pub fn push_frame(&self, frame: impl Into<String>) {
        let state = self.state.lock();
        if let Some(session) = state.sessions.iter().rev().find(|s| s.open) {
            session.sink.frame(frame);
        }
    }

    /// Deliver a message on the current session
    pub fn push_message(&self, message: &WireMessage) {
        if let Ok(frame) = encode_wire(message) {
            self.push_frame(frame);
        }
    }

    /// Close the current session from the server side
    pub fn close_current(&self, reason: CloseReason) {
        let mut state = self.state.lock();
        if let Some(session) = state.sessions.iter_mut().rev().find(|s| s.open) {
            session.open = false;
            session.sink.closed(reason);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Wait until the sent operations satisfy `predicate`
    pub async fn wait_for_sent<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&[OutboundMessage]) -> bool,
    {
        self.wait(timeout, || predicate(&self.sent_messages())).await
    }

    /// Wait until at least `count` connect attempts were made
    pub async fn wait_for_connects(&self, count: usize, timeout: Duration) -> bool {
        self.wait(timeout, || self.connect_count() >= count).await
    }

    async fn wait<F>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if condition() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return condition();
            }
        }
    }

    fn greeting(url: &str, connection: u64, with_token: bool) -> WireMessage {
        let connection_id = query_param(url, "awps_connection_id")
            .unwrap_or_else(|| format!("conn-{}", connection));
        WireMessage::Connected(ConnectedMessage {
            reconnection_token: with_token.then(|| format!("token-{}", connection)),
            connection_id,
            user_id: None,
        })
    }
}

fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == name {
            urlencoding::decode(value).ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        url: &str,
        protocol: &str,
        sink: EventSink,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let session_id = sink.session_id();
        {
            let mut state = self.state.lock();
            state.connect_urls.push(url.to_string());
            state.protocols.push(protocol.to_string());

            if state.fail_next_connects > 0 {
                state.fail_next_connects -= 1;
                drop(state);
                self.notify.notify_waiters();
                return Err(TransportError::ConnectionFailed(
                    "memory transport refused connection".to_string(),
                ));
            }

            for session in state.sessions.iter_mut() {
                session.open = false;
            }

            let connection = state.next_connection;
            state.next_connection += 1;
            if state.greet {
                let greeting = Self::greeting(url, connection, state.issue_reconnection_tokens);
                if let Ok(frame) = encode_wire(&greeting) {
                    sink.frame(frame);
                }
            }
            state.sessions.push(SessionRecord {
                session_id,
                sink,
                open: true,
            });
        }
        self.notify.notify_waiters();

        Ok(Arc::new(MemorySession {
            session_id,
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
        }))
    }
}

struct MemorySession {
    session_id: SessionId,
    state: Arc<Mutex<MemoryState>>,
    notify: Arc<Notify>,
}

impl MemorySession {
    fn ack_for(state: &MemoryState, message: &OutboundMessage) -> Option<AckMessage> {
        let ack_id = message.ack_id()?;
        if !state.auto_ack {
            return None;
        }
        let rejection = match message {
            OutboundMessage::JoinGroup { group, .. } => state.rejected_groups.get(group).copied(),
            _ => None,
        };
        Some(match rejection {
            Some(name) => AckMessage {
                ack_id,
                success: false,
                error: Some(AckErrorDetail {
                    name,
                    message: format!("{} rejected", message.kind()),
                }),
            },
            None => AckMessage {
                ack_id,
                success: true,
                error: None,
            },
        })
    }
}

#[async_trait]
impl TransportSession for MemorySession {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            let open = state
                .sessions
                .iter()
                .any(|s| s.session_id == self.session_id && s.open);
            if !open {
                return Err(TransportError::Closed);
            }

            let ack = decode_outbound(&frame)
                .ok()
                .and_then(|message| Self::ack_for(&state, &message));
            state.sent.push(frame);

            if let Some(ack) = ack {
                if let Ok(reply) = encode_wire(&WireMessage::Ack(ack)) {
                    if let Some(session) = state
                        .sessions
                        .iter()
                        .find(|s| s.session_id == self.session_id)
                    {
                        session.sink.frame(reply);
                    }
                }
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self, _reason: &str) {
        let mut state = self.state.lock();
        if let Some(session) = state
            .sessions
            .iter_mut()
            .find(|s| s.session_id == self.session_id)
        {
            session.open = false;
        }
        drop(state);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{decode, MessageData};
    use crate::transport::abstraction::SessionEvent;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_greets_and_acks() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = transport
            .connect("ws://memory/client", "json", EventSink::new(1, tx))
            .await
            .unwrap();

        let (_, event) = rx.recv().await.unwrap();
        match event {
            SessionEvent::Frame(frame) => match decode(&frame).unwrap() {
                WireMessage::Connected(connected) => {
                    assert_eq!(connected.connection_id, "conn-1");
                    assert_eq!(connected.reconnection_token.as_deref(), Some("token-1"));
                }
                other => panic!("Wrong message type: {}", other.kind()),
            },
            other => panic!("Unexpected event: {:?}", other),
        }

        session
            .send(r#"{"type":"joinGroup","group":"g","ackId":4}"#.to_string())
            .await
            .unwrap();
        let (_, event) = rx.recv().await.unwrap();
        assert_eq!(
            event,
            SessionEvent::Frame(
                encode_wire(&WireMessage::Ack(AckMessage {
                    ack_id: 4,
                    success: true,
                    error: None
                }))
                .unwrap()
            )
        );
        assert_eq!(transport.sent_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_group() {
        let transport = MemoryTransport::new();
        transport.set_greeting(false);
        transport.reject_group("private", AckErrorName::Forbidden);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = transport
            .connect("ws://memory/client", "json", EventSink::new(1, tx))
            .await
            .unwrap();

        session
            .send(r#"{"type":"joinGroup","group":"private","ackId":1}"#.to_string())
            .await
            .unwrap();
        let (_, event) = rx.recv().await.unwrap();
        let SessionEvent::Frame(frame) = event else {
            panic!("Expected a frame");
        };
        match decode(&frame).unwrap() {
            WireMessage::Ack(ack) => {
                assert!(!ack.success);
                assert_eq!(ack.error.unwrap().name, AckErrorName::Forbidden);
            }
            other => panic!("Wrong message type: {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_failed_connects_and_closed_session() {
        let transport = MemoryTransport::new();
        transport.fail_next_connects(1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = transport
            .connect("ws://memory/client", "json", EventSink::new(1, tx.clone()))
            .await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));

        let session = transport
            .connect("ws://memory/client", "json", EventSink::new(2, tx))
            .await
            .unwrap();
        assert_eq!(transport.connect_count(), 2);
        let _greeting = rx.recv().await.unwrap();

        transport.close_current(CloseReason::transient("cable cut"));
        assert_eq!(
            rx.recv().await,
            Some((2, SessionEvent::Closed(CloseReason::transient("cable cut"))))
        );
        let result = session
            .send(r#"{"type":"sequenceAck","sequenceId":1}"#.to_string())
            .await;
        assert_eq!(result, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_recovery_url_keeps_connection_id() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _session = transport
            .connect(
                "ws://memory/client?access_token=x&awps_connection_id=abc%20d&awps_reconnection_token=t",
                "json",
                EventSink::new(1, tx),
            )
            .await
            .unwrap();
        let (_, SessionEvent::Frame(frame)) = rx.recv().await.unwrap() else {
            panic!("Expected greeting");
        };
        match decode(&frame).unwrap() {
            WireMessage::Connected(connected) => assert_eq!(connected.connection_id, "abc d"),
            other => panic!("Wrong message type: {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_wait_for_sent() {
        let transport = MemoryTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = transport
            .connect("ws://memory/client", "json", EventSink::new(1, tx))
            .await
            .unwrap();

        let waiter = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .wait_for_sent(Duration::from_secs(2), |sent| {
                        sent.iter().any(|m| {
                            matches!(m, OutboundMessage::SendEvent { data: MessageData::Text(t), .. } if t == "ping")
                        })
                    })
                    .await
            })
        };

        session
            .send(r#"{"type":"event","event":"e","dataType":"text","data":"ping"}"#.to_string())
            .await
            .unwrap();
        assert!(waiter.await.unwrap());
    }
}
