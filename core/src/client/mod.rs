//! Client engine
//!
//! [`WebPubSubClient`] is the caller-facing handle. Starting it spawns a
//! driver task that owns the connection; every other call either reads
//! shared state or submits an operation through that driver's session.
//!
//! ```no_run
//! use webpubsub_core::{MessageData, StaticUrlCredential, WebPubSubClient, WebPubSubClientOptions};
//!
//! # async fn run() -> Result<(), webpubsub_core::ClientError> {
//! let client = WebPubSubClient::new(
//!     StaticUrlCredential::new("wss://host/client/hubs/chat?access_token=..."),
//!     WebPubSubClientOptions::default(),
//! );
//! client.on_group_message(|event| println!("{}: {:?}", event.group, event.data));
//! client.start().await?;
//! client.join_group("lobby").await?;
//! client
//!     .send_to_group("lobby", MessageData::text("hello"), Default::default())
//!     .await?;
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod ack;
pub mod blocking;
mod driver;
pub mod events;
pub mod options;
pub mod recovery;
pub mod state;

pub use ack::{AckHandle, AckOutcome, AckTracker};
pub use blocking::BlockingClient;
pub use events::{
    ConnectedEvent, DisconnectedEvent, EventHandlers, GroupMessageEvent, ListenerId,
    RejoinGroupFailedEvent, ServerMessageEvent, StoppedEvent,
};
pub use options::{Protocol, RetryPolicy, WebPubSubClientOptions};
pub use recovery::{recovery_url, RecoveryManager, SequenceTracker};
pub use state::{ConnectionState, StateCell};

use crate::credential::ClientCredential;
use crate::error::ClientError;
use crate::message::{AckId, MessageData, OutboundMessage, SequenceId};
use crate::transport::{Transport, WebSocketTransport};
use driver::{Driver, DriverCommand, Shared};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// Result of a completed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendResult {
    /// `None` for fire-and-forget sends
    pub ack_id: Option<AckId>,
    /// The service had already processed this ack id
    pub duplicated: bool,
}

impl From<AckOutcome> for SendResult {
    fn from(outcome: AckOutcome) -> Self {
        Self {
            ack_id: Some(outcome.ack_id),
            duplicated: outcome.duplicated,
        }
    }
}

impl SendResult {
    fn unacknowledged() -> Self {
        Self {
            ack_id: None,
            duplicated: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendToGroupOptions {
    /// Use this ack id instead of a generated one
    pub ack_id: Option<AckId>,
    /// Do not request an ack; `ack_id` is ignored
    pub fire_and_forget: bool,
    /// Do not echo the message back to this connection
    pub no_echo: bool,
}

impl SendToGroupOptions {
    pub fn with_ack_id(mut self, ack_id: AckId) -> Self {
        self.ack_id = Some(ack_id);
        self
    }

    pub fn fire_and_forget(mut self) -> Self {
        self.fire_and_forget = true;
        self
    }

    pub fn no_echo(mut self) -> Self {
        self.no_echo = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendEventOptions {
    pub ack_id: Option<AckId>,
    pub fire_and_forget: bool,
}

impl SendEventOptions {
    pub fn with_ack_id(mut self, ack_id: AckId) -> Self {
        self.ack_id = Some(ack_id);
        self
    }

    pub fn fire_and_forget(mut self) -> Self {
        self.fire_and_forget = true;
        self
    }
}

struct ClientInner {
    shared: Arc<Shared>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // Last handle gone: ask a running driver to shut down
        if let Some(control) = self.shared.control.lock().take() {
            let (done, _) = oneshot::channel();
            let _ = control.send(DriverCommand::Stop { done });
        }
    }
}

/// Handle to one logical client. Clones share the same connection.
#[derive(Clone)]
pub struct WebPubSubClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for WebPubSubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebPubSubClient")
            .field("state", &self.state())
            .field("connection_id", &self.connection_id())
            .finish()
    }
}

impl WebPubSubClient {
    /// Client over WebSockets
    pub fn new(credential: impl ClientCredential, options: WebPubSubClientOptions) -> Self {
        Self::with_transport(
            Arc::new(credential),
            Arc::new(WebSocketTransport::new()),
            options,
        )
    }

    /// Client over any transport
    pub fn with_transport(
        credential: Arc<dyn ClientCredential>,
        transport: Arc<dyn Transport>,
        options: WebPubSubClientOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                shared: Arc::new(Shared::new(options, transport, credential)),
            }),
        }
    }

    fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    pub fn options(&self) -> &WebPubSubClientOptions {
        &self.shared().options
    }

    // ====== LIFECYCLE ======

    /// Fetch an access URL and open the first session.
    ///
    /// Returns once the service has greeted the session, so
    /// `connection_id()` is set. A greeting that does not arrive within the
    /// ack timeout is not an error; the id is filled in when it does.
    pub async fn start(&self) -> Result<(), ClientError> {
        if !self.shared().state.transition(ConnectionState::Connecting) {
            return Err(ClientError::AlreadyStarted);
        }
        Driver::new(Arc::clone(&self.inner.shared)).start().await
    }

    /// Close the session and cancel every outstanding operation.
    ///
    /// Returns once the client is `Stopped`. A no-op when already stopped.
    pub async fn stop(&self) {
        let control = self.shared().control.lock().clone();
        let Some(control) = control else {
            return;
        };
        let (done, finished) = oneshot::channel();
        if control.send(DriverCommand::Stop { done }).is_err() {
            return;
        }
        // Err means the driver is already gone
        let _ = finished.await;
    }

    pub fn state(&self) -> ConnectionState {
        self.shared().state.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared().state.subscribe()
    }

    /// Wait until the client reaches `state`
    pub async fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        self.shared().state.wait_for(state, timeout).await
    }

    /// Connection id assigned by the service for the current session
    pub fn connection_id(&self) -> Option<String> {
        self.shared().link.read().connection_id.clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.shared().link.read().user_id.clone()
    }

    /// Next sequence id expected from the service
    pub fn sequence_id(&self) -> SequenceId {
        self.shared().recovery.sequence_id()
    }

    /// Groups this client will re-join on a new session
    pub fn joined_groups(&self) -> Vec<String> {
        self.shared().recovery.joined_groups()
    }

    pub fn pending_acks(&self) -> usize {
        self.shared().acks.pending_count()
    }

    // ====== OPERATIONS ======

    pub async fn join_group(&self, group: &str) -> Result<SendResult, ClientError> {
        self.shared().join_group(group, None).await.map(SendResult::from)
    }

    pub async fn join_group_with_ack_id(
        &self,
        group: &str,
        ack_id: AckId,
    ) -> Result<SendResult, ClientError> {
        self.shared()
            .join_group(group, Some(ack_id))
            .await
            .map(SendResult::from)
    }

    pub async fn leave_group(&self, group: &str) -> Result<SendResult, ClientError> {
        self.shared().leave_group(group, None).await.map(SendResult::from)
    }

    pub async fn leave_group_with_ack_id(
        &self,
        group: &str,
        ack_id: AckId,
    ) -> Result<SendResult, ClientError> {
        self.shared()
            .leave_group(group, Some(ack_id))
            .await
            .map(SendResult::from)
    }

    pub async fn send_to_group(
        &self,
        group: &str,
        data: MessageData,
        options: SendToGroupOptions,
    ) -> Result<SendResult, ClientError> {
        let group = group.to_string();
        let no_echo = options.no_echo;

        if options.fire_and_forget {
            self.shared()
                .send_untracked(OutboundMessage::SendToGroup {
                    group,
                    data,
                    ack_id: None,
                    no_echo,
                })
                .await?;
            return Ok(SendResult::unacknowledged());
        }

        self.shared()
            .send_tracked(options.ack_id, move |ack_id| OutboundMessage::SendToGroup {
                group,
                data,
                ack_id: Some(ack_id),
                no_echo,
            })
            .await
            .map(SendResult::from)
    }

    pub async fn send_event(
        &self,
        event: &str,
        data: MessageData,
        options: SendEventOptions,
    ) -> Result<SendResult, ClientError> {
        let event = event.to_string();

        if options.fire_and_forget {
            self.shared()
                .send_untracked(OutboundMessage::SendEvent {
                    event,
                    data,
                    ack_id: None,
                })
                .await?;
            return Ok(SendResult::unacknowledged());
        }

        self.shared()
            .send_tracked(options.ack_id, move |ack_id| OutboundMessage::SendEvent {
                event,
                data,
                ack_id: Some(ack_id),
            })
            .await
            .map(SendResult::from)
    }

    // ====== LISTENERS ======

    pub fn on_connected<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&ConnectedEvent) + Send + Sync + 'static,
    {
        self.shared().events.on_connected(handler)
    }

    pub fn on_disconnected<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&DisconnectedEvent) + Send + Sync + 'static,
    {
        self.shared().events.on_disconnected(handler)
    }

    pub fn on_group_message<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&GroupMessageEvent) + Send + Sync + 'static,
    {
        self.shared().events.on_group_message(handler)
    }

    pub fn on_server_message<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&ServerMessageEvent) + Send + Sync + 'static,
    {
        self.shared().events.on_server_message(handler)
    }

    pub fn on_stopped<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&StoppedEvent) + Send + Sync + 'static,
    {
        self.shared().events.on_stopped(handler)
    }

    pub fn on_rejoin_group_failed<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&RejoinGroupFailedEvent) + Send + Sync + 'static,
    {
        self.shared().events.on_rejoin_group_failed(handler)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared().events.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{CredentialError, MockClientCredential, StaticUrlCredential};
    use crate::error::SendFailureReason;
    use crate::transport::MemoryTransport;

    fn memory_client(transport: &MemoryTransport) -> WebPubSubClient {
        WebPubSubClient::with_transport(
            Arc::new(StaticUrlCredential::new("ws://memory/client")),
            Arc::new(transport.clone()),
            WebPubSubClientOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_send_while_stopped_fails_fast() {
        let transport = MemoryTransport::new();
        let client = memory_client(&transport);

        let err = client
            .send_to_group("g", MessageData::text("x"), SendToGroupOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_connected());
        assert!(client.join_group("g").await.unwrap_err().is_not_connected());
        assert_eq!(transport.connect_count(), 0);
        assert!(transport.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_start_twice() {
        let transport = MemoryTransport::new();
        let client = memory_client(&transport);

        client.start().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.start().await, Err(ClientError::AlreadyStarted));

        client.stop().await;
        assert_eq!(client.state(), ConnectionState::Stopped);
        // Restart is allowed after stop
        client.start().await.unwrap();
        client.stop().await;
    }

    #[tokio::test]
    async fn test_start_waits_for_greeting() {
        let transport = MemoryTransport::new();
        let client = memory_client(&transport);
        client.start().await.unwrap();
        assert_eq!(client.connection_id().as_deref(), Some("conn-1"));
        client.stop().await;

        // Without a greeting start gives up waiting after the ack timeout
        let silent = MemoryTransport::new();
        silent.set_greeting(false);
        let client = WebPubSubClient::with_transport(
            Arc::new(StaticUrlCredential::new("ws://memory/client")),
            Arc::new(silent.clone()),
            WebPubSubClientOptions::default().with_ack_timeout(Duration::from_millis(50)),
        );
        client.start().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.connection_id(), None);
        client.stop().await;
    }

    #[tokio::test]
    async fn test_credential_failure_is_connect_failed() {
        let mut credential = MockClientCredential::new();
        credential
            .expect_client_access_url()
            .times(1)
            .returning(|| Err(CredentialError("token service down".to_string())));

        let transport = MemoryTransport::new();
        let client = WebPubSubClient::with_transport(
            Arc::new(credential),
            Arc::new(transport.clone()),
            WebPubSubClientOptions::default(),
        );

        match client.start().await {
            Err(ClientError::ConnectFailed(reason)) => assert!(reason.contains("token service down")),
            other => panic!("Unexpected result: {:?}", other),
        }
        assert_eq!(client.state(), ConnectionState::Stopped);
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_is_connect_failed() {
        let transport = MemoryTransport::new();
        transport.fail_next_connects(1);
        let client = memory_client(&transport);

        assert!(matches!(client.start().await, Err(ClientError::ConnectFailed(_))));
        assert_eq!(client.state(), ConnectionState::Stopped);
        client.start().await.unwrap();
        client.stop().await;
    }

    #[tokio::test]
    async fn test_join_and_leave_track_membership() {
        let transport = MemoryTransport::new();
        let client = memory_client(&transport);
        client.start().await.unwrap();

        let result = client.join_group("g1").await.unwrap();
        assert!(result.ack_id.is_some());
        assert!(!result.duplicated);
        assert_eq!(client.joined_groups(), vec!["g1".to_string()]);

        client.leave_group("g1").await.unwrap();
        assert!(client.joined_groups().is_empty());
        client.stop().await;
    }

    #[tokio::test]
    async fn test_rejected_join_not_recorded() {
        let transport = MemoryTransport::new();
        transport.reject_group("secret", crate::message::AckErrorName::Forbidden);
        let client = memory_client(&transport);
        client.start().await.unwrap();

        match client.join_group("secret").await {
            Err(ClientError::SendMessageFailed {
                reason: SendFailureReason::Rejected(detail),
                ..
            }) => assert_eq!(detail.name, crate::message::AckErrorName::Forbidden),
            other => panic!("Unexpected result: {:?}", other),
        }
        assert!(client.joined_groups().is_empty());
        client.stop().await;
    }

    #[tokio::test]
    async fn test_fire_and_forget_has_no_ack() {
        let transport = MemoryTransport::new();
        let client = memory_client(&transport);
        client.start().await.unwrap();

        let result = client
            .send_event(
                "chat",
                MessageData::text("hi"),
                SendEventOptions::default().with_ack_id(99).fire_and_forget(),
            )
            .await
            .unwrap();
        assert_eq!(result.ack_id, None);
        assert!(transport.sent_messages().iter().any(|m| matches!(
            m,
            OutboundMessage::SendEvent { ack_id: None, .. }
        )));
        client.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let transport = MemoryTransport::new();
        let client = memory_client(&transport);
        client.stop().await;
        client.start().await.unwrap();
        client.stop().await;
        client.stop().await;
        assert_eq!(client.state(), ConnectionState::Stopped);
    }
}
