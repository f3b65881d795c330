// Connection driver: the task that owns the client's lifecycle
//
// One driver task per started client. It alone moves the state machine,
// installs and tears down transport sessions, and delivers inbound frames.
// Callers reach the session only through `Shared::submit`.

use super::ack::{AckOutcome, AckTracker};
use super::events::{
    ConnectedEvent, DisconnectedEvent, EventHandlers, GroupMessageEvent, RejoinGroupFailedEvent,
    ServerMessageEvent,
};
use super::options::WebPubSubClientOptions;
use super::recovery::{recovery_url, RecoveryManager};
use super::state::{ConnectionState, StateCell};
use crate::credential::ClientCredential;
use crate::error::{ClientError, SendFailureReason};
use crate::message::{codec, AckId, OutboundMessage, WireMessage};
use crate::transport::{
    CloseKind, CloseReason, EventSink, SessionEvent, SessionId, Transport, TransportError,
    TransportSession,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub(crate) enum DriverCommand {
    Stop { done: oneshot::Sender<()> },
    RejoinFailed {
        session_id: SessionId,
        group: String,
        error: ClientError,
    },
}

/// What the driver knows about the current logical session
#[derive(Default)]
pub(crate) struct Link {
    pub(crate) session: Option<(SessionId, Arc<dyn TransportSession>)>,
    pub(crate) connection_id: Option<String>,
    pub(crate) user_id: Option<String>,
    pub(crate) reconnection_token: Option<String>,
    /// Last URL issued by the credential
    pub(crate) access_url: Option<String>,
    /// Reason from a server `disconnected` message, reported on close
    pub(crate) disconnect_reason: Option<String>,
}

/// State shared between the facade, the driver and rejoin tasks
pub(crate) struct Shared {
    pub(crate) options: WebPubSubClientOptions,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) credential: Arc<dyn ClientCredential>,
    pub(crate) state: StateCell,
    pub(crate) acks: AckTracker,
    pub(crate) recovery: RecoveryManager,
    pub(crate) events: EventHandlers,
    pub(crate) link: RwLock<Link>,
    pub(crate) control: Mutex<Option<mpsc::UnboundedSender<DriverCommand>>>,
}

impl Shared {
    pub(crate) fn new(
        options: WebPubSubClientOptions,
        transport: Arc<dyn Transport>,
        credential: Arc<dyn ClientCredential>,
    ) -> Self {
        Self {
            options,
            transport,
            credential,
            state: StateCell::new(),
            acks: AckTracker::new(),
            recovery: RecoveryManager::new(),
            events: EventHandlers::new(),
            link: RwLock::new(Link::default()),
            control: Mutex::new(None),
        }
    }

    /// Encode and write one operation on the current session
    pub(crate) async fn submit(&self, message: &OutboundMessage) -> Result<(), ClientError> {
        let ack_id = message.ack_id();
        let frame = codec::encode(message)
            .map_err(|e| ClientError::send_failed(ack_id, SendFailureReason::Encode(e.to_string())))?;

        let session = self
            .link
            .read()
            .session
            .as_ref()
            .map(|(_, session)| Arc::clone(session));
        let Some(session) = session else {
            return Err(ClientError::not_connected(ack_id));
        };

        session
            .send(frame)
            .await
            .map_err(|e| ClientError::send_failed(ack_id, SendFailureReason::Transport(e.to_string())))
    }

    /// Send without waiting for an ack
    pub(crate) async fn send_untracked(&self, message: OutboundMessage) -> Result<(), ClientError> {
        if !self.state.current().is_connected() {
            return Err(ClientError::not_connected(None));
        }
        self.submit(&message).await
    }

    /// Register an ack, send the operation built for it, and wait
    pub(crate) async fn send_tracked<F>(
        &self,
        ack_id: Option<AckId>,
        build: F,
    ) -> Result<AckOutcome, ClientError>
    where
        F: FnOnce(AckId) -> OutboundMessage + Send,
    {
        if !self.state.current().is_connected() {
            return Err(ClientError::not_connected(ack_id));
        }

        let timeout = self.options.ack_timeout;
        let handle = match ack_id {
            Some(ack_id) => self.acks.register(ack_id, timeout)?,
            None => self.acks.register_next(timeout),
        };
        let ack_id = handle.ack_id();
        let message = build(ack_id);

        if let Err(e) = self.submit(&message).await {
            self.acks.cancel(ack_id);
            return Err(e);
        }
        handle.wait().await
    }

    pub(crate) async fn join_group(
        &self,
        group: &str,
        ack_id: Option<AckId>,
    ) -> Result<AckOutcome, ClientError> {
        let name = group.to_string();
        let outcome = self
            .send_tracked(ack_id, move |ack_id| OutboundMessage::JoinGroup {
                group: name,
                ack_id: Some(ack_id),
            })
            .await?;
        self.recovery.record_joined(group);
        Ok(outcome)
    }

    pub(crate) async fn leave_group(
        &self,
        group: &str,
        ack_id: Option<AckId>,
    ) -> Result<AckOutcome, ClientError> {
        let name = group.to_string();
        let outcome = self
            .send_tracked(ack_id, move |ack_id| OutboundMessage::LeaveGroup {
                group: name,
                ack_id: Some(ack_id),
            })
            .await?;
        self.recovery.record_left(group);
        Ok(outcome)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StopCause {
    /// `stop()` was called or the client was dropped
    Requested,
    /// No further session will be attempted
    GaveUp(String),
}

enum Next {
    Continue,
    Shutdown(StopCause),
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

pub(crate) struct Driver {
    shared: Arc<Shared>,
    session_events_tx: mpsc::UnboundedSender<(SessionId, SessionEvent)>,
    session_events: mpsc::UnboundedReceiver<(SessionId, SessionEvent)>,
    command_tx: mpsc::UnboundedSender<DriverCommand>,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    last_session_id: SessionId,
    stop_waiters: Vec<oneshot::Sender<()>>,
}

impl Driver {
    /// Create a driver and publish its command channel to the facade
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let (session_events_tx, session_events) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::unbounded_channel();
        *shared.control.lock() = Some(command_tx.clone());
        Self {
            shared,
            session_events_tx,
            session_events,
            command_tx,
            commands,
            last_session_id: 0,
            stop_waiters: Vec::new(),
        }
    }

    /// Open the first session and hand the driver to its own task.
    /// Expects the state to be `Connecting`.
    pub(crate) async fn start(mut self) -> Result<(), ClientError> {
        let url = match self.shared.credential.client_access_url().await {
            Ok(url) => url,
            Err(e) => {
                self.abort_start();
                return Err(ClientError::ConnectFailed(e.to_string()));
            }
        };

        if let Err(e) = self.open_session(&url).await {
            warn!("Initial connect failed: {}", e);
            self.abort_start();
            return Err(ClientError::ConnectFailed(e.to_string()));
        }
        self.shared.link.write().access_url = Some(url);

        self.enter_connected(true);
        if let Some(cause) = self.await_greeting().await {
            let reason = match &cause {
                StopCause::GaveUp(reason) => reason.clone(),
                StopCause::Requested => "client stopped".to_string(),
            };
            self.shutdown(cause).await;
            return Err(ClientError::ConnectFailed(reason));
        }
        tokio::spawn(self.run());
        Ok(())
    }

    /// Deliver frames of the first session until the service's `connected`
    /// message has been handled, bounded by the ack timeout.
    ///
    /// Returns a stop cause when the client shut down before the greeting.
    async fn await_greeting(&mut self) -> Option<StopCause> {
        let timeout = self.shared.options.ack_timeout;
        let deadline = Instant::now() + timeout;

        while self.shared.link.read().connection_id.is_none() {
            let received = tokio::time::timeout_at(deadline, self.session_events.recv()).await;
            let Ok(Some((session_id, event))) = received else {
                warn!("No connected message within {:?}", timeout);
                return None;
            };
            if !self.is_current(session_id) {
                continue;
            }
            let next = match event {
                SessionEvent::Frame(frame) => self.handle_frame(&frame).await,
                SessionEvent::Closed(reason) => Some(self.on_session_closed(reason)),
            };
            match next {
                None => {}
                // Dropped before the greeting; the run loop takes over
                Some(Next::Continue) => return None,
                Some(Next::Shutdown(cause)) => return Some(cause),
            }
        }
        None
    }

    fn abort_start(&self) {
        self.release_control();
        self.shared.state.transition(ConnectionState::Stopped);
    }

    async fn run(mut self) {
        let cause = loop {
            let next = match self.shared.state.current() {
                ConnectionState::Connected => self.run_connected().await,
                ConnectionState::Recovering => self.run_recovering().await,
                ConnectionState::Reconnecting => self.run_reconnecting().await,
                state => {
                    error!("Driver running in state {}", state);
                    Next::Shutdown(StopCause::Requested)
                }
            };
            if let Next::Shutdown(cause) = next {
                break cause;
            }
        };
        self.shutdown(cause).await;
    }

    // ====== CONNECTED ======

    async fn run_connected(&mut self) -> Next {
        let reliable = self.shared.options.protocol.is_reliable();
        let mut sweep = ticker(self.shared.options.ack_sweep_interval);
        let mut sequence_ack = ticker(self.shared.options.sequence_ack_interval);

        loop {
            tokio::select! {
                Some((session_id, event)) = self.session_events.recv() => {
                    if !self.is_current(session_id) {
                        debug!("Ignoring event from stale session {}", session_id);
                        continue;
                    }
                    let next = match event {
                        SessionEvent::Frame(frame) => self.handle_frame(&frame).await,
                        SessionEvent::Closed(reason) => Some(self.on_session_closed(reason)),
                    };
                    if let Some(next) = next {
                        return next;
                    }
                }
                command = self.commands.recv() => {
                    if let Some(next) = self.handle_command(command) {
                        return next;
                    }
                }
                _ = sweep.tick() => {
                    self.shared.acks.expire(Instant::now());
                }
                _ = sequence_ack.tick(), if reliable => {
                    self.flush_sequence_ack().await;
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: &str) -> Option<Next> {
        let message = match codec::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable frame: {}", e);
                return None;
            }
        };

        match message {
            WireMessage::Connected(connected) => {
                {
                    let mut link = self.shared.link.write();
                    link.connection_id = Some(connected.connection_id.clone());
                    link.user_id = connected.user_id.clone();
                    link.reconnection_token = connected.reconnection_token;
                }
                info!("Connected as {}", connected.connection_id);
                self.shared.events.emit_connected(&ConnectedEvent {
                    connection_id: connected.connection_id,
                    user_id: connected.user_id,
                });
                None
            }
            WireMessage::Disconnected(disconnected) => {
                info!("Server ended the session: {}", disconnected.reason);
                let session = {
                    let mut link = self.shared.link.write();
                    link.disconnect_reason = Some(disconnected.reason.clone());
                    link.reconnection_token = None;
                    link.session.as_ref().map(|(_, s)| Arc::clone(s))
                };
                if let Some(session) = session {
                    session.close("disconnected by server").await;
                }
                Some(self.on_session_closed(CloseReason::transient(disconnected.reason)))
            }
            WireMessage::Ack(ack) => {
                self.shared.acks.resolve(ack.ack_id, ack.success, ack.error);
                None
            }
            WireMessage::GroupData(message) => {
                if let Some(sequence_id) = message.sequence_id {
                    if !self.shared.recovery.observe_sequence(sequence_id) {
                        debug!("Dropping replayed group message {}", sequence_id);
                        return None;
                    }
                }
                self.shared.events.emit_group_message(&GroupMessageEvent {
                    group: message.group,
                    data: message.data,
                    from_user_id: message.from_user_id,
                    sequence_id: message.sequence_id,
                });
                None
            }
            WireMessage::ServerData(message) => {
                if let Some(sequence_id) = message.sequence_id {
                    if !self.shared.recovery.observe_sequence(sequence_id) {
                        debug!("Dropping replayed server message {}", sequence_id);
                        return None;
                    }
                }
                self.shared.events.emit_server_message(&ServerMessageEvent {
                    data: message.data,
                    sequence_id: message.sequence_id,
                });
                None
            }
        }
    }

    fn on_session_closed(&mut self, reason: CloseReason) -> Next {
        let (connection_id, description, recoverable) = {
            let mut link = self.shared.link.write();
            link.session = None;
            let description = link
                .disconnect_reason
                .take()
                .unwrap_or_else(|| reason.to_string());
            let recoverable = self.shared.options.protocol.is_reliable()
                && reason.kind != CloseKind::Stop
                && link.connection_id.is_some()
                && link.reconnection_token.is_some();
            (link.connection_id.clone(), description, recoverable)
        };
        info!("Session closed: {}", reason);

        if !recoverable && !self.shared.options.auto_reconnect {
            return Next::Shutdown(StopCause::GaveUp(description));
        }

        self.shared.events.emit_disconnected(&DisconnectedEvent {
            connection_id,
            reason: Some(description),
            terminal: false,
        });

        if recoverable {
            self.shared.state.transition(ConnectionState::Recovering);
        } else {
            self.enter_reconnecting();
        }
        Next::Continue
    }

    fn handle_command(&mut self, command: Option<DriverCommand>) -> Option<Next> {
        match command {
            Some(DriverCommand::Stop { done }) => {
                self.stop_waiters.push(done);
                Some(Next::Shutdown(StopCause::Requested))
            }
            Some(DriverCommand::RejoinFailed {
                session_id,
                group,
                error,
            }) => {
                // Only a refusal on the live session ends the membership.
                // Lost or timed-out rejoins are replayed on the next session.
                let refused = matches!(
                    error,
                    ClientError::SendMessageFailed {
                        reason: SendFailureReason::Rejected(_),
                        ..
                    }
                );
                if refused && self.is_current(session_id) {
                    self.shared.recovery.record_left(&group);
                }
                self.shared
                    .events
                    .emit_rejoin_failed(&RejoinGroupFailedEvent { group, error });
                None
            }
            None => Some(Next::Shutdown(StopCause::Requested)),
        }
    }

    async fn flush_sequence_ack(&self) {
        let Some(sequence_id) = self.shared.recovery.take_sequence_ack() else {
            return;
        };
        let message = OutboundMessage::SequenceAck { sequence_id };
        if let Err(e) = self.shared.submit(&message).await {
            debug!("sequenceAck {} not sent: {}", sequence_id, e);
            self.shared.recovery.restore_sequence_ack(sequence_id);
        }
    }

    // ====== RECOVERING / RECONNECTING ======

    async fn run_recovering(&mut self) -> Next {
        let policy = self.shared.options.recovery_policy.clone();
        let url = {
            let link = self.shared.link.read();
            match (&link.access_url, &link.connection_id, &link.reconnection_token) {
                (Some(url), Some(connection_id), Some(token)) => {
                    Some(recovery_url(url, connection_id, token))
                }
                _ => None,
            }
        };

        if let Some(url) = url {
            for attempt in 0..policy.max_attempts {
                let delay = match attempt {
                    0 => Duration::ZERO,
                    n => policy.delay_for(n - 1),
                };
                if let Some(next) = self.pause(delay).await {
                    return next;
                }

                info!("Recovery attempt {}/{}", attempt + 1, policy.max_attempts);
                match self.open_session(&url).await {
                    Ok(()) => {
                        info!("Session recovered");
                        self.enter_connected(false);
                        return Next::Continue;
                    }
                    Err(e) => warn!("Recovery attempt {} failed: {}", attempt + 1, e),
                }
            }
        }

        if !self.shared.options.auto_reconnect {
            return Next::Shutdown(StopCause::GaveUp(format!(
                "recovery gave up after {} attempts",
                policy.max_attempts
            )));
        }

        warn!("Recovery gave up, opening a new session");
        self.enter_reconnecting();
        Next::Continue
    }

    async fn run_reconnecting(&mut self) -> Next {
        let policy = self.shared.options.reconnect_policy.clone();

        for attempt in 0..policy.max_attempts {
            let delay = match attempt {
                0 => Duration::ZERO,
                n => policy.delay_for(n - 1),
            };
            if let Some(next) = self.pause(delay).await {
                return next;
            }

            info!("Reconnect attempt {}/{}", attempt + 1, policy.max_attempts);
            let url = match self.shared.credential.client_access_url().await {
                Ok(url) => url,
                Err(e) => {
                    warn!("Reconnect attempt {}: {}", attempt + 1, e);
                    continue;
                }
            };
            match self.open_session(&url).await {
                Ok(()) => {
                    self.shared.link.write().access_url = Some(url);
                    info!("Reconnected");
                    self.enter_connected(true);
                    return Next::Continue;
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt + 1, e),
            }
        }

        Next::Shutdown(StopCause::GaveUp(format!(
            "reconnect gave up after {} attempts",
            policy.max_attempts
        )))
    }

    /// Sleep between attempts while still honoring stop and ack deadlines
    async fn pause(&mut self, delay: Duration) -> Option<Next> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        let mut sweep = ticker(self.shared.options.ack_sweep_interval);

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    if let Some(next) = self.handle_command(command) {
                        return Some(next);
                    }
                }
                _ = &mut sleep => return None,
                _ = sweep.tick() => {
                    self.shared.acks.expire(Instant::now());
                }
            }
        }
    }

    fn enter_reconnecting(&self) {
        self.shared.state.transition(ConnectionState::Reconnecting);
        self.shared.acks.fail_all(|ack_id| {
            ClientError::send_failed(Some(ack_id), SendFailureReason::ConnectionLost)
        });
    }

    // ====== SESSIONS ======

    async fn open_session(&mut self, url: &str) -> Result<(), TransportError> {
        self.last_session_id += 1;
        let session_id = self.last_session_id;
        let sink = EventSink::new(session_id, self.session_events_tx.clone());
        let session = self
            .shared
            .transport
            .connect(url, self.shared.options.protocol.name(), sink)
            .await?;
        self.shared.link.write().session = Some((session_id, session));
        Ok(())
    }

    fn is_current(&self, session_id: SessionId) -> bool {
        self.shared
            .link
            .read()
            .session
            .as_ref()
            .map(|(current, _)| *current == session_id)
            .unwrap_or(false)
    }

    fn enter_connected(&self, new_logical_session: bool) {
        self.shared.state.transition(ConnectionState::Connected);

        if new_logical_session {
            let mut link = self.shared.link.write();
            link.connection_id = None;
            link.user_id = None;
            link.reconnection_token = None;
            drop(link);
            self.shared.acks.clear_history();
        }

        let rejoin = self
            .shared
            .recovery
            .on_enter_connected(new_logical_session, self.shared.options.auto_rejoin_groups);
        for group in rejoin {
            self.spawn_rejoin(group);
        }
    }

    fn spawn_rejoin(&self, group: String) {
        let shared = Arc::clone(&self.shared);
        let commands = self.command_tx.clone();
        let session_id = self.last_session_id;
        tokio::spawn(async move {
            if let Err(error) = shared.join_group(&group, None).await {
                warn!("Rejoining group {} failed: {}", group, error);
                let _ = commands.send(DriverCommand::RejoinFailed {
                    session_id,
                    group,
                    error,
                });
            }
        });
    }

    fn release_control(&self) {
        let mut control = self.shared.control.lock();
        let ours = control
            .as_ref()
            .map(|tx| tx.same_channel(&self.command_tx))
            .unwrap_or(false);
        if ours {
            *control = None;
        }
    }

    async fn shutdown(&mut self, cause: StopCause) {
        let (session, connection_id) = {
            let mut link = self.shared.link.write();
            let session = link.session.take();
            let connection_id = link.connection_id.take();
            *link = Link::default();
            (session, connection_id)
        };
        let had_session = session.is_some();
        if let Some((_, session)) = session {
            session.close("client stopped").await;
        }

        match cause {
            StopCause::Requested => {
                self.shared.acks.fail_all(|_| ClientError::Cancelled);
                if had_session {
                    self.shared.events.emit_disconnected(&DisconnectedEvent {
                        connection_id,
                        reason: Some("client stopped".to_string()),
                        terminal: true,
                    });
                }
            }
            StopCause::GaveUp(reason) => {
                warn!("Giving up on the connection: {}", reason);
                self.shared.acks.fail_all(|ack_id| {
                    ClientError::send_failed(Some(ack_id), SendFailureReason::ConnectionLost)
                });
                self.shared.events.emit_disconnected(&DisconnectedEvent {
                    connection_id,
                    reason: Some(reason),
                    terminal: true,
                });
            }
        }

        self.shared.recovery.reset();
        self.shared.acks.clear_history();
        self.release_control();
        while let Ok(command) = self.commands.try_recv() {
            if let DriverCommand::Stop { done } = command {
                self.stop_waiters.push(done);
            }
        }
        self.shared.state.transition(ConnectionState::Stopped);
        info!("Client stopped");
        self.shared.events.emit_stopped();

        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}
