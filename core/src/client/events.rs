// Client events and listener registry
//
// Listeners run on the engine task, one event at a time, in arrival order.
// A slow listener delays delivery of everything behind it.

use crate::error::ClientError;
use crate::message::{MessageData, SequenceId};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A logical session is established (or re-established)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedEvent {
    pub connection_id: String,
    pub user_id: Option<String>,
}

/// The transport went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectedEvent {
    pub connection_id: Option<String>,
    pub reason: Option<String>,
    /// No further reconnect will be attempted
    pub terminal: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupMessageEvent {
    pub group: String,
    pub data: MessageData,
    pub from_user_id: Option<String>,
    pub sequence_id: Option<SequenceId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerMessageEvent {
    pub data: MessageData,
    pub sequence_id: Option<SequenceId>,
}

/// The client reached `Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoppedEvent;

/// Re-joining a group on a new logical session failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejoinGroupFailedEvent {
    pub group: String,
    pub error: ClientError,
}

/// Handle returned by every `on_*` registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct ListenerList<E> {
    entries: RwLock<Vec<(ListenerId, Handler<E>)>>,
}

impl<E> ListenerList<E> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, id: ListenerId, handler: Handler<E>) {
        self.entries.write().push((id, handler));
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    fn emit(&self, event: &E) {
        // Snapshot so a handler may register or remove listeners
        let handlers: Vec<Handler<E>> = self
            .entries
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// All listeners of one client
pub struct EventHandlers {
    next_id: AtomicU64,
    connected: ListenerList<ConnectedEvent>,
    disconnected: ListenerList<DisconnectedEvent>,
    group_message: ListenerList<GroupMessageEvent>,
    server_message: ListenerList<ServerMessageEvent>,
    stopped: ListenerList<StoppedEvent>,
    rejoin_failed: ListenerList<RejoinGroupFailedEvent>,
}

impl Default for EventHandlers {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EventHandlers {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            connected: ListenerList::new(),
            disconnected: ListenerList::new(),
            group_message: ListenerList::new(),
            server_message: ListenerList::new(),
            stopped: ListenerList::new(),
            rejoin_failed: ListenerList::new(),
        }
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on_connected<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&ConnectedEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.connected.add(id, Arc::new(handler));
        id
    }

    pub fn on_disconnected<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&DisconnectedEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.disconnected.add(id, Arc::new(handler));
        id
    }

    pub fn on_group_message<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&GroupMessageEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.group_message.add(id, Arc::new(handler));
        id
    }

    pub fn on_server_message<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&ServerMessageEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.server_message.add(id, Arc::new(handler));
        id
    }

    pub fn on_stopped<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&StoppedEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.stopped.add(id, Arc::new(handler));
        id
    }

    pub fn on_rejoin_group_failed<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&RejoinGroupFailedEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.rejoin_failed.add(id, Arc::new(handler));
        id
    }

    /// Remove a listener of any kind
    pub fn remove(&self, id: ListenerId) -> bool {
        self.connected.remove(id)
            || self.disconnected.remove(id)
            || self.group_message.remove(id)
            || self.server_message.remove(id)
            || self.stopped.remove(id)
            || self.rejoin_failed.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.connected.len()
            + self.disconnected.len()
            + self.group_message.len()
            + self.server_message.len()
            + self.stopped.len()
            + self.rejoin_failed.len()
    }

    pub(crate) fn emit_connected(&self, event: &ConnectedEvent) {
        self.connected.emit(event);
    }

    pub(crate) fn emit_disconnected(&self, event: &DisconnectedEvent) {
        self.disconnected.emit(event);
    }

    pub(crate) fn emit_group_message(&self, event: &GroupMessageEvent) {
        self.group_message.emit(event);
    }

    pub(crate) fn emit_server_message(&self, event: &ServerMessageEvent) {
        self.server_message.emit(event);
    }

    pub(crate) fn emit_stopped(&self) {
        self.stopped.emit(&StoppedEvent);
    }

    pub(crate) fn emit_rejoin_failed(&self, event: &RejoinGroupFailedEvent) {
        self.rejoin_failed.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_emit_in_registration_order() {
        let handlers = EventHandlers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            handlers.on_server_message(move |event| {
                seen.lock().push((tag, event.data.as_text().map(str::to_string)));
            });
        }

        handlers.emit_server_message(&ServerMessageEvent {
            data: MessageData::text("hi"),
            sequence_id: None,
        });

        assert_eq!(
            *seen.lock(),
            vec![
                ("first", Some("hi".to_string())),
                ("second", Some("hi".to_string()))
            ]
        );
    }

    #[test]
    fn test_remove_listener() {
        let handlers = EventHandlers::new();
        let count = Arc::new(AtomicU64::new(0));
        let id = {
            let count = Arc::clone(&count);
            handlers.on_stopped(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        handlers.emit_stopped();
        assert!(handlers.remove(id));
        assert!(!handlers.remove(id));
        handlers.emit_stopped();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(handlers.listener_count(), 0);
    }

    #[test]
    fn test_handler_can_register_listener() {
        let handlers = Arc::new(EventHandlers::new());
        let inner = Arc::clone(&handlers);
        handlers.on_connected(move |_| {
            inner.on_connected(|_| {});
        });

        handlers.emit_connected(&ConnectedEvent {
            connection_id: "c".to_string(),
            user_id: None,
        });
        assert_eq!(handlers.listener_count(), 2);
    }
}
