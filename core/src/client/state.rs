// Connection state: the five lifecycle states and their legal transitions

use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Stopped,
    Connecting,
    Connected,
    /// Resuming the same logical session after a transport drop
    Recovering,
    /// Opening a new logical session
    Reconnecting,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Stopped, Connecting)
                | (Connecting, Connected)
                | (Connecting, Stopped)
                | (Connected, Recovering)
                | (Connected, Reconnecting)
                | (Connected, Stopped)
                | (Recovering, Connected)
                | (Recovering, Reconnecting)
                | (Recovering, Stopped)
                | (Reconnecting, Connected)
                | (Reconnecting, Stopped)
        )
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    pub fn is_stopped(self) -> bool {
        self == ConnectionState::Stopped
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Stopped => "Stopped",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Recovering => "Recovering",
            ConnectionState::Reconnecting => "Reconnecting",
        };
        f.write_str(name)
    }
}

/// Current state, observable by any number of watchers
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Stopped);
        Self { tx }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Move to `next` if the transition table allows it
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut from = ConnectionState::Stopped;
        let changed = self.tx.send_if_modified(|state| {
            from = *state;
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            info!("Connection state {} -> {}", from, next);
        } else {
            debug!("Refusing state transition {} -> {}", from, next);
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Wait until the state equals `target`, up to `timeout`
    pub async fn wait_for(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|state| *state == target))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_transition_table() {
        assert!(Stopped.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(Recovering));
        assert!(Recovering.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connected));

        assert!(!Stopped.can_transition_to(Connected));
        assert!(!Reconnecting.can_transition_to(Recovering));
        assert!(!Connected.can_transition_to(Connected));
        assert!(!Connecting.can_transition_to(Recovering));
    }

    #[test]
    fn test_every_state_can_stop() {
        for state in [Connecting, Connected, Recovering, Reconnecting] {
            assert!(state.can_transition_to(Stopped), "{} cannot stop", state);
        }
    }

    #[test]
    fn test_cell_rejects_illegal() {
        let cell = StateCell::new();
        assert!(!cell.transition(Connected));
        assert_eq!(cell.current(), Stopped);

        assert!(cell.transition(Connecting));
        assert!(!cell.transition(Connecting));
        assert!(cell.transition(Connected));
        assert!(cell.current().is_connected());
    }

    #[tokio::test]
    async fn test_wait_for_state() {
        let cell = std::sync::Arc::new(StateCell::new());
        let waiter = {
            let cell = std::sync::Arc::clone(&cell);
            tokio::spawn(async move { cell.wait_for(Connected, Duration::from_secs(2)).await })
        };
        cell.transition(Connecting);
        cell.transition(Connected);
        assert!(waiter.await.unwrap());

        assert!(!cell.wait_for(Recovering, Duration::from_millis(20)).await);
    }
}
