// Recovery: sequence tracking, group membership and session re-entry
//
// A recovered session keeps everything: the server replays what was missed
// and the sequence window continues. A new logical session starts the
// window over and, when enabled, replays the joins the client had.

use crate::message::SequenceId;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Tracks the next sequence id expected from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceTracker {
    next_expected: SequenceId,
    latest: Option<SequenceId>,
    unacked: bool,
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self {
            next_expected: 1,
            latest: None,
            unacked: false,
        }
    }

    /// Next sequence id the client expects; starts at 1
    pub fn current(&self) -> SequenceId {
        self.next_expected
    }

    /// Record a received sequence id. Returns false for a replay of
    /// something already delivered.
    pub fn observe(&mut self, sequence_id: SequenceId) -> bool {
        if sequence_id < self.next_expected {
            return false;
        }
        self.next_expected = sequence_id.saturating_add(1);
        self.latest = Some(sequence_id);
        self.unacked = true;
        true
    }

    /// Highest received id, if it has not been acknowledged yet
    pub fn take_ack(&mut self) -> Option<SequenceId> {
        if !self.unacked {
            return None;
        }
        self.unacked = false;
        self.latest
    }

    /// Put an id back after its sequenceAck could not be sent
    pub fn restore_ack(&mut self, sequence_id: SequenceId) {
        if self.latest == Some(sequence_id) {
            self.unacked = true;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Recovery state shared by the driver and the facade
#[derive(Debug, Default)]
pub struct RecoveryManager {
    groups: Mutex<BTreeSet<String>>,
    sequence: Mutex<SequenceTracker>,
}

impl RecoveryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called each time the client enters `Connected`.
    ///
    /// Returns the groups to re-join, in order. Empty for a recovered
    /// session or when rejoin is disabled.
    pub fn on_enter_connected(&self, new_logical_session: bool, rejoin_groups: bool) -> Vec<String> {
        if !new_logical_session {
            debug!("Session recovered, sequence continues at {}", self.sequence_id());
            return Vec::new();
        }

        self.sequence.lock().reset();
        if !rejoin_groups {
            return Vec::new();
        }
        let groups = self.joined_groups();
        if !groups.is_empty() {
            info!("Rejoining {} groups", groups.len());
        }
        groups
    }

    // ====== SEQUENCE ======

    pub fn observe_sequence(&self, sequence_id: SequenceId) -> bool {
        self.sequence.lock().observe(sequence_id)
    }

    pub fn sequence_id(&self) -> SequenceId {
        self.sequence.lock().current()
    }

    pub fn take_sequence_ack(&self) -> Option<SequenceId> {
        self.sequence.lock().take_ack()
    }

    pub fn restore_sequence_ack(&self, sequence_id: SequenceId) {
        self.sequence.lock().restore_ack(sequence_id);
    }

    // ====== GROUPS ======

    pub fn record_joined(&self, group: &str) {
        self.groups.lock().insert(group.to_string());
    }

    pub fn record_left(&self, group: &str) -> bool {
        self.groups.lock().remove(group)
    }

    pub fn is_joined(&self, group: &str) -> bool {
        self.groups.lock().contains(group)
    }

    pub fn joined_groups(&self) -> Vec<String> {
        self.groups.lock().iter().cloned().collect()
    }

    /// Forget everything; the client stopped
    pub fn reset(&self) {
        self.groups.lock().clear();
        self.sequence.lock().reset();
    }
}

/// URL that resumes `connection_id` on the same logical session
pub fn recovery_url(access_url: &str, connection_id: &str, reconnection_token: &str) -> String {
    let separator = if access_url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}awps_connection_id={}&awps_reconnection_token={}",
        access_url,
        separator,
        urlencoding::encode(connection_id),
        urlencoding::encode(reconnection_token)
    )
}
