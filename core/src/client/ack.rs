// Ack tracker: outstanding ack-tracked operations and their completions
//
// Each ack id maps to exactly one waiting caller. An entry leaves the table
// when its ack arrives, its deadline passes, or the session it was sent on
// is given up; whichever happens first completes the caller.

use crate::error::{ClientError, SendFailureReason};
use crate::message::codec::MAX_ACK_ID;
use crate::message::{AckErrorDetail, AckErrorName, AckId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How many completed ack ids are remembered for duplicate detection
pub const COMPLETED_HISTORY: usize = 1024;

/// Successful completion of an ack-tracked operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    pub ack_id: AckId,
    /// The service had already processed this ack id
    pub duplicated: bool,
}

pub type AckResult = Result<AckOutcome, ClientError>;

/// The caller's side of a registered ack
#[derive(Debug)]
pub struct AckHandle {
    ack_id: AckId,
    rx: oneshot::Receiver<AckResult>,
}

impl AckHandle {
    pub fn ack_id(&self) -> AckId {
        self.ack_id
    }

    /// Wait for the ack, the deadline sweep, or cancellation
    pub async fn wait(self) -> AckResult {
        match self.rx.await {
            Ok(result) => result,
            // Tracker dropped with the entry still pending
            Err(_) => Err(ClientError::Cancelled),
        }
    }
}

#[derive(Debug)]
struct PendingAck {
    deadline: Instant,
    completion: oneshot::Sender<AckResult>,
}

#[derive(Debug)]
struct TrackerState {
    pending: HashMap<AckId, PendingAck>,
    completed: HashSet<AckId>,
    completed_order: VecDeque<AckId>,
    history: usize,
    next_id: AckId,
}

impl TrackerState {
    fn remember_completed(&mut self, ack_id: AckId) {
        if self.history == 0 || !self.completed.insert(ack_id) {
            return;
        }
        self.completed_order.push_back(ack_id);
        while self.completed_order.len() > self.history {
            if let Some(oldest) = self.completed_order.pop_front() {
                self.completed.remove(&oldest);
            }
        }
    }

    fn insert(&mut self, ack_id: AckId, timeout: Duration) -> Result<AckHandle, ClientError> {
        if ack_id > MAX_ACK_ID {
            return Err(ClientError::send_failed(
                Some(ack_id),
                SendFailureReason::Encode(format!("ack id {} exceeds 63 bits", ack_id)),
            ));
        }
        if self.pending.contains_key(&ack_id) {
            return Err(ClientError::DuplicateAckId(ack_id));
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            ack_id,
            PendingAck {
                deadline: Instant::now() + timeout,
                completion: tx,
            },
        );
        Ok(AckHandle { ack_id, rx })
    }
}

/// Table of outstanding acks
#[derive(Debug)]
pub struct AckTracker {
    state: Mutex<TrackerState>,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AckTracker {
    pub fn new() -> Self {
        Self::with_history(COMPLETED_HISTORY)
    }

    /// Tracker remembering up to `history` completed ids
    pub fn with_history(history: usize) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                pending: HashMap::new(),
                completed: HashSet::new(),
                completed_order: VecDeque::new(),
                history,
                next_id: 1,
            }),
        }
    }

    /// Register a caller-chosen ack id.
    ///
    /// Fails with `DuplicateAckId` while the same id is still outstanding.
    pub fn register(&self, ack_id: AckId, timeout: Duration) -> Result<AckHandle, ClientError> {
        self.state.lock().insert(ack_id, timeout)
    }

    /// Register the next generated ack id, skipping ids still outstanding
    pub fn register_next(&self, timeout: Duration) -> AckHandle {
        let mut state = self.state.lock();
        loop {
            let ack_id = state.next_id;
            state.next_id = if ack_id >= MAX_ACK_ID { 1 } else { ack_id + 1 };
            if let Ok(handle) = state.insert(ack_id, timeout) {
                return handle;
            }
        }
    }

    /// Complete the caller waiting on `ack_id`.
    ///
    /// Returns false for an id nobody is waiting on; such acks are ignored.
    pub fn resolve(&self, ack_id: AckId, success: bool, error: Option<AckErrorDetail>) -> bool {
        let mut state = self.state.lock();
        let Some(pending) = state.pending.remove(&ack_id) else {
            debug!("Ignoring ack for unknown id {}", ack_id);
            return false;
        };

        let duplicate_error = matches!(
            &error,
            Some(AckErrorDetail {
                name: AckErrorName::Duplicate,
                ..
            })
        );

        let result = if success || duplicate_error {
            let seen_before = state.completed.contains(&ack_id);
            state.remember_completed(ack_id);
            Ok(AckOutcome {
                ack_id,
                duplicated: duplicate_error || seen_before,
            })
        } else {
            let detail = error.unwrap_or(AckErrorDetail {
                name: AckErrorName::InternalServerError,
                message: "ack reported failure without detail".to_string(),
            });
            Err(ClientError::send_failed(
                Some(ack_id),
                SendFailureReason::Rejected(detail),
            ))
        };
        drop(state);

        // Caller may have given up already
        let _ = pending.completion.send(result);
        true
    }

    /// Fail every entry whose deadline is at or before `now`
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<(AckId, PendingAck)> = {
            let mut state = self.state.lock();
            let ids: Vec<AckId> = state
                .pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        let count = expired.len();
        for (ack_id, pending) in expired {
            warn!("Ack {} timed out", ack_id);
            let _ = pending.completion.send(Err(ClientError::send_failed(
                Some(ack_id),
                SendFailureReason::Timeout,
            )));
        }
        count
    }

    /// Drop an entry without completing it, e.g. when the send itself failed
    pub fn cancel(&self, ack_id: AckId) -> bool {
        self.state.lock().pending.remove(&ack_id).is_some()
    }

    /// Fail every outstanding entry with the error built by `error_for`
    pub fn fail_all<F>(&self, error_for: F) -> usize
    where
        F: Fn(AckId) -> ClientError,
    {
        let drained: Vec<(AckId, PendingAck)> = self.state.lock().pending.drain().collect();
        let count = drained.len();
        for (ack_id, pending) in drained {
            let _ = pending.completion.send(Err(error_for(ack_id)));
        }
        if count > 0 {
            debug!("Failed {} outstanding acks", count);
        }
        count
    }

    /// Forget completed ids; a new logical session starts a new dedup window
    pub fn clear_history(&self) {
        let mut state = self.state.lock();
        state.completed.clear();
        state.completed_order.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_pending(&self, ack_id: AckId) -> bool {
        self.state.lock().pending.contains_key(&ack_id)
    }
}
