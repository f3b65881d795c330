// Caller-facing error types

use crate::message::{AckErrorDetail, AckId};
use std::fmt;
use thiserror::Error;

/// Why an outbound operation did not complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFailureReason {
    /// The client was not `Connected` when the call was made
    NotConnected,
    /// No ack arrived before the operation's deadline
    Timeout,
    /// The service answered with an error ack
    Rejected(AckErrorDetail),
    /// The logical session ended before the ack arrived
    ConnectionLost,
    /// The transport refused the frame
    Transport(String),
    /// The operation could not be put on the wire
    Encode(String),
}

impl fmt::Display for SendFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendFailureReason::NotConnected => write!(f, "not connected"),
            SendFailureReason::Timeout => write!(f, "timed out waiting for ack"),
            SendFailureReason::Rejected(detail) => write!(f, "rejected ({})", detail),
            SendFailureReason::ConnectionLost => write!(f, "connection lost"),
            SendFailureReason::Transport(e) => write!(f, "transport error: {}", e),
            SendFailureReason::Encode(e) => write!(f, "encode error: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Send failed: {reason}")]
    SendMessageFailed {
        ack_id: Option<AckId>,
        reason: SendFailureReason,
    },
    #[error("Cancelled: client stopped")]
    Cancelled,
    #[error("Ack id {0} is already outstanding")]
    DuplicateAckId(AckId),
    #[error("Client already started")]
    AlreadyStarted,
}

impl ClientError {
    pub(crate) fn send_failed(ack_id: Option<AckId>, reason: SendFailureReason) -> Self {
        ClientError::SendMessageFailed { ack_id, reason }
    }

    pub(crate) fn not_connected(ack_id: Option<AckId>) -> Self {
        Self::send_failed(ack_id, SendFailureReason::NotConnected)
    }

    /// The call failed because the client was not connected
    pub fn is_not_connected(&self) -> bool {
        matches!(
            self,
            ClientError::SendMessageFailed {
                reason: SendFailureReason::NotConnected,
                ..
            }
        )
    }

    /// Ack id of the failed operation, when it had one
    pub fn ack_id(&self) -> Option<AckId> {
        match self {
            ClientError::SendMessageFailed { ack_id, .. } => *ack_id,
            ClientError::DuplicateAckId(ack_id) => Some(*ack_id),
            _ => None,
        }
    }
}
