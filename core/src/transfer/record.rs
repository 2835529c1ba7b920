// Transfer records and their state machine

use crate::types::{PeerId, SendId};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => write!(f, "outbound"),
            Direction::Inbound => write!(f, "inbound"),
        }
    }
}

/// File metadata announced in an `ask`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
}

impl FileMeta {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

/// Sender: `Asking → Accepted → Sending → Sent`, or `Asking → Refused`.
/// Receiver: `AskReceived → Accepted → Receiving → Complete`, or
/// `AskReceived → Refused`. Any non-terminal state may become `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Asking,
    AskReceived,
    Accepted,
    Refused,
    Sending,
    Receiving,
    Sent,
    Complete,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Refused
                | TransferState::Sent
                | TransferState::Complete
                | TransferState::Failed
        )
    }

    pub fn can_transition(self, direction: Direction, next: TransferState) -> bool {
        use TransferState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        match direction {
            Direction::Outbound => matches!(
                (self, next),
                (Asking, Accepted) | (Asking, Refused) | (Accepted, Sending) | (Sending, Sent)
            ),
            Direction::Inbound => matches!(
                (self, next),
                (AskReceived, Accepted)
                    | (AskReceived, Refused)
                    | (Accepted, Receiving)
                    | (Receiving, Complete)
            ),
        }
    }
}

/// Bookkeeping for one transfer attempt.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub send_id: SendId,
    pub peer_id: PeerId,
    pub direction: Direction,
    pub file: FileMeta,
    pub state: TransferState,
    /// Outbound: the full encoded payload. Inbound: what arrived so far.
    pub payload: String,
    /// Chunks sent (outbound) or received (inbound)
    pub chunk_index: usize,
    /// Outbound only; zero until the payload is loaded
    pub total_chunks: usize,
    /// Chunks still to send
    pub remaining: usize,
    /// Creation order, used for round-robin fairness
    pub(crate) seq: u64,
}

impl TransferRecord {
    pub fn outbound(send_id: SendId, peer_id: PeerId, file: FileMeta) -> Self {
        Self::new(send_id, peer_id, Direction::Outbound, file, TransferState::Asking)
    }

    pub fn inbound(send_id: SendId, peer_id: PeerId, file: FileMeta) -> Self {
        Self::new(send_id, peer_id, Direction::Inbound, file, TransferState::AskReceived)
    }

    fn new(
        send_id: SendId,
        peer_id: PeerId,
        direction: Direction,
        file: FileMeta,
        state: TransferState,
    ) -> Self {
        Self {
            send_id,
            peer_id,
            direction,
            file,
            state,
            payload: String::new(),
            chunk_index: 0,
            total_chunks: 0,
            remaining: 0,
            seq: 0,
        }
    }

    /// Move to `next`; refuses backwards or cross-direction moves.
    pub fn advance(&mut self, next: TransferState) -> bool {
        if !self.state.can_transition(self.direction, next) {
            return false;
        }
        self.state = next;
        true
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            send_id: self.send_id.clone(),
            peer_id: self.peer_id.clone(),
            direction: self.direction,
            file: self.file.clone(),
            state: self.state,
            chunk_index: self.chunk_index,
            total_chunks: self.total_chunks,
            remaining: self.remaining,
        }
    }
}

/// Read-only view of a record, payload excluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    pub send_id: SendId,
    pub peer_id: PeerId,
    pub direction: Direction,
    pub file: FileMeta,
    pub state: TransferState,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub remaining: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound() -> TransferRecord {
        TransferRecord::outbound(SendId::new("s"), PeerId::new("p"), FileMeta::new("f", 1))
    }

    #[test]
    fn test_sender_happy_path() {
        let mut record = outbound();
        assert!(record.advance(TransferState::Accepted));
        assert!(record.advance(TransferState::Sending));
        assert!(record.advance(TransferState::Sent));
        assert!(!record.advance(TransferState::Failed));
    }

    #[test]
    fn test_no_going_back() {
        let mut record = outbound();
        record.advance(TransferState::Accepted);
        assert!(!record.advance(TransferState::Asking));
        assert!(!record.advance(TransferState::Refused));
        assert_eq!(record.state, TransferState::Accepted);
    }

    #[test]
    fn test_directions_do_not_mix() {
        let mut record = outbound();
        assert!(!record.advance(TransferState::Receiving));

        let mut inbound =
            TransferRecord::inbound(SendId::new("s"), PeerId::new("p"), FileMeta::new("f", 1));
        assert!(!inbound.advance(TransferState::Sending));
        assert!(inbound.advance(TransferState::Refused));
        assert!(inbound.state.is_terminal());
    }
}
