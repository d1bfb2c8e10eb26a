//! Typed escrow events
//!
//! The settlement machine emits these and the reconciler consumes them.
//! Each stream (creation, release, cancellation) is queried separately from
//! the ledger, so every event carries its own block position.

use crate::models::{Address, Amount, BlockNumber, EscrowId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three independent event streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Released,
    Cancelled,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [Self::Created, Self::Released, Self::Cancelled];

    /// Canonical event signature, hashed into topic 0
    pub fn signature(self) -> &'static str {
        match self {
            Self::Created => "EscrowCreated(uint256,address,address,uint256)",
            Self::Released => "Released(uint256,address,uint256)",
            Self::Cancelled => "EscrowCancelled(uint256)",
        }
    }

    /// Number of topics a well-formed log of this kind carries
    pub fn topic_count(self) -> usize {
        match self {
            Self::Created => 4,
            Self::Released => 3,
            Self::Cancelled => 2,
        }
    }

    /// Number of 32-byte words in the log data
    pub fn data_words(self) -> usize {
        match self {
            Self::Created | Self::Released => 1,
            Self::Cancelled => 0,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "EscrowCreated",
            Self::Released => "Released",
            Self::Cancelled => "EscrowCancelled",
        };
        f.write_str(name)
    }
}

/// Position of a log within the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogPosition {
    pub block_number: BlockNumber,
    pub log_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedEvent {
    pub escrow_id: EscrowId,
    pub requester: Address,
    pub provider: Address,
    pub amount: Amount,
    pub position: LogPosition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedEvent {
    pub escrow_id: EscrowId,
    pub provider: Address,
    pub amount: Amount,
    pub position: LogPosition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelledEvent {
    pub escrow_id: EscrowId,
    pub position: LogPosition,
}

/// Any escrow event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EscrowEvent {
    Created(CreatedEvent),
    Released(ReleasedEvent),
    Cancelled(CancelledEvent),
}

impl EscrowEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Created(_) => EventKind::Created,
            Self::Released(_) => EventKind::Released,
            Self::Cancelled(_) => EventKind::Cancelled,
        }
    }

    pub fn escrow_id(&self) -> EscrowId {
        match self {
            Self::Created(e) => e.escrow_id,
            Self::Released(e) => e.escrow_id,
            Self::Cancelled(e) => e.escrow_id,
        }
    }

    pub fn position(&self) -> LogPosition {
        match self {
            Self::Created(e) => e.position,
            Self::Released(e) => e.position,
            Self::Cancelled(e) => e.position,
        }
    }

    pub fn block_number(&self) -> BlockNumber {
        self.position().block_number
    }
}

/// Decoded logs of the three streams, each ascending by position
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStreams {
    pub created: Vec<CreatedEvent>,
    pub released: Vec<ReleasedEvent>,
    pub cancelled: Vec<CancelledEvent>,
}

impl EventStreams {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.released.is_empty() && self.cancelled.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.released.len() + self.cancelled.len()
    }

    /// Sort each stream by ledger position
    pub fn normalize(&mut self) {
        self.created.sort_by_key(|e| (e.position, e.escrow_id));
        self.released.sort_by_key(|e| (e.position, e.escrow_id));
        self.cancelled.sort_by_key(|e| (e.position, e.escrow_id));
    }

    /// Highest block seen in any stream
    pub fn latest_block(&self) -> Option<BlockNumber> {
        let created = self.created.iter().map(|e| e.position.block_number);
        let released = self.released.iter().map(|e| e.position.block_number);
        let cancelled = self.cancelled.iter().map(|e| e.position.block_number);
        created.chain(released).chain(cancelled).max()
    }

    /// All events merged in ascending ledger order, for audit display
    pub fn timeline(&self) -> Vec<EscrowEvent> {
        let mut all: Vec<EscrowEvent> = self
            .created
            .iter()
            .cloned()
            .map(EscrowEvent::Created)
            .chain(self.released.iter().cloned().map(EscrowEvent::Released))
            .chain(self.cancelled.iter().cloned().map(EscrowEvent::Cancelled))
            .collect();
        all.sort_by_key(|e| (e.position(), e.kind(), e.escrow_id()));
        all
    }
}
