//! Core data models for the escrow system
//!
//! This module contains the escrow record, its status state machine,
//! ledger account identifiers and the fixed-point hour amount helpers.

use crate::error::{EscrowError, SettlementError};
use crate::EscrowResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Escrow identifier, assigned by a monotonic counter starting at 0
pub type EscrowId = u64;

/// Token amount in the smallest unit (18-decimal fixed point)
pub type Amount = u128;

/// Ledger block height
pub type BlockNumber = u64;

/// One hour token in smallest units
pub const HOUR_UNIT: Amount = 1_000_000_000_000_000_000;

/// Convert a raw token amount to hours
pub fn amount_to_hours(amount: Amount) -> f64 {
    amount as f64 / HOUR_UNIT as f64
}

/// Convert whole hours to a raw token amount
pub fn hours(whole: u64) -> Amount {
    whole as Amount * HOUR_UNIT
}

/// Ledger account identifier in canonical lowercase `0x` form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Byte length of an account identifier
    pub const LEN: usize = 20;

    /// Parse and normalize an address, accepting any hex case
    pub fn parse(raw: &str) -> EscrowResult<Self> {
        let trimmed = raw.trim();
        let hex_part = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| EscrowError::invalid_address(format!("{trimmed}: missing 0x prefix")))?;

        if hex_part.len() != Self::LEN * 2 {
            return Err(EscrowError::invalid_address(format!(
                "{trimmed}: expected {} hex characters, got {}",
                Self::LEN * 2,
                hex_part.len()
            )));
        }

        if !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EscrowError::invalid_address(format!(
                "{trimmed}: non-hex character"
            )));
        }

        Ok(Self(format!("0x{}", hex_part.to_ascii_lowercase())))
    }

    /// Build an address from its raw bytes
    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    /// Raw bytes of the address
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        // Construction guarantees 40 valid hex characters after the prefix
        if let Ok(decoded) = hex::decode(&self.0[2..]) {
            out.copy_from_slice(&decoded);
        }
        out
    }

    /// The all-zero address
    pub fn zero() -> Self {
        Self::from_bytes([0u8; Self::LEN])
    }

    pub fn is_zero(&self) -> bool {
        self.to_bytes() == [0u8; Self::LEN]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = EscrowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

/// Escrow state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EscrowStatus {
    /// Funds in custody, awaiting confirmations
    Pending,
    /// Both parties confirmed, funds released to provider
    Completed,
    /// Cancelled by a party, funds returned to requester
    Cancelled,
}

impl EscrowStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Check if a transition to `to` is allowed
    pub fn can_transition_to(&self, to: EscrowStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Completed) | (Self::Pending, Self::Cancelled)
        )
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "Pending",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// Which side of an escrow an account is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Party {
    Requester,
    Provider,
}

/// Escrow record held by the settlement machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escrow {
    pub id: EscrowId,
    pub requester: Address,
    pub provider: Address,
    pub amount: Amount,
    pub status: EscrowStatus,

    pub created_block: BlockNumber,
    pub completed_block: Option<BlockNumber>,
    pub cancelled_block: Option<BlockNumber>,

    // Only meaningful while Pending
    pub confirmed_by_requester: bool,
    pub confirmed_by_provider: bool,
}

impl Escrow {
    /// Create a new pending escrow
    pub fn new(
        id: EscrowId,
        requester: Address,
        provider: Address,
        amount: Amount,
        created_block: BlockNumber,
    ) -> Self {
        Self {
            id,
            requester,
            provider,
            amount,
            status: EscrowStatus::Pending,
            created_block,
            completed_block: None,
            cancelled_block: None,
            confirmed_by_requester: false,
            confirmed_by_provider: false,
        }
    }

    /// Side of this escrow held by `account`, if any
    pub fn party_of(&self, account: &Address) -> Option<Party> {
        if *account == self.requester {
            Some(Party::Requester)
        } else if *account == self.provider {
            Some(Party::Provider)
        } else {
            None
        }
    }

    /// Both confirmation flags are set
    pub fn fully_confirmed(&self) -> bool {
        self.confirmed_by_requester && self.confirmed_by_provider
    }

    /// Validate a state transition
    pub fn validate_transition(&self, to: EscrowStatus) -> Result<(), SettlementError> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(SettlementError::NotPending {
                id: self.id,
                status: self.status,
            })
        }
    }
}
