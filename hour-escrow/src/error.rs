//! Error types for the escrow system
//!
//! Settlement errors are terminal for the action that raised them and are
//! produced before any state is touched. Read-side errors (log fetches,
//! malformed entries) are reported to the caller but never abort a
//! reconciliation that can still make progress.

use crate::models::{Address, Amount, EscrowId, EscrowStatus};
use thiserror::Error;

/// Rejection reasons of the settlement machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    /// Escrow amount was zero
    #[error("Escrow amount must be greater than 0")]
    InvalidAmount,

    /// Requester has not approved enough tokens to the machine
    #[error("Insufficient allowance: required {required}, available {available}")]
    InsufficientAllowance { required: Amount, available: Amount },

    /// Requester holds fewer tokens than the escrow amount
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: Amount, available: Amount },

    /// Provider cannot be the requester itself or the zero address
    #[error("Invalid provider {0}")]
    InvalidProvider(Address),

    /// Unknown escrow id
    #[error("Escrow {0} not found")]
    NotFound(EscrowId),

    /// Caller is neither requester nor provider
    #[error("{caller} is not a party to escrow {id}")]
    Unauthorized { id: EscrowId, caller: Address },

    /// Escrow already reached a terminal state
    #[error("Escrow {id} is not pending (status: {status})")]
    NotPending { id: EscrowId, status: EscrowStatus },

    /// Caller already confirmed this escrow
    #[error("{caller} already confirmed escrow {id}")]
    AlreadyConfirmed { id: EscrowId, caller: Address },

    /// Minting would push the supply past the amount range
    #[error("Minting {amount} would overflow the token supply")]
    SupplyOverflow { amount: Amount },
}

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Settlement machine rejected an action
    #[error("Settlement rejected: {0}")]
    Settlement(#[from] SettlementError),

    /// A ranged log query failed as a whole
    #[error("Log fetch failed for {stream}: {reason}")]
    LogFetch { stream: String, reason: String },

    /// A single log entry could not be decoded
    #[error("Malformed log entry: {0}")]
    MalformedLog(String),

    /// Address could not be parsed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// External integration errors (JSON-RPC node, transport)
    #[error("Integration error: {0}")]
    Integration(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Create a log fetch error for the named stream
    pub fn log_fetch<S: Into<String>, R: Into<String>>(stream: S, reason: R) -> Self {
        Self::LogFetch {
            stream: stream.into(),
            reason: reason.into(),
        }
    }

    /// Create a malformed log error
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::MalformedLog(msg.into())
    }

    /// Create an invalid address error
    pub fn invalid_address<S: Into<String>>(msg: S) -> Self {
        Self::InvalidAddress(msg.into())
    }

    /// Create an integration error
    pub fn integration<S: Into<String>>(msg: S) -> Self {
        Self::Integration(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying the same call could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LogFetch { .. } | Self::Integration(_))
    }
}

impl From<config::ConfigError> for EscrowError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<reqwest::Error> for EscrowError {
    fn from(err: reqwest::Error) -> Self {
        // Decode failures are permanent
        if err.is_decode() {
            Self::MalformedLog(format!("unreadable JSON-RPC response: {err}"))
        } else {
            Self::Integration(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settlement_error_wraps() {
        let err: EscrowError = SettlementError::InvalidAmount.into();
        assert!(matches!(err, EscrowError::Settlement(SettlementError::InvalidAmount)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_log_fetch_is_transient() {
        let err = EscrowError::log_fetch("EscrowCreated", "connection reset");
        assert!(err.is_transient());
        assert!(err.to_string().contains("EscrowCreated"));
    }
}
