//! Time-banking escrow for hour tokens
//!
//! A requester locks hour tokens for a provider; the funds are released once
//! both parties confirm, or refunded if either cancels first. The crate has
//! two halves:
//! - the write path, `SettlementMachine`, which holds custody and emits
//!   `EscrowCreated`, `Released` and `EscrowCancelled` events
//! - the read path, which replays those events through `EventReconciler` and
//!   derives trust metrics with `ReputationAggregator`
//!
//! Both halves meet at the `LedgerClient` port, implemented in memory by the
//! settlement machine and over JSON-RPC by `JsonRpcLedgerClient`.

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger_client;
pub mod models;
pub mod reconciler;
pub mod reputation;
pub mod reputation_service;
pub mod retry;
pub mod rpc_client;
pub mod settlement;
pub mod token_ledger;

use error::EscrowError;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;

pub use crate::config::EngineConfig;
pub use error::SettlementError;
pub use events::{EscrowEvent, EventKind, EventStreams};
pub use ledger_client::LedgerClient;
pub use models::{Address, Amount, BlockNumber, Escrow, EscrowId, EscrowStatus, HOUR_UNIT};
pub use reconciler::{reconcile, EventReconciler, ReconcileState, ReconcilerConfig};
pub use reputation::{Grade, NetworkSummary, ReputationAggregator, ReputationReport, ReputationStats, Role};
pub use reputation_service::{Completeness, QueryOutcome, ReputationService, ReputationView};
pub use retry::RetryPolicy;
pub use rpc_client::JsonRpcLedgerClient;
pub use settlement::{SettlementConfig, SettlementMachine, TxReceipt};
