//! Ledger Client - outbound port to the host ledger
//!
//! The core only reads balances, allowances and ranged event logs through
//! this trait. `JsonRpcLedgerClient` talks to an Ethereum-compatible node,
//! `SettlementMachine` serves the same queries from memory.

use crate::models::{Address, Amount, BlockNumber};
use crate::EscrowResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Log entry as returned by `eth_getLogs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    pub block_number: Option<String>,
    pub transaction_hash: Option<String>,
    pub log_index: Option<String>,
    /// Set when the node returned an entry that is not a log object
    #[serde(skip)]
    pub unreadable: Option<String>,
}

impl RawLog {
    /// Stand-in for an entry that could not be read, decoded as malformed
    pub fn unreadable(entry: &Value, reason: impl Into<String>) -> Self {
        let field = |name: &str| entry.get(name).and_then(Value::as_str).map(str::to_string);
        Self {
            address: field("address").unwrap_or_default(),
            topics: Vec::new(),
            data: String::new(),
            block_number: field("blockNumber"),
            transaction_hash: field("transactionHash"),
            log_index: field("logIndex"),
            unreadable: Some(reason.into()),
        }
    }
}

/// Ranged log query by contract address and event topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub address: Address,
    /// `0x`-prefixed keccak256 of the event signature
    pub topic0: String,
    pub from_block: BlockNumber,
    /// Inclusive upper bound, `None` means the current head
    pub to_block: Option<BlockNumber>,
}

/// Read access to the host ledger
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Current head block
    async fn block_number(&self) -> EscrowResult<BlockNumber>;

    /// Token balance of an account
    async fn balance_of(&self, account: &Address) -> EscrowResult<Amount>;

    /// Token allowance granted by `owner` to `spender`
    async fn allowance_of(&self, owner: &Address, spender: &Address) -> EscrowResult<Amount>;

    /// Logs matching the query, ascending by block and log index
    async fn get_logs(&self, query: &LogQuery) -> EscrowResult<Vec<RawLog>>;
}
