//! Escrow Settlement Machine - custody and release rules
//!
//! The write path of the system. A requester locks hour tokens for a
//! provider; the funds go to the provider once both parties confirm, or back
//! to the requester if either party cancels first.
//!
//! Every action holds the state write lock from its first guard check to its
//! last mutation, so actions are linearized the way ledger ordering would
//! linearize transactions. A rejected action mutates nothing, advances no
//! block and emits no event.

use crate::{
    codec::{encode_event, keccak256, to_hex},
    error::SettlementError,
    events::{CancelledEvent, CreatedEvent, EscrowEvent, LogPosition, ReleasedEvent},
    ledger_client::{LedgerClient, LogQuery, RawLog},
    models::{Address, Amount, BlockNumber, Escrow, EscrowId, EscrowStatus, Party},
    token_ledger::TokenLedger,
    EscrowResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for the settlement machine
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Address the machine holds custody under and emits logs from
    pub contract_address: Address,
    /// Head block before the first transaction
    pub genesis_block: BlockNumber,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        let mut bytes = [0u8; Address::LEN];
        bytes[Address::LEN - 1] = 0xe5;
        Self {
            contract_address: Address::from_bytes(bytes),
            genesis_block: 0,
        }
    }
}

/// Receipt of an accepted transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_id: Uuid,
    pub transaction_hash: String,
    pub block_number: BlockNumber,
    pub events: Vec<EscrowEvent>,
    pub submitted_at: DateTime<Utc>,
}

/// Receipt of a `create_escrow` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedReceipt {
    pub escrow_id: EscrowId,
    pub receipt: TxReceipt,
}

#[derive(Debug, Default)]
struct LedgerState {
    token: TokenLedger,
    escrows: BTreeMap<EscrowId, Escrow>,
    next_id: EscrowId,
    head: BlockNumber,
    journal: Vec<RawLog>,
}

impl LedgerState {
    /// Seal a transaction into the next block and journal its events
    fn commit(&mut self, contract: &Address, events: Vec<EscrowEvent>) -> TxReceipt {
        let tx_id = Uuid::new_v4();
        let transaction_hash = to_hex(&keccak256(tx_id.as_bytes()));
        self.head += 1;

        for event in &events {
            self.journal
                .push(encode_event(event, contract, &transaction_hash));
        }

        TxReceipt {
            tx_id,
            transaction_hash,
            block_number: self.head,
            events,
            submitted_at: Utc::now(),
        }
    }

    fn pending_escrow(
        &self,
        id: EscrowId,
        caller: &Address,
    ) -> Result<(Escrow, Party), SettlementError> {
        let escrow = self
            .escrows
            .get(&id)
            .ok_or(SettlementError::NotFound(id))?;

        let party = escrow
            .party_of(caller)
            .ok_or_else(|| SettlementError::Unauthorized {
                id,
                caller: caller.clone(),
            })?;

        if escrow.status != EscrowStatus::Pending {
            return Err(SettlementError::NotPending {
                id,
                status: escrow.status,
            });
        }

        Ok((escrow.clone(), party))
    }
}

/// Authoritative escrow state machine over an in-memory ledger
#[derive(Clone)]
pub struct SettlementMachine {
    config: SettlementConfig,
    state: Arc<RwLock<LedgerState>>,
}

impl SettlementMachine {
    /// Create a new settlement machine with an empty ledger
    pub fn new(config: SettlementConfig) -> Self {
        let state = LedgerState {
            head: config.genesis_block,
            ..LedgerState::default()
        };
        info!(contract = %config.contract_address, "Initializing settlement machine");

        Self {
            config,
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub fn contract_address(&self) -> &Address {
        &self.config.contract_address
    }

    /// Credit tokens to an account (test and demo seeding)
    pub async fn mint(&self, to: &Address, amount: Amount) -> Result<TxReceipt, SettlementError> {
        let mut state = self.state.write().await;
        state.token.mint(to, amount)?;
        debug!(account = %to, amount, "Minted hour tokens");
        Ok(state.commit(&self.config.contract_address, Vec::new()))
    }

    /// Grant the machine an allowance over `owner`'s tokens
    pub async fn approve(&self, owner: &Address, amount: Amount) -> TxReceipt {
        let mut state = self.state.write().await;
        state
            .token
            .approve(owner, &self.config.contract_address, amount);
        debug!(owner = %owner, amount, "Approved settlement machine");
        state.commit(&self.config.contract_address, Vec::new())
    }

    /// Lock `amount` from `caller` into a new escrow for `provider`
    pub async fn create_escrow(
        &self,
        caller: &Address,
        provider: &Address,
        amount: Amount,
    ) -> Result<CreatedReceipt, SettlementError> {
        info!(requester = %caller, provider = %provider, amount, "Creating escrow");

        let result = self.try_create(caller, provider, amount).await;
        match &result {
            Ok(created) => info!(
                escrow_id = created.escrow_id,
                block = created.receipt.block_number,
                "Created escrow"
            ),
            Err(e) => warn!(requester = %caller, error = %e, "Create escrow rejected"),
        }
        result
    }

    async fn try_create(
        &self,
        caller: &Address,
        provider: &Address,
        amount: Amount,
    ) -> Result<CreatedReceipt, SettlementError> {
        if amount == 0 {
            return Err(SettlementError::InvalidAmount);
        }
        if provider.is_zero() || provider == caller || *provider == self.config.contract_address {
            return Err(SettlementError::InvalidProvider(provider.clone()));
        }

        let contract = &self.config.contract_address;
        let mut state = self.state.write().await;

        // Checks allowance, then balance, before moving anything
        state.token.transfer_from(contract, caller, contract, amount)?;

        let id = state.next_id;
        state.next_id += 1;
        let block = state.head + 1;

        state.escrows.insert(
            id,
            Escrow::new(id, caller.clone(), provider.clone(), amount, block),
        );

        let event = EscrowEvent::Created(CreatedEvent {
            escrow_id: id,
            requester: caller.clone(),
            provider: provider.clone(),
            amount,
            position: LogPosition {
                block_number: block,
                log_index: 0,
            },
        });
        let receipt = state.commit(contract, vec![event]);

        Ok(CreatedReceipt {
            escrow_id: id,
            receipt,
        })
    }

    /// Record `caller`'s confirmation, releasing funds once both agree
    pub async fn confirm(
        &self,
        caller: &Address,
        id: EscrowId,
    ) -> Result<TxReceipt, SettlementError> {
        let result = self.try_confirm(caller, id).await;
        match &result {
            Ok(receipt) if receipt.events.is_empty() => {
                info!(escrow_id = id, party = %caller, "Recorded confirmation")
            }
            Ok(receipt) => info!(
                escrow_id = id,
                block = receipt.block_number,
                "Escrow completed, funds released"
            ),
            Err(e) => warn!(escrow_id = id, caller = %caller, error = %e, "Confirm rejected"),
        }
        result
    }

    async fn try_confirm(
        &self,
        caller: &Address,
        id: EscrowId,
    ) -> Result<TxReceipt, SettlementError> {
        let contract = &self.config.contract_address;
        let mut state = self.state.write().await;
        let (mut escrow, party) = state.pending_escrow(id, caller)?;

        let already = match party {
            Party::Requester => escrow.confirmed_by_requester,
            Party::Provider => escrow.confirmed_by_provider,
        };
        if already {
            return Err(SettlementError::AlreadyConfirmed {
                id,
                caller: caller.clone(),
            });
        }

        match party {
            Party::Requester => escrow.confirmed_by_requester = true,
            Party::Provider => escrow.confirmed_by_provider = true,
        }

        let mut events = Vec::new();
        if escrow.fully_confirmed() {
            escrow.validate_transition(EscrowStatus::Completed)?;
            state.token.transfer(contract, &escrow.provider, escrow.amount)?;

            let block = state.head + 1;
            escrow.status = EscrowStatus::Completed;
            escrow.completed_block = Some(block);
            events.push(EscrowEvent::Released(ReleasedEvent {
                escrow_id: id,
                provider: escrow.provider.clone(),
                amount: escrow.amount,
                position: LogPosition {
                    block_number: block,
                    log_index: 0,
                },
            }));
        }

        state.escrows.insert(id, escrow);
        Ok(state.commit(contract, events))
    }

    /// Cancel a pending escrow and refund the requester
    pub async fn cancel(
        &self,
        caller: &Address,
        id: EscrowId,
    ) -> Result<TxReceipt, SettlementError> {
        let result = self.try_cancel(caller, id).await;
        match &result {
            Ok(receipt) => info!(
                escrow_id = id,
                block = receipt.block_number,
                cancelled_by = %caller,
                "Escrow cancelled, funds refunded"
            ),
            Err(e) => warn!(escrow_id = id, caller = %caller, error = %e, "Cancel rejected"),
        }
        result
    }

    async fn try_cancel(
        &self,
        caller: &Address,
        id: EscrowId,
    ) -> Result<TxReceipt, SettlementError> {
        let contract = &self.config.contract_address;
        let mut state = self.state.write().await;
        let (mut escrow, _) = state.pending_escrow(id, caller)?;

        escrow.validate_transition(EscrowStatus::Cancelled)?;
        state.token.transfer(contract, &escrow.requester, escrow.amount)?;

        let block = state.head + 1;
        escrow.status = EscrowStatus::Cancelled;
        escrow.cancelled_block = Some(block);
        state.escrows.insert(id, escrow);

        let event = EscrowEvent::Cancelled(CancelledEvent {
            escrow_id: id,
            position: LogPosition {
                block_number: block,
                log_index: 0,
            },
        });
        Ok(state.commit(contract, vec![event]))
    }

    /// Current record of an escrow
    pub async fn escrow(&self, id: EscrowId) -> Option<Escrow> {
        self.state.read().await.escrows.get(&id).cloned()
    }

    /// All escrows ordered by id
    pub async fn escrows(&self) -> Vec<Escrow> {
        self.state.read().await.escrows.values().cloned().collect()
    }

    pub async fn balance(&self, account: &Address) -> Amount {
        self.state.read().await.token.balance_of(account)
    }

    pub async fn allowance(&self, owner: &Address) -> Amount {
        self.state
            .read()
            .await
            .token
            .allowance(owner, &self.config.contract_address)
    }

    /// Tokens currently held in custody
    pub async fn custody_balance(&self) -> Amount {
        self.balance(&self.config.contract_address).await
    }

    pub async fn total_supply(&self) -> Amount {
        self.state.read().await.token.total_supply()
    }

    pub async fn head(&self) -> BlockNumber {
        self.state.read().await.head
    }
}

#[async_trait]
impl LedgerClient for SettlementMachine {
    async fn block_number(&self) -> EscrowResult<BlockNumber> {
        Ok(self.head().await)
    }

    async fn balance_of(&self, account: &Address) -> EscrowResult<Amount> {
        Ok(self.balance(account).await)
    }

    async fn allowance_of(&self, owner: &Address, spender: &Address) -> EscrowResult<Amount> {
        Ok(self.state.read().await.token.allowance(owner, spender))
    }

    async fn get_logs(&self, query: &LogQuery) -> EscrowResult<Vec<RawLog>> {
        let state = self.state.read().await;
        let to_block = query.to_block.unwrap_or(state.head);
        let contract = query.address.as_str();

        let logs = state
            .journal
            .iter()
            .filter(|log| log.address.eq_ignore_ascii_case(contract))
            .filter(|log| {
                log.topics
                    .first()
                    .is_some_and(|t| t.eq_ignore_ascii_case(&query.topic0))
            })
            .filter(|log| {
                log.block_number
                    .as_deref()
                    .and_then(|raw| crate::codec::parse_quantity(raw).ok())
                    .is_some_and(|b| b >= query.from_block && b <= to_block)
            })
            .cloned()
            .collect();

        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::event_topic;
    use crate::events::EventKind;
    use crate::models::hours;

    fn stream_topics() -> [(EventKind, String); 3] {
        EventKind::ALL.map(|kind| (kind, event_topic(kind)))
    }

    fn requester() -> Address {
        Address::parse("0xAAaaAAaaAAaaAAaaAAaaAAaaAAaaAAaaAAaaAAaa").unwrap()
    }

    fn provider() -> Address {
        Address::parse("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb").unwrap()
    }

    fn stranger() -> Address {
        Address::parse("0xcccccccccccccccccccccccccccccccccccccccc").unwrap()
    }

    async fn funded_machine(amount: Amount) -> SettlementMachine {
        let machine = SettlementMachine::new(SettlementConfig::default());
        machine.mint(&requester(), amount).await.unwrap();
        machine.approve(&requester(), amount).await;
        machine
    }

    #[tokio::test]
    async fn test_create_and_release() {
        let amount = hours(10);
        let machine = funded_machine(amount).await;

        let created = machine
            .create_escrow(&requester(), &provider(), amount)
            .await
            .unwrap();
        assert_eq!(created.escrow_id, 0);
        assert_eq!(machine.custody_balance().await, amount);
        assert_eq!(machine.balance(&requester()).await, 0);
        assert_eq!(machine.allowance(&requester()).await, 0);

        let first = machine.confirm(&provider(), 0).await.unwrap();
        assert!(first.events.is_empty());
        assert_eq!(machine.balance(&provider()).await, 0);

        let second = machine.confirm(&requester(), 0).await.unwrap();
        assert_eq!(second.events.len(), 1);
        assert_eq!(machine.balance(&provider()).await, amount);
        assert_eq!(machine.custody_balance().await, 0);

        let escrow = machine.escrow(0).await.unwrap();
        assert_eq!(escrow.status, EscrowStatus::Completed);
        assert_eq!(escrow.completed_block, Some(second.block_number));

        let head = machine.head().await;
        for party in [provider(), requester()] {
            let again = machine.confirm(&party, 0).await.unwrap_err();
            assert!(matches!(again, SettlementError::NotPending { .. }));
        }
        assert_eq!(machine.head().await, head);
        assert_eq!(machine.balance(&provider()).await, amount);
    }

    #[tokio::test]
    async fn test_cancel_before_confirmation_restores_balance() {
        let machine = funded_machine(hours(5)).await;
        let before = machine.balance(&requester()).await;

        let created = machine
            .create_escrow(&requester(), &provider(), hours(2))
            .await
            .unwrap();
        assert_eq!(machine.balance(&requester()).await, before - hours(2));

        let receipt = machine.cancel(&requester(), created.escrow_id).await.unwrap();
        assert_eq!(receipt.events.len(), 1);
        assert_eq!(machine.balance(&requester()).await, before);
        assert_eq!(machine.balance(&provider()).await, 0);
        assert_eq!(machine.custody_balance().await, 0);
    }

    #[tokio::test]
    async fn test_mint_overflow_advances_nothing() {
        let machine = funded_machine(Amount::MAX).await;
        let head = machine.head().await;

        let err = machine.mint(&provider(), 1).await.unwrap_err();
        assert_eq!(err, SettlementError::SupplyOverflow { amount: 1 });
        assert_eq!(machine.head().await, head);
        assert_eq!(machine.total_supply().await, Amount::MAX);
    }

    #[tokio::test]
    async fn test_zero_amount_rejected() {
        let machine = funded_machine(hours(1)).await;
        let head = machine.head().await;

        let err = machine
            .create_escrow(&requester(), &provider(), 0)
            .await
            .unwrap_err();
        assert_eq!(err, SettlementError::InvalidAmount);
        assert_eq!(machine.head().await, head);
        assert!(machine.escrows().await.is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_allowance_rejected() {
        let machine = SettlementMachine::new(SettlementConfig::default());
        machine.mint(&requester(), hours(5)).await.unwrap();
        machine.approve(&requester(), hours(1)).await;

        let err = machine
            .create_escrow(&requester(), &provider(), hours(2))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::InsufficientAllowance { .. }));
        assert_eq!(machine.balance(&requester()).await, hours(5));
        assert_eq!(machine.allowance(&requester()).await, hours(1));
    }

    #[tokio::test]
    async fn test_self_escrow_rejected() {
        let machine = funded_machine(hours(1)).await;
        let err = machine
            .create_escrow(&requester(), &requester(), hours(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidProvider(_)));
    }

    #[tokio::test]
    async fn test_ids_are_gap_free() {
        let machine = funded_machine(hours(10)).await;
        machine
            .create_escrow(&requester(), &provider(), 0)
            .await
            .unwrap_err();

        let a = machine
            .create_escrow(&requester(), &provider(), hours(1))
            .await
            .unwrap();
        let b = machine
            .create_escrow(&requester(), &provider(), hours(1))
            .await
            .unwrap();
        assert_eq!((a.escrow_id, b.escrow_id), (0, 1));
    }

    #[tokio::test]
    async fn test_cancel_refunds_requester() {
        let amount = hours(3);
        let machine = funded_machine(amount).await;
        machine
            .create_escrow(&requester(), &provider(), amount)
            .await
            .unwrap();
        machine.confirm(&provider(), 0).await.unwrap();

        machine.cancel(&provider(), 0).await.unwrap();
        assert_eq!(machine.balance(&requester()).await, amount);
        assert_eq!(machine.balance(&provider()).await, 0);
        assert_eq!(machine.escrow(0).await.unwrap().status, EscrowStatus::Cancelled);

        assert!(matches!(
            machine.confirm(&requester(), 0).await.unwrap_err(),
            SettlementError::NotPending { .. }
        ));
        assert!(matches!(
            machine.cancel(&requester(), 0).await.unwrap_err(),
            SettlementError::NotPending { .. }
        ));
        assert_eq!(machine.balance(&requester()).await, amount);
    }

    #[tokio::test]
    async fn test_guards() {
        let machine = funded_machine(hours(2)).await;
        machine
            .create_escrow(&requester(), &provider(), hours(2))
            .await
            .unwrap();

        assert_eq!(
            machine.confirm(&provider(), 9).await.unwrap_err(),
            SettlementError::NotFound(9)
        );
        assert!(matches!(
            machine.cancel(&stranger(), 0).await.unwrap_err(),
            SettlementError::Unauthorized { .. }
        ));

        machine.confirm(&requester(), 0).await.unwrap();
        assert!(matches!(
            machine.confirm(&requester(), 0).await.unwrap_err(),
            SettlementError::AlreadyConfirmed { .. }
        ));
        // A rejected duplicate confirm must not release anything
        assert_eq!(machine.balance(&provider()).await, 0);
        assert_eq!(machine.escrow(0).await.unwrap().status, EscrowStatus::Pending);
    }

    #[tokio::test]
    async fn test_concurrent_confirm_and_cancel() {
        let amount = hours(4);
        let machine = funded_machine(amount).await;
        machine
            .create_escrow(&requester(), &provider(), amount)
            .await
            .unwrap();
        machine.confirm(&provider(), 0).await.unwrap();

        let confirming = machine.clone();
        let cancelling = machine.clone();
        let confirm = tokio::spawn(async move { confirming.confirm(&requester(), 0).await });
        let cancel = tokio::spawn(async move { cancelling.cancel(&provider(), 0).await });

        let confirm = confirm.await.unwrap();
        let cancel = cancel.await.unwrap();
        assert!(confirm.is_ok() ^ cancel.is_ok());

        let loser = if confirm.is_ok() { cancel } else { confirm };
        assert!(matches!(loser.unwrap_err(), SettlementError::NotPending { .. }));

        let paid = machine.balance(&provider()).await;
        let refunded = machine.balance(&requester()).await;
        assert_eq!(paid + refunded, amount);
        assert_eq!(machine.custody_balance().await, 0);
        assert_eq!(machine.total_supply().await, amount);
    }

    #[tokio::test]
    async fn test_logs_served_by_stream() {
        let machine = funded_machine(hours(2)).await;
        machine
            .create_escrow(&requester(), &provider(), hours(1))
            .await
            .unwrap();
        machine
            .create_escrow(&requester(), &provider(), hours(1))
            .await
            .unwrap();
        machine.cancel(&requester(), 1).await.unwrap();

        let [(_, created), (_, released), (_, cancelled)] = stream_topics();
        let query = |topic0: String| LogQuery {
            address: machine.contract_address().clone(),
            topic0,
            from_block: 0,
            to_block: None,
        };

        assert_eq!(machine.get_logs(&query(created)).await.unwrap().len(), 2);
        assert!(machine.get_logs(&query(released)).await.unwrap().is_empty());
        assert_eq!(machine.get_logs(&query(cancelled)).await.unwrap().len(), 1);
    }
}
