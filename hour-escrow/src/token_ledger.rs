//! Token Ledger - in-memory fungible hour token
//!
//! Balances and allowances of the hour token. The settlement machine holds
//! custody by owning a balance under its own address; every movement is a
//! transfer, so total supply only changes through `mint`.

use crate::error::SettlementError;
use crate::models::{Address, Amount};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct TokenLedger {
    balances: HashMap<Address, Amount>,
    allowances: HashMap<(Address, Address), Amount>,
    total_supply: Amount,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance_of(&self, account: &Address) -> Amount {
        self.balances.get(account).copied().unwrap_or(0)
    }

    pub fn allowance(&self, owner: &Address, spender: &Address) -> Amount {
        self.allowances
            .get(&(owner.clone(), spender.clone()))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_supply(&self) -> Amount {
        self.total_supply
    }

    /// Credit new tokens to an account
    ///
    /// Every balance is bounded by the total supply, so checking the supply
    /// keeps all later transfers in range.
    pub fn mint(&mut self, to: &Address, amount: Amount) -> Result<(), SettlementError> {
        let total_supply = self
            .total_supply
            .checked_add(amount)
            .ok_or(SettlementError::SupplyOverflow { amount })?;
        *self.balances.entry(to.clone()).or_insert(0) += amount;
        self.total_supply = total_supply;
        Ok(())
    }

    /// Set the allowance `owner` grants to `spender`
    pub fn approve(&mut self, owner: &Address, spender: &Address, amount: Amount) {
        self.allowances
            .insert((owner.clone(), spender.clone()), amount);
    }

    /// Move tokens owned by `from`
    pub fn transfer(
        &mut self,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), SettlementError> {
        let available = self.balance_of(from);
        if available < amount {
            return Err(SettlementError::InsufficientBalance {
                required: amount,
                available,
            });
        }

        self.balances.insert(from.clone(), available - amount);
        *self.balances.entry(to.clone()).or_insert(0) += amount;
        Ok(())
    }

    /// Move tokens on behalf of `from`, consuming `spender`'s allowance
    ///
    /// Both the allowance and the balance are checked before either is
    /// touched.
    pub fn transfer_from(
        &mut self,
        spender: &Address,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), SettlementError> {
        let allowed = self.allowance(from, spender);
        if allowed < amount {
            return Err(SettlementError::InsufficientAllowance {
                required: amount,
                available: allowed,
            });
        }

        self.transfer(from, to, amount)?;
        self.approve(from, spender, allowed - amount);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Address {
        Address::from_bytes([1; 20])
    }

    fn bob() -> Address {
        Address::from_bytes([2; 20])
    }

    fn vault() -> Address {
        Address::from_bytes([3; 20])
    }

    #[test]
    fn test_transfer_from_consumes_allowance() {
        let mut ledger = TokenLedger::new();
        ledger.mint(&alice(), 100).unwrap();
        ledger.approve(&alice(), &vault(), 60);

        ledger.transfer_from(&vault(), &alice(), &vault(), 40).unwrap();

        assert_eq!(ledger.balance_of(&alice()), 60);
        assert_eq!(ledger.balance_of(&vault()), 40);
        assert_eq!(ledger.allowance(&alice(), &vault()), 20);
        assert_eq!(ledger.total_supply(), 100);
    }

    #[test]
    fn test_insufficient_allowance_leaves_state() {
        let mut ledger = TokenLedger::new();
        ledger.mint(&alice(), 100).unwrap();
        ledger.approve(&alice(), &vault(), 10);

        let err = ledger
            .transfer_from(&vault(), &alice(), &vault(), 50)
            .unwrap_err();
        assert_eq!(
            err,
            SettlementError::InsufficientAllowance {
                required: 50,
                available: 10
            }
        );
        assert_eq!(ledger.balance_of(&alice()), 100);
        assert_eq!(ledger.allowance(&alice(), &vault()), 10);
    }

    #[test]
    fn test_insufficient_balance_keeps_allowance() {
        let mut ledger = TokenLedger::new();
        ledger.mint(&alice(), 5).unwrap();
        ledger.approve(&alice(), &vault(), 50);

        let err = ledger
            .transfer_from(&vault(), &alice(), &bob(), 50)
            .unwrap_err();
        assert!(matches!(err, SettlementError::InsufficientBalance { .. }));
        assert_eq!(ledger.allowance(&alice(), &vault()), 50);
        assert_eq!(ledger.balance_of(&bob()), 0);
    }

    #[test]
    fn test_mint_overflow_rejected() {
        let mut ledger = TokenLedger::new();
        ledger.mint(&alice(), Amount::MAX - 10).unwrap();

        let err = ledger.mint(&bob(), 11).unwrap_err();
        assert_eq!(err, SettlementError::SupplyOverflow { amount: 11 });
        assert_eq!(ledger.balance_of(&bob()), 0);
        assert_eq!(ledger.total_supply(), Amount::MAX - 10);

        ledger.mint(&bob(), 10).unwrap();
        assert_eq!(ledger.total_supply(), Amount::MAX);
    }
}
