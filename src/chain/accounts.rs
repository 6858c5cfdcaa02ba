//! Account balances and the delegated staking table.
//!
//! The node consumes these through [`AccountState`]; [`InMemoryAccounts`]
//! is the implementation the node ships with, snapshotted per height by the
//! ledger so a rollback can restore it.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::chain::block::Block;
use crate::chain::transaction::{Address, Transaction};
use crate::config::GenesisStake;
use crate::consensus::synergy;
use crate::Hash;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    #[error("{address} cannot cover transaction {}", hex::encode(&tx[..8]))]
    InsufficientBalance { address: Address, tx: Hash },
    #[error("balance overflow for {0}")]
    Overflow(Address),
    #[error("invalid genesis stake: {0}")]
    Genesis(String),
    #[error("snapshot: {0}")]
    Snapshot(String),
}

impl AccountError {
    /// Hash of the transaction that caused the failure, if any.
    pub fn offending_tx(&self) -> Option<Hash> {
        match self {
            AccountError::InsufficientBalance { tx, .. } => Some(*tx),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingEntry {
    pub staked: u64,
    /// Addresses allowed to sign nonces and blocks for this delegated account.
    pub operators: Vec<Address>,
}

/// Account capability consumed by the ledger and the proposal round.
pub trait AccountState: Send + Sync {
    fn balance(&self, address: &Address) -> u64;
    fn staking(&self, delegated_id: u8) -> Option<StakingEntry>;
    fn total_staked(&self) -> u64;
    /// Check that `txs`, applied in order, never overdraw a sender.
    fn check_transfers(&self, txs: &[Transaction]) -> Result<(), AccountError>;
    /// Apply the transfers of `block` and credit its reward.
    fn apply_block(&self, block: &Block, txs: &[Transaction]) -> Result<(), AccountError>;
    /// Register an extra operator key for a delegated account.
    fn add_operator(&self, delegated_id: u8, operator: Address);
    fn snapshot(&self) -> Result<Vec<u8>, AccountError>;
    fn restore(&self, snapshot: &[u8]) -> Result<(), AccountError>;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct AccountsInner {
    balances: BTreeMap<Address, u64>,
    staking: BTreeMap<u8, StakingEntry>,
}

impl AccountsInner {
    fn simulate(&self, txs: &[Transaction]) -> Result<BTreeMap<Address, u64>, AccountError> {
        let mut balances = self.balances.clone();
        for tx in txs {
            let sender = tx.body.sender;
            let available = balances.get(&sender).copied().unwrap_or(0);
            let remaining = available
                .checked_sub(tx.body.amount)
                .ok_or(AccountError::InsufficientBalance {
                    address: sender,
                    tx: tx.hash,
                })?;
            balances.insert(sender, remaining);
            let recipient = tx.body.recipient;
            let credited = balances
                .get(&recipient)
                .copied()
                .unwrap_or(0)
                .checked_add(tx.body.amount)
                .ok_or(AccountError::Overflow(recipient))?;
            balances.insert(recipient, credited);
        }
        Ok(balances)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAccounts {
    inner: RwLock<AccountsInner>,
}

impl InMemoryAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the staking table and operator balances.
    pub fn from_genesis(stakes: &[GenesisStake]) -> Result<Self, AccountError> {
        let accounts = InMemoryAccounts::new();
        {
            let mut inner = accounts.write();
            for stake in stakes {
                if stake.delegated_id == 0 {
                    return Err(AccountError::Genesis("delegated id 0 is reserved".into()));
                }
                let mut operators = Vec::with_capacity(stake.operators.len());
                for hex_addr in &stake.operators {
                    let address = Address::from_hex(hex_addr)
                        .ok_or_else(|| AccountError::Genesis(format!("bad operator {hex_addr}")))?;
                    inner.balances.insert(address, stake.operator_balance);
                    operators.push(address);
                }
                inner.staking.insert(
                    stake.delegated_id,
                    StakingEntry {
                        staked: stake.stake,
                        operators,
                    },
                );
            }
        }
        Ok(accounts)
    }

    pub fn set_balance(&self, address: Address, amount: u64) {
        self.write().balances.insert(address, amount);
    }

    pub fn set_stake(&self, delegated_id: u8, entry: StakingEntry) {
        self.write().staking.insert(delegated_id, entry);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AccountsInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AccountsInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl AccountState for InMemoryAccounts {
    fn balance(&self, address: &Address) -> u64 {
        self.read().balances.get(address).copied().unwrap_or(0)
    }

    fn staking(&self, delegated_id: u8) -> Option<StakingEntry> {
        self.read().staking.get(&delegated_id).cloned()
    }

    fn total_staked(&self) -> u64 {
        self.read()
            .staking
            .values()
            .fold(0u64, |acc, e| acc.saturating_add(e.staked))
    }

    fn check_transfers(&self, txs: &[Transaction]) -> Result<(), AccountError> {
        self.read().simulate(txs).map(|_| ())
    }

    fn apply_block(&self, block: &Block, txs: &[Transaction]) -> Result<(), AccountError> {
        let mut inner = self.write();
        let mut balances = inner.simulate(txs)?;
        let (operator_share, delegated_share) =
            synergy::split_reward(block.reward, block.reward_percentage);
        for (address, amount) in [
            (block.header.operator, operator_share),
            (Address::delegated(block.header.delegated_id), delegated_share),
        ] {
            if amount == 0 {
                continue;
            }
            let entry = balances.entry(address).or_insert(0);
            *entry = entry.checked_add(amount).ok_or(AccountError::Overflow(address))?;
        }
        inner.balances = balances;
        Ok(())
    }

    fn add_operator(&self, delegated_id: u8, operator: Address) {
        let mut inner = self.write();
        let entry = inner.staking.entry(delegated_id).or_default();
        if !entry.operators.contains(&operator) {
            entry.operators.push(operator);
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, AccountError> {
        crate::serialize(&*self.read()).map_err(|e| AccountError::Snapshot(e.to_string()))
    }

    fn restore(&self, snapshot: &[u8]) -> Result<(), AccountError> {
        let restored: AccountsInner =
            crate::deserialize(snapshot).map_err(|e| AccountError::Snapshot(e.to_string()))?;
        *self.write() = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::block::tests::child;
    use crate::chain::transaction::tests::transfer;
    use crate::crypto::keys::{SchemeKind, SigningKeypair};

    fn funded(kp: &SigningKeypair, amount: u64) -> InMemoryAccounts {
        let accounts = InMemoryAccounts::new();
        accounts.set_balance(Address::from_public_key(&kp.public), amount);
        accounts
    }

    #[test]
    fn transfers_checked_in_order() {
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        let accounts = funded(&kp, 100);
        let a = transfer(&kp, Address::delegated(1), 60, 0);
        let b = transfer(&kp, Address::delegated(1), 50, 1);
        assert!(accounts.check_transfers(&[a.clone()]).is_ok());
        let err = accounts.check_transfers(&[a, b.clone()]).unwrap_err();
        assert_eq!(err.offending_tx(), Some(b.hash));
    }

    #[test]
    fn apply_block_moves_funds_and_pays_reward() {
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        let accounts = funded(&kp, 100);
        let sender = Address::from_public_key(&kp.public);
        let recipient = Address::delegated(9);
        let tx = transfer(&kp, recipient, 40, 0);
        let block = child(&Block::genesis(), &kp, vec![tx.hash]);

        accounts.apply_block(&block, &[tx]).unwrap();
        let (operator_share, delegated_share) =
            synergy::split_reward(block.reward, block.reward_percentage);
        assert_eq!(accounts.balance(&sender), 60 + operator_share);
        assert_eq!(accounts.balance(&recipient), 40);
        assert_eq!(accounts.balance(&Address::delegated(1)), delegated_share);
    }

    #[test]
    fn failed_apply_leaves_state_untouched() {
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        let accounts = funded(&kp, 10);
        let tx = transfer(&kp, Address::delegated(9), 40, 0);
        let block = child(&Block::genesis(), &kp, vec![tx.hash]);
        assert!(accounts.apply_block(&block, &[tx]).is_err());
        assert_eq!(accounts.balance(&Address::from_public_key(&kp.public)), 10);
    }

    #[test]
    fn snapshot_restore() {
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        let accounts = funded(&kp, 10);
        let snap = accounts.snapshot().unwrap();
        accounts.set_balance(Address::delegated(4), 99);
        accounts.restore(&snap).unwrap();
        assert_eq!(accounts.balance(&Address::delegated(4)), 0);
        assert_eq!(accounts.balance(&Address::from_public_key(&kp.public)), 10);
    }

    #[test]
    fn genesis_stakes_seed_table() {
        let op = Address::delegated(0xaa);
        let accounts = InMemoryAccounts::from_genesis(&[GenesisStake {
            delegated_id: 1,
            stake: 500,
            operators: vec![op.to_string()],
            operator_balance: 7,
        }])
        .unwrap();
        assert_eq!(accounts.total_staked(), 500);
        assert_eq!(accounts.staking(1).unwrap().operators, vec![op]);
        assert_eq!(accounts.balance(&op), 7);

        accounts.add_operator(1, Address::delegated(0xbb));
        assert_eq!(accounts.staking(1).unwrap().operators.len(), 2);

        let reserved = InMemoryAccounts::from_genesis(&[GenesisStake {
            delegated_id: 0,
            stake: 1,
            operators: vec![],
            operator_balance: 0,
        }]);
        assert!(reserved.is_err());
    }
}
