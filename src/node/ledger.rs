//! The single-writer ledger: chain height, last block and the commit and
//! rollback paths shared by the sync and proposal state machines.
//!
//! Every write goes through [`Ledger::lock`]. Holding the returned guard for
//! the whole verify-then-persist sequence is what keeps a sync batch and a
//! proposed block from interleaving writes at the same height.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, MutexGuard};

use crate::chain::accounts::{AccountError, AccountState};
use crate::chain::block::{Block, BlockError};
use crate::chain::stats::StatsSink;
use crate::chain::transaction::{Address, Transaction, TxError};
use crate::consensus::voting::EncryptionVoting;
use crate::constants::ENCRYPTION_CHANGE_MIN_HEIGHT;
use crate::crypto::scheme::{LiveSchemes, SchemeError, Slot};
use crate::node::mempool::Pools;
use crate::node::storage::{CommitBatch, Storage, StorageError};
use crate::Hash;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("block: {0}")]
    Block(#[from] BlockError),
    #[error("accounts: {0}")]
    Account(#[from] AccountError),
    #[error("encryption: {0}")]
    Scheme(#[from] SchemeError),
    #[error("transaction {}: {source}", hex::encode(&hash[..8]))]
    Transaction { hash: Hash, source: TxError },
    #[error("block {0} not found in store")]
    MissingBlock(u64),
    #[error("{} referenced transactions not available", .0.len())]
    MissingTransactions(Vec<Hash>),
    #[error("transaction {} already committed", hex::encode(&.0[..8]))]
    AlreadyCommitted(Hash),
    #[error("{0} slot changed without voting quorum")]
    UnbackedEncryptionChange(Slot),
    #[error("{slot} slot changed at height {height}, below the minimum")]
    EarlyEncryptionChange { slot: Slot, height: u64 },
    #[error("{operator} is not an operator of delegated account {id}")]
    UnknownOperator { id: u8, operator: Address },
    #[error("delegated account {id} stakes {staked}, below the minimum")]
    InsufficientStake { id: u8, staked: u64 },
}

impl LedgerError {
    /// The block was signed by a key with no right to propose it.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            LedgerError::UnknownOperator { .. } | LedgerError::InsufficientStake { .. }
        )
    }
}

/// Where a block being committed came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOrigin {
    /// A block proposed in the live nonce round; slot changes must be
    /// backed by the local voting quorum.
    Proposal,
    /// A historical block fetched during sync.
    Sync,
}

/// Result of a successful commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitReport {
    pub height: u64,
    pub transactions: usize,
    /// Slots whose live config was swapped by this block.
    pub changed_slots: Vec<Slot>,
}

/// Proof that the caller holds the commit lock.
pub type CommitGuard<'a> = MutexGuard<'a, ()>;

/// Clears the syncing flag when dropped.
pub struct SyncingGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct Ledger {
    storage: Arc<dyn Storage>,
    accounts: Arc<dyn AccountState>,
    stats: Arc<dyn StatsSink>,
    schemes: Arc<LiveSchemes>,
    voting: Arc<EncryptionVoting>,
    pools: Arc<Pools>,
    min_staking_for_node: u64,
    height: AtomicU64,
    syncing: AtomicBool,
    commit_lock: Mutex<()>,
    last_block: RwLock<Block>,
}

impl Ledger {
    /// Open the ledger on `storage`, writing genesis on first start and
    /// otherwise restoring accounts and live schemes at the stored height.
    ///
    /// Blocks are only committed when their operator belongs to a delegated
    /// account staking at least `min_staking_for_node`.
    pub fn open(
        storage: Arc<dyn Storage>,
        accounts: Arc<dyn AccountState>,
        stats: Arc<dyn StatsSink>,
        schemes: Arc<LiveSchemes>,
        voting: Arc<EncryptionVoting>,
        pools: Arc<Pools>,
        min_staking_for_node: u64,
    ) -> Result<Self, LedgerError> {
        let last_block = match storage.get_chain_height()? {
            None => {
                let genesis = Block::genesis();
                let snapshot = accounts.snapshot()?;
                storage.apply_commit_batch(&CommitBatch {
                    block: &genesis,
                    transactions: &[],
                    account_snapshot: snapshot,
                })?;
                tracing::info!(hash = %hex::encode(&genesis.block_hash[..8]), "Wrote genesis block");
                genesis
            }
            Some(height) => {
                let block = storage
                    .get_block(height)?
                    .ok_or(LedgerError::MissingBlock(height))?;
                if let Some(snapshot) = storage.get_account_snapshot(height)? {
                    accounts.restore(&snapshot)?;
                }
                tracing::info!(height, "Restored ledger");
                block
            }
        };
        for slot in Slot::BOTH {
            schemes.set(slot, last_block.header.encryption_config(slot)?);
        }
        Ok(Ledger {
            storage,
            accounts,
            stats,
            schemes,
            voting,
            pools,
            min_staking_for_node,
            height: AtomicU64::new(last_block.height()),
            syncing: AtomicBool::new(false),
            commit_lock: Mutex::new(()),
            last_block: RwLock::new(last_block),
        })
    }

    pub fn height(&self) -> u64 {
        self.height.load(Ordering::Acquire)
    }

    pub fn last_block(&self) -> Block {
        self.last_block.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn block(&self, height: u64) -> Result<Option<Block>, LedgerError> {
        Ok(self.storage.get_block(height)?)
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn accounts(&self) -> &Arc<dyn AccountState> {
        &self.accounts
    }

    pub fn schemes(&self) -> &Arc<LiveSchemes> {
        &self.schemes
    }

    pub fn voting(&self) -> &Arc<EncryptionVoting> {
        &self.voting
    }

    pub fn pools(&self) -> &Arc<Pools> {
        &self.pools
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Raise the syncing flag until the guard drops. Returns `None` if a
    /// batch is already being synced.
    pub fn begin_sync(&self) -> Option<SyncingGuard<'_>> {
        self.syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncingGuard {
                flag: &self.syncing,
            })
    }

    pub async fn lock(&self) -> CommitGuard<'_> {
        self.commit_lock.lock().await
    }

    /// Check that the block's operator signs for a sufficiently staked
    /// delegated account.
    pub fn check_operator(&self, block: &Block) -> Result<(), LedgerError> {
        let id = block.header.delegated_id;
        let entry = self.accounts.staking(id).unwrap_or_default();
        if !entry.operators.contains(&block.header.operator) {
            return Err(LedgerError::UnknownOperator {
                id,
                operator: block.header.operator,
            });
        }
        if entry.staked < self.min_staking_for_node {
            return Err(LedgerError::InsufficientStake {
                id,
                staked: entry.staked,
            });
        }
        Ok(())
    }

    /// Referenced hashes found neither in a pool nor in the ledger store.
    pub async fn missing_transactions(&self, block: &Block) -> Result<Vec<Hash>, LedgerError> {
        let mut missing = Vec::new();
        for hash in &block.tx_hashes {
            if !self.pools.exists(hash).await && !self.storage.has_transaction(hash)? {
                missing.push(*hash);
            }
        }
        Ok(missing)
    }

    /// The block's transactions, taken from the pools in block order.
    async fn collect_transactions(&self, block: &Block) -> Result<Vec<Transaction>, LedgerError> {
        let mut txs = Vec::with_capacity(block.tx_hashes.len());
        let mut missing = Vec::new();
        for hash in &block.tx_hashes {
            if self.storage.has_transaction(hash)? {
                return Err(LedgerError::AlreadyCommitted(*hash));
            }
            match self.pools.find(hash).await {
                Some(tx) => txs.push(tx),
                None => missing.push(*hash),
            }
        }
        if !missing.is_empty() {
            return Err(LedgerError::MissingTransactions(missing));
        }
        Ok(txs)
    }

    fn check_transactions(txs: &[Transaction], schemes: &LiveSchemes) -> Result<(), LedgerError> {
        for tx in txs {
            tx.verify(schemes).map_err(|source| LedgerError::Transaction {
                hash: tx.hash,
                source,
            })?;
        }
        Ok(())
    }

    /// Slot changes carried by `block`, checked against the rules for `origin`.
    fn check_encryption_change(
        &self,
        block: &Block,
        previous: &Block,
        origin: CommitOrigin,
    ) -> Result<Vec<Slot>, LedgerError> {
        let changed = block.changed_slots(previous);
        for slot in &changed {
            if block.height() < ENCRYPTION_CHANGE_MIN_HEIGHT {
                return Err(LedgerError::EarlyEncryptionChange {
                    slot: *slot,
                    height: block.height(),
                });
            }
            if origin == CommitOrigin::Proposal {
                let current = previous.header.encryption_config(*slot)?;
                let proposed = block.header.encryption_config(*slot)?;
                let backed = self.voting.decide(
                    *slot,
                    block.height(),
                    self.accounts.total_staked(),
                    &current,
                );
                if backed.as_ref() != Some(&proposed) {
                    return Err(LedgerError::UnbackedEncryptionChange(*slot));
                }
            }
        }
        Ok(changed)
    }

    /// Verify `block` on top of the last block and persist it.
    ///
    /// The block must be structurally valid and signed by an operator of a
    /// staked delegated account. Applies transfers, writes the block, its trie and an account
    /// snapshot, advances the height, swaps changed encryption slots and
    /// updates statistics. On a persistence failure the accounts are put
    /// back to the previous height; nothing is stored.
    pub async fn commit_block(
        &self,
        _guard: &CommitGuard<'_>,
        block: &Block,
        origin: CommitOrigin,
    ) -> Result<CommitReport, LedgerError> {
        let previous = self.last_block();
        let trie = block.check_base(&previous)?;
        self.check_operator(block)?;
        let changed = self.check_encryption_change(block, &previous, origin)?;
        let txs = self.collect_transactions(block).await?;
        Self::check_transactions(&txs, &previous.schemes()?)?;

        self.accounts.apply_block(block, &txs)?;
        let persisted = self
            .accounts
            .snapshot()
            .map_err(LedgerError::from)
            .and_then(|snapshot| {
                trie.store(self.storage.as_ref())?;
                self.storage.apply_commit_batch(&CommitBatch {
                    block,
                    transactions: &txs,
                    account_snapshot: snapshot,
                })?;
                Ok(())
            });
        if let Err(e) = persisted {
            tracing::warn!(height = block.height(), error = %e, "Commit failed, restoring accounts");
            if let Some(snapshot) = self.storage.get_account_snapshot(previous.height())? {
                self.accounts.restore(&snapshot)?;
            }
            return Err(e);
        }
        drop(trie);

        for tx in &txs {
            self.pools.remove(&tx.hash).await;
        }
        *self.last_block.write().unwrap_or_else(|e| e.into_inner()) = block.clone();
        self.height.store(block.height(), Ordering::Release);

        for slot in &changed {
            let config = block.header.encryption_config(*slot)?;
            tracing::warn!(slot = %slot, scheme = %config.name, paused = config.paused, "Encryption slot changed by block");
            self.schemes.set(*slot, config);
        }
        if !changed.is_empty() {
            self.voting.reset();
        }
        self.stats.update(block, &previous);
        tracing::info!(
            height = block.height(),
            txs = txs.len(),
            hash = %hex::encode(&block.block_hash[..8]),
            "Committed block"
        );
        Ok(CommitReport {
            height: block.height(),
            transactions: txs.len(),
            changed_slots: changed,
        })
    }

    /// Discard every block above `height`, returning their transactions to
    /// the pools and restoring accounts and live schemes at `height`.
    pub async fn rollback_to(&self, _guard: &CommitGuard<'_>, height: u64) -> Result<(), LedgerError> {
        let current = self.height();
        if height >= current {
            return Ok(());
        }
        let target = self
            .storage
            .get_block(height)?
            .ok_or(LedgerError::MissingBlock(height))?;
        for h in (height + 1..=current).rev() {
            if let Some(block) = self.storage.get_block(h)? {
                for hash in &block.tx_hashes {
                    if let Some(tx) = self.storage.get_transaction(hash)? {
                        self.storage.remove_transaction(hash)?;
                        self.pools.add(tx).await;
                    }
                }
            }
            self.storage.remove_block(h)?;
            self.storage.remove_merkle_tree(h)?;
            self.storage.remove_account_snapshot(h)?;
        }
        if let Some(snapshot) = self.storage.get_account_snapshot(height)? {
            self.accounts.restore(&snapshot)?;
        }
        self.storage.put_chain_height(height)?;
        for slot in Slot::BOTH {
            self.schemes.set(slot, target.header.encryption_config(slot)?);
        }
        *self.last_block.write().unwrap_or_else(|e| e.into_inner()) = target;
        self.height.store(height, Ordering::Release);
        tracing::warn!(from = current, to = height, "Rolled back ledger");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::accounts::{InMemoryAccounts, StakingEntry};
    use crate::chain::block::tests::child;
    use crate::chain::stats::StatsManager;
    use crate::chain::transaction::tests::transfer;
    use crate::config::PoolSection;
    use crate::crypto::keys::{SchemeKind, SigningKeypair};
    use crate::crypto::merkle::MerkleTrie;
    use crate::crypto::scheme::EncryptionConfig;
    use crate::node::storage::SledStorage;

    pub(crate) const MIN_STAKE: u64 = 500;

    pub(crate) fn open_ledger(accounts: Arc<InMemoryAccounts>) -> Ledger {
        Ledger::open(
            Arc::new(SledStorage::open_temporary().unwrap()),
            accounts,
            Arc::new(StatsManager::new()),
            Arc::new(LiveSchemes::default()),
            Arc::new(EncryptionVoting::new(60)),
            Arc::new(Pools::new(&PoolSection::default())),
            MIN_STAKE,
        )
        .unwrap()
    }

    /// Make `kp` the operator of delegated account 1, the account test
    /// blocks from `child` are signed for.
    pub(crate) fn stake_operator(accounts: &InMemoryAccounts, kp: &SigningKeypair) {
        accounts.set_stake(
            1,
            StakingEntry {
                staked: 1_000,
                operators: vec![Address::from_public_key(&kp.public)],
            },
        );
    }

    /// Accounts where `kp` operates delegated account 1.
    pub(crate) fn operated_by(kp: &SigningKeypair) -> Arc<InMemoryAccounts> {
        let accounts = Arc::new(InMemoryAccounts::new());
        stake_operator(&accounts, kp);
        accounts
    }

    #[tokio::test]
    async fn opens_at_genesis() {
        let ledger = open_ledger(Arc::new(InMemoryAccounts::new()));
        assert_eq!(ledger.height(), 0);
        assert_eq!(ledger.last_block(), Block::genesis());
        assert_eq!(ledger.block(0).unwrap(), Some(Block::genesis()));
    }

    #[tokio::test]
    async fn commit_applies_transfers_and_drains_pool() {
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        let accounts = operated_by(&kp);
        accounts.set_balance(Address::from_public_key(&kp.public), 100);
        let ledger = open_ledger(accounts.clone());

        let tx = transfer(&kp, Address::delegated(5), 30, 0);
        ledger.pools().add(tx.clone()).await;
        let block = child(&ledger.last_block(), &kp, vec![tx.hash]);

        let guard = ledger.lock().await;
        let report = ledger.commit_block(&guard, &block, CommitOrigin::Sync).await.unwrap();
        assert_eq!(report.height, 1);
        assert_eq!(report.transactions, 1);
        assert_eq!(ledger.height(), 1);
        assert_eq!(accounts.balance(&Address::delegated(5)), 30);
        assert!(!ledger.pools().exists(&tx.hash).await);
        assert!(ledger.storage().has_transaction(&tx.hash).unwrap());
        let trie = MerkleTrie::load(ledger.storage().as_ref(), 1).unwrap().unwrap();
        assert_eq!(trie.root(), block.header.root_merkle);

        // Replaying the same hash in a later block is refused.
        let replay = child(&block, &kp, vec![tx.hash]);
        assert!(matches!(
            ledger.commit_block(&guard, &replay, CommitOrigin::Sync).await,
            Err(LedgerError::AlreadyCommitted(_))
        ));
    }

    #[tokio::test]
    async fn missing_and_unfunded_transactions_block_commit() {
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        let ledger = open_ledger(operated_by(&kp));
        let tx = transfer(&kp, Address::delegated(5), 30, 0);
        let block = child(&ledger.last_block(), &kp, vec![tx.hash]);

        assert_eq!(ledger.missing_transactions(&block).await.unwrap(), vec![tx.hash]);
        let guard = ledger.lock().await;
        assert!(matches!(
            ledger.commit_block(&guard, &block, CommitOrigin::Sync).await,
            Err(LedgerError::MissingTransactions(_))
        ));

        ledger.pools().add(tx.clone()).await;
        assert!(ledger.missing_transactions(&block).await.unwrap().is_empty());
        let err = ledger.commit_block(&guard, &block, CommitOrigin::Sync).await.unwrap_err();
        assert!(matches!(err, LedgerError::Account(AccountError::InsufficientBalance { .. })));
        assert_eq!(ledger.height(), 0);
        assert!(ledger.block(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn rollback_restores_state_and_returns_transactions() {
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        let accounts = operated_by(&kp);
        let sender = Address::from_public_key(&kp.public);
        accounts.set_balance(sender, 100);
        let ledger = open_ledger(accounts.clone());
        let guard = ledger.lock().await;

        let one = child(&ledger.last_block(), &kp, vec![]);
        ledger.commit_block(&guard, &one, CommitOrigin::Sync).await.unwrap();
        let balance_at_one = accounts.balance(&sender);

        let tx = transfer(&kp, Address::delegated(5), 30, 0);
        ledger.pools().add(tx.clone()).await;
        let two = child(&one, &kp, vec![tx.hash]);
        ledger.commit_block(&guard, &two, CommitOrigin::Sync).await.unwrap();
        let three = child(&two, &kp, vec![]);
        ledger.commit_block(&guard, &three, CommitOrigin::Sync).await.unwrap();
        assert_eq!(ledger.height(), 3);

        ledger.rollback_to(&guard, 1).await.unwrap();
        assert_eq!(ledger.height(), 1);
        assert_eq!(ledger.last_block(), one);
        assert!(ledger.block(2).unwrap().is_none());
        assert!(ledger.block(3).unwrap().is_none());
        assert_eq!(accounts.balance(&sender), balance_at_one);
        assert!(ledger.pools().exists(&tx.hash).await);
        assert!(!ledger.storage().has_transaction(&tx.hash).unwrap());
        assert_eq!(ledger.storage().get_chain_height().unwrap(), Some(1));
    }

    #[tokio::test]
    async fn encryption_changes_need_height_and_quorum() {
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        let ledger = open_ledger(operated_by(&kp));
        let guard = ledger.lock().await;
        let paused = EncryptionConfig::for_scheme(SchemeKind::Dilithium5, true);

        // Too early.
        let mut early = child(&ledger.last_block(), &kp, vec![]);
        early.header.encryption[1] = paused.to_bytes();
        early.header.sign(Slot::Primary, &kp).unwrap();
        early.seal().unwrap();
        assert!(matches!(
            ledger.commit_block(&guard, &early, CommitOrigin::Sync).await,
            Err(LedgerError::EarlyEncryptionChange { .. })
        ));

        for _ in 0..2 {
            let block = child(&ledger.last_block(), &kp, vec![]);
            ledger.commit_block(&guard, &block, CommitOrigin::Sync).await.unwrap();
        }

        let mut change = child(&ledger.last_block(), &kp, vec![]);
        change.header.encryption[1] = paused.to_bytes();
        change.header.sign(Slot::Primary, &kp).unwrap();
        change.seal().unwrap();

        // A live proposal without votes behind it is refused.
        assert!(matches!(
            ledger.commit_block(&guard, &change, CommitOrigin::Proposal).await,
            Err(LedgerError::UnbackedEncryptionChange(Slot::Secondary))
        ));

        ledger
            .voting()
            .save_vote(Slot::Secondary, 1, paused.to_bytes(), 3, 1_000)
            .unwrap();
        let report = ledger
            .commit_block(&guard, &change, CommitOrigin::Proposal)
            .await
            .unwrap();
        assert_eq!(report.changed_slots, vec![Slot::Secondary]);
        assert!(ledger.schemes().is_paused(Slot::Secondary));
        assert_eq!(ledger.voting().vote_count(Slot::Secondary), 0);

        ledger.rollback_to(&guard, 2).await.unwrap();
        assert!(!ledger.schemes().is_paused(Slot::Secondary));
    }

    #[tokio::test]
    async fn blocks_need_a_staked_operator() {
        let operator = SigningKeypair::generate(SchemeKind::Falcon512);
        let stranger = SigningKeypair::generate(SchemeKind::Falcon512);
        let accounts = operated_by(&operator);
        let ledger = open_ledger(accounts.clone());
        let guard = ledger.lock().await;

        let forged = child(&ledger.last_block(), &stranger, vec![]);
        let err = ledger
            .commit_block(&guard, &forged, CommitOrigin::Sync)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnknownOperator { id: 1, .. }));
        assert!(err.is_unauthorized());
        assert_eq!(ledger.height(), 0);

        accounts.set_stake(
            1,
            StakingEntry {
                staked: MIN_STAKE - 1,
                operators: vec![Address::from_public_key(&operator.public)],
            },
        );
        let thin = child(&ledger.last_block(), &operator, vec![]);
        assert!(matches!(
            ledger.commit_block(&guard, &thin, CommitOrigin::Proposal).await,
            Err(LedgerError::InsufficientStake { id: 1, staked }) if staked == MIN_STAKE - 1
        ));

        stake_operator(&accounts, &operator);
        ledger.commit_block(&guard, &thin, CommitOrigin::Proposal).await.unwrap();
        assert_eq!(ledger.height(), 1);
    }

    #[tokio::test]
    async fn syncing_flag_is_exclusive_and_scoped() {
        let ledger = open_ledger(Arc::new(InMemoryAccounts::new()));
        {
            let _guard = ledger.begin_sync().unwrap();
            assert!(ledger.is_syncing());
            assert!(ledger.begin_sync().is_none());
        }
        assert!(!ledger.is_syncing());
    }
}
