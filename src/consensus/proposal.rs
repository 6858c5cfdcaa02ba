//! Nonce rounds: one validator's nonce transaction for the next height
//! makes every staked validator assemble, sign and broadcast a block.
//!
//! A nonce transaction is sent by the operator of a delegated account to
//! that account's reserved address. Its opt data references the block it
//! builds on and piggybacks an oracle sample pair and one encryption vote
//! per slot:
//!
//! ```text
//! last_height(8) ++ last_hash(32) ++ price(8) ++ rand(8)
//!   ++ len(4) ++ primary_vote ++ len(4) ++ secondary_vote
//! ```

use std::sync::Arc;

use crate::chain::accounts::AccountError;
use crate::chain::block::{BaseHeader, Block, BlockError};
use crate::chain::oracle::Oracle;
use crate::chain::transaction::{Address, PoolKind, Transaction, TxBody, TxError};
use crate::config::{ConsensusSection, SignKeyChoice};
use crate::consensus::synergy;
use crate::constants::ENCRYPTION_CHANGE_MIN_HEIGHT;
use crate::crypto::keys::KeyError;
use crate::crypto::merkle::MerkleTrie;
use crate::crypto::scheme::{EncryptionConfig, SchemeError, Slot};
use crate::node::ledger::Ledger;
use crate::node::wallet::NodeWallet;
use crate::Hash;

const FIXED_OPT_LEN: usize = 8 + 32 + 8 + 8;

#[derive(Debug, thiserror::Error)]
pub enum ProposalError {
    #[error("ledger is syncing")]
    Syncing,
    #[error("nonce for height {got}, expected {expected}")]
    WrongHeight { expected: u64, got: u64 },
    #[error("nonce does not reference our last block")]
    StaleReference,
    #[error("nonce transaction: {0}")]
    Transaction(#[from] TxError),
    #[error("nonce recipient is not a delegated account")]
    NotDelegated,
    #[error("delegated account {id} stakes {staked}, below the minimum")]
    InsufficientStake { id: u8, staked: u64 },
    #[error("sender is not an operator of delegated account {0}")]
    NotOperator(u8),
    #[error("malformed nonce data: {0}")]
    OptData(&'static str),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Scheme(#[from] SchemeError),
    #[error("proof of synergy failed at difficulty {0}")]
    NoSynergy(u32),
    #[error("pool transfers do not balance: {0}")]
    BadTransfers(AccountError),
}

/// Decoded opt data of a nonce transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NonceData {
    pub last_height: u64,
    pub last_hash: Hash,
    pub price: i64,
    pub rand: i64,
    /// Encoded [`EncryptionConfig`] per slot, empty for no vote.
    pub votes: [Vec<u8>; 2],
}

impl NonceData {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_OPT_LEN + 8 + self.votes[0].len() + self.votes[1].len());
        out.extend_from_slice(&self.last_height.to_le_bytes());
        out.extend_from_slice(&self.last_hash);
        out.extend_from_slice(&self.price.to_le_bytes());
        out.extend_from_slice(&self.rand.to_le_bytes());
        for vote in &self.votes {
            out.extend_from_slice(&(vote.len() as u32).to_le_bytes());
            out.extend_from_slice(vote);
        }
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ProposalError> {
        if bytes.len() < FIXED_OPT_LEN {
            return Err(ProposalError::OptData("too short"));
        }
        let word = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[at..at + 8]);
            b
        };
        let mut last_hash = [0u8; 32];
        last_hash.copy_from_slice(&bytes[8..40]);
        let mut rest = &bytes[FIXED_OPT_LEN..];
        let mut votes: [Vec<u8>; 2] = Default::default();
        for vote in votes.iter_mut() {
            if rest.len() < 4 {
                return Err(ProposalError::OptData("vote length"));
            }
            let mut len = [0u8; 4];
            len.copy_from_slice(&rest[..4]);
            let len = u32::from_le_bytes(len) as usize;
            rest = &rest[4..];
            if rest.len() < len {
                return Err(ProposalError::OptData("vote body"));
            }
            *vote = rest[..len].to_vec();
            rest = &rest[len..];
        }
        Ok(NonceData {
            last_height: u64::from_le_bytes(word(0)),
            last_hash,
            price: i64::from_le_bytes(word(40)),
            rand: i64::from_le_bytes(word(48)),
            votes,
        })
    }
}

/// This validator's identity and round parameters.
#[derive(Clone, Debug)]
pub struct ProposerSettings {
    pub delegated_id: u8,
    pub reward_percentage: u16,
    pub chain_id: u16,
    pub sign_key_choice: SignKeyChoice,
    pub max_transactions_per_block: usize,
    pub min_staking_for_node: u64,
    pub price_sample: i64,
    /// Vote piggybacked per slot, already encoded.
    pub votes: [Vec<u8>; 2],
}

impl ProposerSettings {
    pub fn from_config(
        consensus: &ConsensusSection,
        delegated_id: u8,
        reward_percentage: u16,
        chain_id: u16,
    ) -> Result<Self, KeyError> {
        let encode = |vote: &Option<crate::config::SchemeVote>| -> Result<Vec<u8>, KeyError> {
            match vote {
                Some(v) => {
                    let kind = crate::crypto::keys::SchemeKind::from_name(&v.scheme)?;
                    Ok(EncryptionConfig::for_scheme(kind, v.paused).to_bytes())
                }
                None => Ok(Vec::new()),
            }
        };
        Ok(ProposerSettings {
            delegated_id,
            reward_percentage,
            chain_id,
            sign_key_choice: consensus.sign_key_choice,
            max_transactions_per_block: consensus.max_transactions_per_block,
            min_staking_for_node: consensus.min_staking_for_node,
            price_sample: consensus.price_sample,
            votes: [encode(&consensus.primary_vote)?, encode(&consensus.secondary_vote)?],
        })
    }
}

pub struct Proposer {
    ledger: Arc<Ledger>,
    oracle: Arc<dyn Oracle>,
    wallet: Arc<NodeWallet>,
    settings: ProposerSettings,
}

impl Proposer {
    pub fn new(
        ledger: Arc<Ledger>,
        oracle: Arc<dyn Oracle>,
        wallet: Arc<NodeWallet>,
        settings: ProposerSettings,
    ) -> Self {
        Proposer {
            ledger,
            oracle,
            wallet,
            settings,
        }
    }

    pub fn settings(&self) -> &ProposerSettings {
        &self.settings
    }

    /// The nonce transaction this validator sends for the next height.
    pub fn build_nonce(&self) -> Result<Transaction, ProposalError> {
        let last = self.ledger.last_block();
        let height = last.height() + 1;
        let slot = self
            .ledger
            .schemes()
            .choose_signing_slot(height, self.settings.sign_key_choice);
        let data = NonceData {
            last_height: last.height(),
            last_hash: last.block_hash,
            price: self.settings.price_sample,
            rand: rand::random::<i64>(),
            votes: self.settings.votes.clone(),
        };
        let body = TxBody {
            kind: PoolKind::Standard,
            sender: self.wallet.address(slot),
            recipient: Address::delegated(self.settings.delegated_id),
            amount: 0,
            nonce: height,
            chain_id: self.settings.chain_id,
            height,
            sending_time: crate::unix_time_secs(),
            opt_data: data.to_bytes(),
        };
        Ok(Transaction::sign(body, slot, &self.wallet.keypair(slot))?)
    }

    /// Validate a nonce transaction and assemble our block for its height.
    ///
    /// Oracle samples and encryption votes are recorded once the sender is
    /// known to operate a staked delegated account. The returned block has
    /// passed proof of synergy and the pool transfer check; the caller
    /// broadcasts it.
    pub async fn on_nonce(&self, nonce: &Transaction) -> Result<Block, ProposalError> {
        if self.ledger.is_syncing() {
            return Err(ProposalError::Syncing);
        }
        let last = self.ledger.last_block();
        let height = last.height() + 1;
        if nonce.body.height != height {
            return Err(ProposalError::WrongHeight {
                expected: height,
                got: nonce.body.height,
            });
        }
        nonce.verify(self.ledger.schemes())?;
        let data = NonceData::parse(&nonce.body.opt_data)?;
        if data.last_height + 1 != height || data.last_hash != last.block_hash {
            return Err(ProposalError::StaleReference);
        }

        let id = nonce
            .body
            .recipient
            .delegated_id()
            .ok_or(ProposalError::NotDelegated)?;
        let entry = self.ledger.accounts().staking(id).unwrap_or_default();
        if entry.staked < self.settings.min_staking_for_node {
            return Err(ProposalError::InsufficientStake {
                id,
                staked: entry.staked,
            });
        }
        if !entry.operators.contains(&nonce.body.sender) {
            return Err(ProposalError::NotOperator(id));
        }
        self.record_samples(id, height, entry.staked, &data);

        let block = self.assemble(&last, nonce.body.sending_time).await?;
        if !synergy::check_proof_of_synergy(&block.block_hash, block.header.difficulty) {
            return Err(ProposalError::NoSynergy(block.header.difficulty));
        }
        Ok(block)
    }

    fn record_samples(&self, id: u8, height: u64, staked: u64, data: &NonceData) {
        if let Err(e) = self.oracle.save_price(id, height, data.price, staked) {
            tracing::debug!(id, error = %e, "Price sample rejected");
        }
        if let Err(e) = self.oracle.save_rand(id, height, data.rand, staked) {
            tracing::debug!(id, error = %e, "Rand sample rejected");
        }
        for slot in Slot::BOTH {
            if let Err(e) = self
                .ledger
                .voting()
                .save_vote(slot, id, data.votes[slot.index()].clone(), height, staked)
            {
                tracing::debug!(id, slot = %slot, error = %e, "Encryption vote rejected");
            }
        }
    }

    /// Slot configs our header declares: a change backed by the vote quorum,
    /// otherwise the current config.
    fn header_encryption(&self, height: u64) -> [Vec<u8>; 2] {
        let total = self.ledger.accounts().total_staked();
        Slot::BOTH.map(|slot| {
            let current = self.ledger.schemes().get(slot);
            let decided = (height >= ENCRYPTION_CHANGE_MIN_HEIGHT)
                .then(|| self.ledger.voting().decide(slot, height, total, &current))
                .flatten();
            decided.unwrap_or(current).to_bytes()
        })
    }

    async fn assemble(&self, last: &Block, nonce_time: u64) -> Result<Block, ProposalError> {
        let height = last.height() + 1;
        let pools = self.ledger.pools();
        let txs = pools
            .peek(self.settings.max_transactions_per_block, height)
            .await;
        if let Err(e) = self.ledger.accounts().check_transfers(&txs) {
            if let Some(bad) = e.offending_tx() {
                pools.remove_bad(bad).await;
            }
            return Err(ProposalError::BadTransfers(e));
        }
        let tx_hashes: Vec<Hash> = txs.iter().map(|tx| tx.hash).collect();
        let trie = MerkleTrie::build(height, &tx_hashes);

        let slot = self
            .ledger
            .schemes()
            .choose_signing_slot(height, self.settings.sign_key_choice);
        let keypair = self.wallet.keypair(slot);
        let mut header = BaseHeader {
            previous_hash: last.block_hash,
            difficulty: synergy::adjust_difficulty(
                last.header.difficulty,
                nonce_time.saturating_sub(last.timestamp),
            ),
            height,
            delegated_id: self.settings.delegated_id,
            operator: Address::from_public_key(&keypair.public),
            root_merkle: trie.root(),
            encryption: self.header_encryption(height),
            signer_slot: slot,
            signer_key: Vec::new(),
            signature: Vec::new(),
            timestamp: nonce_time,
        };
        header.sign(slot, &keypair)?;

        let reward = synergy::reward_for_supply(last.supply);
        let price_oracle = self.oracle.price(height).unwrap_or_else(|e| {
            tracing::debug!(height, error = %e, "No price oracle");
            0
        });
        let rand_oracle = self.oracle.rand(height).unwrap_or_else(|e| {
            tracing::debug!(height, error = %e, "No rand oracle");
            0
        });
        let mut block = Block {
            header,
            header_hash: [0u8; 32],
            timestamp: crate::unix_time_secs(),
            reward_percentage: self.settings.reward_percentage,
            supply: last.supply.saturating_add(reward),
            reward,
            price_oracle,
            rand_oracle,
            tx_hashes,
            block_hash: [0u8; 32],
        };
        block.seal()?;
        tracing::debug!(height, txs = block.tx_hashes.len(), slot = %slot, "Assembled block");
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::accounts::{AccountState, InMemoryAccounts, StakingEntry};
    use crate::chain::oracle::OracleBook;
    use crate::chain::transaction::tests::transfer;
    use crate::consensus::sync::SyncMachine;
    use crate::crypto::keys::{SchemeKind, SigningKeypair};
    use crate::crypto::scheme::LiveSchemes;
    use crate::node::ledger::tests::open_ledger;
    use crate::node::ledger::CommitOrigin;

    struct Round {
        ledger: Arc<Ledger>,
        accounts: Arc<InMemoryAccounts>,
        proposer: Proposer,
    }

    fn wallet() -> Arc<NodeWallet> {
        Arc::new(NodeWallet::ephemeral(&LiveSchemes::default()).unwrap())
    }

    fn stake(wallet: &NodeWallet) -> StakingEntry {
        StakingEntry {
            staked: 1_000,
            operators: vec![wallet.address(Slot::Primary), wallet.address(Slot::Secondary)],
        }
    }

    fn round(votes: [Vec<u8>; 2]) -> Round {
        let wallet = wallet();
        let stakes = [(1, stake(&wallet))];
        validator(1, wallet, &stakes, votes)
    }

    /// A validator for delegated account `id` on a chain whose genesis
    /// staking table is `stakes`.
    fn validator(id: u8, wallet: Arc<NodeWallet>, stakes: &[(u8, StakingEntry)], votes: [Vec<u8>; 2]) -> Round {
        let accounts = Arc::new(InMemoryAccounts::new());
        for (delegated_id, entry) in stakes {
            accounts.set_stake(*delegated_id, entry.clone());
        }
        let ledger = Arc::new(open_ledger(accounts.clone()));
        let settings = ProposerSettings {
            delegated_id: id,
            reward_percentage: 100,
            chain_id: 23,
            sign_key_choice: SignKeyChoice::PreferPrimary,
            max_transactions_per_block: 10,
            min_staking_for_node: 500,
            price_sample: 42,
            votes,
        };
        let proposer = Proposer::new(Arc::clone(&ledger), Arc::new(OracleBook::new()), wallet, settings);
        Round {
            ledger,
            accounts,
            proposer,
        }
    }

    /// Falcon signatures are salted, so a block that misses the synergy
    /// target at raised difficulty can be reassembled with a new hash.
    async fn propose(r: &Round) -> Block {
        for _ in 0..64 {
            let nonce = r.proposer.build_nonce().unwrap();
            match r.proposer.on_nonce(&nonce).await {
                Ok(block) => return block,
                Err(ProposalError::NoSynergy(_)) => continue,
                Err(e) => panic!("proposal failed: {e}"),
            }
        }
        panic!("no block met the synergy target");
    }

    #[test]
    fn nonce_data_layout() {
        let data = NonceData {
            last_height: 4,
            last_hash: [9u8; 32],
            price: -3,
            rand: 77,
            votes: [vec![1, 2, 3], vec![]],
        };
        let bytes = data.to_bytes();
        assert_eq!(&bytes[..8], &4u64.to_le_bytes());
        assert_eq!(&bytes[8..40], &[9u8; 32]);
        assert_eq!(&bytes[56..60], &3u32.to_le_bytes());
        assert_eq!(NonceData::parse(&bytes).unwrap(), data);
        assert!(NonceData::parse(&bytes[..50]).is_err());
        assert!(NonceData::parse(&bytes[..58]).is_err());
    }

    #[tokio::test]
    async fn own_nonce_yields_committable_block() {
        let r = round([Vec::new(), Vec::new()]);
        let payer = SigningKeypair::generate(SchemeKind::Falcon512);
        r.accounts.set_balance(Address::from_public_key(&payer.public), 100);
        let tx = transfer(&payer, Address::delegated(3), 40, 0);
        r.ledger.pools().add(tx.clone()).await;

        let nonce = r.proposer.build_nonce().unwrap();
        let block = r.proposer.on_nonce(&nonce).await.unwrap();
        assert_eq!(block.height(), 1);
        assert_eq!(block.tx_hashes, vec![tx.hash]);
        assert_eq!(block.header.delegated_id, 1);
        assert_eq!(block.price_oracle, 42);

        let guard = r.ledger.lock().await;
        let report = r
            .ledger
            .commit_block(&guard, &block, CommitOrigin::Proposal)
            .await
            .unwrap();
        assert_eq!(report.transactions, 1);
        assert_eq!(r.accounts.balance(&Address::delegated(3)), 40);
    }

    #[tokio::test]
    async fn rejects_bad_nonces() {
        let r = round([Vec::new(), Vec::new()]);
        let nonce = r.proposer.build_nonce().unwrap();

        let mut future = nonce.clone();
        future.body.height = 5;
        assert!(matches!(
            r.proposer.on_nonce(&future).await,
            Err(ProposalError::WrongHeight { expected: 1, got: 5 })
        ));

        let mut tampered = nonce.clone();
        tampered.body.amount = 1;
        assert!(matches!(
            r.proposer.on_nonce(&tampered).await,
            Err(ProposalError::Transaction(TxError::HashMismatch))
        ));

        r.accounts.set_stake(
            1,
            StakingEntry {
                staked: 10,
                operators: vec![nonce.body.sender],
            },
        );
        assert!(matches!(
            r.proposer.on_nonce(&nonce).await,
            Err(ProposalError::InsufficientStake { id: 1, staked: 10 })
        ));

        r.accounts.set_stake(
            1,
            StakingEntry {
                staked: 1_000,
                operators: vec![],
            },
        );
        assert!(matches!(
            r.proposer.on_nonce(&nonce).await,
            Err(ProposalError::NotOperator(1))
        ));
    }

    #[tokio::test]
    async fn overdrawn_pool_transaction_is_banned() {
        let r = round([Vec::new(), Vec::new()]);
        let payer = SigningKeypair::generate(SchemeKind::Falcon512);
        let tx = transfer(&payer, Address::delegated(3), 40, 0);
        r.ledger.pools().add(tx.clone()).await;

        let nonce = r.proposer.build_nonce().unwrap();
        assert!(matches!(
            r.proposer.on_nonce(&nonce).await,
            Err(ProposalError::BadTransfers(_))
        ));
        assert!(r.ledger.pools().is_banned(&tx.hash).await);
        assert!(!r.ledger.pools().exists(&tx.hash).await);
    }

    #[tokio::test]
    async fn votes_are_recorded_and_steer_the_header() {
        let paused = EncryptionConfig::for_scheme(SchemeKind::Dilithium5, true).to_bytes();
        let r = round([Vec::new(), paused.clone()]);

        // Below the minimum height the vote is recorded but not applied.
        let block = propose(&r).await;
        assert_eq!(r.ledger.voting().vote_count(Slot::Secondary), 1);
        assert!(block.changed_slots(&r.ledger.last_block()).is_empty());

        let guard = r.ledger.lock().await;
        r.ledger.commit_block(&guard, &block, CommitOrigin::Proposal).await.unwrap();
        drop(guard);
        for _ in 0..2 {
            let block = propose(&r).await;
            let guard = r.ledger.lock().await;
            let report = r
                .ledger
                .commit_block(&guard, &block, CommitOrigin::Proposal)
                .await
                .unwrap();
            if report.height == 3 {
                assert_eq!(report.changed_slots, vec![Slot::Secondary]);
            }
        }
        assert!(r.ledger.schemes().is_paused(Slot::Secondary));
    }

    #[tokio::test]
    async fn competing_validators_settle_on_one_block() {
        let (wallet_a, wallet_b) = (wallet(), wallet());
        let stakes = [(1, stake(&wallet_a)), (2, stake(&wallet_b))];
        let a = validator(1, wallet_a, &stakes, [Vec::new(), Vec::new()]);
        let b = validator(2, wallet_b, &stakes, [Vec::new(), Vec::new()]);

        // Both answer the same nonce and each takes its own block first.
        let nonce = a.proposer.build_nonce().unwrap();
        let block_a = a.proposer.on_nonce(&nonce).await.unwrap();
        let block_b = b.proposer.on_nonce(&nonce).await.unwrap();
        assert_ne!(block_a.block_hash, block_b.block_hash);
        assert_eq!(block_b.header.delegated_id, 2);
        for (r, block) in [(&a, &block_a), (&b, &block_b)] {
            let guard = r.ledger.lock().await;
            r.ledger.commit_block(&guard, block, CommitOrigin::Proposal).await.unwrap();
        }

        // The block arriving second at a height is refused.
        let guard = b.ledger.lock().await;
        assert!(b
            .ledger
            .commit_block(&guard, &block_a, CommitOrigin::Proposal)
            .await
            .is_err());
        drop(guard);

        let sync_a = SyncMachine::new(Arc::clone(&a.ledger), 1);
        let sync_b = SyncMachine::new(Arc::clone(&b.ledger), 1);
        for _ in 0..2 {
            for (local, remote) in [(&sync_a, &sync_b), (&sync_b, &sync_a)] {
                if let Some(request) = local.on_announcement(&remote.announcement(vec![])) {
                    let served = remote.serve_headers(request).unwrap();
                    local.on_headers(served).await.unwrap();
                }
            }
        }
        let winner = if block_a.block_hash < block_b.block_hash {
            &block_a
        } else {
            &block_b
        };
        assert_eq!(a.ledger.last_block(), *winner);
        assert_eq!(b.ledger.last_block(), *winner);
    }
}
