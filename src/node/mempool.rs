//! Bounded transaction pools with insertion ordering and a ban index.
//!
//! There is one pool per [`PoolKind`]. Each holds pending transactions by
//! hash, remembers the order they arrived in so block assembly is
//! deterministic, and keeps a bounded set of banned hashes that can never
//! be re-added.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tokio::sync::Mutex;

use crate::chain::transaction::{PoolKind, Transaction};
use crate::config::PoolSection;
use crate::constants::{MAX_TRANSACTION_DELAY, MAX_TX_BANS};
use crate::Hash;

#[derive(Clone, Debug)]
struct PoolEntry {
    tx: Transaction,
    size: usize,
    insertion_order: u64,
}

/// Summary for logging.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub transaction_count: usize,
    pub total_bytes: usize,
    pub banned: usize,
}

pub struct TransactionPool {
    kind: PoolKind,
    config: PoolSection,
    txs: HashMap<Hash, PoolEntry>,
    /// Insertion order -> hash.
    order: BTreeMap<u64, Hash>,
    banned: HashSet<Hash>,
    ban_order: VecDeque<Hash>,
    total_bytes: usize,
    insertion_counter: u64,
}

impl TransactionPool {
    pub fn new(kind: PoolKind, config: PoolSection) -> Self {
        TransactionPool {
            kind,
            config,
            txs: HashMap::new(),
            order: BTreeMap::new(),
            banned: HashSet::new(),
            ban_order: VecDeque::new(),
            total_bytes: 0,
            insertion_counter: 0,
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Add a transaction. Returns false if its hash is already pending or
    /// banned, or if the pool is full.
    pub fn add(&mut self, tx: Transaction) -> bool {
        let hash = tx.hash;
        if self.txs.contains_key(&hash) || self.banned.contains(&hash) {
            return false;
        }
        let size = match tx.to_bytes() {
            Ok(bytes) => bytes.len(),
            Err(_) => return false,
        };
        if self.txs.len() >= self.config.max_transactions
            || self.total_bytes + size > self.config.max_bytes
        {
            tracing::debug!(pool = ?self.kind, "Pool full, dropping transaction");
            return false;
        }
        let insertion_order = self.insertion_counter;
        self.insertion_counter += 1;
        self.order.insert(insertion_order, hash);
        self.total_bytes += size;
        self.txs.insert(
            hash,
            PoolEntry {
                tx,
                size,
                insertion_order,
            },
        );
        true
    }

    pub fn exists(&self, hash: &Hash) -> bool {
        self.txs.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<&Transaction> {
        self.txs.get(hash).map(|e| &e.tx)
    }

    pub fn remove(&mut self, hash: &Hash) -> Option<Transaction> {
        let entry = self.txs.remove(hash)?;
        self.order.remove(&entry.insertion_order);
        self.total_bytes -= entry.size;
        Some(entry.tx)
    }

    /// Remove and exclude `hash` from ever being added again. The ban index
    /// is bounded; the oldest ban is forgotten first.
    pub fn ban(&mut self, hash: Hash) {
        self.remove(&hash);
        if self.banned.insert(hash) {
            self.ban_order.push_back(hash);
            while self.ban_order.len() > MAX_TX_BANS {
                if let Some(old) = self.ban_order.pop_front() {
                    self.banned.remove(&old);
                }
            }
        }
    }

    pub fn is_banned(&self, hash: &Hash) -> bool {
        self.banned.contains(hash)
    }

    /// Up to `max` transactions eligible at `height`, in insertion order.
    ///
    /// A transaction is eligible once its target height is reached and until
    /// it is older than the maximum transaction delay.
    pub fn peek(&self, max: usize, height: u64) -> Vec<Transaction> {
        self.order
            .values()
            .filter_map(|hash| self.txs.get(hash))
            .filter(|e| {
                e.tx.body.height <= height
                    && height <= e.tx.body.height.saturating_add(MAX_TRANSACTION_DELAY)
            })
            .take(max)
            .map(|e| e.tx.clone())
            .collect()
    }

    /// Drop transactions that can no longer be selected at `height`.
    pub fn prune_expired(&mut self, height: u64) -> usize {
        let expired: Vec<Hash> = self
            .txs
            .values()
            .filter(|e| e.tx.body.height.saturating_add(MAX_TRANSACTION_DELAY) < height)
            .map(|e| e.tx.hash)
            .collect();
        for hash in &expired {
            self.remove(hash);
        }
        expired.len()
    }

    pub fn count(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            transaction_count: self.txs.len(),
            total_bytes: self.total_bytes,
            banned: self.banned.len(),
        }
    }
}

/// The three pools, each behind its own lock.
pub struct Pools {
    standard: Mutex<TransactionPool>,
    escrow: Mutex<TransactionPool>,
    multisig: Mutex<TransactionPool>,
}

impl Pools {
    pub fn new(config: &PoolSection) -> Self {
        Pools {
            standard: Mutex::new(TransactionPool::new(PoolKind::Standard, config.clone())),
            escrow: Mutex::new(TransactionPool::new(PoolKind::Escrow, config.clone())),
            multisig: Mutex::new(TransactionPool::new(PoolKind::MultiSig, config.clone())),
        }
    }

    pub fn pool(&self, kind: PoolKind) -> &Mutex<TransactionPool> {
        match kind {
            PoolKind::Standard => &self.standard,
            PoolKind::Escrow => &self.escrow,
            PoolKind::MultiSig => &self.multisig,
        }
    }

    /// Add to the pool matching the transaction's kind.
    pub async fn add(&self, tx: Transaction) -> bool {
        self.pool(tx.kind()).lock().await.add(tx)
    }

    pub async fn exists(&self, hash: &Hash) -> bool {
        for kind in PoolKind::ALL {
            if self.pool(kind).lock().await.exists(hash) {
                return true;
            }
        }
        false
    }

    pub async fn find(&self, hash: &Hash) -> Option<Transaction> {
        for kind in PoolKind::ALL {
            if let Some(tx) = self.pool(kind).lock().await.get(hash) {
                return Some(tx.clone());
            }
        }
        None
    }

    pub async fn remove(&self, hash: &Hash) -> Option<Transaction> {
        for kind in PoolKind::ALL {
            if let Some(tx) = self.pool(kind).lock().await.remove(hash) {
                return Some(tx);
            }
        }
        None
    }

    /// Ban a transaction that failed a block transfer check, in every pool.
    pub async fn remove_bad(&self, hash: Hash) {
        for kind in PoolKind::ALL {
            self.pool(kind).lock().await.ban(hash);
        }
        tracing::info!(tx = %hex::encode(&hash[..8]), "Banned transaction");
    }

    pub async fn is_banned(&self, hash: &Hash) -> bool {
        for kind in PoolKind::ALL {
            if self.pool(kind).lock().await.is_banned(hash) {
                return true;
            }
        }
        false
    }

    /// Up to `max` transactions for a block at `height`: standard first,
    /// then escrow, then multisig, each in insertion order.
    pub async fn peek(&self, max: usize, height: u64) -> Vec<Transaction> {
        let mut selected = Vec::new();
        for kind in PoolKind::ALL {
            let remaining = max - selected.len();
            if remaining == 0 {
                break;
            }
            selected.extend(self.pool(kind).lock().await.peek(remaining, height));
        }
        selected
    }

    pub async fn prune_expired(&self, height: u64) -> usize {
        let mut pruned = 0;
        for kind in PoolKind::ALL {
            pruned += self.pool(kind).lock().await.prune_expired(height);
        }
        pruned
    }

    /// Totals across the three pools.
    pub async fn stats(&self) -> PoolStats {
        let mut total = PoolStats::default();
        for kind in PoolKind::ALL {
            let stats = self.pool(kind).lock().await.stats();
            total.transaction_count += stats.transaction_count;
            total.total_bytes += stats.total_bytes;
            total.banned += stats.banned;
        }
        total
    }

    pub async fn counts(&self) -> [usize; 3] {
        [
            self.standard.lock().await.count(),
            self.escrow.lock().await.count(),
            self.multisig.lock().await.count(),
        ]
    }
}
