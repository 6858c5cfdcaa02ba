//! Persistent ledger storage.
//!
//! Provides a `Storage` trait and a sled-backed implementation for blocks by
//! height, committed transactions by hash, Merkle tries and account
//! snapshots by height, and the chain height.

use crate::chain::block::Block;
use crate::chain::transaction::Transaction;
use crate::Hash;

/// Errors from storage operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

fn io(e: sled::Error) -> StorageError {
    StorageError::Io(e.to_string())
}

/// Everything a block commit writes, applied together.
pub struct CommitBatch<'a> {
    pub block: &'a Block,
    pub transactions: &'a [Transaction],
    pub account_snapshot: Vec<u8>,
}

/// Trait for persistent storage backends.
pub trait Storage: Send + Sync {
    fn put_block(&self, block: &Block) -> Result<(), StorageError>;
    fn get_block(&self, height: u64) -> Result<Option<Block>, StorageError>;
    fn remove_block(&self, height: u64) -> Result<(), StorageError>;

    fn put_transaction(&self, tx: &Transaction) -> Result<(), StorageError>;
    fn get_transaction(&self, hash: &Hash) -> Result<Option<Transaction>, StorageError>;
    fn has_transaction(&self, hash: &Hash) -> Result<bool, StorageError>;
    fn remove_transaction(&self, hash: &Hash) -> Result<(), StorageError>;

    fn put_merkle_tree(&self, height: u64, tree: &[u8]) -> Result<(), StorageError>;
    fn get_merkle_tree(&self, height: u64) -> Result<Option<Vec<u8>>, StorageError>;
    fn remove_merkle_tree(&self, height: u64) -> Result<(), StorageError>;

    fn put_account_snapshot(&self, height: u64, snapshot: &[u8]) -> Result<(), StorageError>;
    fn get_account_snapshot(&self, height: u64) -> Result<Option<Vec<u8>>, StorageError>;
    fn remove_account_snapshot(&self, height: u64) -> Result<(), StorageError>;

    fn put_chain_height(&self, height: u64) -> Result<(), StorageError>;
    fn get_chain_height(&self) -> Result<Option<u64>, StorageError>;

    /// Write a committed block with its transactions, account snapshot and
    /// the new chain height. The height is written last.
    fn apply_commit_batch(&self, batch: &CommitBatch<'_>) -> Result<(), StorageError>;

    fn flush(&self) -> Result<(), StorageError>;
}

/// Sled-backed storage implementation.
pub struct SledStorage {
    db: sled::Db,
    blocks: sled::Tree,
    transactions: sled::Tree,
    merkle_trees: sled::Tree,
    account_snapshots: sled::Tree,
    chain_meta: sled::Tree,
}

const HEIGHT_KEY: &[u8] = b"height";

impl SledStorage {
    /// Open or create a sled database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(io)?;
        Self::from_db(db)
    }

    /// Open a temporary database, removed on drop (for testing).
    pub fn open_temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open().map_err(io)?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        Ok(SledStorage {
            blocks: db.open_tree("blocks").map_err(io)?,
            transactions: db.open_tree("transactions").map_err(io)?,
            merkle_trees: db.open_tree("merkle_trees").map_err(io)?,
            account_snapshots: db.open_tree("account_snapshots").map_err(io)?,
            chain_meta: db.open_tree("chain_meta").map_err(io)?,
            db,
        })
    }

    pub fn size_on_disk(&self) -> Result<u64, StorageError> {
        self.db.size_on_disk().map_err(io)
    }
}

// Big-endian so sled's lexicographic order matches numeric order.
fn height_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

fn get_raw(tree: &sled::Tree, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
    Ok(tree.get(key).map_err(io)?.map(|v| v.to_vec()))
}

impl Storage for SledStorage {
    fn put_block(&self, block: &Block) -> Result<(), StorageError> {
        let value = block
            .to_bytes()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.blocks.insert(height_key(block.height()), value).map_err(io)?;
        Ok(())
    }

    fn get_block(&self, height: u64) -> Result<Option<Block>, StorageError> {
        match get_raw(&self.blocks, &height_key(height))? {
            Some(bytes) => Block::from_bytes(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn remove_block(&self, height: u64) -> Result<(), StorageError> {
        self.blocks.remove(height_key(height)).map_err(io)?;
        Ok(())
    }

    fn put_transaction(&self, tx: &Transaction) -> Result<(), StorageError> {
        let value = tx
            .to_bytes()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.transactions.insert(tx.hash, value).map_err(io)?;
        Ok(())
    }

    fn get_transaction(&self, hash: &Hash) -> Result<Option<Transaction>, StorageError> {
        match get_raw(&self.transactions, hash)? {
            Some(bytes) => Transaction::from_bytes(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn has_transaction(&self, hash: &Hash) -> Result<bool, StorageError> {
        self.transactions.contains_key(hash).map_err(io)
    }

    fn remove_transaction(&self, hash: &Hash) -> Result<(), StorageError> {
        self.transactions.remove(hash).map_err(io)?;
        Ok(())
    }

    fn put_merkle_tree(&self, height: u64, tree: &[u8]) -> Result<(), StorageError> {
        self.merkle_trees.insert(height_key(height), tree).map_err(io)?;
        Ok(())
    }

    fn get_merkle_tree(&self, height: u64) -> Result<Option<Vec<u8>>, StorageError> {
        get_raw(&self.merkle_trees, &height_key(height))
    }

    fn remove_merkle_tree(&self, height: u64) -> Result<(), StorageError> {
        self.merkle_trees.remove(height_key(height)).map_err(io)?;
        Ok(())
    }

    fn put_account_snapshot(&self, height: u64, snapshot: &[u8]) -> Result<(), StorageError> {
        self.account_snapshots
            .insert(height_key(height), snapshot)
            .map_err(io)?;
        Ok(())
    }

    fn get_account_snapshot(&self, height: u64) -> Result<Option<Vec<u8>>, StorageError> {
        get_raw(&self.account_snapshots, &height_key(height))
    }

    fn remove_account_snapshot(&self, height: u64) -> Result<(), StorageError> {
        self.account_snapshots.remove(height_key(height)).map_err(io)?;
        Ok(())
    }

    fn put_chain_height(&self, height: u64) -> Result<(), StorageError> {
        self.chain_meta
            .insert(HEIGHT_KEY, height_key(height).to_vec())
            .map_err(io)?;
        Ok(())
    }

    fn get_chain_height(&self) -> Result<Option<u64>, StorageError> {
        match get_raw(&self.chain_meta, HEIGHT_KEY)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::Serialization("invalid height record".into()))?;
                Ok(Some(u64::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    fn apply_commit_batch(&self, batch: &CommitBatch<'_>) -> Result<(), StorageError> {
        let height = batch.block.height();

        let mut tx_batch = sled::Batch::default();
        for tx in batch.transactions {
            let value = tx
                .to_bytes()
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            tx_batch.insert(tx.hash.to_vec(), value);
        }
        let block_value = batch
            .block
            .to_bytes()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        self.transactions.apply_batch(tx_batch).map_err(io)?;
        self.account_snapshots
            .insert(height_key(height), batch.account_snapshot.as_slice())
            .map_err(io)?;
        self.blocks.insert(height_key(height), block_value).map_err(io)?;
        self.put_chain_height(height)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(io)?;
        Ok(())
    }
}
