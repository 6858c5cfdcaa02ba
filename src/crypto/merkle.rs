//! Height-scoped Merkle trie over the transaction hashes of a block.
//!
//! Leaves are taken in the given order and padded with zero hashes to the
//! next power of two. Interior nodes are domain-separated BLAKE3 over the
//! two children. The trie is owned by whoever built it and released when
//! dropped, so every exit path, including `?` on error, frees it.

use serde::{Deserialize, Serialize};

use crate::node::storage::{Storage, StorageError};
use crate::Hash;

const NODE_DOMAIN: &str = "okura.merkle.node";

/// A node in a Merkle authentication path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleNode {
    pub hash: Hash,
    /// True if this sibling is on the left side.
    pub is_left: bool,
}

/// A built trie. Persisted form is the leaf list; layers are rebuilt on load.
#[derive(Clone, Debug)]
pub struct MerkleTrie {
    height: u64,
    leaves: Vec<Hash>,
    layers: Vec<Vec<Hash>>,
}

#[derive(Serialize, Deserialize)]
struct StoredTrie {
    height: u64,
    leaves: Vec<Hash>,
}

fn merge(left: &Hash, right: &Hash) -> Hash {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    crate::hash_domain(NODE_DOMAIN, &buf)
}

impl MerkleTrie {
    /// Build over `leaves` in order. An empty list yields the zero root.
    pub fn build(height: u64, leaves: &[Hash]) -> Self {
        let mut layers = Vec::new();
        if leaves.len() > 1 {
            let mut layer = leaves.to_vec();
            layer.resize(leaves.len().next_power_of_two(), [0u8; 32]);
            while layer.len() > 1 {
                let next: Vec<Hash> = layer.chunks(2).map(|c| merge(&c[0], &c[1])).collect();
                layers.push(std::mem::replace(&mut layer, next));
            }
            layers.push(layer);
        }
        MerkleTrie {
            height,
            leaves: leaves.to_vec(),
            layers,
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn leaves(&self) -> &[Hash] {
        &self.leaves
    }

    pub fn root(&self) -> Hash {
        match self.leaves.len() {
            0 => [0u8; 32],
            1 => self.leaves[0],
            _ => self
                .layers
                .last()
                .and_then(|top| top.first())
                .copied()
                .unwrap_or([0u8; 32]),
        }
    }

    pub fn contains(&self, leaf: &Hash) -> bool {
        self.leaves.iter().any(|l| l == leaf)
    }

    /// Authentication path for leaf `index`, bottom-up.
    pub fn proof(&self, index: usize) -> Option<Vec<MerkleNode>> {
        if index >= self.leaves.len() {
            return None;
        }
        let mut path = Vec::new();
        let mut idx = index;
        for layer in self.layers.iter().take(self.layers.len().saturating_sub(1)) {
            path.push(MerkleNode {
                hash: layer[idx ^ 1],
                is_left: idx % 2 == 1,
            });
            idx /= 2;
        }
        Some(path)
    }

    /// Persist under this trie's height, replacing any previous trie there.
    pub fn store(&self, storage: &dyn Storage) -> Result<(), StorageError> {
        let stored = StoredTrie {
            height: self.height,
            leaves: self.leaves.clone(),
        };
        let bytes = crate::serialize(&stored).map_err(|e| StorageError::Serialization(e.to_string()))?;
        storage.put_merkle_tree(self.height, &bytes)
    }

    pub fn load(storage: &dyn Storage, height: u64) -> Result<Option<Self>, StorageError> {
        let Some(bytes) = storage.get_merkle_tree(height)? else {
            return Ok(None);
        };
        let stored: StoredTrie =
            crate::deserialize(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(Some(MerkleTrie::build(stored.height, &stored.leaves)))
    }
}

/// Fold an authentication path back up to a root.
pub fn compute_merkle_root(leaf: &Hash, path: &[MerkleNode]) -> Hash {
    path.iter().fold(*leaf, |current, node| {
        if node.is_left {
            merge(&node.hash, &current)
        } else {
            merge(&current, &node.hash)
        }
    })
}

pub fn verify_merkle_proof(leaf: &Hash, path: &[MerkleNode], root: &Hash) -> bool {
    crate::constant_time_eq(&compute_merkle_root(leaf, path), root)
}
