//! Blocks and their structural verification.
//!
//! A block's header commits to the previous block hash, the Merkle root of
//! its transaction hashes and the two encryption-config slots in force from
//! this height on. Signatures on block `h` are checked against the slots
//! carried by block `h - 1`, so verification never depends on live state.

use serde::{Deserialize, Serialize};

use crate::chain::transaction::Address;
use crate::consensus::synergy;
use crate::crypto::keys::{KeyError, SigningKeypair};
use crate::crypto::merkle::MerkleTrie;
use crate::crypto::scheme::{EncryptionConfig, LiveSchemes, SchemeError, Slot};
use crate::Hash;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("height {got} does not follow {expected}")]
    HeightMismatch { expected: u64, got: u64 },
    #[error("previous hash does not link to block {0}")]
    PreviousHashMismatch(u64),
    #[error("header hash mismatch")]
    HeaderHashMismatch,
    #[error("block hash mismatch")]
    BlockHashMismatch,
    #[error("merkle root mismatch")]
    MerkleRootMismatch,
    #[error("encryption slot: {0}")]
    Encryption(#[from] SchemeError),
    #[error("operator is not derived from the signing key")]
    OperatorMismatch,
    #[error("reward {got} != expected {expected}")]
    RewardMismatch { expected: u64, got: u64 },
    #[error("supply {got} != expected {expected}")]
    SupplyMismatch { expected: u64, got: u64 },
    #[error("difficulty {got} != expected {expected}")]
    DifficultyMismatch { expected: u32, got: u32 },
    #[error("reward percentage {0} above cap")]
    RewardPercentage(u16),
    #[error("proof of synergy failed")]
    ProofOfSynergy,
    #[error(transparent)]
    Key(#[from] KeyError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseHeader {
    pub previous_hash: Hash,
    pub difficulty: u32,
    pub height: u64,
    pub delegated_id: u8,
    pub operator: Address,
    pub root_merkle: Hash,
    /// Encoded [`EncryptionConfig`] for the primary and secondary slot.
    pub encryption: [Vec<u8>; 2],
    pub signer_slot: Slot,
    pub signer_key: Vec<u8>,
    pub signature: Vec<u8>,
    /// Sending time of the nonce transaction that triggered this block.
    pub timestamp: u64,
}

impl BaseHeader {
    fn signing_hash(&self) -> Result<Hash, BlockError> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        let bytes = crate::serialize(&unsigned).map_err(|e| BlockError::Serialization(e.to_string()))?;
        Ok(crate::hash_domain("okura.header.sign", &bytes))
    }

    pub fn sign(&mut self, slot: Slot, keypair: &SigningKeypair) -> Result<(), BlockError> {
        self.signer_slot = slot;
        self.signer_key = keypair.public.clone();
        self.signature.clear();
        let hash = self.signing_hash()?;
        self.signature = keypair.sign(&hash)?;
        Ok(())
    }

    pub fn verify_signature(&self, schemes: &LiveSchemes) -> Result<(), BlockError> {
        if Address::from_public_key(&self.signer_key) != self.operator {
            return Err(BlockError::OperatorMismatch);
        }
        let hash = self.signing_hash()?;
        schemes.verify(self.signer_slot, &self.signer_key, &hash, &self.signature)?;
        Ok(())
    }

    pub fn hash(&self) -> Result<Hash, BlockError> {
        let bytes = crate::serialize(self).map_err(|e| BlockError::Serialization(e.to_string()))?;
        Ok(crate::hash_domain("okura.header", &bytes))
    }

    pub fn encryption_config(&self, slot: Slot) -> Result<EncryptionConfig, SchemeError> {
        EncryptionConfig::from_bytes(&self.encryption[slot.index()])
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BaseHeader,
    pub header_hash: Hash,
    /// Unix seconds at assembly.
    pub timestamp: u64,
    /// Operator share of the reward, per mille.
    pub reward_percentage: u16,
    pub supply: u64,
    pub reward: u64,
    pub price_oracle: i64,
    pub rand_oracle: i64,
    pub tx_hashes: Vec<Hash>,
    pub block_hash: Hash,
}

impl Block {
    /// The fixed genesis block every node starts from.
    pub fn genesis() -> Self {
        let header = BaseHeader {
            previous_hash: [0u8; 32],
            difficulty: crate::constants::INITIAL_DIFFICULTY,
            height: 0,
            delegated_id: 0,
            operator: Address::default(),
            root_merkle: [0u8; 32],
            encryption: LiveSchemes::default().both().map(|c| c.to_bytes()),
            signer_slot: Slot::Primary,
            signer_key: vec![],
            signature: vec![],
            timestamp: crate::constants::GENESIS_TIMESTAMP,
        };
        let mut block = Block {
            header_hash: [0u8; 32],
            header,
            timestamp: crate::constants::GENESIS_TIMESTAMP,
            reward_percentage: 0,
            supply: crate::constants::INIT_SUPPLY,
            reward: 0,
            price_oracle: 0,
            rand_oracle: 0,
            tx_hashes: vec![],
            block_hash: [0u8; 32],
        };
        // Fixed fields; serialization cannot fail here.
        block.header_hash = block.header.hash().unwrap_or_default();
        block.block_hash = block.compute_hash().unwrap_or_default();
        block
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn compute_hash(&self) -> Result<Hash, BlockError> {
        let mut unhashed = self.clone();
        unhashed.block_hash = [0u8; 32];
        let bytes = crate::serialize(&unhashed).map_err(|e| BlockError::Serialization(e.to_string()))?;
        Ok(crate::hash_domain("okura.block", &bytes))
    }

    /// Fill in both hashes after the header has been signed.
    pub fn seal(&mut self) -> Result<(), BlockError> {
        self.header_hash = self.header.hash()?;
        self.block_hash = self.compute_hash()?;
        Ok(())
    }

    /// Live schemes as declared by this block's header.
    pub fn schemes(&self) -> Result<LiveSchemes, BlockError> {
        Ok(LiveSchemes::new(
            self.header.encryption_config(Slot::Primary)?,
            self.header.encryption_config(Slot::Secondary)?,
        ))
    }

    /// Height continuity and previous-hash equality against `previous`.
    pub fn verify_linkage(&self, previous: &Block) -> Result<(), BlockError> {
        if self.height() != previous.height() + 1 {
            return Err(BlockError::HeightMismatch {
                expected: previous.height() + 1,
                got: self.height(),
            });
        }
        if !crate::constant_time_eq(&self.header.previous_hash, &previous.block_hash) {
            return Err(BlockError::PreviousHashMismatch(previous.height()));
        }
        Ok(())
    }

    /// Structural check of `self` on top of `previous`: linkage, hashes,
    /// both encryption slots, the header signature under the previous
    /// block's schemes, economics, proof of synergy and the Merkle root.
    ///
    /// Returns the rebuilt trie for the caller to persist or drop.
    pub fn check_base(&self, previous: &Block) -> Result<MerkleTrie, BlockError> {
        self.verify_linkage(previous)?;
        if self.header.hash()? != self.header_hash {
            return Err(BlockError::HeaderHashMismatch);
        }
        if self.compute_hash()? != self.block_hash {
            return Err(BlockError::BlockHashMismatch);
        }
        for slot in Slot::BOTH {
            self.header.encryption_config(slot)?;
        }
        self.header.verify_signature(&previous.schemes()?)?;

        if self.reward_percentage > crate::constants::MAX_REWARD_PERCENTAGE {
            return Err(BlockError::RewardPercentage(self.reward_percentage));
        }
        let reward = synergy::reward_for_supply(previous.supply);
        if self.reward != reward {
            return Err(BlockError::RewardMismatch {
                expected: reward,
                got: self.reward,
            });
        }
        let supply = previous.supply.saturating_add(reward);
        if self.supply != supply {
            return Err(BlockError::SupplyMismatch {
                expected: supply,
                got: self.supply,
            });
        }
        let difficulty = synergy::adjust_difficulty(
            previous.header.difficulty,
            self.header.timestamp.saturating_sub(previous.timestamp),
        );
        if self.header.difficulty != difficulty {
            return Err(BlockError::DifficultyMismatch {
                expected: difficulty,
                got: self.header.difficulty,
            });
        }
        if !synergy::check_proof_of_synergy(&self.block_hash, self.header.difficulty) {
            return Err(BlockError::ProofOfSynergy);
        }

        let trie = MerkleTrie::build(self.height(), &self.tx_hashes);
        if trie.root() != self.header.root_merkle {
            return Err(BlockError::MerkleRootMismatch);
        }
        Ok(trie)
    }

    /// Slots whose config differs from `previous`.
    pub fn changed_slots(&self, previous: &Block) -> Vec<Slot> {
        Slot::BOTH
            .into_iter()
            .filter(|s| self.header.encryption[s.index()] != previous.header.encryption[s.index()])
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BlockError> {
        crate::serialize(self).map_err(|e| BlockError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlockError> {
        crate::deserialize(bytes).map_err(|e| BlockError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::keys::SchemeKind;

    /// Build and sign a valid child of `previous` with `keypair` as operator.
    pub(crate) fn child(previous: &Block, keypair: &SigningKeypair, tx_hashes: Vec<Hash>) -> Block {
        let height = previous.height() + 1;
        let timestamp = previous.timestamp + crate::constants::BLOCK_TIME_INTERVAL_SECS;
        let trie = MerkleTrie::build(height, &tx_hashes);
        let mut header = BaseHeader {
            previous_hash: previous.block_hash,
            difficulty: synergy::adjust_difficulty(previous.header.difficulty, timestamp - previous.timestamp),
            height,
            delegated_id: 1,
            operator: Address::from_public_key(&keypair.public),
            root_merkle: trie.root(),
            encryption: previous.header.encryption.clone(),
            signer_slot: Slot::Primary,
            signer_key: vec![],
            signature: vec![],
            timestamp,
        };
        header.sign(Slot::Primary, keypair).unwrap();
        let reward = synergy::reward_for_supply(previous.supply);
        let mut block = Block {
            header,
            header_hash: [0u8; 32],
            timestamp,
            reward_percentage: 100,
            supply: previous.supply + reward,
            reward,
            price_oracle: 0,
            rand_oracle: 0,
            tx_hashes,
            block_hash: [0u8; 32],
        };
        block.seal().unwrap();
        block
    }

    #[test]
    fn genesis_is_stable() {
        let a = Block::genesis();
        let b = Block::genesis();
        assert_eq!(a.block_hash, b.block_hash);
        assert_ne!(a.block_hash, [0u8; 32]);
        assert_eq!(a.supply, crate::constants::INIT_SUPPLY);
        let schemes = a.schemes().unwrap();
        assert_eq!(schemes.kind(Slot::Primary).unwrap(), SchemeKind::Falcon512);
    }

    #[test]
    fn valid_child_passes_check_base() {
        let genesis = Block::genesis();
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        let block = child(&genesis, &kp, vec![[1u8; 32], [2u8; 32]]);
        let trie = block.check_base(&genesis).unwrap();
        assert_eq!(trie.root(), block.header.root_merkle);
        assert!(block.changed_slots(&genesis).is_empty());

        let restored = Block::from_bytes(&block.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, block);
    }

    #[test]
    fn linkage_violations_rejected() {
        let genesis = Block::genesis();
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        let one = child(&genesis, &kp, vec![]);
        let two = child(&one, &kp, vec![]);
        assert!(matches!(
            two.verify_linkage(&genesis),
            Err(BlockError::HeightMismatch { expected: 1, got: 2 })
        ));

        let mut forked = one.clone();
        forked.header.previous_hash = [9u8; 32];
        assert_eq!(
            forked.verify_linkage(&genesis),
            Err(BlockError::PreviousHashMismatch(0))
        );
    }

    #[test]
    fn tampered_fields_rejected() {
        let genesis = Block::genesis();
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);

        let mut extra_tx = child(&genesis, &kp, vec![[1u8; 32]]);
        extra_tx.tx_hashes.push([2u8; 32]);
        extra_tx.block_hash = extra_tx.compute_hash().unwrap();
        assert_eq!(extra_tx.check_base(&genesis).unwrap_err(), BlockError::MerkleRootMismatch);

        let mut inflated = child(&genesis, &kp, vec![]);
        inflated.reward += 1;
        inflated.block_hash = inflated.compute_hash().unwrap();
        assert!(matches!(
            inflated.check_base(&genesis),
            Err(BlockError::RewardMismatch { .. })
        ));

        let mut unsigned = child(&genesis, &kp, vec![]);
        unsigned.header.signature[0] ^= 1;
        unsigned.seal().unwrap();
        assert!(matches!(
            unsigned.check_base(&genesis),
            Err(BlockError::Encryption(SchemeError::BadSignature(_)))
        ));
    }

    #[test]
    fn secondary_key_must_match_secondary_scheme() {
        let genesis = Block::genesis();
        let falcon = SigningKeypair::generate(SchemeKind::Falcon512);
        let mut block = child(&genesis, &falcon, vec![]);
        block.header.sign(Slot::Secondary, &falcon).unwrap();
        block.seal().unwrap();
        assert!(block.check_base(&genesis).is_err());

        let dilithium = SigningKeypair::generate(SchemeKind::Dilithium5);
        let mut block = child(&genesis, &dilithium, vec![]);
        block.header.sign(Slot::Secondary, &dilithium).unwrap();
        block.seal().unwrap();
        block.check_base(&genesis).unwrap();
    }
}
