//! Signed transactions and addresses.

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{KeyError, SigningKeypair};
use crate::crypto::scheme::{LiveSchemes, SchemeError, Slot};
use crate::network::protocol::{fields, Topic};
use crate::Hash;

pub const ADDRESS_LEN: usize = 20;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TxError {
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("transaction hash does not match its contents")]
    HashMismatch,
    #[error("sender is not derived from the signing key")]
    SenderMismatch,
    #[error(transparent)]
    Scheme(#[from] SchemeError),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// A 20-byte account address.
///
/// Ordinary addresses are derived from a public key. Delegated (validator)
/// accounts are the reserved range `00..00 || id` with `id` in 1..=255.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = crate::hash_domain("okura.address", public_key);
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&digest[..ADDRESS_LEN]);
        Address(out)
    }

    pub fn delegated(id: u8) -> Self {
        let mut out = [0u8; ADDRESS_LEN];
        out[ADDRESS_LEN - 1] = id;
        Address(out)
    }

    /// The delegated id if this is a delegated account address.
    pub fn delegated_id(&self) -> Option<u8> {
        let (prefix, last) = self.0.split_at(ADDRESS_LEN - 1);
        if last[0] != 0 && prefix.iter().all(|b| *b == 0) {
            Some(last[0])
        } else {
            None
        }
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim_start_matches("0x")).ok()?;
        let arr: [u8; ADDRESS_LEN] = bytes.try_into().ok()?;
        Some(Address(arr))
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Which pool a transaction belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolKind {
    Standard,
    Escrow,
    MultiSig,
}

impl PoolKind {
    pub const ALL: [PoolKind; 3] = [PoolKind::Standard, PoolKind::Escrow, PoolKind::MultiSig];

    /// Payload key used for this pool in wire messages.
    pub fn tag(self) -> Topic {
        match self {
            PoolKind::Standard => fields::POOL_STANDARD,
            PoolKind::Escrow => fields::POOL_ESCROW,
            PoolKind::MultiSig => fields::POOL_MULTISIG,
        }
    }

    pub fn from_tag(tag: Topic) -> Option<PoolKind> {
        PoolKind::ALL.into_iter().find(|k| k.tag() == tag)
    }
}

/// The signed portion of a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxBody {
    pub kind: PoolKind,
    pub sender: Address,
    pub recipient: Address,
    pub amount: u64,
    pub nonce: u64,
    pub chain_id: u16,
    /// Height the sender targeted; nonce transactions use the proposed height.
    pub height: u64,
    /// Unix seconds at signing.
    pub sending_time: u64,
    pub opt_data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub body: TxBody,
    pub slot: Slot,
    pub public_key: Vec<u8>,
    pub hash: Hash,
    pub signature: Vec<u8>,
}

fn body_hash(body: &TxBody, slot: Slot, public_key: &[u8]) -> Result<Hash, TxError> {
    let bytes = crate::serialize(&(body, slot, public_key))
        .map_err(|e| TxError::Serialization(e.to_string()))?;
    Ok(crate::hash_domain("okura.tx", &bytes))
}

impl Transaction {
    /// Sign `body` with the key held for `slot`.
    pub fn sign(body: TxBody, slot: Slot, keypair: &SigningKeypair) -> Result<Self, TxError> {
        let hash = body_hash(&body, slot, &keypair.public)?;
        let signature = keypair.sign(&hash)?;
        Ok(Transaction {
            body,
            slot,
            public_key: keypair.public.clone(),
            hash,
            signature,
        })
    }

    /// Recompute the hash, bind the sender to the key and check the
    /// signature against the live scheme of the signing slot.
    pub fn verify(&self, schemes: &LiveSchemes) -> Result<(), TxError> {
        let expected = body_hash(&self.body, self.slot, &self.public_key)?;
        if !crate::constant_time_eq(&expected, &self.hash) {
            return Err(TxError::HashMismatch);
        }
        if Address::from_public_key(&self.public_key) != self.body.sender {
            return Err(TxError::SenderMismatch);
        }
        schemes.verify(self.slot, &self.public_key, &self.hash, &self.signature)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TxError> {
        crate::serialize(self).map_err(|e| TxError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TxError> {
        crate::deserialize(bytes).map_err(|e| TxError::Serialization(e.to_string()))
    }

    pub fn kind(&self) -> PoolKind {
        self.body.kind
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::keys::SchemeKind;

    pub(crate) fn transfer(
        keypair: &SigningKeypair,
        recipient: Address,
        amount: u64,
        nonce: u64,
    ) -> Transaction {
        let body = TxBody {
            kind: PoolKind::Standard,
            sender: Address::from_public_key(&keypair.public),
            recipient,
            amount,
            nonce,
            chain_id: 23,
            height: 1,
            sending_time: 1_700_000_100,
            opt_data: vec![],
        };
        Transaction::sign(body, Slot::Primary, keypair).unwrap()
    }

    #[test]
    fn delegated_addresses() {
        assert_eq!(Address::delegated(7).delegated_id(), Some(7));
        assert_eq!(Address::default().delegated_id(), None);
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        assert_eq!(Address::from_public_key(&kp.public).delegated_id(), None);
        let a = Address::delegated(3);
        assert_eq!(Address::from_hex(&a.to_string()), Some(a));
    }

    #[test]
    fn signed_transfer_verifies() {
        let schemes = LiveSchemes::default();
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        let tx = transfer(&kp, Address::delegated(1), 10, 0);
        tx.verify(&schemes).unwrap();

        let restored = Transaction::from_bytes(&tx.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, tx);
    }

    #[test]
    fn tampering_is_detected() {
        let schemes = LiveSchemes::default();
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        let mut tx = transfer(&kp, Address::delegated(1), 10, 0);
        tx.body.amount = 11;
        assert_eq!(tx.verify(&schemes), Err(TxError::HashMismatch));

        let mut forged = transfer(&kp, Address::delegated(1), 10, 0);
        forged.body.sender = Address::delegated(9);
        forged.hash = body_hash(&forged.body, forged.slot, &forged.public_key).unwrap();
        assert_eq!(forged.verify(&schemes), Err(TxError::SenderMismatch));
    }

    #[test]
    fn pool_tags_map_back() {
        for kind in PoolKind::ALL {
            assert_eq!(PoolKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(PoolKind::from_tag(fields::NONCE_TX), None);
    }
}
