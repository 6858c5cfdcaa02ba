//! Topic-keyed batch wire format shared by every protocol.
//!
//! Layout (integers little-endian):
//!
//! ```text
//! head(4) ++ chain_id(2) ++ entry_count(4)
//!   ++ { key(2) ++ blob_count(4) ++ { len(4) ++ blob } }
//! ```
//!
//! The head is the two-byte opcode token padded with zeros.

use std::collections::BTreeMap;

use crate::chain::transaction::Transaction;
use crate::crypto::scheme::LiveSchemes;
use crate::network::protocol::{Opcode, Topic};

const HEAD_LEN: usize = 4;
const BASE_LEN: usize = HEAD_LEN + 2;

/// Errors from encoding or decoding wire messages.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("insufficient bytes for base message")]
    InsufficientBase,
    #[error("insufficient bytes for entry count")]
    InsufficientEntryCount,
    #[error("insufficient bytes for entry key")]
    InsufficientKey,
    #[error("insufficient bytes for blob count")]
    InsufficientBlobCount,
    #[error("insufficient bytes for blob length")]
    InsufficientBlobLength,
    #[error("insufficient bytes for blob body")]
    InsufficientBlob,
    #[error("unknown opcode {0}")]
    UnknownOpcode(String),
    #[error("chain id mismatch: expected {expected}, got {got}")]
    ChainIdMismatch { expected: u16, got: u16 },
    #[error("message of {size} bytes exceeds limit {max}")]
    MessageTooLarge { size: usize, max: usize },
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

impl CodecError {
    /// True for the truncation family of errors.
    pub fn is_insufficient(&self) -> bool {
        matches!(
            self,
            CodecError::InsufficientBase
                | CodecError::InsufficientEntryCount
                | CodecError::InsufficientKey
                | CodecError::InsufficientBlobCount
                | CodecError::InsufficientBlobLength
                | CodecError::InsufficientBlob
        )
    }
}

/// A decoded wire message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireMessage {
    pub head: Opcode,
    pub chain_id: u16,
    pub payload: BTreeMap<Topic, Vec<Vec<u8>>>,
}

impl WireMessage {
    pub fn new(head: Opcode, chain_id: u16) -> Self {
        WireMessage {
            head,
            chain_id,
            payload: BTreeMap::new(),
        }
    }

    /// Builder-style entry insertion.
    pub fn with(mut self, key: Topic, blobs: Vec<Vec<u8>>) -> Self {
        self.payload.insert(key, blobs);
        self
    }

    pub fn push(&mut self, key: Topic, blob: Vec<u8>) {
        self.payload.entry(key).or_default().push(blob);
    }

    pub fn blobs(&self, key: Topic) -> &[Vec<u8>] {
        self.payload.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First blob under a key.
    pub fn first(&self, key: Topic) -> Option<&[u8]> {
        self.blobs(key).first().map(Vec::as_slice)
    }

    pub fn encoded_len(&self) -> usize {
        BASE_LEN
            + 4
            + self
                .payload
                .values()
                .map(|blobs| 6 + blobs.iter().map(|b| 4 + b.len()).sum::<usize>())
                .sum::<usize>()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        let token = self.head.token();
        out.extend_from_slice(&[token[0], token[1], 0, 0]);
        out.extend_from_slice(&self.chain_id.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        for (key, blobs) in &self.payload {
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(&(blobs.len() as u32).to_le_bytes());
            for blob in blobs {
                out.extend_from_slice(&(blob.len() as u32).to_le_bytes());
                out.extend_from_slice(blob);
            }
        }
        out
    }

    /// Exact inverse of [`WireMessage::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<WireMessage, CodecError> {
        let mut r = Reader { bytes, pos: 0 };
        let head = r.take(HEAD_LEN, CodecError::InsufficientBase)?;
        if head[2..] != [0, 0] {
            return Err(CodecError::UnknownOpcode(hex::encode(head)));
        }
        let head = Opcode::from_token([head[0], head[1]])
            .ok_or_else(|| CodecError::UnknownOpcode(hex::encode(head)))?;
        let chain_id = u16::from_le_bytes(r.array(CodecError::InsufficientBase)?);
        let entries = r.u32(CodecError::InsufficientEntryCount)?;

        let mut payload = BTreeMap::new();
        for _ in 0..entries {
            let key = Topic(r.array(CodecError::InsufficientKey)?);
            let count = r.u32(CodecError::InsufficientBlobCount)? as usize;
            // every blob needs at least its length prefix
            let mut blobs = Vec::with_capacity(count.min(r.remaining() / 4));
            for _ in 0..count {
                let len = r.u32(CodecError::InsufficientBlobLength)? as usize;
                blobs.push(r.take(len, CodecError::InsufficientBlob)?.to_vec());
            }
            payload.insert(key, blobs);
        }
        if r.remaining() != 0 {
            return Err(CodecError::TrailingBytes(r.remaining()));
        }
        Ok(WireMessage {
            head,
            chain_id,
            payload,
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize, err: CodecError) -> Result<&'a [u8], CodecError> {
        if len > self.remaining() {
            return Err(err);
        }
        let out = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn array<const N: usize>(&mut self, err: CodecError) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, err)?);
        Ok(out)
    }

    fn u32(&mut self, err: CodecError) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.array(err)?))
    }
}

/// Chain-bound codec enforcing the configured size limit.
#[derive(Clone, Copy, Debug)]
pub struct Codec {
    pub chain_id: u16,
    pub max_message_bytes: usize,
}

/// A message that passed [`Codec::check_valid_message`].
#[derive(Debug)]
pub struct ValidatedMessage {
    pub message: WireMessage,
    /// Transactions found in the payload, keyed like the payload.
    pub transactions: BTreeMap<Topic, Vec<Transaction>>,
    /// Blobs dropped because they failed to parse or verify.
    pub dropped: usize,
}

impl Codec {
    pub fn new(chain_id: u16, max_message_bytes: usize) -> Self {
        Codec {
            chain_id,
            max_message_bytes,
        }
    }

    pub fn message(&self, head: Opcode) -> WireMessage {
        WireMessage::new(head, self.chain_id)
    }

    pub fn encode(&self, msg: &WireMessage) -> Result<Vec<u8>, CodecError> {
        let size = msg.encoded_len();
        if size > self.max_message_bytes {
            return Err(CodecError::MessageTooLarge {
                size,
                max: self.max_message_bytes,
            });
        }
        Ok(msg.to_bytes())
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<WireMessage, CodecError> {
        if bytes.len() > self.max_message_bytes {
            return Err(CodecError::MessageTooLarge {
                size: bytes.len(),
                max: self.max_message_bytes,
            });
        }
        let msg = WireMessage::from_bytes(bytes)?;
        if msg.chain_id != self.chain_id {
            return Err(CodecError::ChainIdMismatch {
                expected: self.chain_id,
                got: msg.chain_id,
            });
        }
        Ok(msg)
    }

    /// Decode and, for transaction-bearing opcodes, parse and verify each
    /// transaction. Bad entries are dropped one by one; the batch survives.
    ///
    /// Transactions arriving on the nonce topics are parsed but not verified
    /// here, the proposal round applies its own checks.
    pub fn check_valid_message(
        &self,
        bytes: &[u8],
        topic: Topic,
        schemes: &LiveSchemes,
    ) -> Result<ValidatedMessage, CodecError> {
        let mut message = self.decode(bytes)?;
        let mut transactions = BTreeMap::new();
        let mut dropped = 0;
        if message.head.carries_transactions() {
            let verify = !matches!(topic, Topic::NONCE | Topic::SELF_NONCE);
            for (key, blobs) in message.payload.iter_mut() {
                let mut kept_blobs = Vec::with_capacity(blobs.len());
                let mut kept_txs = Vec::with_capacity(blobs.len());
                for blob in blobs.drain(..) {
                    let tx = match Transaction::from_bytes(&blob) {
                        Ok(tx) => tx,
                        Err(e) => {
                            tracing::debug!(key = %key, error = %e, "Dropping unparsable transaction");
                            dropped += 1;
                            continue;
                        }
                    };
                    if tx.body.chain_id != self.chain_id {
                        dropped += 1;
                        continue;
                    }
                    if verify {
                        if let Err(e) = tx.verify(schemes) {
                            tracing::debug!(
                                tx = %hex::encode(&tx.hash[..8]),
                                error = %e,
                                "Dropping unverifiable transaction"
                            );
                            dropped += 1;
                            continue;
                        }
                    }
                    kept_blobs.push(blob);
                    kept_txs.push(tx);
                }
                *blobs = kept_blobs;
                transactions.insert(*key, kept_txs);
            }
        }
        Ok(ValidatedMessage {
            message,
            transactions,
            dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::fields;

    fn sample() -> WireMessage {
        WireMessage::new(Opcode::SendHeaders, 23)
            .with(fields::INDICES, vec![5u64.to_le_bytes().to_vec()])
            .with(fields::HEADERS, vec![vec![1, 2, 3], vec![], vec![9; 40]])
    }

    #[test]
    fn decode_inverts_encode() {
        let msg = sample();
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), msg.encoded_len());
        assert_eq!(WireMessage::from_bytes(&bytes).unwrap(), msg);

        let empty = WireMessage::new(Opcode::HeightAnnounce, 1);
        assert_eq!(WireMessage::from_bytes(&empty.to_bytes()).unwrap(), empty);
    }

    #[test]
    fn every_truncation_is_insufficient_bytes() {
        let bytes = sample().to_bytes();
        for cut in 0..bytes.len() {
            let err = WireMessage::from_bytes(&bytes[..cut]).unwrap_err();
            assert!(err.is_insufficient(), "cut {cut}: {err}");
        }
    }

    #[test]
    fn truncation_errors_name_the_field() {
        let bytes = sample().to_bytes();
        assert_eq!(
            WireMessage::from_bytes(&bytes[..3]).unwrap_err(),
            CodecError::InsufficientBase
        );
        assert_eq!(
            WireMessage::from_bytes(&bytes[..7]).unwrap_err(),
            CodecError::InsufficientEntryCount
        );
        assert_eq!(
            WireMessage::from_bytes(&bytes[..11]).unwrap_err(),
            CodecError::InsufficientKey
        );
    }

    #[test]
    fn declared_length_beyond_buffer_rejected() {
        let mut bytes = WireMessage::new(Opcode::TxGossip, 23)
            .with(fields::POOL_STANDARD, vec![vec![0u8; 4]])
            .to_bytes();
        // blob length lives after head, chain id, count, key and blob count
        let len_at = BASE_LEN + 4 + 2 + 4;
        bytes[len_at..len_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(
            WireMessage::from_bytes(&bytes).unwrap_err(),
            CodecError::InsufficientBlob
        );
    }

    #[test]
    fn unknown_opcode_rejected() {
        let mut bytes = sample().to_bytes();
        bytes[0] = b'z';
        bytes[1] = b'z';
        assert!(matches!(
            WireMessage::from_bytes(&bytes),
            Err(CodecError::UnknownOpcode(_))
        ));
    }

    #[test]
    fn codec_enforces_chain_and_size() {
        let codec = Codec::new(23, 256);
        let bytes = codec.encode(&sample()).unwrap();
        assert!(codec.decode(&bytes).is_ok());

        let other = Codec::new(24, 256);
        assert_eq!(
            other.decode(&bytes).unwrap_err(),
            CodecError::ChainIdMismatch {
                expected: 24,
                got: 23
            }
        );

        let big = WireMessage::new(Opcode::TxGossip, 23)
            .with(fields::POOL_STANDARD, vec![vec![0; 300]]);
        assert!(matches!(
            codec.encode(&big),
            Err(CodecError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn check_valid_message_drops_garbage_blobs_individually() {
        let schemes = LiveSchemes::default();
        let codec = Codec::new(23, 1 << 20);
        let msg = WireMessage::new(Opcode::TxGossip, 23)
            .with(fields::POOL_STANDARD, vec![vec![1, 2, 3], vec![4, 5]]);
        let validated = codec
            .check_valid_message(&msg.to_bytes(), Topic::TRANSACTION, &schemes)
            .unwrap();
        assert_eq!(validated.dropped, 2);
        assert!(validated.message.blobs(fields::POOL_STANDARD).is_empty());
    }
}
