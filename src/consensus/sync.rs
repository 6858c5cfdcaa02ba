//! Height negotiation and header-batch catch-up.
//!
//! Every second each node announces `(height, last block hash)` on the sync
//! topic. A peer that is ahead, or level with a different tip, is asked for
//! a bucket of blocks ending at its height. The returned batch is checked
//! block by block against the local chain: a mismatch at or below our height
//! is a fork and rolls the ledger back by the configured distance, a batch
//! whose transactions are not all known yet asks for them and waits, and a
//! complete batch is committed in order under the commit lock.
//!
//! Two validators can commit different blocks at the same height when their
//! proposals cross. A level peer's chain is only adopted when its tip hash
//! is lower than ours, so both sides settle on the same block.

use std::sync::{Arc, Mutex};

use crate::chain::block::{Block, BlockError};
use crate::constants::NUMBER_OF_HASHES_IN_BUCKET;
use crate::network::codec::{Codec, WireMessage};
use crate::network::peers::PeerAddress;
use crate::network::protocol::{fields, Opcode};
use crate::node::ledger::{CommitOrigin, CommitReport, Ledger, LedgerError};
use crate::Hash;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("block {height}: {source}")]
    Block { height: u64, source: BlockError },
    #[error("malformed sync message: {0}")]
    Malformed(&'static str),
    #[error("block at index {index} claims height {height}")]
    IndexMismatch { index: u64, height: u64 },
    #[error("another batch is being committed")]
    Busy,
}

/// Where the sync state machine currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    NegotiatingHeight,
    InSync,
    RequestingHeaders { begin: u64, end: u64 },
    ReceivingHeaders,
    CommittingBatch,
}

/// A peer's `hi` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeightAnnouncement {
    pub height: u64,
    pub last_hash: Hash,
    /// Peer addresses the announcer suggests dialing.
    pub peers: Vec<PeerAddress>,
}

impl HeightAnnouncement {
    pub fn to_message(&self, codec: &Codec) -> WireMessage {
        codec
            .message(Opcode::HeightAnnounce)
            .with(fields::LAST_HEIGHT, vec![self.height.to_le_bytes().to_vec()])
            .with(fields::LAST_BLOCK, vec![self.last_hash.to_vec()])
            .with(fields::PEERS, self.peers.iter().map(|p| p.0.to_vec()).collect())
    }

    pub fn from_message(msg: &WireMessage) -> Result<Self, SyncError> {
        let height = read_u64(msg.first(fields::LAST_HEIGHT))?;
        let last_hash: Hash = msg
            .first(fields::LAST_BLOCK)
            .and_then(|b| b.try_into().ok())
            .ok_or(SyncError::Malformed("last block hash"))?;
        let peers = msg
            .blobs(fields::PEERS)
            .iter()
            .filter_map(|b| <[u8; 4]>::try_from(b.as_slice()).ok().map(PeerAddress))
            .collect();
        Ok(HeightAnnouncement {
            height,
            last_hash,
            peers,
        })
    }
}

/// A `gh` request for blocks `begin..=end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderRequest {
    pub begin: u64,
    pub end: u64,
}

impl HeaderRequest {
    /// The bucket to ask for when a peer announces `peer_height` and we are
    /// at `local_height`. The bucket ends at the peer's height and reaches
    /// back far enough to overlap our tip; when the peer is more than a
    /// bucket ahead we fetch forward from our own height instead.
    pub fn for_heights(local_height: u64, peer_height: u64) -> Self {
        let mut end = peer_height;
        let mut begin = peer_height.saturating_sub(NUMBER_OF_HASHES_IN_BUCKET);
        if begin < 2 {
            begin = 0;
        }
        if begin > local_height {
            begin = local_height;
            end = (local_height + NUMBER_OF_HASHES_IN_BUCKET).min(peer_height);
        }
        HeaderRequest { begin, end }
    }

    pub fn to_message(&self, codec: &Codec) -> WireMessage {
        codec
            .message(Opcode::GetHeaders)
            .with(fields::BEGIN_HEIGHT, vec![self.begin.to_le_bytes().to_vec()])
            .with(fields::END_HEIGHT, vec![self.end.to_le_bytes().to_vec()])
    }

    pub fn from_message(msg: &WireMessage) -> Result<Self, SyncError> {
        Ok(HeaderRequest {
            begin: read_u64(msg.first(fields::BEGIN_HEIGHT))?,
            end: read_u64(msg.first(fields::END_HEIGHT))?,
        })
    }
}

fn read_u64(blob: Option<&[u8]>) -> Result<u64, SyncError> {
    blob.and_then(|b| <[u8; 8]>::try_from(b).ok())
        .map(u64::from_le_bytes)
        .ok_or(SyncError::Malformed("height field"))
}

/// Encode an `sh` reply.
pub fn headers_message(codec: &Codec, batch: &[(u64, Block)]) -> Result<WireMessage, SyncError> {
    let mut msg = codec.message(Opcode::SendHeaders);
    for (index, block) in batch {
        msg.push(fields::INDICES, index.to_le_bytes().to_vec());
        let bytes = block.to_bytes().map_err(|source| SyncError::Block {
            height: *index,
            source,
        })?;
        msg.push(fields::HEADERS, bytes);
    }
    Ok(msg)
}

/// Decode an `sh` reply into `(index, block)` pairs.
pub fn parse_headers(msg: &WireMessage) -> Result<Vec<(u64, Block)>, SyncError> {
    let indices = msg.blobs(fields::INDICES);
    let blocks = msg.blobs(fields::HEADERS);
    if indices.len() != blocks.len() {
        return Err(SyncError::Malformed("index and block counts differ"));
    }
    indices
        .iter()
        .zip(blocks)
        .map(|(index, bytes)| {
            let index = read_u64(Some(index))?;
            let block = Block::from_bytes(bytes).map_err(|source| SyncError::Block {
                height: index,
                source,
            })?;
            Ok((index, block))
        })
        .collect()
}

/// What a header batch led to.
#[derive(Debug, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Nothing in the batch extends our chain.
    Ignored(&'static str),
    /// A fork was found; the ledger now stands at `rolled_back_to`.
    Forked { at: u64, rolled_back_to: u64 },
    /// Some referenced transactions must be fetched first.
    MissingTransactions(Vec<Hash>),
    /// Blocks committed in order.
    Committed(Vec<CommitReport>),
}

pub struct SyncMachine {
    ledger: Arc<Ledger>,
    rollback_distance: u64,
    phase: Mutex<SyncPhase>,
}

impl SyncMachine {
    pub fn new(ledger: Arc<Ledger>, rollback_distance: u64) -> Self {
        SyncMachine {
            ledger,
            rollback_distance,
            phase: Mutex::new(SyncPhase::Idle),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: SyncPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    /// Our own `hi` message content.
    pub fn announcement(&self, peers: Vec<PeerAddress>) -> HeightAnnouncement {
        let last = self.ledger.last_block();
        HeightAnnouncement {
            height: last.height(),
            last_hash: last.block_hash,
            peers,
        }
    }

    /// React to a peer's height. Returns the headers to request, if any.
    pub fn on_announcement(&self, ann: &HeightAnnouncement) -> Option<HeaderRequest> {
        self.set_phase(SyncPhase::NegotiatingHeight);
        let last = self.ledger.last_block();
        let local = last.height();
        if ann.height < local {
            tracing::trace!(local, peer_height = ann.height, "Peer is behind");
            self.set_phase(SyncPhase::InSync);
            return None;
        }
        if ann.height == local && crate::constant_time_eq(&ann.last_hash, &last.block_hash) {
            self.set_phase(SyncPhase::InSync);
            return None;
        }
        if ann.height == local {
            tracing::info!(height = local, "Peer tip differs at our height, checking for a fork");
        }
        let request = HeaderRequest::for_heights(local, ann.height);
        self.set_phase(SyncPhase::RequestingHeaders {
            begin: request.begin,
            end: request.end,
        });
        Some(request)
    }

    /// Stored blocks for a peer's `gh` request, clamped to our height.
    pub fn serve_headers(&self, request: HeaderRequest) -> Result<Vec<(u64, Block)>, SyncError> {
        let end = request.end.min(self.ledger.height());
        if request.begin > end {
            return Ok(Vec::new());
        }
        let mut batch = Vec::with_capacity((end - request.begin + 1) as usize);
        for height in request.begin..=end {
            let block = self
                .ledger
                .block(height)?
                .ok_or(LedgerError::MissingBlock(height))?;
            batch.push((height, block));
        }
        Ok(batch)
    }

    /// Verify a header batch and commit what it adds to our chain.
    pub async fn on_headers(&self, batch: Vec<(u64, Block)>) -> Result<BatchOutcome, SyncError> {
        self.set_phase(SyncPhase::ReceivingHeaders);
        let outcome = self.process_batch(batch).await;
        self.set_phase(SyncPhase::Idle);
        outcome
    }

    async fn process_batch(&self, batch: Vec<(u64, Block)>) -> Result<BatchOutcome, SyncError> {
        let tip = self.ledger.last_block();
        let local = tip.height();
        let (Some((first, _)), Some((last, peer_tip))) = (batch.first(), batch.last()) else {
            return Ok(BatchOutcome::Ignored("empty batch"));
        };
        if *last < local {
            return Ok(BatchOutcome::Ignored("peer chain is shorter"));
        }
        if *last == local && peer_tip.block_hash >= tip.block_hash {
            return Ok(BatchOutcome::Ignored("peer tip is not preferred"));
        }
        if *first > local {
            return Ok(BatchOutcome::Ignored("batch does not reach our tip"));
        }

        let mut previous: Option<Block> = None;
        let mut missing = Vec::new();
        for (index, block) in &batch {
            if *index == 0 {
                continue;
            }
            if *index <= local {
                let ours = self
                    .ledger
                    .block(*index)?
                    .ok_or(LedgerError::MissingBlock(*index))?;
                if ours.block_hash == block.block_hash {
                    previous = Some(ours);
                    continue;
                }
                self.check_competing(*index, block, previous.take())?;
                return self.roll_back_fork(*index).await;
            }
            if block.height() != *index {
                return Err(SyncError::IndexMismatch {
                    index: *index,
                    height: block.height(),
                });
            }
            let parent = match previous.take() {
                Some(parent) => parent,
                None => self
                    .ledger
                    .block(index - 1)?
                    .ok_or(LedgerError::MissingBlock(index - 1))?,
            };
            // The rebuilt trie is only needed for the check here.
            block.check_base(&parent).map_err(|source| SyncError::Block {
                height: *index,
                source,
            })?;
            missing.extend(self.ledger.missing_transactions(block).await?);
            previous = Some(block.clone());
        }
        if !missing.is_empty() {
            tracing::info!(count = missing.len(), "Batch references unknown transactions");
            return Ok(BatchOutcome::MissingTransactions(missing));
        }

        let Some(_syncing) = self.ledger.begin_sync() else {
            return Err(SyncError::Busy);
        };
        self.set_phase(SyncPhase::CommittingBatch);
        let guard = self.ledger.lock().await;
        let mut reports = Vec::new();
        for (index, block) in &batch {
            if *index <= self.ledger.height() {
                continue;
            }
            match self.ledger.commit_block(&guard, block, CommitOrigin::Sync).await {
                Ok(report) => reports.push(report),
                Err(LedgerError::MissingTransactions(hashes)) => {
                    return Ok(BatchOutcome::MissingTransactions(hashes));
                }
                Err(e) => {
                    tracing::warn!(height = index, error = %e, "Sync commit failed");
                    if reports.is_empty() {
                        return Err(e.into());
                    }
                    break;
                }
            }
        }
        if let Some(last) = reports.last() {
            tracing::info!(from = local + 1, to = last.height, "Synced blocks");
        }
        Ok(BatchOutcome::Committed(reports))
    }

    /// A peer block replacing ours at `index` must itself be acceptable
    /// before we discard anything for it.
    fn check_competing(&self, index: u64, block: &Block, parent: Option<Block>) -> Result<(), SyncError> {
        if block.height() != index {
            return Err(SyncError::IndexMismatch {
                index,
                height: block.height(),
            });
        }
        let parent = match parent {
            Some(parent) => parent,
            None => self
                .ledger
                .block(index - 1)?
                .ok_or(LedgerError::MissingBlock(index - 1))?,
        };
        // A batch starting inside a deeper fork has no parent of ours to check against.
        if block.header.previous_hash == parent.block_hash {
            block.check_base(&parent).map_err(|source| SyncError::Block {
                height: index,
                source,
            })?;
        }
        self.ledger.check_operator(block)?;
        Ok(())
    }

    async fn roll_back_fork(&self, at: u64) -> Result<BatchOutcome, SyncError> {
        let target = at.saturating_sub(self.rollback_distance);
        tracing::warn!(at, target, "Fork detected in header batch");
        let Some(_syncing) = self.ledger.begin_sync() else {
            return Err(SyncError::Busy);
        };
        let guard = self.ledger.lock().await;
        self.ledger.rollback_to(&guard, target).await?;
        Ok(BatchOutcome::Forked {
            at,
            rolled_back_to: self.ledger.height(),
        })
    }
}
