//! The running node: persistent ledger, transaction pools, wallet and the
//! orchestrator that wires them to the transport.

pub mod core;
pub mod ledger;
pub mod mempool;
pub mod storage;
pub mod wallet;

pub use self::core::{HandlerOutcome, Node};

use crate::chain::accounts::AccountError;
use crate::chain::block::BlockError;
use crate::chain::transaction::TxError;
use crate::consensus::proposal::ProposalError;
use crate::consensus::sync::SyncError;
use crate::crypto::keys::KeyError;
use crate::network::protocol::{Opcode, Topic};
use crate::network::{CodecError, TransportError};

/// Errors surfaced by node startup and message handlers.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),
    #[error("ledger error: {0}")]
    Ledger(#[from] ledger::LedgerError),
    #[error("wallet error: {0}")]
    Wallet(#[from] wallet::WalletError),
    #[error("genesis accounts: {0}")]
    Accounts(#[from] AccountError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("sync: {0}")]
    Sync(#[from] SyncError),
    #[error("proposal: {0}")]
    Proposal(#[from] ProposalError),
    #[error(transparent)]
    Transaction(#[from] TxError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("opcode {opcode} is not served on topic {topic}")]
    WrongTopic { opcode: Opcode, topic: Topic },
    #[error("malformed message: {0}")]
    Malformed(&'static str),
}

impl NodeError {
    /// Whether the sending peer is to blame and loses trust.
    pub fn is_peer_fault(&self) -> bool {
        match self {
            NodeError::Ledger(e) | NodeError::Sync(SyncError::Ledger(e)) => e.is_unauthorized(),
            _ => matches!(
                self,
                NodeError::Codec(_)
                    | NodeError::Transaction(_)
                    | NodeError::Block(_)
                    | NodeError::WrongTopic { .. }
                    | NodeError::Malformed(_)
                    | NodeError::Sync(
                        SyncError::Malformed(_) | SyncError::Block { .. } | SyncError::IndexMismatch { .. }
                    )
            ),
        }
    }
}
