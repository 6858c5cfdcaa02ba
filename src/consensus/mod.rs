//! # Nonce-round consensus
//!
//! Okura runs a fixed set of delegated validators. Each block interval a
//! validator broadcasts a nonce transaction for the next height; every
//! staked validator that accepts it assembles a block over the pending pool
//! transactions and proposes it if the block hash meets the
//! proof-of-synergy target.
//!
//! ```text
//! height h:
//!   1. validator V sends nonce(h+1, last_hash(h), oracle samples, votes)
//!   2. peers check V's stake and operator key, record samples and votes
//!   3. each peer builds block h+1: pool txs -> trie -> header -> sign
//!   4. blocks passing proof of synergy are broadcast on the sync topic,
//!      and the proposer feeds its own block in as if it had arrived
//!   5. the first valid block at h+1 from a staked operator is committed,
//!      later ones at that height are ignored
//! ```
//!
//! Nodes that fall behind, or end up on a different tip, catch up through
//! the header exchange in [`sync`], which rolls back a bounded distance on
//! a fork. Two tips at the same height settle on the lower block hash. Votes carried by nonces drive [`voting`], which can pause or
//! replace either of the two live signature schemes.

pub mod proposal;
pub mod sync;
pub mod synergy;
pub mod voting;
