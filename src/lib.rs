//! # Okura
//!
//! A peer-to-peer blockchain node for a fixed set of delegated validators:
//! - **Proof-of-synergy rounds**: a nonce transaction for the next height
//!   triggers block assembly on every staked validator
//! - **Topic transport**: one TCP port per protocol topic with framed,
//!   trust-gated connections
//! - **Fork-aware sync**: header exchange with bounded rollback
//! - **Rotating post-quantum signatures**: two live scheme slots that the
//!   network can pause or replace by stake-weighted vote

pub mod chain;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod network;
pub mod node;

/// Protocol constants
pub mod constants {
    /// Default chain identifier carried in every wire message.
    pub const DEFAULT_CHAIN_ID: u16 = 23;

    /// Hard cap on the token supply (8 decimals).
    pub const MAX_TOTAL_SUPPLY: u64 = 230_000_000_000_000_000;
    /// Supply minted at genesis.
    pub const INIT_SUPPLY: u64 = 23_000_000_000_000_000;
    /// Reward per block is the remaining mintable supply divided by this.
    pub const REWARD_DIVISOR: u64 = 10_000_000;
    /// Operator share of the reward is capped at 50% (per mille).
    pub const MAX_REWARD_PERCENTAGE: u16 = 500;

    /// Proof-of-synergy difficulty scaling factor.
    pub const DIFFICULTY_MULTIPLIER: u32 = 10;
    /// Step applied when the block interval drifts from target.
    pub const DIFFICULTY_CHANGE: u32 = 10;
    /// Difficulty of the genesis block.
    pub const INITIAL_DIFFICULTY: u32 = 10;
    /// Target seconds between blocks.
    pub const BLOCK_TIME_INTERVAL_SECS: u64 = 10;
    /// Fixed genesis timestamp so every node derives the same genesis hash.
    pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

    /// Maximum pool transactions selected into one block.
    pub const MAX_TRANSACTIONS_PER_BLOCK: usize = 5_000;
    /// Capacity of each transaction pool.
    pub const MAX_TRANSACTIONS_IN_POOL: usize = 10_000;
    /// Byte budget of each transaction pool (50 MiB).
    pub const POOL_MAX_BYTES: usize = 50 * 1024 * 1024;
    /// Entries retained in each pool's ban index.
    pub const MAX_TX_BANS: usize = 60_480;
    /// A pool transaction older than this many blocks is no longer selected.
    pub const MAX_TRANSACTION_DELAY: u64 = 60_480;

    /// Minimum stake backing a delegated account that may trigger a round.
    pub const MIN_STAKING_FOR_NODE: u64 = 100_000_000_000_000;
    /// Oracle samples older than this many blocks are ignored.
    pub const ORACLES_HEIGHT_DISTANCE: u64 = 6;
    /// Encryption votes older than this many blocks are pruned.
    pub const VOTING_HEIGHT_DISTANCE: u64 = 60;
    /// Encryption slot changes are only honoured from this height on.
    pub const ENCRYPTION_CHANGE_MIN_HEIGHT: u64 = 3;

    /// Blocks served per header request.
    pub const NUMBER_OF_HASHES_IN_BUCKET: u64 = 32;
    /// Blocks discarded below the first mismatching index on a fork.
    pub const ROLLBACK_DISTANCE: u64 = 1;

    /// Trust budget granted to a peer on first valid contact.
    pub const TRUST_BUDGET: i32 = 2;
    /// Peer count below which announced peers are dialed.
    pub const MAX_PEERS_CONNECTED: usize = 6;
    /// Maximum reassembled network message (16 MiB).
    pub const MAX_NETWORK_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
    /// Socket read size for the receive loop.
    pub const RECEIVE_CHUNK_BYTES: usize = 1024;
    /// Dial attempts before giving up on a peer.
    pub const DIAL_RETRIES: u32 = 3;
    /// Pause between dial attempts in milliseconds.
    pub const DIAL_BACKOFF_MS: u64 = 2_000;
    /// Send-loop lock acquisition timeout in milliseconds.
    pub const SEND_LOCK_TIMEOUT_MS: u64 = 10;
    /// Reconnect attempts after a dialed connection drops.
    pub const RECONNECT_ATTEMPTS: u32 = 2;
    /// Frames buffered per connection before sends are abandoned.
    pub const CONNECTION_QUEUE_DEPTH: usize = 128;
    /// Default wall-clock ban duration in seconds.
    pub const BAN_DURATION_SECS: u64 = 3_600;
    /// Default height-based ban duration in blocks.
    pub const BAN_DURATION_BLOCKS: u64 = 360;

    /// Height announcement period in milliseconds.
    pub const ANNOUNCE_INTERVAL_MS: u64 = 1_000;
    /// Transaction gossip period in milliseconds.
    pub const GOSSIP_INTERVAL_MS: u64 = 1_000;
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Compute a domain-separated BLAKE3 hash.
pub fn hash_domain(domain: &str, data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(domain);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Constant-time comparison of two byte slices.
///
/// The length comparison is not constant-time; every caller compares
/// fixed-size hashes.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Serialize a value using bincode with legacy (v1-compatible) encoding.
pub fn serialize<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(val, bincode::config::legacy())
}

/// Deserialize a value using bincode with legacy (v1-compatible) encoding.
///
/// Rejects inputs larger than `MAX_NETWORK_MESSAGE_BYTES`.
pub fn deserialize<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    if bytes.len() > constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(bincode::error::DecodeError::LimitExceeded);
    }
    let (val, _len) = bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
    Ok(val)
}

/// Seconds since the UNIX epoch (0 if the clock is before it).
pub fn unix_time_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
