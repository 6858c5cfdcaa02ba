//! Configuration file support for the Okura node.
//!
//! Loads optional `okura.toml` from the data directory. CLI flags override
//! config file values. If no config file exists, defaults are used.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::network::protocol::Topic;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct OkuraConfig {
    pub node: NodeSection,
    pub network: NetworkSection,
    pub consensus: ConsensusSection,
    pub pool: PoolSection,
}

/// Node identity section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub data_dir: String,
    /// Address other peers see this node as. Never banned, excluded from broadcasts.
    pub my_ip: Ipv4Addr,
    /// Peer IPv4 addresses dialed on every service topic at startup.
    pub bootstrap_peers: Vec<Ipv4Addr>,
    /// Delegated account slot this node operates (0 = not a validator).
    pub delegated_account: u8,
    /// Operator share of block rewards, per mille.
    pub reward_percentage: u16,
    pub chain_id: u16,
}

impl Default for NodeSection {
    fn default() -> Self {
        NodeSection {
            data_dir: "./okura-data".into(),
            my_ip: Ipv4Addr::LOCALHOST,
            bootstrap_peers: vec![],
            delegated_account: 0,
            reward_percentage: 0,
            chain_id: crate::constants::DEFAULT_CHAIN_ID,
        }
    }
}

/// How long a ban lasts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BanPolicy {
    /// Expires after a number of seconds.
    WallClock { seconds: u64 },
    /// Expires once the chain has grown by a number of blocks.
    Height { blocks: u64 },
}

impl Default for BanPolicy {
    fn default() -> Self {
        BanPolicy::WallClock {
            seconds: crate::constants::BAN_DURATION_SECS,
        }
    }
}

/// Networking section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub listen_host: IpAddr,
    /// Port per topic, keyed by the two-letter topic code ("TT", "NN", ...).
    pub ports: BTreeMap<String, u16>,
    pub max_message_bytes: usize,
    pub trust_budget: i32,
    pub max_peers_connected: usize,
    pub dial_retries: u32,
    pub dial_backoff_ms: u64,
    pub send_lock_timeout_ms: u64,
    pub reconnect_attempts: u32,
    pub ban_policy: BanPolicy,
}

impl Default for NetworkSection {
    fn default() -> Self {
        NetworkSection {
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ports: Topic::ALL
                .iter()
                .filter_map(|t| t.default_port().map(|p| (t.to_string(), p)))
                .collect(),
            max_message_bytes: crate::constants::MAX_NETWORK_MESSAGE_BYTES,
            trust_budget: crate::constants::TRUST_BUDGET,
            max_peers_connected: crate::constants::MAX_PEERS_CONNECTED,
            dial_retries: crate::constants::DIAL_RETRIES,
            dial_backoff_ms: crate::constants::DIAL_BACKOFF_MS,
            send_lock_timeout_ms: crate::constants::SEND_LOCK_TIMEOUT_MS,
            reconnect_attempts: crate::constants::RECONNECT_ATTEMPTS,
            ban_policy: BanPolicy::default(),
        }
    }
}

impl NetworkSection {
    /// Port for a topic, falling back to the fixed topic map.
    pub fn port(&self, topic: Topic) -> Option<u16> {
        self.ports
            .get(&topic.to_string())
            .copied()
            .or_else(|| topic.default_port())
    }

    /// Socket address this node listens on for a topic.
    pub fn listen_addr(&self, topic: Topic) -> Option<SocketAddr> {
        self.port(topic).map(|p| SocketAddr::new(self.listen_host, p))
    }

    pub fn dial_backoff(&self) -> Duration {
        Duration::from_millis(self.dial_backoff_ms)
    }

    pub fn send_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.send_lock_timeout_ms)
    }
}

/// Which key signs when both scheme slots are active.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignKeyChoice {
    #[default]
    Random,
    PreferPrimary,
    PreferSecondary,
}

/// Initial staking entry for the in-memory staking table.
#[derive(Clone, Debug, Deserialize)]
pub struct GenesisStake {
    pub delegated_id: u8,
    pub stake: u64,
    /// Hex-encoded 20-byte operator addresses.
    #[serde(default)]
    pub operators: Vec<String>,
    /// Spendable balance credited to each operator address.
    #[serde(default)]
    pub operator_balance: u64,
}

/// Vote this validator piggybacks on its nonce transactions.
#[derive(Clone, Debug, Deserialize)]
pub struct SchemeVote {
    /// Scheme name, e.g. "Falcon-1024".
    pub scheme: String,
    #[serde(default)]
    pub paused: bool,
}

/// Consensus section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConsensusSection {
    /// Blocks discarded below the first mismatching index on a fork.
    pub rollback_distance: u64,
    pub sign_key_choice: SignKeyChoice,
    pub max_transactions_per_block: usize,
    pub voting_height_distance: u64,
    pub min_staking_for_node: u64,
    pub block_time_interval_secs: u64,
    pub genesis_stakes: Vec<GenesisStake>,
    pub primary_vote: Option<SchemeVote>,
    pub secondary_vote: Option<SchemeVote>,
    /// Price sample contributed to the oracle with each nonce.
    pub price_sample: i64,
}

impl Default for ConsensusSection {
    fn default() -> Self {
        ConsensusSection {
            rollback_distance: crate::constants::ROLLBACK_DISTANCE,
            sign_key_choice: SignKeyChoice::default(),
            max_transactions_per_block: crate::constants::MAX_TRANSACTIONS_PER_BLOCK,
            voting_height_distance: crate::constants::VOTING_HEIGHT_DISTANCE,
            min_staking_for_node: crate::constants::MIN_STAKING_FOR_NODE,
            block_time_interval_secs: crate::constants::BLOCK_TIME_INTERVAL_SECS,
            genesis_stakes: vec![],
            primary_vote: None,
            secondary_vote: None,
            price_sample: 0,
        }
    }
}

/// Transaction pool section, applied to each of the three pools.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub max_transactions: usize,
    pub max_bytes: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        PoolSection {
            max_transactions: crate::constants::MAX_TRANSACTIONS_IN_POOL,
            max_bytes: crate::constants::POOL_MAX_BYTES,
        }
    }
}

impl OkuraConfig {
    /// Load configuration from `okura.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("okura.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<OkuraConfig>(&contents) {
                Ok(mut config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config.node.data_dir = data_dir.display().to_string();
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::with_data_dir(data_dir)
                }
            },
            Err(_) => Self::with_data_dir(data_dir),
        }
    }

    fn with_data_dir(data_dir: &Path) -> Self {
        let mut config = Self::default();
        config.node.data_dir = data_dir.display().to_string();
        config
    }

    /// Whether this node proposes blocks.
    pub fn is_validator(&self) -> bool {
        self.node.delegated_account != 0
    }
}
