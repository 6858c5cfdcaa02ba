//! Peer registry: trust budgets, bans and the per-topic connection index.
//!
//! All connection and trust state lives behind one registry-wide lock.
//! Mutations take the write half; lookups on the send path take the read
//! half with a short timeout so one slow holder cannot stall a topic.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::BanPolicy;
use crate::network::protocol::Topic;

/// Four-byte network identity of a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress(pub [u8; 4]);

impl PeerAddress {
    /// Broadcast target: every connection on a topic except ourselves.
    pub const WILDCARD: PeerAddress = PeerAddress([0, 0, 0, 0]);

    pub fn from_socket_addr(addr: &SocketAddr) -> Option<PeerAddress> {
        match addr.ip() {
            IpAddr::V4(v4) => Some(PeerAddress(v4.octets())),
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(|v4| PeerAddress(v4.octets())),
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.0)
    }

    pub fn is_wildcard(&self) -> bool {
        *self == PeerAddress::WILDCARD
    }
}

impl From<Ipv4Addr> for PeerAddress {
    fn from(ip: Ipv4Addr) -> Self {
        PeerAddress(ip.octets())
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.ip())
    }
}

/// A ban entry key. `topic: None` bans the address on every topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BanKey {
    pub topic: Option<Topic>,
    pub address: PeerAddress,
}

/// Point in time against which ban expiries are evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainClock {
    pub height: u64,
    pub timestamp: u64,
}

/// Result of a trust decrement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrustOutcome {
    /// Own and wildcard addresses are exempt.
    Exempt,
    /// The peer has no trust entry.
    Unknown,
    Remaining(i32),
    /// Trust hit zero and the entry was removed.
    Exhausted,
}

/// Sending half of one live connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    /// Distinguishes a connection from its replacement.
    pub id: u64,
    pub frames: mpsc::Sender<Vec<u8>>,
    pub cancel: CancellationToken,
    /// True when this node dialed the connection.
    pub initiated: bool,
}

/// Registry timeout on the send path.
#[derive(Debug, thiserror::Error)]
#[error("peer registry busy")]
pub struct RegistryBusy;

#[derive(Default)]
struct RegistryInner {
    trust: HashMap<PeerAddress, i32>,
    nodes: HashMap<PeerAddress, i32>,
    bans: HashMap<BanKey, u64>,
    connections: HashMap<Topic, HashMap<PeerAddress, ConnectionHandle>>,
}

impl RegistryInner {
    fn ban_active(&self, key: &BanKey, policy: BanPolicy, clock: ChainClock) -> bool {
        match self.bans.get(key) {
            Some(&expiry) => match policy {
                BanPolicy::WallClock { .. } => clock.timestamp < expiry,
                BanPolicy::Height { .. } => clock.height < expiry,
            },
            None => false,
        }
    }

    fn remove_everywhere(&mut self, address: PeerAddress) -> usize {
        let mut closed = 0;
        for conns in self.connections.values_mut() {
            if let Some(handle) = conns.remove(&address) {
                handle.cancel.cancel();
                closed += 1;
            }
        }
        closed
    }
}

/// Trust store, ban list and connection index for all topics.
pub struct PeerRegistry {
    my_ip: PeerAddress,
    trust_budget: i32,
    policy: BanPolicy,
    chain_height: AtomicU64,
    inner: RwLock<RegistryInner>,
}

impl PeerRegistry {
    pub fn new(my_ip: PeerAddress, trust_budget: i32, policy: BanPolicy) -> Self {
        PeerRegistry {
            my_ip,
            trust_budget,
            policy,
            chain_height: AtomicU64::new(0),
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    pub fn my_ip(&self) -> PeerAddress {
        self.my_ip
    }

    fn exempt(&self, address: PeerAddress) -> bool {
        address == self.my_ip || address.is_wildcard()
    }

    /// Feed the ledger height used by height-based ban expiry.
    pub fn set_chain_height(&self, height: u64) {
        self.chain_height.store(height, Ordering::Relaxed);
    }

    pub fn clock(&self) -> ChainClock {
        ChainClock {
            height: self.chain_height.load(Ordering::Relaxed),
            timestamp: crate::unix_time_secs(),
        }
    }

    // ── Trust ──

    /// Grant the trust budget on first valid contact. Returns current trust.
    pub async fn register_valid(&self, address: PeerAddress) -> i32 {
        let mut inner = self.inner.write().await;
        *inner.trust.entry(address).or_insert(self.trust_budget)
    }

    /// Mark a confirmed validator.
    pub async fn register_node(&self, address: PeerAddress) {
        let mut inner = self.inner.write().await;
        inner.nodes.entry(address).or_insert(self.trust_budget);
    }

    /// Restore one point of trust after a well-formed message, up to the budget.
    pub async fn reward(&self, address: PeerAddress) {
        let mut inner = self.inner.write().await;
        if let Some(t) = inner.trust.get_mut(&address) {
            *t = (*t + 1).min(self.trust_budget);
        }
    }

    /// Decrement trust, removing the peer from the trust and node indices at zero.
    pub async fn reduce_trust(&self, address: PeerAddress) -> TrustOutcome {
        if self.exempt(address) {
            return TrustOutcome::Exempt;
        }
        let mut inner = self.inner.write().await;
        let Some(t) = inner.trust.get_mut(&address) else {
            return TrustOutcome::Unknown;
        };
        *t -= 1;
        if *t > 0 {
            return TrustOutcome::Remaining(*t);
        }
        inner.trust.remove(&address);
        inner.nodes.remove(&address);
        TrustOutcome::Exhausted
    }

    pub async fn trust(&self, address: PeerAddress) -> Option<i32> {
        self.inner.read().await.trust.get(&address).copied()
    }

    pub async fn is_node(&self, address: PeerAddress) -> bool {
        self.inner.read().await.nodes.contains_key(&address)
    }

    pub async fn node_peers(&self) -> Vec<PeerAddress> {
        self.inner.read().await.nodes.keys().copied().collect()
    }

    // ── Bans ──

    /// Ban an address on one topic, or on all topics when `topic` is `None`.
    ///
    /// Matching connections are force-closed and the peer leaves the trust
    /// and node indices. Returns false for exempt addresses.
    pub async fn ban(&self, address: PeerAddress, topic: Option<Topic>) -> bool {
        if self.exempt(address) {
            return false;
        }
        let clock = self.clock();
        let expiry = match self.policy {
            BanPolicy::WallClock { seconds } => clock.timestamp.saturating_add(seconds),
            BanPolicy::Height { blocks } => clock.height.saturating_add(blocks),
        };
        let mut inner = self.inner.write().await;
        let policy = self.policy;
        inner
            .bans
            .retain(|_, exp| match policy {
                BanPolicy::WallClock { .. } => clock.timestamp < *exp,
                BanPolicy::Height { .. } => clock.height < *exp,
            });
        inner.bans.insert(BanKey { topic, address }, expiry);
        inner.trust.remove(&address);
        inner.nodes.remove(&address);
        let closed = match topic {
            None => inner.remove_everywhere(address),
            Some(t) => inner
                .connections
                .get_mut(&t)
                .and_then(|conns| conns.remove(&address))
                .map(|h| {
                    h.cancel.cancel();
                    1
                })
                .unwrap_or(0),
        };
        tracing::info!(
            peer = %address,
            topic = ?topic.map(|t| t.to_string()),
            closed,
            "Banned peer"
        );
        true
    }

    pub async fn is_banned(&self, address: PeerAddress, topic: Topic) -> bool {
        self.is_banned_at(address, topic, self.clock()).await
    }

    pub async fn is_banned_at(&self, address: PeerAddress, topic: Topic, clock: ChainClock) -> bool {
        if self.exempt(address) {
            return false;
        }
        let inner = self.inner.read().await;
        inner.ban_active(&BanKey { topic: None, address }, self.policy, clock)
            || inner.ban_active(
                &BanKey {
                    topic: Some(topic),
                    address,
                },
                self.policy,
                clock,
            )
    }

    /// Ban on zero trust; shared by every fault path.
    pub async fn fault(&self, address: PeerAddress, reason: &str) -> TrustOutcome {
        let outcome = self.reduce_trust(address).await;
        tracing::debug!(peer = %address, reason, ?outcome, "Peer fault");
        if outcome == TrustOutcome::Exhausted {
            self.ban(address, None).await;
        }
        outcome
    }

    // ── Connections ──

    /// Register a connection, replacing (and cancelling) any previous one.
    pub async fn add_connection(&self, topic: Topic, address: PeerAddress, handle: ConnectionHandle) {
        let mut inner = self.inner.write().await;
        if let Some(old) = inner.connections.entry(topic).or_default().insert(address, handle) {
            old.cancel.cancel();
        }
    }

    /// Remove a connection if it is still the one identified by `id`.
    pub async fn remove_connection(&self, topic: Topic, address: PeerAddress, id: u64) -> bool {
        let mut inner = self.inner.write().await;
        let Some(conns) = inner.connections.get_mut(&topic) else {
            return false;
        };
        if conns.get(&address).map(|h| h.id) == Some(id) {
            if let Some(h) = conns.remove(&address) {
                h.cancel.cancel();
            }
            return true;
        }
        false
    }

    /// Close every connection of an address on every topic.
    pub async fn close_and_remove(&self, address: PeerAddress) -> usize {
        self.inner.write().await.remove_everywhere(address)
    }

    pub async fn has_connection(&self, topic: Topic, address: PeerAddress) -> bool {
        self.inner
            .read()
            .await
            .connections
            .get(&topic)
            .is_some_and(|c| c.contains_key(&address))
    }

    pub async fn connected(&self, topic: Topic) -> Vec<PeerAddress> {
        self.inner
            .read()
            .await
            .connections
            .get(&topic)
            .map(|c| c.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Distinct addresses with at least one open connection.
    pub async fn peer_count(&self) -> usize {
        let inner = self.inner.read().await;
        let mut all: Vec<PeerAddress> = inner
            .connections
            .values()
            .flat_map(|c| c.keys().copied())
            .filter(|a| *a != self.my_ip)
            .collect();
        all.sort();
        all.dedup();
        all.len()
    }

    /// Resolve send targets under a bounded wait for the read lock.
    ///
    /// The wildcard resolves to every connection on the topic except our own
    /// and except peers without remaining trust.
    pub async fn send_targets(
        &self,
        topic: Topic,
        to: PeerAddress,
        wait: Duration,
    ) -> Result<Vec<(PeerAddress, ConnectionHandle)>, RegistryBusy> {
        let inner = tokio::time::timeout(wait, self.inner.read())
            .await
            .map_err(|_| RegistryBusy)?;
        let Some(conns) = inner.connections.get(&topic) else {
            return Ok(vec![]);
        };
        if to.is_wildcard() {
            Ok(conns
                .iter()
                .filter(|(a, _)| **a != self.my_ip)
                .filter(|(a, _)| inner.trust.get(a).is_some_and(|t| *t > 0))
                .map(|(a, h)| (*a, h.clone()))
                .collect())
        } else {
            Ok(conns.get(&to).map(|h| vec![(to, h.clone())]).unwrap_or_default())
        }
    }
}
