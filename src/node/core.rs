//! Node orchestrator tying together the ledger, pools, wallet and transport.
//!
//! The `Node` owns every subsystem and runs the main event loop: inbound
//! payloads are validated by the codec and dispatched by opcode, and three
//! timers drive the height announcement, transaction gossip and, on
//! validators, the nonce round.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::IndexedRandom;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::ledger::{CommitOrigin, Ledger, LedgerError};
use super::mempool::Pools;
use super::storage::{SledStorage, Storage};
use super::wallet::NodeWallet;
use super::NodeError;
use crate::chain::accounts::InMemoryAccounts;
use crate::chain::block::Block;
use crate::chain::oracle::OracleBook;
use crate::chain::stats::StatsManager;
use crate::chain::transaction::Transaction;
use crate::config::OkuraConfig;
use crate::consensus::proposal::{Proposer, ProposerSettings};
use crate::consensus::sync::{self, BatchOutcome, HeaderRequest, HeightAnnouncement, SyncMachine};
use crate::consensus::voting::EncryptionVoting;
use crate::crypto::scheme::{LiveSchemes, Slot};
use crate::network::codec::{Codec, ValidatedMessage, WireMessage};
use crate::network::peers::{PeerAddress, PeerRegistry};
use crate::network::protocol::{fields, Opcode, Topic};
use crate::network::transport::{Inbound, Transport, TransportConfig};
use crate::Hash;

/// What became of one inbound payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerOutcome {
    Handled,
    /// The payload was dropped; the reason is for logs only.
    Dropped(String),
}

pub struct Node {
    config: OkuraConfig,
    codec: Codec,
    transport: Arc<Transport>,
    ledger: Arc<Ledger>,
    sync: SyncMachine,
    proposer: Option<Proposer>,
    wallet: Arc<NodeWallet>,
    inbound: Option<mpsc::Receiver<Inbound>>,
}

impl Node {
    /// Open the ledger and wallet under the data directory, bind the peer
    /// service topics and dial the bootstrap peers.
    pub async fn start(config: OkuraConfig, shutdown: CancellationToken) -> Result<Self, NodeError> {
        let data_dir = PathBuf::from(&config.node.data_dir);
        std::fs::create_dir_all(&data_dir)?;

        let storage: Arc<dyn Storage> = Arc::new(SledStorage::open(&data_dir.join("ledger"))?);
        let accounts = Arc::new(InMemoryAccounts::from_genesis(&config.consensus.genesis_stakes)?);
        let ledger = Arc::new(Ledger::open(
            storage,
            accounts,
            Arc::new(StatsManager::new()),
            Arc::new(LiveSchemes::default()),
            Arc::new(EncryptionVoting::new(config.consensus.voting_height_distance)),
            Arc::new(Pools::new(&config.pool)),
            config.consensus.min_staking_for_node,
        )?);
        let wallet = Arc::new(NodeWallet::load_or_generate(&data_dir, ledger.schemes())?);

        let registry = Arc::new(PeerRegistry::new(
            config.node.my_ip.into(),
            config.network.trust_budget,
            config.network.ban_policy,
        ));
        registry.set_chain_height(ledger.height());
        let (transport, inbound) = Transport::start(
            TransportConfig::from(config.network.clone()),
            registry,
            shutdown,
        );
        for topic in Topic::PEER_SERVICES {
            transport.listen(topic).await?;
        }

        let proposer = if config.is_validator() {
            let settings = ProposerSettings::from_config(
                &config.consensus,
                config.node.delegated_account,
                config.node.reward_percentage,
                config.node.chain_id,
            )?;
            tracing::info!(delegated = config.node.delegated_account, "Running as validator");
            Some(Proposer::new(
                Arc::clone(&ledger),
                Arc::new(OracleBook::new()),
                Arc::clone(&wallet),
                settings,
            ))
        } else {
            None
        };

        let node = Node {
            codec: Codec::new(config.node.chain_id, config.network.max_message_bytes),
            sync: SyncMachine::new(Arc::clone(&ledger), config.consensus.rollback_distance),
            config,
            transport,
            ledger,
            proposer,
            wallet,
            inbound: Some(inbound),
        };
        node.dial_bootstrap().await;
        tracing::info!(height = node.ledger.height(), my_ip = %node.registry().my_ip(), "Node started");
        Ok(node)
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        self.transport.registry()
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn wallet(&self) -> &Arc<NodeWallet> {
        &self.wallet
    }

    pub fn sync_machine(&self) -> &SyncMachine {
        &self.sync
    }

    async fn dial_bootstrap(&self) {
        for ip in &self.config.node.bootstrap_peers {
            let peer = PeerAddress::from(*ip);
            self.registry().register_node(peer).await;
            self.dial(peer).await;
        }
    }

    /// Connect to a peer on every peer service topic.
    async fn dial(&self, peer: PeerAddress) {
        for topic in Topic::PEER_SERVICES {
            if let Err(e) = self.transport.connect(peer, topic).await {
                tracing::warn!(peer = %peer, topic = %topic, error = %e, "Failed to dial peer");
            }
        }
    }

    /// Run the main event loop until `shutdown` fires.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let Some(mut inbound) = self.inbound.take() else {
            tracing::error!("Node event loop already ran");
            return;
        };
        let mut announce_interval =
            tokio::time::interval(Duration::from_millis(crate::constants::ANNOUNCE_INTERVAL_MS));
        let mut gossip_interval =
            tokio::time::interval(Duration::from_millis(crate::constants::GOSSIP_INTERVAL_MS));
        let mut nonce_interval = tokio::time::interval(Duration::from_secs(
            self.config.consensus.block_time_interval_secs.max(1),
        ));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown signal received");
                    self.shutdown();
                    break;
                }
                Some(msg) = inbound.recv() => {
                    let outcome = self.on_message(msg.topic, msg.from, &msg.bytes).await;
                    if let HandlerOutcome::Dropped(reason) = outcome {
                        tracing::debug!(peer = %msg.from, topic = %msg.topic, reason = %reason, "Dropped message");
                    }
                }
                _ = announce_interval.tick() => {
                    self.announce_height().await;
                }
                _ = gossip_interval.tick() => {
                    self.gossip_pool().await;
                }
                _ = nonce_interval.tick() => {
                    self.send_nonce().await;
                }
            }
        }
    }

    fn shutdown(&self) {
        if let Err(e) = self.ledger.storage().flush() {
            tracing::error!(error = %e, "Failed to flush storage on shutdown");
        }
        tracing::info!("Node shutdown complete");
    }

    // ── Periodic loops ──

    /// Broadcast our tip on the sync topic with one random validator peer.
    pub async fn announce_height(&self) {
        self.registry().set_chain_height(self.ledger.height());
        let nodes = self.registry().node_peers().await;
        let peers = nodes.choose(&mut rand::rng()).copied().into_iter().collect();
        let msg = self.sync.announcement(peers).to_message(&self.codec);
        self.broadcast(Topic::SYNC, &msg).await;
    }

    /// Spread pending pool transactions, unless a sync batch is committing.
    pub async fn gossip_pool(&self) {
        if self.ledger.is_syncing() {
            return;
        }
        let height = self.ledger.height();
        let pools = self.ledger.pools();
        let pruned = pools.prune_expired(height).await;
        if pruned > 0 {
            let stats = pools.stats().await;
            tracing::debug!(
                count = pruned,
                pending = stats.transaction_count,
                bytes = stats.total_bytes,
                banned = stats.banned,
                "Pruned expired pool transactions"
            );
        }
        let txs = pools
            .peek(self.config.consensus.max_transactions_per_block, height + 1)
            .await;
        if txs.is_empty() {
            return;
        }
        match self.transactions_message(&txs) {
            Ok(msg) => self.broadcast(Topic::TRANSACTION, &msg).await,
            Err(e) => tracing::warn!(error = %e, "Failed to encode pool gossip"),
        }
    }

    /// Validators open the next round: the nonce goes to peers on the nonce
    /// topic and back to ourselves on the self-nonce topic.
    pub async fn send_nonce(&self) {
        let Some(proposer) = &self.proposer else {
            return;
        };
        if self.ledger.is_syncing() {
            return;
        }
        let nonce = match proposer.build_nonce() {
            Ok(nonce) => nonce,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build nonce");
                return;
            }
        };
        let bytes = match nonce.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode nonce");
                return;
            }
        };
        let msg = self
            .codec
            .message(Opcode::Nonce)
            .with(fields::NONCE_TX, vec![bytes]);
        tracing::debug!(height = nonce.body.height, "Sending nonce");
        self.broadcast(Topic::NONCE, &msg).await;
        self.send_to(Topic::SELF_NONCE, self.registry().my_ip(), &msg).await;
    }

    // ── Dispatch ──

    /// Validate one inbound payload and run it through its protocol.
    ///
    /// Undecodable payloads cost the peer trust, and on the nonce topic an
    /// immediate ban. Handler failures are logged and dropped.
    pub async fn on_message(&self, topic: Topic, from: PeerAddress, bytes: &[u8]) -> HandlerOutcome {
        let registry = self.registry();
        if registry.is_banned(from, topic).await {
            return HandlerOutcome::Dropped(format!("{from} is banned"));
        }
        let valid = match self
            .codec
            .check_valid_message(bytes, topic, self.ledger.schemes())
        {
            Ok(valid) => valid,
            Err(e) => {
                if topic == Topic::NONCE {
                    registry.ban(from, Some(Topic::NONCE)).await;
                } else {
                    registry.fault(from, "undecodable message").await;
                }
                return HandlerOutcome::Dropped(e.to_string());
            }
        };
        registry.reward(from).await;
        if valid.dropped > 0 {
            tracing::debug!(peer = %from, dropped = valid.dropped, "Dropped invalid transactions");
        }

        let head = valid.message.head;
        match self.dispatch(topic, from, valid).await {
            Ok(()) => HandlerOutcome::Handled,
            Err(e) => {
                if e.is_peer_fault() {
                    registry.fault(from, "invalid protocol message").await;
                }
                tracing::debug!(peer = %from, opcode = %head, error = %e, "Handler failed");
                HandlerOutcome::Dropped(e.to_string())
            }
        }
    }

    async fn dispatch(&self, topic: Topic, from: PeerAddress, valid: ValidatedMessage) -> Result<(), NodeError> {
        let head = valid.message.head;
        let served = match head {
            Opcode::Nonce => matches!(topic, Topic::NONCE | Topic::SELF_NONCE),
            Opcode::Block | Opcode::HeightAnnounce | Opcode::GetHeaders | Opcode::SendHeaders => {
                topic == Topic::SYNC
            }
            Opcode::TxGossip | Opcode::GetTxFromPool | Opcode::GetTxFromLedger => {
                topic == Topic::TRANSACTION
            }
        };
        if !served {
            return Err(NodeError::WrongTopic { opcode: head, topic });
        }
        match head {
            Opcode::Nonce => self.handle_nonce(from, valid).await,
            Opcode::Block => self.handle_block(from, &valid.message).await,
            Opcode::HeightAnnounce => self.handle_announcement(from, &valid.message).await,
            Opcode::GetHeaders => self.handle_get_headers(from, &valid.message).await,
            Opcode::SendHeaders => self.handle_headers(from, &valid.message).await,
            Opcode::TxGossip => self.handle_tx_gossip(valid).await,
            Opcode::GetTxFromPool => self.handle_tx_request(from, &valid.message, false).await,
            Opcode::GetTxFromLedger => self.handle_tx_request(from, &valid.message, true).await,
        }
    }

    // ── Nonce round ──

    async fn handle_nonce(&self, from: PeerAddress, valid: ValidatedMessage) -> Result<(), NodeError> {
        let Some(proposer) = &self.proposer else {
            return Ok(());
        };
        let nonce = valid
            .transactions
            .get(&fields::NONCE_TX)
            .and_then(|txs| txs.first())
            .ok_or(NodeError::Malformed("nonce message without nonce"))?;
        let block = proposer.on_nonce(nonce).await?;
        let me = self.registry().my_ip();
        if from != me {
            self.registry().register_node(from).await;
        }

        let msg = self
            .codec
            .message(Opcode::Block)
            .with(fields::BLOCK, vec![block.to_bytes()?]);
        tracing::info!(height = block.height(), txs = block.tx_hashes.len(), "Proposed block");
        self.broadcast(Topic::SYNC, &msg).await;
        // Our own block competes like any received one: first valid wins.
        self.handle_block(me, &msg).await
    }

    async fn handle_block(&self, from: PeerAddress, msg: &WireMessage) -> Result<(), NodeError> {
        let bytes = msg
            .first(fields::BLOCK)
            .ok_or(NodeError::Malformed("block message without block"))?;
        let block = Block::from_bytes(bytes)?;
        let expected = self.ledger.height() + 1;
        if block.height() != expected {
            tracing::trace!(height = block.height(), expected, "Ignoring block off our tip");
            return Ok(());
        }
        block.check_base(&self.ledger.last_block())?;
        self.ledger.check_operator(&block)?;

        let missing = self.ledger.missing_transactions(&block).await?;
        if !missing.is_empty() {
            tracing::debug!(height = expected, count = missing.len(), "Block needs pool transactions");
            return self
                .request_transactions(from, Opcode::GetTxFromPool, &missing)
                .await;
        }

        let guard = self.ledger.lock().await;
        match self
            .ledger
            .commit_block(&guard, &block, CommitOrigin::Proposal)
            .await
        {
            Ok(report) => {
                drop(guard);
                self.after_commit(&report.changed_slots);
                Ok(())
            }
            // Another validator's block for this height won the race.
            Err(LedgerError::Block(_)) if self.ledger.height() >= expected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Generate fresh wallet keys for slots whose scheme changed.
    fn after_commit(&self, changed: &[Slot]) {
        self.registry().set_chain_height(self.ledger.height());
        for slot in changed {
            self.align_wallet(*slot);
        }
    }

    fn align_wallet(&self, slot: Slot) {
        let kind = match self.ledger.schemes().kind(slot) {
            Ok(kind) => kind,
            Err(e) => {
                tracing::warn!(slot = %slot, error = %e, "Live scheme unusable for the wallet");
                return;
            }
        };
        if let Err(e) = self.wallet.rotate(slot, kind) {
            tracing::error!(slot = %slot, error = %e, "Failed to rotate wallet key");
        }
    }

    // ── Sync ──

    async fn handle_announcement(&self, from: PeerAddress, msg: &WireMessage) -> Result<(), NodeError> {
        let announcement = HeightAnnouncement::from_message(msg)?;
        self.exchange_peers(&announcement.peers).await;
        if let Some(request) = self.sync.on_announcement(&announcement) {
            tracing::debug!(peer = %from, begin = request.begin, end = request.end, "Requesting headers");
            self.send_to(Topic::SYNC, from, &request.to_message(&self.codec))
                .await;
        }
        Ok(())
    }

    /// Dial suggested peers while we are below the connection target.
    async fn exchange_peers(&self, suggested: &[PeerAddress]) {
        let registry = self.registry();
        for peer in suggested {
            if registry.peer_count().await >= self.config.network.max_peers_connected {
                return;
            }
            if peer.is_wildcard() || *peer == registry.my_ip() {
                continue;
            }
            if registry.is_banned(*peer, Topic::SYNC).await
                || registry.connected(Topic::SYNC).await.contains(peer)
            {
                continue;
            }
            tracing::info!(peer = %peer, "Dialing suggested peer");
            registry.register_node(*peer).await;
            self.dial(*peer).await;
        }
    }

    async fn handle_get_headers(&self, from: PeerAddress, msg: &WireMessage) -> Result<(), NodeError> {
        let request = HeaderRequest::from_message(msg)?;
        let batch = self.sync.serve_headers(request)?;
        if batch.is_empty() {
            return Ok(());
        }
        let reply = sync::headers_message(&self.codec, &batch)?;
        self.send_to(Topic::SYNC, from, &reply).await;
        Ok(())
    }

    async fn handle_headers(&self, from: PeerAddress, msg: &WireMessage) -> Result<(), NodeError> {
        let batch = sync::parse_headers(msg)?;
        match self.sync.on_headers(batch).await? {
            BatchOutcome::Ignored(reason) => {
                tracing::trace!(peer = %from, reason, "Header batch ignored");
            }
            BatchOutcome::MissingTransactions(hashes) => {
                self.request_transactions(from, Opcode::GetTxFromLedger, &hashes)
                    .await?;
            }
            BatchOutcome::Forked { at, rolled_back_to } => {
                tracing::warn!(peer = %from, at, rolled_back_to, "Rolled back fork");
                self.registry().set_chain_height(self.ledger.height());
                for slot in Slot::BOTH {
                    self.align_wallet(slot);
                }
            }
            BatchOutcome::Committed(reports) => {
                for report in &reports {
                    self.after_commit(&report.changed_slots);
                }
            }
        }
        Ok(())
    }

    // ── Transactions ──

    async fn handle_tx_gossip(&self, valid: ValidatedMessage) -> Result<(), NodeError> {
        let pools = self.ledger.pools();
        let storage = self.ledger.storage();
        let mut fresh = Vec::new();
        for tx in valid.transactions.into_values().flatten() {
            if pools.exists(&tx.hash).await || storage.has_transaction(&tx.hash)? {
                continue;
            }
            if pools.add(tx.clone()).await {
                fresh.push(tx);
            }
        }
        if fresh.is_empty() || self.ledger.is_syncing() {
            return Ok(());
        }
        tracing::debug!(count = fresh.len(), "Spreading new transactions");
        let msg = self.transactions_message(&fresh)?;
        self.broadcast(Topic::TRANSACTION, &msg).await;
        Ok(())
    }

    /// Answer `st` from the pools, or `bt` from the ledger store with the
    /// pools as fallback.
    async fn handle_tx_request(
        &self,
        from: PeerAddress,
        msg: &WireMessage,
        from_ledger: bool,
    ) -> Result<(), NodeError> {
        let pools = self.ledger.pools();
        let mut found = Vec::new();
        for blob in msg.blobs(fields::POOL_STANDARD) {
            let hash: Hash = blob
                .as_slice()
                .try_into()
                .map_err(|_| NodeError::Malformed("transaction hash length"))?;
            let tx = if from_ledger {
                match self.ledger.storage().get_transaction(&hash)? {
                    Some(tx) => Some(tx),
                    None => pools.find(&hash).await,
                }
            } else {
                pools.find(&hash).await
            };
            found.extend(tx);
        }
        if found.is_empty() {
            return Ok(());
        }
        let reply = self.transactions_message(&found)?;
        self.send_to(Topic::TRANSACTION, from, &reply).await;
        Ok(())
    }

    async fn request_transactions(
        &self,
        from: PeerAddress,
        opcode: Opcode,
        hashes: &[Hash],
    ) -> Result<(), NodeError> {
        let msg = self.codec.message(opcode).with(
            fields::POOL_STANDARD,
            hashes.iter().map(|h| h.to_vec()).collect(),
        );
        self.send_to(Topic::TRANSACTION, from, &msg).await;
        Ok(())
    }

    /// A `tx` message with each transaction under its pool's key.
    fn transactions_message(&self, txs: &[Transaction]) -> Result<WireMessage, NodeError> {
        let mut by_pool: BTreeMap<Topic, Vec<Vec<u8>>> = BTreeMap::new();
        for tx in txs {
            by_pool.entry(tx.kind().tag()).or_default().push(tx.to_bytes()?);
        }
        Ok(by_pool
            .into_iter()
            .fold(self.codec.message(Opcode::TxGossip), |msg, (key, blobs)| {
                msg.with(key, blobs)
            }))
    }

    // ── Sending ──

    async fn broadcast(&self, topic: Topic, msg: &WireMessage) {
        self.send_to(topic, PeerAddress::WILDCARD, msg).await;
    }

    async fn send_to(&self, topic: Topic, to: PeerAddress, msg: &WireMessage) {
        let bytes = match self.codec.encode(msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(topic = %topic, opcode = %msg.head, error = %e, "Failed to encode message");
                return;
            }
        };
        if let Err(e) = self.transport.send(topic, to, bytes).await {
            tracing::debug!(topic = %topic, peer = %to, error = %e, "Send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::transaction::tests::transfer;
    use crate::chain::block::tests::child;
    use crate::chain::transaction::Address;
    use crate::config::{GenesisStake, SignKeyChoice};
    use crate::crypto::keys::{SchemeKind, SigningKeypair};

    async fn test_node_with(dir: &std::path::Path, customize: impl FnOnce(&mut OkuraConfig)) -> Node {
        let mut config = OkuraConfig::default();
        config.node.data_dir = dir.display().to_string();
        config.node.my_ip = std::net::Ipv4Addr::LOCALHOST;
        config.network.listen_host = std::net::Ipv4Addr::LOCALHOST.into();
        for port in config.network.ports.values_mut() {
            *port = 0;
        }
        customize(&mut config);
        Node::start(config, CancellationToken::new()).await.unwrap()
    }

    async fn test_node(dir: &std::path::Path) -> Node {
        test_node_with(dir, |_| {}).await
    }

    fn stake_for(operators: &[Address]) -> impl FnOnce(&mut OkuraConfig) + '_ {
        move |config| {
            config.consensus.min_staking_for_node = 10;
            config.consensus.genesis_stakes = vec![GenesisStake {
                delegated_id: 1,
                stake: 1_000,
                operators: operators.iter().map(|a| a.to_string()).collect(),
                operator_balance: 0,
            }];
        }
    }

    /// A node whose genesis lets `kp` sign blocks for delegated account 1.
    async fn staked_node(dir: &std::path::Path, kp: &SigningKeypair) -> Node {
        let operator = [Address::from_public_key(&kp.public)];
        test_node_with(dir, stake_for(&operator)).await
    }

    fn block_bytes(node: &Node, block: &Block) -> Vec<u8> {
        let msg = node
            .codec()
            .message(Opcode::Block)
            .with(fields::BLOCK, vec![block.to_bytes().unwrap()]);
        node.codec().encode(&msg).unwrap()
    }

    fn peer() -> PeerAddress {
        PeerAddress([10, 0, 0, 9])
    }

    #[tokio::test]
    async fn garbage_costs_trust_and_bans_on_nonce_topic() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path()).await;
        node.registry().register_valid(peer()).await;

        let outcome = node.on_message(Topic::TRANSACTION, peer(), b"junk").await;
        assert!(matches!(outcome, HandlerOutcome::Dropped(_)));
        assert_eq!(node.registry().trust(peer()).await, Some(1));

        node.on_message(Topic::NONCE, peer(), b"junk").await;
        assert!(node.registry().is_banned(peer(), Topic::NONCE).await);
        assert!(matches!(
            node.on_message(Topic::NONCE, peer(), b"junk").await,
            HandlerOutcome::Dropped(reason) if reason.contains("banned")
        ));
    }

    #[tokio::test]
    async fn opcode_on_wrong_topic_is_a_fault() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path()).await;
        node.registry().register_valid(peer()).await;
        let msg = node.sync.announcement(vec![]).to_message(node.codec());
        let bytes = node.codec().encode(&msg).unwrap();
        assert!(matches!(
            node.on_message(Topic::TRANSACTION, peer(), &bytes).await,
            HandlerOutcome::Dropped(_)
        ));
        assert_eq!(node.registry().trust(peer()).await, Some(1));
    }

    #[tokio::test]
    async fn gossip_adds_to_pool_once() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path()).await;
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        let tx = transfer(&kp, Address::delegated(2), 5, 0);
        let msg = node.transactions_message(std::slice::from_ref(&tx)).unwrap();
        let bytes = node.codec().encode(&msg).unwrap();

        assert_eq!(
            node.on_message(Topic::TRANSACTION, peer(), &bytes).await,
            HandlerOutcome::Handled
        );
        assert!(node.ledger().pools().exists(&tx.hash).await);
        assert_eq!(node.ledger().pools().counts().await, [1, 0, 0]);
        node.on_message(Topic::TRANSACTION, peer(), &bytes).await;
        assert_eq!(node.ledger().pools().counts().await, [1, 0, 0]);
    }

    #[tokio::test]
    async fn announcement_ahead_of_us_is_answered() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path()).await;
        let ann = HeightAnnouncement {
            height: 40,
            last_hash: [3u8; 32],
            peers: vec![],
        };
        let bytes = node.codec().encode(&ann.to_message(node.codec())).unwrap();
        assert_eq!(
            node.on_message(Topic::SYNC, peer(), &bytes).await,
            HandlerOutcome::Handled
        );
        assert_eq!(
            node.sync_machine().phase(),
            crate::consensus::sync::SyncPhase::RequestingHeaders { begin: 0, end: 32 }
        );
    }

    #[tokio::test]
    async fn block_off_tip_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        let node = staked_node(dir.path(), &kp).await;
        let one = child(&Block::genesis(), &kp, vec![]);
        let two = child(&one, &kp, vec![]);
        assert_eq!(
            node.on_message(Topic::SYNC, peer(), &block_bytes(&node, &two)).await,
            HandlerOutcome::Handled
        );
        assert_eq!(node.ledger().height(), 0);
    }

    #[tokio::test]
    async fn block_from_staked_operator_commits() {
        let dir = tempfile::tempdir().unwrap();
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        let node = staked_node(dir.path(), &kp).await;
        let one = child(&Block::genesis(), &kp, vec![]);
        assert_eq!(
            node.on_message(Topic::SYNC, peer(), &block_bytes(&node, &one)).await,
            HandlerOutcome::Handled
        );
        assert_eq!(node.ledger().height(), 1);
        assert_eq!(node.ledger().last_block(), one);
    }

    #[tokio::test]
    async fn block_from_unknown_operator_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let operator = SigningKeypair::generate(SchemeKind::Falcon512);
        let stranger = SigningKeypair::generate(SchemeKind::Falcon512);
        let node = staked_node(dir.path(), &operator).await;
        node.registry().register_valid(peer()).await;

        let forged = child(&Block::genesis(), &stranger, vec![]);
        let outcome = node.on_message(Topic::SYNC, peer(), &block_bytes(&node, &forged)).await;
        assert!(matches!(outcome, HandlerOutcome::Dropped(reason) if reason.contains("not an operator")));
        assert_eq!(node.ledger().height(), 0);
        assert_eq!(node.registry().trust(peer()).await, Some(1));
    }

    #[tokio::test]
    async fn first_valid_block_at_a_height_wins() {
        let dir = tempfile::tempdir().unwrap();
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        let node = staked_node(dir.path(), &kp).await;
        let first = child(&Block::genesis(), &kp, vec![]);
        let second = child(&Block::genesis(), &kp, vec![]);
        assert_ne!(first.block_hash, second.block_hash);

        node.on_message(Topic::SYNC, peer(), &block_bytes(&node, &first)).await;
        assert_eq!(
            node.on_message(Topic::SYNC, peer(), &block_bytes(&node, &second)).await,
            HandlerOutcome::Handled
        );
        assert_eq!(node.ledger().height(), 1);
        assert_eq!(node.ledger().last_block(), first);
    }

    #[tokio::test]
    async fn own_nonce_commits_through_the_block_path() {
        let dir = tempfile::tempdir().unwrap();
        let wallet = NodeWallet::load_or_generate(dir.path(), &LiveSchemes::default()).unwrap();
        let operators = [wallet.address(Slot::Primary), wallet.address(Slot::Secondary)];
        let node = test_node_with(dir.path(), |config| {
            stake_for(&operators)(config);
            config.node.delegated_account = 1;
            config.consensus.sign_key_choice = SignKeyChoice::PreferPrimary;
        })
        .await;

        let nonce = node.proposer.as_ref().unwrap().build_nonce().unwrap();
        let msg = node
            .codec()
            .message(Opcode::Nonce)
            .with(fields::NONCE_TX, vec![nonce.to_bytes().unwrap()]);
        let bytes = node.codec().encode(&msg).unwrap();
        let me = node.registry().my_ip();
        assert_eq!(
            node.on_message(Topic::SELF_NONCE, me, &bytes).await,
            HandlerOutcome::Handled
        );
        assert_eq!(node.ledger().height(), 1);
        assert_eq!(
            node.ledger().last_block().header.operator,
            wallet.address(Slot::Primary)
        );
    }
}
