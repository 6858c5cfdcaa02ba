//! Per-topic TCP transport.
//!
//! Each topic has one listener, one send loop fed by a bounded queue, and
//! for every connection a read task plus a write task. The read task
//! reassembles frames, applies trust faults, and hands payloads to the node
//! through a single inbound channel.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::NetworkSection;
use crate::network::peers::{ConnectionHandle, PeerAddress, PeerRegistry, TrustOutcome};
use crate::network::protocol::{frame, ControlToken, FrameAssembler, StreamEvent, Topic};

/// Errors from transport operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("peer {0} is banned")]
    Banned(PeerAddress),
    #[error("no port configured for topic {0}")]
    NoPort(Topic),
    #[error("unsupported address {0}")]
    UnsupportedAddress(SocketAddr),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("shutdown")]
    Shutdown,
}

/// A reassembled payload from a peer.
#[derive(Clone, Debug)]
pub struct Inbound {
    pub topic: Topic,
    pub from: PeerAddress,
    pub bytes: Vec<u8>,
}

struct Outbound {
    to: PeerAddress,
    bytes: Vec<u8>,
}

/// Transport tuning, usually taken from [`NetworkSection`].
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub network: NetworkSection,
    pub queue_depth: usize,
}

impl From<NetworkSection> for TransportConfig {
    fn from(network: NetworkSection) -> Self {
        TransportConfig {
            network,
            queue_depth: crate::constants::CONNECTION_QUEUE_DEPTH,
        }
    }
}

/// Handle to the running transport.
pub struct Transport {
    config: TransportConfig,
    registry: Arc<PeerRegistry>,
    inbound: mpsc::Sender<Inbound>,
    queues: HashMap<Topic, mpsc::Sender<Outbound>>,
    paused: HashMap<Topic, Arc<AtomicBool>>,
    shutdown: CancellationToken,
    next_connection_id: AtomicU64,
    /// Sends abandoned because of lock contention or full peer queues.
    abandoned_sends: AtomicU64,
}

impl Transport {
    /// Start the per-topic send loops. Listeners are opened with [`Transport::listen`].
    pub fn start(
        config: TransportConfig,
        registry: Arc<PeerRegistry>,
        shutdown: CancellationToken,
    ) -> (Arc<Transport>, mpsc::Receiver<Inbound>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_depth * 8);
        let mut queues = HashMap::new();
        let mut receivers = Vec::new();
        let mut paused = HashMap::new();
        for topic in Topic::ALL {
            let (tx, rx) = mpsc::channel(config.queue_depth);
            queues.insert(topic, tx);
            paused.insert(topic, Arc::new(AtomicBool::new(false)));
            receivers.push((topic, rx));
        }
        let transport = Arc::new(Transport {
            config,
            registry,
            inbound: inbound_tx,
            queues,
            paused,
            shutdown,
            next_connection_id: AtomicU64::new(1),
            abandoned_sends: AtomicU64::new(0),
        });
        for (topic, rx) in receivers {
            tokio::spawn(send_loop(Arc::clone(&transport), topic, rx));
        }
        (transport, inbound_rx)
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn abandoned_sends(&self) -> u64 {
        self.abandoned_sends.load(Ordering::Relaxed)
    }

    /// Bind the topic's configured port and accept connections until shutdown.
    pub async fn listen(self: &Arc<Self>, topic: Topic) -> Result<SocketAddr, TransportError> {
        let addr = self
            .config
            .network
            .listen_addr(topic)
            .ok_or(TransportError::NoPort(topic))?;
        self.listen_on(topic, addr).await
    }

    /// Bind an explicit address for a topic (port 0 picks a free port).
    pub async fn listen_on(
        self: &Arc<Self>,
        topic: Topic,
        addr: SocketAddr,
    ) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        tracing::info!(topic = %topic, addr = %local_addr, "Listening");
        tokio::spawn(accept_loop(Arc::clone(self), topic, listener));
        Ok(local_addr)
    }

    /// Dial a peer on the topic's configured port.
    pub async fn connect(
        self: &Arc<Self>,
        peer: PeerAddress,
        topic: Topic,
    ) -> Result<(), TransportError> {
        let port = self
            .config
            .network
            .port(topic)
            .ok_or(TransportError::NoPort(topic))?;
        self.connect_addr(topic, SocketAddr::new(peer.ip().into(), port))
            .await
    }

    /// Dial an explicit address with bounded retries.
    ///
    /// Each failed attempt costs one point of trust; the peer is banned once
    /// its trust is exhausted.
    pub async fn connect_addr(
        self: &Arc<Self>,
        topic: Topic,
        addr: SocketAddr,
    ) -> Result<(), TransportError> {
        let peer =
            PeerAddress::from_socket_addr(&addr).ok_or(TransportError::UnsupportedAddress(addr))?;
        if self.registry.is_banned(peer, topic).await {
            return Err(TransportError::Banned(peer));
        }
        if self.registry.has_connection(topic, peer).await {
            return Ok(());
        }
        self.registry.register_valid(peer).await;

        let retries = self.config.network.dial_retries.max(1);
        let mut last_err = String::new();
        for attempt in 1..=retries {
            if self.shutdown.is_cancelled() {
                return Err(TransportError::Shutdown);
            }
            match self.dial(addr).await {
                Ok(stream) => {
                    tracing::debug!(peer = %peer, topic = %topic, attempt, "Connected");
                    self.spawn_connection(topic, peer, stream, Some(addr)).await;
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, topic = %topic, attempt, error = %e, "Dial failed");
                    last_err = e.to_string();
                    if self.registry.fault(peer, "dial failed").await == TrustOutcome::Exhausted {
                        return Err(TransportError::Banned(peer));
                    }
                    if attempt < retries {
                        tokio::time::sleep(self.config.network.dial_backoff()).await;
                    }
                }
            }
        }
        Err(TransportError::ConnectionFailed(last_err))
    }

    /// Connect from our listen host so the remote side sees our identity.
    async fn dial(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        let host = self.config.network.listen_host;
        if !host.is_unspecified() && host.is_ipv4() == addr.is_ipv4() {
            socket.bind(SocketAddr::new(host, 0))?;
        }
        socket.connect(addr).await
    }

    /// Queue bytes for a peer, or for every peer on the topic via the wildcard.
    ///
    /// Messages addressed to our own IP are looped back into the inbound
    /// channel without touching the network.
    pub async fn send(&self, topic: Topic, to: PeerAddress, bytes: Vec<u8>) -> Result<(), TransportError> {
        if to == self.registry.my_ip() {
            return self
                .inbound
                .send(Inbound {
                    topic,
                    from: to,
                    bytes,
                })
                .await
                .map_err(|_| TransportError::Shutdown);
        }
        let queue = self.queues.get(&topic).ok_or(TransportError::NoPort(topic))?;
        queue
            .send(Outbound { to, bytes })
            .await
            .map_err(|_| TransportError::Shutdown)
    }

    /// Write a control token directly to one connection.
    pub async fn send_control(
        &self,
        topic: Topic,
        to: PeerAddress,
        token: ControlToken,
    ) -> Result<(), TransportError> {
        let targets = self
            .registry
            .send_targets(topic, to, self.config.network.send_lock_timeout())
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        for (_, handle) in targets {
            handle
                .frames
                .send(token.as_bytes().to_vec())
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn spawn_connection(
        self: &Arc<Self>,
        topic: Topic,
        peer: PeerAddress,
        stream: TcpStream,
        redial: Option<SocketAddr>,
    ) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (frames_tx, frames_rx) = mpsc::channel::<Vec<u8>>(self.config.queue_depth);
        let cancel = self.shutdown.child_token();
        self.registry
            .add_connection(
                topic,
                peer,
                ConnectionHandle {
                    id,
                    frames: frames_tx,
                    cancel: cancel.clone(),
                    initiated: redial.is_some(),
                },
            )
            .await;

        let (reader, writer) = stream.into_split();
        tokio::spawn(write_task(
            Arc::clone(self),
            topic,
            peer,
            id,
            writer,
            frames_rx,
            cancel.clone(),
        ));
        tokio::spawn(read_task(
            Arc::clone(self),
            topic,
            peer,
            id,
            reader,
            cancel,
            redial,
        ));
    }
}

async fn accept_loop(transport: Arc<Transport>, topic: Topic, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = transport.shutdown.cancelled() => break,
            res = listener.accept() => res,
        };
        let (stream, addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let Some(peer) = PeerAddress::from_socket_addr(&addr) else {
            continue;
        };
        if transport.registry.is_banned(peer, topic).await {
            tracing::debug!(peer = %peer, topic = %topic, "Rejected banned peer");
            continue;
        }
        transport.registry.register_valid(peer).await;
        transport.spawn_connection(topic, peer, stream, None).await;
    }
}

async fn write_task(
    transport: Arc<Transport>,
    topic: Topic,
    peer: PeerAddress,
    id: u64,
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => break,
            next = frames.recv() => match next {
                Some(bytes) => bytes,
                None => break,
            },
        };
        let is_control = ControlToken::ALL.iter().any(|t| t.as_bytes() == bytes.as_slice());
        let wire = if is_control { bytes } else { frame(&bytes) };
        if let Err(e) = writer.write_all(&wire).await {
            tracing::debug!(peer = %peer, topic = %topic, error = %e, "Write failed, closing");
            transport.registry.remove_connection(topic, peer, id).await;
            break;
        }
    }
    if !transport.shutdown.is_cancelled() {
        let _ = writer.write_all(ControlToken::Close.as_bytes()).await;
    }
    let _ = writer.shutdown().await;
}

async fn read_task(
    transport: Arc<Transport>,
    topic: Topic,
    peer: PeerAddress,
    id: u64,
    mut reader: OwnedReadHalf,
    cancel: CancellationToken,
    redial: Option<SocketAddr>,
) {
    let mut assembler = FrameAssembler::new(transport.config.network.max_message_bytes);
    let mut chunk = vec![0u8; crate::constants::RECEIVE_CHUNK_BYTES];
    let mut read_error = false;

    'read: loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            res = reader.read(&mut chunk) => match res {
                Ok(0) => {
                    read_error = true;
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(peer = %peer, topic = %topic, error = %e, "Read failed");
                    read_error = true;
                    break;
                }
            },
        };
        for event in assembler.push(&chunk[..n]) {
            match event {
                StreamEvent::Frame(bytes) => {
                    let msg = Inbound {
                        topic,
                        from: peer,
                        bytes,
                    };
                    if transport.inbound.send(msg).await.is_err() {
                        break 'read;
                    }
                }
                StreamEvent::Oversized => {
                    if transport.registry.fault(peer, "oversized message").await
                        == TrustOutcome::Exhausted
                    {
                        break 'read;
                    }
                }
                StreamEvent::BadMagic => {
                    if transport.registry.fault(peer, "bad magic").await == TrustOutcome::Exhausted {
                        break 'read;
                    }
                }
                StreamEvent::Control(ControlToken::Wait) => {
                    if let Some(flag) = transport.paused.get(&topic) {
                        flag.store(true, Ordering::Relaxed);
                    }
                }
                StreamEvent::Control(token) => {
                    tracing::debug!(peer = %peer, topic = %topic, ?token, "Peer closed connection");
                    break 'read;
                }
            }
        }
    }

    let still_current = transport.registry.remove_connection(topic, peer, id).await;
    if let Some(addr) = redial {
        if read_error && still_current && !transport.shutdown.is_cancelled() {
            tokio::spawn(reconnect(transport, topic, peer, addr));
        }
    }
}

/// Bounded reconnection for a dialed connection that dropped.
///
/// Returns a boxed future because it re-enters [`Transport::spawn_connection`],
/// which spawns the read task that calls back here.
fn reconnect(
    transport: Arc<Transport>,
    topic: Topic,
    peer: PeerAddress,
    addr: SocketAddr,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        for attempt in 1..=transport.config.network.reconnect_attempts {
            tokio::time::sleep(transport.config.network.dial_backoff()).await;
            if transport.shutdown.is_cancelled() || transport.registry.is_banned(peer, topic).await {
                return;
            }
            match transport.dial(addr).await {
                Ok(stream) => {
                    tracing::debug!(peer = %peer, topic = %topic, attempt, "Reconnected");
                    transport.spawn_connection(topic, peer, stream, Some(addr)).await;
                    return;
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, topic = %topic, attempt, error = %e, "Reconnect failed");
                }
            }
        }
        tracing::info!(peer = %peer, topic = %topic, "Giving up on peer");
        transport.registry.close_and_remove(peer).await;
    })
}

async fn send_loop(transport: Arc<Transport>, topic: Topic, mut queue: mpsc::Receiver<Outbound>) {
    let wait = transport.config.network.send_lock_timeout();
    loop {
        let out = tokio::select! {
            _ = transport.shutdown.cancelled() => break,
            next = queue.recv() => match next {
                Some(out) => out,
                None => break,
            },
        };
        if let Some(flag) = transport.paused.get(&topic) {
            if flag.swap(false, Ordering::Relaxed) {
                tokio::time::sleep(wait).await;
            }
        }
        let targets = match transport.registry.send_targets(topic, out.to, wait).await {
            Ok(t) => t,
            Err(_) => {
                transport.abandoned_sends.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(topic = %topic, to = %out.to, "Registry busy, send abandoned");
                continue;
            }
        };
        for (peer, handle) in targets {
            if handle.cancel.is_cancelled() {
                continue;
            }
            match handle.frames.try_send(out.bytes.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    transport.abandoned_sends.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(peer = %peer, topic = %topic, "Peer queue full, send abandoned");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    transport.registry.remove_connection(topic, peer, handle.id).await;
                }
            }
        }
    }
}
