//! Peer Synchronizer: connections, handshake, batched chain download and
//! relay of new blocks and transactions
//!
//! Per connection: `Connecting -> Handshaking -> Synced <-> Syncing ->
//! Disconnected`. Everything that touches chain or mempool goes through the
//! [`NodeHandle`], so peer tasks never mutate shared state directly.

use crate::compact::{CompactBlock, PendingBlock, Reconstruction};
use crate::config::NodeConfig;
use crate::block::block_size;
use crate::constants::{MESSAGE_SIZE_FACTOR, PROTOCOL_VERSION, SEEN_BLOCKS_CAPACITY, SEEN_TXS_CAPACITY};
use crate::error::{NodeError, RejectReason, Result};
use crate::network::*;
use crate::node::{unix_now_secs, NodeEvent, NodeHandle};
use crate::storage::Store;
use crate::types::*;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

const OUTBOUND_QUEUE: usize = 256;
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);
/// Addresses sent in one `peers` message
const MAX_SHARED_PEERS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Connecting,
    Handshaking,
    Syncing,
    Synced,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
}

/// Compact relay bandwidth counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Blocks rebuilt entirely from the mempool
    pub reconstructed: u64,
    /// Blocks that needed a `getblocktxn` round trip
    pub round_trips: u64,
    /// Blocks that had to be downloaded in full
    pub full_fallbacks: u64,
}

#[derive(Debug, Default)]
struct RelayCounters {
    reconstructed: AtomicU64,
    round_trips: AtomicU64,
    full_fallbacks: AtomicU64,
}

struct ConnectedPeer {
    addr: SocketAddr,
    node_id: String,
    outbound: mpsc::Sender<Message>,
}

struct Shared {
    config: NodeConfig,
    node_id: String,
    node: NodeHandle,
    store: Option<Store>,
    local_addr: OnceLock<SocketAddr>,
    book: Mutex<PeerBook>,
    peers: RwLock<HashMap<PeerId, ConnectedPeer>>,
    dialing: Mutex<HashSet<SocketAddr>>,
    seen_blocks: Mutex<SeenCache>,
    seen_txs: Mutex<SeenCache>,
    /// Compact blocks waiting for a `blocktxn` reply, with the peer asked
    pending_blocks: Mutex<HashMap<Hash, (PeerId, PendingBlock)>>,
    counters: RelayCounters,
    next_peer_id: AtomicU64,
    shutdown: watch::Receiver<bool>,
}

/// Cloneable handle to the running synchronizer
#[derive(Clone)]
pub struct Synchronizer {
    shared: Arc<Shared>,
}

impl Synchronizer {
    pub fn new(
        config: NodeConfig,
        node: NodeHandle,
        store: Option<Store>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let node_id = hex::encode(rand::random::<[u8; 16]>());
        let book = PeerBook::new(config.max_peers, config.ban_threshold);
        Synchronizer {
            shared: Arc::new(Shared {
                config,
                node_id,
                node,
                store,
                local_addr: OnceLock::new(),
                book: Mutex::new(book),
                peers: RwLock::new(HashMap::new()),
                dialing: Mutex::new(HashSet::new()),
                seen_blocks: Mutex::new(SeenCache::new(SEEN_BLOCKS_CAPACITY)),
                seen_txs: Mutex::new(SeenCache::new(SEEN_TXS_CAPACITY)),
                pending_blocks: Mutex::new(HashMap::new()),
                counters: RelayCounters::default(),
                next_peer_id: AtomicU64::new(1),
                shutdown,
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    /// Bind the listener and start the accept, relay and maintenance
    /// tasks. Bootstrap peers and stored addresses are dialed by the
    /// maintenance task. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.shared.config.listen_addr).await?;
        let local = listener.local_addr()?;
        let _ = self.shared.local_addr.set(local);

        {
            let mut book = self.shared.book.lock().await;
            let stored = self.shared.store.as_ref().map(Store::load_peers).unwrap_or_default();
            for addr in self.shared.config.bootstrap_peers.iter().chain(stored.iter()) {
                if *addr != local {
                    book.add_address(*addr);
                }
            }
        }

        tokio::spawn(accept_loop(self.shared.clone(), listener));
        tokio::spawn(relay_loop(self.shared.clone()));
        tokio::spawn(maintenance_loop(self.shared.clone()));
        info!(addr = %local, node_id = %self.shared.node_id, "synchronizer listening");
        Ok(local)
    }

    /// Dial `addr` now. Resolves once the TCP connection is up; the
    /// handshake continues in the background.
    pub async fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.shared.book.lock().await.add_address(addr);
        dial(self.shared.clone(), addr).await
    }

    pub async fn peer_count(&self) -> usize {
        self.shared.peers.read().await.len()
    }

    pub async fn known_peers(&self) -> Vec<SocketAddr> {
        self.shared.book.lock().await.known_addresses(unix_now_secs())
    }

    pub fn relay_stats(&self) -> RelayStats {
        let counters = &self.shared.counters;
        RelayStats {
            reconstructed: counters.reconstructed.load(Ordering::Relaxed),
            round_trips: counters.round_trips.load(Ordering::Relaxed),
            full_fallbacks: counters.full_fallbacks.load(Ordering::Relaxed),
        }
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    let mut shutdown = shared.shutdown.clone();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    if shared.book.lock().await.is_banned(remote.ip(), unix_now_secs()) {
                        debug!(peer = %remote, "refusing banned peer");
                        continue;
                    }
                    if shared.peers.read().await.len() >= shared.config.max_peers {
                        debug!(peer = %remote, "refusing inbound peer, at capacity");
                        continue;
                    }
                    tokio::spawn(run_connection(shared.clone(), stream, remote, Direction::Inbound));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn dial(shared: Arc<Shared>, addr: SocketAddr) -> Result<()> {
    if !shared.dialing.lock().await.insert(addr) {
        return Ok(());
    }
    let timeout = Duration::from_secs(shared.config.connect_timeout_secs);
    let error = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            // `dialing` is cleared once the handshake settles
            tokio::spawn(run_connection(shared, stream, addr, Direction::Outbound));
            return Ok(());
        }
        Ok(Err(e)) => NodeError::Network(format!("connect to {}: {}", addr, e)),
        Err(_) => NodeError::Timeout(format!("connect to {}", addr)),
    };
    shared.dialing.lock().await.remove(&addr);
    record_failure(&shared, addr, &error).await;
    Err(error)
}

async fn record_failure(shared: &Shared, addr: SocketAddr, error: &NodeError) {
    let banned = shared.book.lock().await.record_failure(&addr, unix_now_secs());
    if banned {
        warn!(peer = %addr, %error, "peer banned after repeated failures");
    } else {
        debug!(peer = %addr, %error, "peer attempt failed");
    }
}

/// Longest line accepted from a peer
fn max_message_bytes(config: &NodeConfig) -> usize {
    config.chain.max_block_size.saturating_mul(MESSAGE_SIZE_FACTOR)
}

/// Cut a `blocks` reply to at most `budget` serialized bytes, keeping at
/// least one block so the requester always progresses
fn truncate_batch(blocks: &mut Vec<Block>, budget: usize) {
    let mut used = 0usize;
    let keep = blocks
        .iter()
        .take_while(|block| {
            used = used.saturating_add(block_size(block));
            used <= budget
        })
        .count()
        .max(1);
    blocks.truncate(keep);
}

async fn write_loop(mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<Message>) {
    while let Some(message) = queue.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            debug!(error = %e, "peer write failed");
            break;
        }
    }
}

async fn run_connection(shared: Arc<Shared>, stream: TcpStream, remote: SocketAddr, direction: Direction) {
    debug!(peer = %remote, ?direction, phase = ?PeerPhase::Connecting, "peer connection opened");
    let (read_half, write_half) = stream.into_split();
    let mut reader = MessageReader::new(BufReader::new(read_half), max_message_bytes(&shared.config));
    let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
    let writer = tokio::spawn(write_loop(write_half, queue));

    debug!(peer = %remote, phase = ?PeerPhase::Handshaking, "peer phase");
    let result = handshake(&shared, &mut reader, &outbound, remote, direction).await;
    if direction == Direction::Outbound {
        shared.dialing.lock().await.remove(&remote);
    }
    let (peer_id, addr, theirs) = match result {
        Ok(Some(connected)) => connected,
        Ok(None) => {
            drop(outbound);
            let _ = writer.await;
            return;
        }
        Err(error) => {
            match &error {
                NodeError::Rejected(reason) => {
                    shared
                        .book
                        .lock()
                        .await
                        .penalize(&remote, PenaltyReason::MalformedMessage, unix_now_secs());
                    debug!(peer = %remote, %reason, "bad handshake");
                }
                e if e.is_transient() && direction == Direction::Outbound => {
                    record_failure(&shared, remote, e).await;
                }
                e => debug!(peer = %remote, error = %e, "handshake failed"),
            }
            drop(outbound);
            let _ = writer.await;
            return;
        }
    };

    // Inbound peers that gave no listening port cannot be dialed back
    let dialable = direction == Direction::Outbound || theirs.listen_port.is_some();
    let mut session = Session {
        shared: shared.clone(),
        peer_id,
        addr,
        outbound,
        phase: PeerPhase::Synced,
        peer_height: theirs.height,
        requested_from: None,
        ping_nonce: None,
        last_seen: Instant::now(),
        closing: false,
    };
    session.run(reader).await;

    shared.peers.write().await.remove(&peer_id);
    {
        let mut book = shared.book.lock().await;
        let banned = book.get(&addr).map_or(false, |peer| peer.is_banned(unix_now_secs()));
        if dialable || banned {
            book.mark_disconnected(&addr);
        } else {
            book.forget(&addr);
        }
    }
    shared
        .pending_blocks
        .lock()
        .await
        .retain(|_, (requester, _)| *requester != peer_id);
    info!(peer = %addr, phase = ?PeerPhase::Disconnected, "peer disconnected");
    drop(session);
    let _ = writer.await;
}

/// Exchange handshakes and register the peer. `Ok(None)` means the
/// connection should be dropped quietly: it reached ourselves or a peer we
/// are already connected to.
async fn handshake<R: AsyncBufRead + Unpin>(
    shared: &Shared,
    reader: &mut MessageReader<R>,
    outbound: &mpsc::Sender<Message>,
    remote: SocketAddr,
    direction: Direction,
) -> Result<Option<(PeerId, SocketAddr, Handshake)>> {
    let tip = shared.node.get_chain_tip().await?;
    let ours = Handshake {
        node_id: shared.node_id.clone(),
        height: tip.height,
        best_hash: tip.hash,
        listen_port: shared.local_addr.get().map(|addr| addr.port()),
        version: PROTOCOL_VERSION,
    };
    outbound
        .send(Message::Handshake(ours))
        .await
        .map_err(|_| NodeError::Network("peer writer closed".to_string()))?;

    let timeout = Duration::from_secs(shared.config.handshake_timeout_secs);
    let theirs = tokio::time::timeout(timeout, async {
        loop {
            match reader.read_message().await? {
                None => return Err(NodeError::Network("closed during handshake".to_string())),
                Some(Ok(Message::Handshake(handshake))) => return Ok(handshake),
                Some(Ok(Message::Unknown)) => continue,
                Some(Ok(other)) => {
                    return Err(NodeError::Rejected(RejectReason::MalformedMessage(format!(
                        "expected handshake, got {}",
                        other.kind()
                    ))))
                }
                Some(Err(reason)) => return Err(NodeError::Rejected(reason)),
            }
        }
    })
    .await
    .map_err(|_| NodeError::Timeout(format!("handshake with {}", remote)))??;

    if theirs.node_id == shared.node_id {
        debug!(peer = %remote, "connected to ourselves, forgetting address");
        shared.book.lock().await.forget(&remote);
        return Ok(None);
    }

    let addr = match (direction, theirs.listen_port) {
        (Direction::Inbound, Some(port)) => SocketAddr::new(remote.ip(), port),
        _ => remote,
    };

    let peer_id = {
        let mut peers = shared.peers.write().await;
        if peers.values().any(|peer| peer.node_id == theirs.node_id) {
            debug!(peer = %remote, node_id = %theirs.node_id, "already connected to this node");
            return Ok(None);
        }
        let peer_id = shared.next_peer_id.fetch_add(1, Ordering::Relaxed);
        peers.insert(
            peer_id,
            ConnectedPeer {
                addr,
                node_id: theirs.node_id.clone(),
                outbound: outbound.clone(),
            },
        );
        peer_id
    };
    shared
        .book
        .lock()
        .await
        .mark_connected(addr, &theirs.node_id, unix_now_secs());
    info!(
        peer = %addr,
        node_id = %theirs.node_id,
        height = theirs.height,
        ?direction,
        "peer connected"
    );
    Ok(Some((peer_id, addr, theirs)))
}

/// One established connection
struct Session {
    shared: Arc<Shared>,
    peer_id: PeerId,
    /// Address the peer accepts connections on
    addr: SocketAddr,
    outbound: mpsc::Sender<Message>,
    phase: PeerPhase,
    /// Best height the peer has told us about
    peer_height: Natural,
    /// Start height of the outstanding `getblocks`, if any
    requested_from: Option<Natural>,
    ping_nonce: Option<u64>,
    last_seen: Instant,
    closing: bool,
}

impl Session {
    async fn run<R: AsyncBufRead + Unpin>(&mut self, mut reader: MessageReader<R>) {
        let idle_timeout = Duration::from_secs(self.shared.config.peer_idle_timeout_secs);
        let mut ping = tokio::time::interval(Duration::from_secs(
            self.shared.config.ping_interval_secs.max(1),
        ));
        ping.tick().await;
        let mut shutdown = self.shared.shutdown.clone();

        if let Err(e) = self.sync_if_behind().await {
            debug!(peer = %self.addr, error = %e, "could not start sync");
            return;
        }

        while !self.closing {
            tokio::select! {
                read = reader.read_message() => match read {
                    Ok(Some(Ok(message))) => {
                        self.last_seen = Instant::now();
                        self.shared.book.lock().await.touch(&self.addr, unix_now_secs());
                        if let Err(e) = self.handle(message).await {
                            debug!(peer = %self.addr, error = %e, "stopping session");
                            break;
                        }
                    }
                    Ok(Some(Err(reason))) => {
                        self.penalize(PenaltyReason::MalformedMessage, &reason).await;
                    }
                    Ok(None) => break,
                    Err(NodeError::Rejected(reason)) => {
                        self.penalize(PenaltyReason::MalformedMessage, &reason).await;
                        break;
                    }
                    Err(e) => {
                        debug!(peer = %self.addr, error = %e, "peer read failed");
                        break;
                    }
                },
                _ = ping.tick() => {
                    if self.last_seen.elapsed() > idle_timeout {
                        info!(peer = %self.addr, "peer idle, disconnecting");
                        break;
                    }
                    let nonce = rand::random::<u64>();
                    self.ping_nonce = Some(nonce);
                    self.send(Message::Ping { nonce }).await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn send(&mut self, message: Message) {
        if self.outbound.send(message).await.is_err() {
            self.closing = true;
        }
    }

    fn set_phase(&mut self, phase: PeerPhase) {
        if self.phase != phase {
            debug!(peer = %self.addr, ?phase, "peer phase");
            self.phase = phase;
        }
    }

    async fn penalize(&mut self, penalty: PenaltyReason, reason: &RejectReason) {
        let banned = self
            .shared
            .book
            .lock()
            .await
            .penalize(&self.addr, penalty, unix_now_secs());
        if banned {
            warn!(peer = %self.addr, %reason, "peer banned");
            self.closing = true;
        } else {
            debug!(peer = %self.addr, ?penalty, %reason, "peer penalized");
        }
    }

    async fn request_blocks(&mut self, from_height: Natural) {
        self.requested_from = Some(from_height);
        self.set_phase(PeerPhase::Syncing);
        let limit = self.shared.config.sync_batch_size;
        self.send(Message::GetBlocks { from_height, limit }).await;
    }

    async fn sync_if_behind(&mut self) -> Result<()> {
        let tip = self.shared.node.get_chain_tip().await?;
        if self.peer_height > tip.height {
            info!(peer = %self.addr, ours = tip.height, theirs = self.peer_height, "peer is ahead, syncing");
            self.request_blocks(tip.height + 1).await;
        }
        Ok(())
    }

    async fn handle(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Handshake(_) => debug!(peer = %self.addr, "ignoring repeated handshake"),
            Message::GetBlocks { from_height, limit } => {
                let limit = limit.min(self.shared.config.sync_batch_size) as usize;
                let mut blocks = self.shared.node.get_blocks(from_height, limit).await?;
                truncate_batch(&mut blocks, self.shared.config.chain.max_block_size);
                self.send(Message::Blocks { blocks }).await;
            }
            Message::Blocks { blocks } => self.on_blocks(blocks).await?,
            Message::NewBlock { block } => {
                if self.shared.seen_blocks.lock().await.is_duplicate(&block.hash) {
                    return Ok(());
                }
                self.peer_height = self.peer_height.max(block.header.height);
                self.submit_relayed_block(block).await?;
            }
            Message::NewTx { tx } => self.on_transaction(tx).await?,
            Message::GetPeers => {
                let mut peers = self.shared.book.lock().await.known_addresses(unix_now_secs());
                peers.retain(|addr| *addr != self.addr);
                peers.truncate(MAX_SHARED_PEERS);
                self.send(Message::Peers { peers }).await;
            }
            Message::Peers { peers } => {
                let local = self.shared.local_addr.get().copied();
                let mut book = self.shared.book.lock().await;
                let learned = peers
                    .into_iter()
                    .take(MAX_SHARED_PEERS)
                    .filter(|addr| Some(*addr) != local && addr.port() != 0)
                    .filter(|addr| book.add_address(*addr))
                    .count();
                debug!(peer = %self.addr, learned, "received peer addresses");
            }
            Message::Ping { nonce } => self.send(Message::Pong { nonce }).await,
            Message::Pong { nonce } => {
                if self.ping_nonce == Some(nonce) {
                    self.ping_nonce = None;
                }
            }
            Message::CmpctBlock(compact) => self.on_compact_block(compact).await?,
            Message::GetBlockTxn { block_hash, indexes } => {
                self.on_get_block_txn(block_hash, indexes).await?
            }
            Message::BlockTxn { block_hash, txs } => self.on_block_txn(block_hash, txs).await?,
            Message::Unknown => debug!(peer = %self.addr, "ignoring unknown message type"),
        }
        Ok(())
    }

    /// Apply a `getblocks` batch in order. The first rejected block ends
    /// the batch; nothing after it is trusted.
    async fn on_blocks(&mut self, blocks: Vec<Block>) -> Result<()> {
        let requested_from = self.requested_from.take();
        let Some(first_height) = blocks.first().map(|block| block.header.height) else {
            self.set_phase(PeerPhase::Synced);
            return Ok(());
        };
        let count = blocks.len();
        let batch_size = self.shared.config.sync_batch_size;
        let mut last_height = first_height;

        for (position, block) in blocks.into_iter().enumerate() {
            let height = block.header.height;
            self.shared.seen_blocks.lock().await.is_duplicate(&block.hash);
            match self.shared.node.submit_block_from(block, Some(self.peer_id)).await {
                Ok(_) => last_height = height,
                Err(NodeError::Rejected(RejectReason::UnknownParent)) if position == 0 => {
                    // Our chains diverge below this batch; step back
                    let from = first_height.saturating_sub(batch_size).max(1);
                    if from < first_height {
                        debug!(peer = %self.addr, from, "batch does not connect, backtracking");
                        self.request_blocks(from).await;
                    } else {
                        self.set_phase(PeerPhase::Synced);
                    }
                    return Ok(());
                }
                Err(NodeError::Rejected(reason)) => {
                    warn!(
                        peer = %self.addr,
                        height,
                        %reason,
                        discarded = count - position - 1,
                        "sync batch stopped at rejected block"
                    );
                    if let Some(penalty) = penalty_for(&reason, true) {
                        self.penalize(penalty, &reason).await;
                    }
                    self.set_phase(PeerPhase::Synced);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        let tip = self.shared.node.get_chain_tip().await?;
        info!(peer = %self.addr, from = first_height, count, height = tip.height, "sync batch applied");
        let next_from = last_height.max(tip.height) + 1;
        let progressed = requested_from.map_or(true, |from| next_from > from);
        if progressed && (self.peer_height > tip.height || count as u64 >= batch_size) {
            self.request_blocks(next_from).await;
        } else {
            self.set_phase(PeerPhase::Synced);
        }
        Ok(())
    }

    async fn submit_relayed_block(&mut self, block: Block) -> Result<()> {
        match self.shared.node.submit_block_from(block, Some(self.peer_id)).await {
            Ok(_) => self.shared.book.lock().await.reward(&self.addr, 1),
            Err(NodeError::Rejected(RejectReason::UnknownParent)) => {
                if self.requested_from.is_none() {
                    let tip = self.shared.node.get_chain_tip().await?;
                    self.request_blocks(tip.height + 1).await;
                }
            }
            Err(NodeError::Rejected(reason)) => {
                if let Some(penalty) = penalty_for(&reason, true) {
                    self.penalize(penalty, &reason).await;
                }
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn on_transaction(&mut self, tx: Transaction) -> Result<()> {
        if self.shared.seen_txs.lock().await.is_duplicate(&tx.id()) {
            return Ok(());
        }
        match self.shared.node.submit_transaction_from(tx, Some(self.peer_id)).await {
            Ok(_) => {}
            Err(NodeError::Rejected(reason)) => {
                debug!(peer = %self.addr, %reason, "relayed transaction rejected");
                if let Some(penalty) = penalty_for(&reason, false) {
                    self.penalize(penalty, &reason).await;
                }
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn on_compact_block(&mut self, compact: CompactBlock) -> Result<()> {
        if self.shared.seen_blocks.lock().await.is_duplicate(&compact.hash) {
            return Ok(());
        }
        let height = compact.header.height;
        self.peer_height = self.peer_height.max(height);
        match self.shared.node.reconstruct(compact).await {
            Ok(Reconstruction::Complete(block)) => {
                self.shared.counters.reconstructed.fetch_add(1, Ordering::Relaxed);
                self.submit_relayed_block(block).await?;
            }
            Ok(Reconstruction::Incomplete(pending)) => {
                self.shared.counters.round_trips.fetch_add(1, Ordering::Relaxed);
                let block_hash = pending.hash;
                let indexes = pending.missing_indexes();
                debug!(peer = %self.addr, missing = indexes.len(), "requesting missing compact block transactions");
                self.shared
                    .pending_blocks
                    .lock()
                    .await
                    .insert(block_hash, (self.peer_id, pending));
                self.send(Message::GetBlockTxn { block_hash, indexes }).await;
            }
            Err(NodeError::Rejected(RejectReason::BadMerkleRoot)) => {
                // Our own mempool can hold a transaction whose short id collides
                self.fetch_full_block(height, &RejectReason::BadMerkleRoot).await;
            }
            Err(NodeError::Rejected(reason)) => {
                self.penalize(PenaltyReason::MalformedMessage, &reason).await;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn fetch_full_block(&mut self, height: Natural, reason: &RejectReason) {
        self.shared.counters.full_fallbacks.fetch_add(1, Ordering::Relaxed);
        debug!(peer = %self.addr, height, %reason, "compact block unusable, fetching full block");
        self.requested_from = Some(height);
        self.set_phase(PeerPhase::Syncing);
        self.send(Message::GetBlocks { from_height: height, limit: 1 }).await;
    }

    async fn on_get_block_txn(&mut self, block_hash: Hash, indexes: Vec<u32>) -> Result<()> {
        let Some(block) = self.shared.node.get_block(block_hash).await? else {
            debug!(peer = %self.addr, block = %hex::encode(block_hash), "getblocktxn for unknown block");
            return Ok(());
        };
        let mut txs = Vec::with_capacity(indexes.len());
        for index in indexes {
            match block.transactions.get(index as usize) {
                Some(tx) => txs.push(tx.clone()),
                None => {
                    let reason = RejectReason::MalformedMessage(format!("no transaction at index {}", index));
                    self.penalize(PenaltyReason::MalformedMessage, &reason).await;
                    return Ok(());
                }
            }
        }
        self.send(Message::BlockTxn { block_hash, txs }).await;
        Ok(())
    }

    async fn on_block_txn(&mut self, block_hash: Hash, txs: Vec<Transaction>) -> Result<()> {
        let pending = self.shared.pending_blocks.lock().await.remove(&block_hash);
        let Some((_, pending)) = pending else {
            debug!(peer = %self.addr, block = %hex::encode(block_hash), "unsolicited blocktxn");
            return Ok(());
        };
        let height = pending.header.height;
        match pending.fill(txs) {
            Ok(block) => self.submit_relayed_block(block).await?,
            Err(reason) => self.fetch_full_block(height, &reason).await,
        }
        Ok(())
    }
}

/// Forward accepted blocks and transactions to every peer except the one
/// they came from
async fn relay_loop(shared: Arc<Shared>) {
    let mut events = shared.node.subscribe_events();
    let mut shutdown = shared.shutdown.clone();
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.changed() => break,
        };
        match event {
            Ok(NodeEvent::NewTip { block, origin }) => {
                shared.seen_blocks.lock().await.is_duplicate(&block.hash);
                let message = if shared.config.compact_relay {
                    Message::CmpctBlock(CompactBlock::from_block(&block, rand::random()))
                } else {
                    Message::NewBlock { block }
                };
                broadcast(&shared, message, origin).await;
            }
            Ok(NodeEvent::TransactionAccepted { tx, origin }) => {
                shared.seen_txs.lock().await.is_duplicate(&tx.id());
                broadcast(&shared, Message::NewTx { tx }, origin).await;
            }
            Ok(NodeEvent::Reorganized { .. }) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "relay fell behind node events"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn broadcast(shared: &Shared, message: Message, exclude: Option<PeerId>) {
    let peers = shared.peers.read().await;
    for (peer_id, peer) in peers.iter() {
        if Some(*peer_id) == exclude {
            continue;
        }
        if peer.outbound.try_send(message.clone()).is_err() {
            debug!(peer = %peer.addr, kind = message.kind(), "peer queue full, relay dropped");
        }
    }
}

/// Lift expired bans, keep outbound connections topped up, ask for more
/// addresses and save the address book
async fn maintenance_loop(shared: Arc<Shared>) {
    let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
    let mut shutdown = shared.shutdown.clone();
    let getpeers_interval = Duration::from_secs(shared.config.getpeers_interval_secs.max(1));
    let save_interval = Duration::from_secs(shared.config.persist_retry_secs.max(1));
    let mut last_getpeers = Instant::now();
    let mut last_save = Instant::now();

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => break,
        }
        let now = unix_now_secs();

        let candidates = {
            let connected = shared.peers.read().await.len();
            let dialing = shared.dialing.lock().await.clone();
            let mut book = shared.book.lock().await;
            book.check_bans(now);
            let room = shared.config.max_peers.saturating_sub(connected + dialing.len());
            book.connectable(now)
                .into_iter()
                .filter(|addr| !dialing.contains(addr))
                .take(room)
                .collect::<Vec<_>>()
        };
        for addr in candidates {
            let shared = shared.clone();
            tokio::spawn(async move {
                let _ = dial(shared, addr).await;
            });
        }

        if last_getpeers.elapsed() >= getpeers_interval {
            last_getpeers = Instant::now();
            let peers = shared.peers.read().await;
            let ids: Vec<&PeerId> = peers.keys().collect();
            if !ids.is_empty() {
                let pick = ids[rand::random::<usize>() % ids.len()];
                if let Some(peer) = peers.get(pick) {
                    let _ = peer.outbound.try_send(Message::GetPeers);
                }
            }
        }

        if last_save.elapsed() >= save_interval {
            last_save = Instant::now();
            save_peers(&shared).await;
        }
    }
    save_peers(&shared).await;
}

async fn save_peers(shared: &Shared) {
    let Some(store) = &shared.store else {
        return;
    };
    let peers = shared.book.lock().await.known_addresses(unix_now_secs());
    if let Err(e) = store.save_peers(&peers) {
        warn!(error = %e, "failed to save peer addresses");
    }
}
