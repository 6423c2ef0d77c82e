//! Wire protocol, framing, seen-item tracking and the peer book
//!
//! Messages are JSON objects tagged by `"type"`, one per line. Anything the
//! node does not understand decodes to [`Message::Unknown`] and is ignored.

use crate::compact::CompactBlock;
use crate::constants::*;
use crate::error::{NodeError, RejectReason, Result, ValidationResult};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Local identifier of one peer connection
pub type PeerId = u64;

/// Handshake announced by both sides right after connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub node_id: String,
    pub height: Natural,
    #[serde(with = "hex::serde")]
    pub best_hash: Hash,
    /// Port the sender accepts connections on, if any
    #[serde(default)]
    pub listen_port: Option<u16>,
    #[serde(default)]
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Handshake(Handshake),
    #[serde(rename_all = "camelCase")]
    GetBlocks { from_height: Natural, limit: u64 },
    Blocks { blocks: Vec<Block> },
    NewBlock { block: Block },
    NewTx { tx: Transaction },
    GetPeers,
    Peers { peers: Vec<SocketAddr> },
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    CmpctBlock(CompactBlock),
    #[serde(rename_all = "camelCase")]
    GetBlockTxn {
        #[serde(with = "hex::serde")]
        block_hash: Hash,
        indexes: Vec<u32>,
    },
    #[serde(rename_all = "camelCase")]
    BlockTxn {
        #[serde(with = "hex::serde")]
        block_hash: Hash,
        txs: Vec<Transaction>,
    },
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::GetBlocks { .. } => "getblocks",
            Message::Blocks { .. } => "blocks",
            Message::NewBlock { .. } => "newblock",
            Message::NewTx { .. } => "newtx",
            Message::GetPeers => "getpeers",
            Message::Peers { .. } => "peers",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::CmpctBlock(_) => "cmpctblock",
            Message::GetBlockTxn { .. } => "getblocktxn",
            Message::BlockTxn { .. } => "blocktxn",
            Message::Unknown => "unknown",
        }
    }
}

/// Serialize a message as one newline-terminated JSON line
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode_message(line: &[u8]) -> ValidationResult<Message> {
    serde_json::from_slice(line).map_err(|e| RejectReason::MalformedMessage(e.to_string()))
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let line = encode_message(message)?;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads newline-delimited messages, refusing lines above a size bound
pub struct MessageReader<R> {
    inner: R,
    max_line: usize,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> MessageReader<R> {
    pub fn new(inner: R, max_line: usize) -> Self {
        MessageReader {
            inner,
            max_line,
            buf: Vec::new(),
        }
    }

    /// Next message from the stream.
    ///
    /// `Ok(None)` at end of stream. A line that fails to decode is returned
    /// as the inner error and the stream stays usable; an oversized line is
    /// an outer error since framing can no longer be trusted.
    pub async fn read_message(&mut self) -> Result<Option<ValidationResult<Message>>> {
        // Partial lines stay in `buf` across calls, so a read cancelled
        // by `select!` loses nothing
        loop {
            let limit = (self.max_line + 1).saturating_sub(self.buf.len()) as u64;
            (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await?;
            if self.buf.last() != Some(&b'\n') {
                if self.buf.len() > self.max_line {
                    self.buf.clear();
                    return Err(NodeError::Rejected(RejectReason::MalformedMessage(format!(
                        "line exceeds {} bytes",
                        self.max_line
                    ))));
                }
                if self.buf.is_empty() {
                    return Ok(None);
                }
                // Final line without terminator
                let result = decode_message(trim_line(&self.buf));
                self.buf.clear();
                return Ok(Some(result));
            }
            let line = trim_line(&self.buf);
            if line.is_empty() {
                self.buf.clear();
                continue;
            }
            let result = decode_message(line);
            self.buf.clear();
            return Ok(Some(result));
        }
    }
}

fn trim_line(buf: &[u8]) -> &[u8] {
    let mut end = buf.len();
    while end > 0 && (buf[end - 1] == b'\n' || buf[end - 1] == b'\r') {
        end -= 1;
    }
    &buf[..end]
}

/// Bounded FIFO set of recently seen block hashes or transaction ids
#[derive(Debug)]
pub struct SeenCache {
    capacity: usize,
    hashes: HashSet<Hash>,
    order: VecDeque<Hash>,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        SeenCache {
            capacity: capacity.max(1),
            hashes: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// True if `hash` was seen before; otherwise records it, evicting the
    /// oldest entry at capacity
    pub fn is_duplicate(&mut self, hash: &Hash) -> bool {
        if self.hashes.contains(hash) {
            return true;
        }
        if self.hashes.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.hashes.remove(&old);
            }
        }
        self.hashes.insert(*hash);
        self.order.push_back(*hash);
        false
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.hashes.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// Misbehaviour a peer can be penalized for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PenaltyReason {
    InvalidBlock,
    InvalidTransaction,
    MalformedMessage,
}

impl PenaltyReason {
    pub fn penalty(self) -> i32 {
        match self {
            PenaltyReason::InvalidBlock => -50,
            PenaltyReason::InvalidTransaction => -10,
            PenaltyReason::MalformedMessage => -20,
        }
    }
}

const SCORE_MIN: i32 = -1000;
const SCORE_MAX: i32 = 100;

/// What the node remembers about one peer address
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub addr: SocketAddr,
    pub node_id: Option<String>,
    pub connected: bool,
    pub last_seen_secs: u64,
    pub score: i32,
    /// Consecutive transient failures
    pub failures: u32,
    pub ban_until_secs: Option<u64>,
    /// Earliest time of the next outbound attempt
    pub next_attempt_secs: u64,
    backoff_secs: u64,
}

impl PeerRecord {
    fn new(addr: SocketAddr) -> Self {
        PeerRecord {
            addr,
            node_id: None,
            connected: false,
            last_seen_secs: 0,
            score: 0,
            failures: 0,
            ban_until_secs: None,
            next_attempt_secs: 0,
            backoff_secs: INITIAL_BACKOFF_SECS,
        }
    }

    pub fn is_banned(&self, now_secs: u64) -> bool {
        self.ban_until_secs.map_or(false, |until| now_secs < until)
    }
}

/// Address book with reputation scoring, failure counting, bans and
/// reconnect backoff
#[derive(Debug)]
pub struct PeerBook {
    peers: HashMap<SocketAddr, PeerRecord>,
    max_peers: usize,
    ban_threshold: i32,
}

impl PeerBook {
    pub fn new(max_peers: usize, ban_threshold: i32) -> Self {
        PeerBook {
            peers: HashMap::new(),
            max_peers,
            ban_threshold,
        }
    }

    /// Remember an address. When the book is full the worst-scoring
    /// disconnected peer makes room. Returns false if the address was not
    /// added.
    pub fn add_address(&mut self, addr: SocketAddr) -> bool {
        if self.peers.contains_key(&addr) {
            return false;
        }
        if self.peers.len() >= self.max_peers.saturating_mul(4).max(1) {
            let worst = self
                .peers
                .values()
                .filter(|p| !p.connected)
                .min_by_key(|p| p.score)
                .map(|p| p.addr);
            match worst {
                Some(worst) => {
                    debug!(evicted = %worst, added = %addr, "peer book full, evicting worst peer");
                    self.peers.remove(&worst);
                }
                None => return false,
            }
        }
        self.peers.insert(addr, PeerRecord::new(addr));
        true
    }

    /// Drop an address entirely, e.g. one that turned out to be ourselves
    pub fn forget(&mut self, addr: &SocketAddr) {
        self.peers.remove(addr);
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&PeerRecord> {
        self.peers.get(addr)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn mark_connected(&mut self, addr: SocketAddr, node_id: &str, now_secs: u64) {
        self.add_address(addr);
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.connected = true;
            peer.node_id = Some(node_id.to_string());
            peer.last_seen_secs = now_secs;
            peer.failures = 0;
            peer.backoff_secs = INITIAL_BACKOFF_SECS;
            peer.next_attempt_secs = 0;
        }
    }

    pub fn mark_disconnected(&mut self, addr: &SocketAddr) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.connected = false;
        }
    }

    pub fn touch(&mut self, addr: &SocketAddr, now_secs: u64) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.last_seen_secs = now_secs;
        }
    }

    /// Record a transient failure (timeout, refused connection, reset).
    /// Schedules the next attempt with exponential backoff and bans once
    /// the consecutive failures reach the threshold. Returns true if the
    /// peer got banned.
    pub fn record_failure(&mut self, addr: &SocketAddr, now_secs: u64) -> bool {
        let Some(peer) = self.peers.get_mut(addr) else {
            return false;
        };
        peer.connected = false;
        peer.failures += 1;
        peer.next_attempt_secs = now_secs + peer.backoff_secs;
        peer.backoff_secs = (peer.backoff_secs * 2).min(MAX_BACKOFF_SECS);
        if peer.failures >= FAILURE_THRESHOLD {
            peer.ban_until_secs = Some(now_secs + BAN_DURATION_SECS);
            return true;
        }
        false
    }

    /// Deduct points for misbehaviour. Returns true if the peer got banned.
    pub fn penalize(&mut self, addr: &SocketAddr, reason: PenaltyReason, now_secs: u64) -> bool {
        self.add_address(*addr);
        let Some(peer) = self.peers.get_mut(addr) else {
            return false;
        };
        peer.score = (peer.score + reason.penalty()).max(SCORE_MIN);
        if peer.score <= self.ban_threshold {
            peer.connected = false;
            peer.ban_until_secs = Some(now_secs + BAN_DURATION_SECS);
            return true;
        }
        false
    }

    /// Credit a peer for delivering something useful
    pub fn reward(&mut self, addr: &SocketAddr, amount: i32) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.score = (peer.score + amount).min(SCORE_MAX);
        }
    }

    /// A ban applies to every port of the banned host
    pub fn is_banned(&self, ip: IpAddr, now_secs: u64) -> bool {
        self.peers
            .values()
            .any(|p| p.addr.ip() == ip && p.is_banned(now_secs))
    }

    /// Lift expired bans, resetting score and failure count
    pub fn check_bans(&mut self, now_secs: u64) {
        for peer in self.peers.values_mut() {
            if peer.ban_until_secs.map_or(false, |until| now_secs >= until) {
                peer.ban_until_secs = None;
                peer.score = 0;
                peer.failures = 0;
                peer.backoff_secs = INITIAL_BACKOFF_SECS;
            }
        }
    }

    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.connected).count()
    }

    /// Disconnected, unbanned addresses whose backoff has elapsed, best
    /// score first
    pub fn connectable(&self, now_secs: u64) -> Vec<SocketAddr> {
        let mut candidates: Vec<&PeerRecord> = self
            .peers
            .values()
            .filter(|p| !p.connected && !p.is_banned(now_secs) && p.next_attempt_secs <= now_secs)
            .collect();
        candidates.sort_by(|a, b| b.score.cmp(&a.score).then(a.addr.cmp(&b.addr)));
        candidates.into_iter().map(|p| p.addr).collect()
    }

    /// Addresses worth sharing or persisting: everything not banned
    pub fn known_addresses(&self, now_secs: u64) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|p| !p.is_banned(now_secs))
            .map(|p| p.addr)
            .collect();
        addrs.sort();
        addrs
    }
}

/// Penalty for relaying an item that failed validation, if it deserves one
pub fn penalty_for(reason: &RejectReason, is_block: bool) -> Option<PenaltyReason> {
    if !reason.penalizes_sender() {
        return None;
    }
    Some(match reason {
        // The parent may simply not have reached us yet
        RejectReason::MissingInput(_) if !is_block => return None,
        RejectReason::MalformedMessage(_) => PenaltyReason::MalformedMessage,
        _ if is_block => PenaltyReason::InvalidBlock,
        _ => PenaltyReason::InvalidTransaction,
    })
}
