//! The node actor: sole owner of the ledger and mempool
//!
//! Every mutation and query is a [`NodeCommand`] processed one at a time by
//! the actor task, so block application, reorganization and mempool
//! admission never interleave. Callers hold a cloneable [`NodeHandle`].

use crate::compact::{CompactBlock, Reconstruction};
use crate::error::{NodeError, Result, ValidationResult};
use crate::ledger::{AcceptOutcome, LedgerState};
use crate::mempool::{Admission, Mempool, MempoolEntry};
use crate::mining::{create_block_template, BlockTemplate};
use crate::network::PeerId;
use crate::reorganization::ReorgOutcome;
use crate::storage::{PersistedState, Store};
use crate::types::*;
use serde::Serialize;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const COMMAND_QUEUE: usize = 1024;
const EVENT_QUEUE: usize = 1024;

pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Changes other components react to
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// `block` became the active tip; `origin` is the peer that sent it
    NewTip { block: Block, origin: Option<PeerId> },
    TransactionAccepted { tx: Transaction, origin: Option<PeerId> },
    Reorganized { old_tip: Hash, new_tip: Hash, depth: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub height: Natural,
    #[serde(with = "hex::serde")]
    pub tip_hash: Hash,
    pub difficulty_target: u32,
    pub current_reward: u64,
    pub minted_supply: u64,
    pub remaining_supply: u64,
    pub blocks_until_halving: u64,
    pub mempool_size: usize,
    pub mempool_bytes: usize,
    pub utxo_count: usize,
}

pub enum NodeCommand {
    SubmitTransaction {
        tx: Transaction,
        origin: Option<PeerId>,
        reply: oneshot::Sender<ValidationResult<Admission>>,
    },
    SubmitBlock {
        block: Block,
        origin: Option<PeerId>,
        reply: oneshot::Sender<ValidationResult<AcceptOutcome>>,
    },
    GetBalance {
        key_hash: KeyHash,
        reply: oneshot::Sender<u64>,
    },
    GetUtxos {
        key_hash: KeyHash,
        reply: oneshot::Sender<Vec<(OutPoint, UTXO)>>,
    },
    GetStats {
        reply: oneshot::Sender<NodeStats>,
    },
    GetChainTip {
        reply: oneshot::Sender<ChainTip>,
    },
    GetBlocks {
        from_height: Natural,
        limit: usize,
        reply: oneshot::Sender<Vec<Block>>,
    },
    GetBlock {
        hash: Hash,
        reply: oneshot::Sender<Option<Block>>,
    },
    GetMempoolEntries {
        reply: oneshot::Sender<Vec<MempoolEntry>>,
    },
    BlockTemplate {
        recipient: LockingCondition,
        reply: oneshot::Sender<ValidationResult<BlockTemplate>>,
    },
    Reconstruct {
        compact: CompactBlock,
        reply: oneshot::Sender<ValidationResult<Reconstruction>>,
    },
    Flush {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable front door to the node actor
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<NodeCommand>,
    tip: watch::Receiver<ChainTip>,
    events: broadcast::Sender<NodeEvent>,
}

impl NodeHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> NodeCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| NodeError::ChannelClosed)?;
        response.await.map_err(|_| NodeError::ChannelClosed)
    }

    pub async fn submit_transaction(&self, tx: Transaction) -> Result<Admission> {
        self.submit_transaction_from(tx, None).await
    }

    pub async fn submit_transaction_from(&self, tx: Transaction, origin: Option<PeerId>) -> Result<Admission> {
        let result = self
            .request(|reply| NodeCommand::SubmitTransaction { tx, origin, reply })
            .await?;
        Ok(result?)
    }

    /// Offer a locally mined block
    pub async fn submit_mined_block(&self, block: Block) -> Result<AcceptOutcome> {
        self.submit_block_from(block, None).await
    }

    pub async fn submit_block_from(&self, block: Block, origin: Option<PeerId>) -> Result<AcceptOutcome> {
        let result = self
            .request(|reply| NodeCommand::SubmitBlock { block, origin, reply })
            .await?;
        Ok(result?)
    }

    pub async fn get_balance(&self, key_hash: KeyHash) -> Result<u64> {
        self.request(|reply| NodeCommand::GetBalance { key_hash, reply }).await
    }

    pub async fn get_utxos(&self, key_hash: KeyHash) -> Result<Vec<(OutPoint, UTXO)>> {
        self.request(|reply| NodeCommand::GetUtxos { key_hash, reply }).await
    }

    pub async fn get_stats(&self) -> Result<NodeStats> {
        self.request(|reply| NodeCommand::GetStats { reply }).await
    }

    pub async fn get_chain_tip(&self) -> Result<ChainTip> {
        self.request(|reply| NodeCommand::GetChainTip { reply }).await
    }

    pub async fn get_blocks(&self, from_height: Natural, limit: usize) -> Result<Vec<Block>> {
        self.request(|reply| NodeCommand::GetBlocks { from_height, limit, reply })
            .await
    }

    pub async fn get_block(&self, hash: Hash) -> Result<Option<Block>> {
        self.request(|reply| NodeCommand::GetBlock { hash, reply }).await
    }

    pub async fn mempool_entries(&self) -> Result<Vec<MempoolEntry>> {
        self.request(|reply| NodeCommand::GetMempoolEntries { reply }).await
    }

    /// Snapshot template on the current tip
    pub async fn block_template(&self, recipient: LockingCondition) -> Result<BlockTemplate> {
        let result = self
            .request(|reply| NodeCommand::BlockTemplate { recipient, reply })
            .await?;
        Ok(result?)
    }

    pub async fn reconstruct(&self, compact: CompactBlock) -> Result<Reconstruction> {
        let result = self
            .request(|reply| NodeCommand::Reconstruct { compact, reply })
            .await?;
        Ok(result?)
    }

    /// Write the current state to disk now
    pub async fn flush(&self) -> Result<()> {
        self.request(|reply| NodeCommand::Flush { reply }).await?
    }

    /// Latest active tip, updated on every tip change
    pub fn subscribe_tip(&self) -> watch::Receiver<ChainTip> {
        self.tip.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }
}

/// Owner of the ledger and mempool
pub struct Node {
    ledger: LedgerState,
    mempool: Mempool,
    store: Option<Store>,
    persist_interval: Duration,
    /// State changed since the last successful save
    dirty: bool,
    failed_saves: u32,
    last_save: Option<Instant>,
    tip: watch::Sender<ChainTip>,
    events: broadcast::Sender<NodeEvent>,
}

impl Node {
    pub fn new(ledger: LedgerState, mempool: Mempool) -> Self {
        let (tip, _) = watch::channel(ledger.tip());
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        Node {
            ledger,
            mempool,
            store: None,
            persist_interval: Duration::from_secs(crate::config::DEFAULT_PERSIST_RETRY_SECS),
            dirty: false,
            failed_saves: 0,
            last_save: None,
            tip,
            events,
        }
    }

    /// Persist to `store` at most once per `interval`. A tip change saves
    /// at once if the last save is older than that; anything else waits for
    /// the next tick.
    pub fn with_store(mut self, store: Store, interval: Duration) -> Self {
        self.store = Some(store);
        self.persist_interval = interval.max(Duration::from_millis(10));
        self
    }

    /// Start the actor. It stops once every handle is dropped, saving a
    /// final time.
    pub fn spawn(self) -> (NodeHandle, JoinHandle<()>) {
        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE);
        let handle = NodeHandle {
            commands,
            tip: self.tip.subscribe(),
            events: self.events.clone(),
        };
        let task = tokio::spawn(self.run(receiver));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<NodeCommand>) {
        let mut ticker = tokio::time::interval(self.persist_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(height = self.ledger.height(), "node started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = ticker.tick() => self.housekeeping(),
            }
        }
        if self.dirty {
            let _ = self.persist();
        }
        info!("node stopped");
    }

    fn handle(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::SubmitTransaction { tx, origin, reply } => {
                let _ = reply.send(self.submit_transaction(tx, origin));
            }
            NodeCommand::SubmitBlock { block, origin, reply } => {
                let _ = reply.send(self.submit_block(block, origin));
            }
            NodeCommand::GetBalance { key_hash, reply } => {
                let _ = reply.send(self.ledger.balance(&key_hash));
            }
            NodeCommand::GetUtxos { key_hash, reply } => {
                let _ = reply.send(self.ledger.utxos_for(&key_hash));
            }
            NodeCommand::GetStats { reply } => {
                let _ = reply.send(self.stats());
            }
            NodeCommand::GetChainTip { reply } => {
                let _ = reply.send(self.ledger.tip());
            }
            NodeCommand::GetBlocks { from_height, limit, reply } => {
                let _ = reply.send(self.ledger.blocks_from(from_height, limit));
            }
            NodeCommand::GetBlock { hash, reply } => {
                let _ = reply.send(self.ledger.get_block(&hash).cloned());
            }
            NodeCommand::GetMempoolEntries { reply } => {
                let _ = reply.send(self.mempool.entries().into_iter().cloned().collect());
            }
            NodeCommand::BlockTemplate { recipient, reply } => {
                let template =
                    create_block_template(&self.ledger, &self.mempool, recipient, unix_now_secs());
                let _ = reply.send(template);
            }
            NodeCommand::Reconstruct { compact, reply } => {
                let _ = reply.send(compact.reconstruct(&self.mempool, self.ledger.params().max_block_size));
            }
            NodeCommand::Flush { reply } => {
                let _ = reply.send(self.persist());
            }
        }
    }

    fn submit_transaction(&mut self, tx: Transaction, origin: Option<PeerId>) -> ValidationResult<Admission> {
        let admission = self.mempool.admit(tx.clone(), &self.ledger, unix_now_secs())?;
        debug!(
            tx = %hex::encode(admission.tx_id),
            fee = admission.fee,
            evicted = admission.evicted.len(),
            "transaction admitted"
        );
        self.dirty = true;
        let _ = self.events.send(NodeEvent::TransactionAccepted { tx, origin });
        Ok(admission)
    }

    fn submit_block(&mut self, block: Block, origin: Option<PeerId>) -> ValidationResult<AcceptOutcome> {
        let now = unix_now_secs();
        let hash = block.hash;
        let height = block.header.height;
        let outcome = match self.ledger.accept_block(block.clone(), now) {
            Ok(outcome) => outcome,
            Err(reason) => {
                if reason.penalizes_sender() {
                    warn!(height, hash = %hex::encode(hash), %reason, peer = ?origin, "block rejected");
                } else {
                    debug!(height, hash = %hex::encode(hash), %reason, peer = ?origin, "block not accepted");
                }
                return Err(reason);
            }
        };

        match &outcome {
            AcceptOutcome::Extended(summary) => {
                self.mempool.remove_for_block(&block);
                self.mempool.expire(now);
                info!(
                    height,
                    hash = %hex::encode(hash),
                    txs = block.transactions.len(),
                    fees = summary.fees,
                    "block accepted"
                );
                self.tip_changed(origin);
            }
            AcceptOutcome::Reorganized(reorg) => {
                self.after_reorganization(reorg, now);
                self.tip_changed(origin);
            }
            AcceptOutcome::SideBranch => {
                debug!(height, hash = %hex::encode(hash), "block stored on side branch");
            }
            AcceptOutcome::AlreadyKnown => {}
        }
        Ok(outcome)
    }

    /// Rebuild the mempool on the new chain: transactions of disconnected
    /// blocks first, then the previous pool, each re-validated
    fn after_reorganization(&mut self, reorg: &ReorgOutcome, now: u64) {
        let previous = self.mempool.drain();
        let orphaned = reorg.orphaned_transactions();
        let orphan_count = orphaned.len();
        let restored = self
            .mempool
            .readmit(orphaned.into_iter().map(|tx| (tx, now)), &self.ledger);
        let kept = self.mempool.readmit(
            previous.into_iter().map(|entry| (entry.tx, entry.arrival_time)),
            &self.ledger,
        );
        self.mempool.expire(now);
        info!(
            depth = reorg.depth(),
            old_tip = %hex::encode(reorg.old_tip),
            new_tip = %hex::encode(reorg.new_tip),
            orphaned = orphan_count,
            restored,
            kept,
            "chain reorganized"
        );
        let _ = self.events.send(NodeEvent::Reorganized {
            old_tip: reorg.old_tip,
            new_tip: reorg.new_tip,
            depth: reorg.depth(),
        });
    }

    fn tip_changed(&mut self, origin: Option<PeerId>) {
        self.tip.send_replace(self.ledger.tip());
        let _ = self.events.send(NodeEvent::NewTip {
            block: self.ledger.tip_block().clone(),
            origin,
        });
        self.dirty = true;
        let due = self
            .last_save
            .map_or(true, |at| at.elapsed() >= self.persist_interval);
        if due {
            let _ = self.persist();
        }
    }

    fn housekeeping(&mut self) {
        let expired = self.mempool.expire(unix_now_secs());
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired mempool entries");
            self.dirty = true;
        }
        if self.dirty {
            let _ = self.persist();
        }
    }

    /// Save if a store is configured. A failure leaves the state dirty so
    /// the next tick retries.
    fn persist(&mut self) -> Result<()> {
        let Some(store) = &self.store else {
            self.dirty = false;
            return Ok(());
        };
        let result = PersistedState::capture(&self.ledger, &self.mempool).and_then(|state| store.save(&state));
        match &result {
            Ok(()) => {
                if self.failed_saves > 0 {
                    info!(attempts = self.failed_saves + 1, "state persisted after retry");
                }
                self.failed_saves = 0;
                self.dirty = false;
                self.last_save = Some(Instant::now());
            }
            Err(e) => {
                self.failed_saves += 1;
                self.dirty = true;
                error!(attempt = self.failed_saves, error = %e, "failed to persist state, will retry");
            }
        }
        result
    }

    fn stats(&self) -> NodeStats {
        let tip = self.ledger.tip();
        NodeStats {
            height: tip.height,
            tip_hash: tip.hash,
            difficulty_target: self
                .ledger
                .required_target(&tip.hash)
                .unwrap_or(self.ledger.tip_block().header.difficulty_target),
            current_reward: self.ledger.next_reward(),
            minted_supply: self.ledger.minted_supply(),
            remaining_supply: self.ledger.remaining_supply(),
            blocks_until_halving: self.ledger.blocks_until_halving(),
            mempool_size: self.mempool.len(),
            mempool_bytes: self.mempool.total_size(),
            utxo_count: self.ledger.utxo_set().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectReason;
    use crate::params::{ChainParams, MempoolPolicy};
    use crate::testutil::*;

    fn spawn_node() -> (NodeHandle, LedgerState) {
        let ledger = LedgerState::new(ChainParams::regtest());
        let (handle, _) = Node::new(ledger.clone(), Mempool::new(MempoolPolicy::default())).spawn();
        (handle, ledger)
    }

    #[tokio::test]
    async fn test_submit_block_moves_tip() {
        let (handle, mut shadow) = spawn_node();
        let mut tip = handle.subscribe_tip();
        let block = next_block(&shadow, vec![], p2kh(&key(1)), 0);
        shadow.apply_block(&block, NOW).unwrap();

        let outcome = handle.submit_mined_block(block.clone()).await.unwrap();
        assert!(matches!(outcome, AcceptOutcome::Extended(_)));
        tip.changed().await.unwrap();
        assert_eq!(tip.borrow().hash, block.hash);
        assert_eq!(handle.get_chain_tip().await.unwrap(), shadow.tip());
        assert_eq!(handle.get_balance(key_hash_for(&key(1))).await.unwrap(), 50);
        assert_eq!(handle.get_utxos(key_hash_for(&key(1))).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejections_are_typed() {
        let (handle, shadow) = spawn_node();
        let mut block = next_block(&shadow, vec![], anyone(), 0);
        block.header.height = 7;
        match handle.submit_mined_block(block).await {
            Err(NodeError::Rejected(RejectReason::BadHeight { expected: 1, got: 7 })) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        let ghost = spend_open(&[OutPoint::new([9; 32], 0)], vec![(1, anyone())], SEQ_FINAL);
        assert!(matches!(
            handle.submit_transaction(ghost).await,
            Err(NodeError::Rejected(RejectReason::MissingInput(_)))
        ));
    }

    #[tokio::test]
    async fn test_confirmed_transactions_leave_mempool() {
        let (handle, mut shadow) = spawn_node();
        let funding = next_block(&shadow, vec![], anyone(), 0);
        shadow.apply_block(&funding, NOW).unwrap();
        handle.submit_mined_block(funding.clone()).await.unwrap();

        let tx = spend_open(&[coinbase_outpoint(&funding)], vec![(40, anyone())], SEQ_FINAL);
        let mut events = handle.subscribe_events();
        handle.submit_transaction(tx.clone()).await.unwrap();
        match events.recv().await.unwrap() {
            NodeEvent::TransactionAccepted { tx: relayed, origin: None } => assert_eq!(relayed, tx),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(handle.get_stats().await.unwrap().mempool_size, 1);

        let template = handle.block_template(anyone()).await.unwrap();
        assert_eq!(template.fees, 10);
        let confirming = next_block(&shadow, vec![tx], anyone(), 10);
        handle.submit_mined_block(confirming).await.unwrap();
        let stats = handle.get_stats().await.unwrap();
        assert_eq!(stats.height, 2);
        assert_eq!(stats.mempool_size, 0);
        assert_eq!(stats.minted_supply, 100);
        assert_eq!(stats.current_reward, 50);
    }

    #[tokio::test]
    async fn test_reorg_restores_orphaned_transactions() {
        let (handle, shadow) = spawn_node();
        let genesis = shadow.tip_block().clone();
        let funding = block_on(&genesis, vec![], anyone(), 0, 1);
        handle.submit_mined_block(funding.clone()).await.unwrap();

        let tx = spend_open(&[coinbase_outpoint(&funding)], vec![(30, anyone())], SEQ_FINAL);
        let ours = block_on(&funding, vec![tx.clone()], anyone(), 20, 2);
        handle.submit_mined_block(ours).await.unwrap();
        assert_eq!(handle.mempool_entries().await.unwrap().len(), 0);

        // Competing branch from `funding` that overtakes by one block
        let theirs_a = block_on(&funding, vec![], anyone(), 0, 3);
        let theirs_b = block_on(&theirs_a, vec![], anyone(), 0, 4);
        let mut events = handle.subscribe_events();
        assert!(matches!(
            handle.submit_block_from(theirs_a, Some(7)).await.unwrap(),
            AcceptOutcome::SideBranch
        ));
        assert!(matches!(
            handle.submit_block_from(theirs_b.clone(), Some(7)).await.unwrap(),
            AcceptOutcome::Reorganized(_)
        ));

        assert_eq!(handle.get_chain_tip().await.unwrap().hash, theirs_b.hash);
        let pool = handle.mempool_entries().await.unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].tx, tx);

        let mut saw_reorg = false;
        let mut relayed = None;
        while let Ok(event) = events.try_recv() {
            match event {
                NodeEvent::Reorganized { depth, .. } => {
                    assert_eq!(depth, 1);
                    saw_reorg = true;
                }
                NodeEvent::NewTip { block, origin } => relayed = Some((block.hash, origin)),
                NodeEvent::TransactionAccepted { .. } => {}
            }
        }
        assert!(saw_reorg);
        assert_eq!(relayed, Some((theirs_b.hash, Some(7))));
    }

    #[tokio::test]
    async fn test_block_change_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let ledger = LedgerState::new(ChainParams::regtest());
        let block = next_block(&ledger, vec![], anyone(), 0);
        let (handle, task) = Node::new(ledger, Mempool::default())
            .with_store(store.clone(), Duration::from_secs(60))
            .spawn();
        handle.submit_mined_block(block.clone()).await.unwrap();

        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.chain.last().unwrap().hash, block.hash);
        assert_eq!(saved.minted_supply, 50);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_tip_saves_are_batched_by_interval() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let mut shadow = LedgerState::new(ChainParams::regtest());
        let (handle, task) = Node::new(shadow.clone(), Mempool::default())
            .with_store(store.clone(), Duration::from_secs(60))
            .spawn();
        for _ in 0..3 {
            let block = next_block(&shadow, vec![], anyone(), 0);
            shadow.apply_block(&block, NOW).unwrap();
            handle.submit_mined_block(block).await.unwrap();
        }

        // Only the first tip change was written straight away
        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.chain.len(), 2);

        drop(handle);
        task.await.unwrap();
        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.chain.last().unwrap().hash, shadow.tip().hash);
        assert_eq!(saved.minted_supply, 150);
    }
}
