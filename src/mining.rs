//! Block templates, proof-of-work search and the miner loop

use crate::block::{calculate_block_hash, calculate_merkle_root};
use crate::constants::{COINBASE_RESERVED_SIZE, SEQUENCE_FINAL};
use crate::error::{NodeError, RejectReason, ValidationResult};
use crate::ledger::LedgerState;
use crate::mempool::Mempool;
use crate::node::NodeHandle;
use crate::pow::check_proof_of_work;
use crate::transaction::{validate_transaction, UtxoOverlay};
use crate::types::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Nonces tried between checks of the stop flag
const STOP_CHECK_INTERVAL: u64 = 1024;

/// Miner state machine: Idle → Searching → (Found | Preempted) → Idle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MinerState {
    Idle,
    Searching { height: Natural, parent: Hash },
    Found { height: Natural, hash: Hash },
    Preempted { height: Natural },
}

/// Snapshot of everything needed to search for a block. Holds no reference
/// into the ledger or mempool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplate {
    pub header: BlockHeader,
    /// Coinbase first
    pub transactions: Vec<Transaction>,
    pub fees: u64,
    pub reward: u64,
}

impl BlockTemplate {
    pub fn height(&self) -> Natural {
        self.header.height
    }

    pub fn parent(&self) -> Hash {
        self.header.previous_hash
    }

    /// The chain moved on: this template no longer extends the tip
    pub fn is_stale(&self, tip: &ChainTip) -> bool {
        self.header.previous_hash != tip.hash
    }
}

/// Outcome of a bounded nonce search
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    Found(Block),
    Preempted,
    Exhausted,
}

/// Coinbase transaction paying `value` to `recipient`, committing to
/// `height`
pub fn create_coinbase_transaction(
    height: Natural,
    value: u64,
    recipient: LockingCondition,
    extra: ByteString,
) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint::null(),
            unlock_proof: UnlockProof::Coinbase { height, extra },
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TransactionOutput {
            value,
            locking_condition: recipient,
        }],
        lock_time: 0,
    }
}

/// CreateBlockTemplate: ℒ𝒮 × ℳ𝒫 → ℬ
///
/// 1. Select transactions from the mempool, leaving room for the coinbase
/// 2. Assemble them on top of the current tip
pub fn create_block_template(
    ledger: &LedgerState,
    mempool: &Mempool,
    recipient: LockingCondition,
    now: u64,
) -> ValidationResult<BlockTemplate> {
    let max_size = ledger
        .params()
        .max_block_size
        .saturating_sub(COINBASE_RESERVED_SIZE);
    let selected = mempool.select_for_block(max_size);
    assemble_template(ledger, selected, recipient, now)
}

/// Build a template extending the tip from candidate transactions in
/// block order.
///
/// Each candidate is re-validated against the tip's UTXO set as updated by
/// the candidates before it; those that fail are left out. The coinbase
/// claims the reward plus the fees of what remains.
pub fn assemble_template(
    ledger: &LedgerState,
    candidates: Vec<Transaction>,
    recipient: LockingCondition,
    now: u64,
) -> ValidationResult<BlockTemplate> {
    let tip = ledger.tip_block();
    let height = tip.header.height + 1;
    let max_tx_size = ledger.params().max_tx_size;

    let mut view = UtxoOverlay::new(ledger.utxo_set());
    let mut fees: u64 = 0;
    let mut transactions = Vec::with_capacity(candidates.len() + 1);
    transactions.push(Transaction {
        version: 1,
        inputs: vec![],
        outputs: vec![],
        lock_time: 0,
    });
    for tx in candidates {
        match validate_transaction(&tx, &view, ledger.oracle(), height, max_tx_size) {
            Ok(fee) => {
                fees = fees.checked_add(fee).ok_or(RejectReason::ValueOverflow)?;
                view.apply(&tx, height);
                transactions.push(tx);
            }
            Err(reason) => debug!(%reason, "dropping transaction from template"),
        }
    }

    let reward = ledger.next_reward();
    let claimed = reward.checked_add(fees).ok_or(RejectReason::ValueOverflow)?;
    transactions[0] = create_coinbase_transaction(height, claimed, recipient, Vec::new());

    let header = BlockHeader {
        version: 1,
        height,
        previous_hash: tip.hash,
        merkle_root: calculate_merkle_root(&transactions),
        timestamp: now.max(tip.header.timestamp),
        difficulty_target: ledger.required_target(&tip.hash)?,
        nonce: 0,
    };
    Ok(BlockTemplate {
        header,
        transactions,
        fees,
        reward,
    })
}

/// MineBlock: ℬ × ℕ → ℬ × {success, failure}
///
/// Try up to `max_attempts` nonces from the template's starting nonce,
/// giving up early once `stop` is raised.
pub fn mine_block(template: BlockTemplate, max_attempts: u64, stop: &AtomicBool) -> SearchOutcome {
    let BlockTemplate {
        mut header,
        transactions,
        ..
    } = template;
    for attempt in 0..max_attempts {
        if attempt % STOP_CHECK_INTERVAL == 0 && stop.load(Ordering::Relaxed) {
            return SearchOutcome::Preempted;
        }
        let hash = calculate_block_hash(&header);
        if check_proof_of_work(&hash, header.difficulty_target).is_ok() {
            return SearchOutcome::Found(Block {
                header,
                hash,
                transactions,
            });
        }
        header.nonce = header.nonce.wrapping_add(1);
    }
    SearchOutcome::Exhausted
}

/// Background miner: builds templates through the node handle and searches
/// on a blocking worker, abandoning the search when the tip moves
pub struct Miner {
    handle: NodeHandle,
    recipient: LockingCondition,
    nonce_batch: u64,
    state: watch::Sender<MinerState>,
}

impl Miner {
    pub fn new(handle: NodeHandle, recipient: LockingCondition, nonce_batch: u64) -> Self {
        let (state, _) = watch::channel(MinerState::Idle);
        Miner {
            handle,
            recipient,
            nonce_batch: nonce_batch.max(1),
            state,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<MinerState> {
        self.state.subscribe()
    }

    /// Mine until `shutdown` flips to true or the node goes away
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("miner started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.state.send_replace(MinerState::Idle);

            let mut template = match self.handle.block_template(self.recipient.clone()).await {
                Ok(template) => template,
                Err(NodeError::ChannelClosed) => break,
                Err(e) => {
                    warn!(error = %e, "could not build block template");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            template.header.nonce = rand::random::<u64>();
            let (height, parent) = (template.height(), template.parent());
            self.state.send_replace(MinerState::Searching { height, parent });

            let mut tip = self.handle.subscribe_tip();
            let stop = Arc::new(AtomicBool::new(false));
            let worker_stop = Arc::clone(&stop);
            let batch = self.nonce_batch;
            let mut search =
                tokio::task::spawn_blocking(move || mine_block(template, batch, &worker_stop));

            let outcome = tokio::select! {
                result = &mut search => result,
                _ = wait_until_stale(&mut tip, parent) => {
                    stop.store(true, Ordering::Relaxed);
                    (&mut search).await
                }
                _ = shutdown.changed() => {
                    stop.store(true, Ordering::Relaxed);
                    let _ = (&mut search).await;
                    break;
                }
            };

            match outcome {
                Ok(SearchOutcome::Found(block)) => {
                    if tip.borrow().hash != parent {
                        debug!(height, "found block went stale before submission");
                        self.state.send_replace(MinerState::Preempted { height });
                        continue;
                    }
                    let hash = block.hash;
                    self.state.send_replace(MinerState::Found { height, hash });
                    match self.handle.submit_mined_block(block).await {
                        Ok(_) => info!(height, hash = %hex::encode(hash), "mined block"),
                        Err(e) => warn!(height, error = %e, "mined block rejected"),
                    }
                }
                Ok(SearchOutcome::Preempted) => {
                    debug!(height, "search preempted by new tip");
                    self.state.send_replace(MinerState::Preempted { height });
                }
                Ok(SearchOutcome::Exhausted) => {}
                Err(e) => {
                    warn!(error = %e, "mining worker failed");
                    break;
                }
            }
        }
        self.state.send_replace(MinerState::Idle);
        info!("miner stopped");
    }
}

/// Resolves once the tip no longer equals `parent`, or the node is gone
async fn wait_until_stale(tip: &mut watch::Receiver<ChainTip>, parent: Hash) {
    loop {
        if tip.borrow_and_update().hash != parent {
            return;
        }
        if tip.changed().await.is_err() {
            return;
        }
    }
}
