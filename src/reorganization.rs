//! Chain reorganization: moving the active chain onto a branch with more
//! cumulative work

use crate::error::{RejectReason, ValidationResult};
use crate::ledger::{LedgerState, UndoData};
use crate::transaction::{calculate_tx_id, is_coinbase};
use crate::types::*;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// Result of a completed reorganization
#[derive(Debug, Clone)]
pub struct ReorgOutcome {
    pub old_tip: Hash,
    pub new_tip: Hash,
    /// Height of the last block both chains share
    pub fork_height: Natural,
    /// Blocks removed from the active chain, tip first
    pub disconnected: Vec<Block>,
    /// Blocks added to the active chain, oldest first
    pub connected: Vec<Block>,
    /// Branch block that failed validation, if the branch was only
    /// partially connected
    pub failed: Option<(Hash, RejectReason)>,
}

impl ReorgOutcome {
    pub fn depth(&self) -> usize {
        self.disconnected.len()
    }

    /// Non-coinbase transactions confirmed by a disconnected block and by
    /// no connected block, oldest first so parents precede children
    pub fn orphaned_transactions(&self) -> Vec<Transaction> {
        let reconfirmed: HashSet<Hash> = self
            .connected
            .iter()
            .flat_map(|block| block.transactions.iter())
            .map(calculate_tx_id)
            .collect();
        self.disconnected
            .iter()
            .rev()
            .flat_map(|block| block.transactions.iter())
            .filter(|tx| !is_coinbase(tx) && !reconfirmed.contains(&calculate_tx_id(tx)))
            .cloned()
            .collect()
    }
}

/// Ledger fields a reorganization may touch
struct Snapshot {
    utxo_set: UtxoSet,
    undo: HashMap<Hash, UndoData>,
    minted_supply: u64,
    active: Vec<Hash>,
}

impl Snapshot {
    fn take(ledger: &LedgerState) -> Self {
        Snapshot {
            utxo_set: ledger.utxo_set.clone(),
            undo: ledger.undo.clone(),
            minted_supply: ledger.minted_supply,
            active: ledger.tree.active_hashes().to_vec(),
        }
    }

    fn restore(self, ledger: &mut LedgerState) {
        ledger.utxo_set = self.utxo_set;
        ledger.undo = self.undo;
        ledger.minted_supply = self.minted_supply;
        ledger.tree.set_active(self.active);
    }
}

/// Reorganization: switch the active chain to end at `target`
///
/// For a target block already stored in the block tree:
/// 1. Find the fork point between the target's branch and the active chain
/// 2. Reject if more than maxReorgDepth blocks would be disconnected
/// 3. Disconnect active blocks back to the fork point using their undo data
/// 4. Connect the branch blocks in order, fully validating each
/// 5. If a branch block is invalid, mark it and its descendants invalid,
///    then keep whichever of {old chain, valid branch prefix} has more work
///
/// The ledger never ends up in a state between the two chains.
pub fn reorganize(
    ledger: &mut LedgerState,
    target: &Hash,
    now: u64,
) -> ValidationResult<ReorgOutcome> {
    // 1. Fork point
    let (fork_hash, branch) = ledger
        .tree
        .find_fork(target)
        .ok_or(RejectReason::UnknownParent)?;
    let fork_height = ledger
        .tree
        .get(&fork_hash)
        .map(|node| node.height())
        .ok_or(RejectReason::UnknownParent)?;

    // 2. Depth limit; every block to disconnect needs undo data
    let old_tip = ledger.tree.tip_hash();
    let old_work = ledger.tree.tip().cumulative_work;
    let old_height = ledger.tree.height();
    let depth = old_height - fork_height;
    let limit = ledger.params.max_reorg_depth;
    let undo_available = (fork_height + 1..=old_height).all(|height| {
        ledger
            .tree
            .hash_at_height(height)
            .map_or(false, |hash| ledger.undo.contains_key(&hash))
    });
    if depth > limit || !undo_available {
        return Err(RejectReason::ReorgTooDeep { depth, limit });
    }

    let snapshot = Snapshot::take(ledger);

    // 3. Disconnect
    let mut disconnected = Vec::with_capacity(depth as usize);
    while ledger.tree.height() > fork_height {
        match ledger.revert_tip() {
            Ok(block) => disconnected.push(block),
            Err(reason) => {
                snapshot.restore(ledger);
                return Err(reason);
            }
        }
    }

    // 4. Connect
    let mut connected = Vec::with_capacity(branch.len());
    let mut failed = None;
    for hash in &branch {
        let block = match ledger.tree.get(hash) {
            Some(node) => node.block.clone(),
            None => break,
        };
        match ledger.apply_block(&block, now) {
            Ok(_) => connected.push(block),
            Err(reason) => {
                warn!(
                    height = block.header.height,
                    hash = %hex::encode(hash),
                    %reason,
                    "branch block failed validation during reorganization"
                );
                ledger.tree.mark_invalid(hash);
                failed = Some((*hash, reason));
                break;
            }
        }
    }

    // 5. Fall back if the valid prefix is not better than what we had
    if let Some((_, reason)) = &failed {
        if ledger.tree.tip().cumulative_work <= old_work {
            let reason = reason.clone();
            snapshot.restore(ledger);
            return Err(reason);
        }
    }

    let new_tip = ledger.tree.tip_hash();
    info!(
        depth,
        fork_height,
        old_tip = %hex::encode(old_tip),
        new_tip = %hex::encode(new_tip),
        "chain reorganized"
    );
    Ok(ReorgOutcome {
        old_tip,
        new_tip,
        fork_height,
        disconnected,
        connected,
        failed,
    })
}
