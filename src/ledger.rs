//! Ledger state: the UTXO set of the active chain, undo data for recent
//! blocks, and the block tree holding every candidate branch.
//!
//! All mutation goes through [`LedgerState::apply_block`] and
//! [`LedgerState::revert_block`]; both leave the state untouched when they
//! fail.

use crate::block::{
    genesis_block, validate_block, validate_block_header, BlockSummary, ValidationContext,
};
use crate::chain::BlockTree;
use crate::economic::{current_reward, next_halving_height};
use crate::error::{NodeError, RejectReason, Result, ValidationResult};
use crate::params::ChainParams;
use crate::pow::retarget;
use crate::reorganization::{reorganize, ReorgOutcome};
use crate::script::{PredicateOracle, StandardOracle};
use crate::transaction::{calculate_tx_id, is_coinbase};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// What one block consumed: the spent outputs of each transaction, in block
/// order, and the new supply it minted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoData {
    pub spent: Vec<Vec<(OutPoint, UTXO)>>,
    pub minted: u64,
}

/// Result of offering a block to the ledger
#[derive(Debug, Clone)]
pub enum AcceptOutcome {
    /// Connected on top of the previous tip
    Extended(BlockSummary),
    /// Stored on a branch with no more work than the active chain
    SideBranch,
    /// The block's branch overtook the active chain
    Reorganized(ReorgOutcome),
    AlreadyKnown,
}

#[derive(Clone)]
pub struct LedgerState {
    pub(crate) params: ChainParams,
    pub(crate) tree: BlockTree,
    pub(crate) utxo_set: UtxoSet,
    pub(crate) undo: HashMap<Hash, UndoData>,
    pub(crate) minted_supply: u64,
    oracle: Arc<dyn PredicateOracle>,
}

impl LedgerState {
    /// Fresh ledger holding only the genesis block
    pub fn new(params: ChainParams) -> Self {
        Self::with_oracle(params, Arc::new(StandardOracle::new()))
    }

    pub fn with_oracle(params: ChainParams, oracle: Arc<dyn PredicateOracle>) -> Self {
        let genesis = genesis_block(&params);
        let mut utxo_set = UtxoSet::new();
        for tx in &genesis.transactions {
            add_outputs(&mut utxo_set, tx, 0);
        }
        LedgerState {
            params,
            tree: BlockTree::new(genesis),
            utxo_set,
            undo: HashMap::new(),
            minted_supply: 0,
            oracle,
        }
    }

    /// Rebuild a ledger from persisted parts. `chain` is the active chain
    /// from genesis; blocks are trusted, only their linkage is checked.
    pub fn from_parts(
        params: ChainParams,
        chain: Vec<Block>,
        utxo_set: UtxoSet,
        undo: HashMap<Hash, UndoData>,
        minted_supply: u64,
    ) -> Result<Self> {
        let mut blocks = chain.into_iter();
        let genesis = blocks
            .next()
            .ok_or_else(|| NodeError::Corrupt("chain is empty".to_string()))?;
        if genesis.hash != genesis_block(&params).hash {
            return Err(NodeError::Corrupt(
                "genesis block does not match chain parameters".to_string(),
            ));
        }

        let mut tree = BlockTree::new(genesis);
        for block in blocks {
            let (hash, height) = (block.hash, block.header.height);
            if height != tree.height() + 1 {
                return Err(NodeError::Corrupt(format!(
                    "block at position {} claims height {}",
                    tree.height() + 1,
                    height
                )));
            }
            tree.insert(block)
                .map_err(|e| NodeError::Corrupt(format!("block {}: {}", height, e)))?;
            tree.push_active(hash);
        }

        Ok(LedgerState {
            params,
            tree,
            utxo_set,
            undo,
            minted_supply,
            oracle: Arc::new(StandardOracle::new()),
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn tree(&self) -> &BlockTree {
        &self.tree
    }

    pub fn utxo_set(&self) -> &UtxoSet {
        &self.utxo_set
    }

    pub fn undo_data(&self) -> &HashMap<Hash, UndoData> {
        &self.undo
    }

    pub fn oracle(&self) -> &dyn PredicateOracle {
        self.oracle.as_ref()
    }

    pub fn minted_supply(&self) -> u64 {
        self.minted_supply
    }

    pub fn remaining_supply(&self) -> u64 {
        self.params.max_supply.saturating_sub(self.minted_supply)
    }

    pub fn height(&self) -> Natural {
        self.tree.height()
    }

    pub fn tip_block(&self) -> &Block {
        &self.tree.tip().block
    }

    pub fn tip(&self) -> ChainTip {
        let tip = self.tip_block();
        ChainTip {
            height: tip.header.height,
            hash: tip.hash,
            timestamp: tip.header.timestamp,
        }
    }

    pub fn get_block(&self, hash: &Hash) -> Option<&Block> {
        self.tree.get(hash).map(|node| &node.block)
    }

    /// Up to `limit` active-chain blocks starting at `from_height`. Empty
    /// when `from_height` is above the tip.
    pub fn blocks_from(&self, from_height: Natural, limit: usize) -> Vec<Block> {
        (from_height..=self.height())
            .take(limit)
            .filter_map(|height| self.tree.block_at_height(height))
            .cloned()
            .collect()
    }

    /// Reward the next block on the active chain is entitled to
    pub fn next_reward(&self) -> u64 {
        current_reward(self.height() + 1, self.minted_supply, &self.params)
    }

    /// Blocks until the nominal reward next halves
    pub fn blocks_until_halving(&self) -> u64 {
        next_halving_height(self.height(), &self.params).saturating_sub(self.height())
    }

    /// Target required of a block whose parent is `parent_hash`.
    ///
    /// Unchanged from the parent except at heights that are multiples of
    /// the adjustment interval, which retarget over the window
    /// `[h - interval, h - 1]`.
    pub fn required_target(&self, parent_hash: &Hash) -> ValidationResult<u32> {
        let parent = self.tree.get(parent_hash).ok_or(RejectReason::UnknownParent)?;
        let parent_bits = parent.block.header.difficulty_target;
        let height = parent.height() + 1;
        let interval = self.params.adjustment_interval;
        if interval == 0 || height % interval != 0 {
            return Ok(parent_bits);
        }
        let first = self
            .tree
            .ancestor_at(parent_hash, height - interval)
            .ok_or(RejectReason::UnknownParent)?;
        let elapsed = parent
            .block
            .header
            .timestamp
            .saturating_sub(first.block.header.timestamp);
        Ok(retarget(parent_bits, elapsed, &self.params))
    }

    fn context(&self, now: u64, required_target: u32) -> ValidationContext<'_> {
        ValidationContext {
            params: &self.params,
            oracle: self.oracle.as_ref(),
            now,
            required_target,
            minted_supply: self.minted_supply,
        }
    }

    /// ApplyBlock: ℒ𝒮 × ℬ → ℒ𝒮
    ///
    /// Validates `block` against the active tip and, if valid, connects it:
    /// spends its inputs, adds its outputs, records undo data and credits
    /// minted supply. On rejection nothing changes.
    pub fn apply_block(&mut self, block: &Block, now: u64) -> ValidationResult<BlockSummary> {
        let tip = self.tree.tip();
        let required_target = self.required_target(&tip.hash())?;
        let summary = validate_block(
            block,
            &tip.block,
            &self.utxo_set,
            &self.context(now, required_target),
        )?;

        if !self.tree.contains(&block.hash) {
            self.tree.insert(block.clone())?;
        }
        self.connect(block, &summary);
        Ok(summary)
    }

    fn connect(&mut self, block: &Block, summary: &BlockSummary) {
        let height = block.header.height;
        let mut spent = Vec::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            let mut spent_by_tx = Vec::new();
            if !is_coinbase(tx) {
                for input in &tx.inputs {
                    if let Some(utxo) = self.utxo_set.remove(&input.prevout) {
                        spent_by_tx.push((input.prevout, utxo));
                    }
                }
            }
            add_outputs(&mut self.utxo_set, tx, height);
            spent.push(spent_by_tx);
        }

        self.minted_supply = self.minted_supply.saturating_add(summary.minted);
        self.tree.push_active(block.hash);
        self.undo.insert(
            block.hash,
            UndoData {
                spent,
                minted: summary.minted,
            },
        );

        // Undo data older than the reorg horizon is never needed again
        let depth = self.params.max_reorg_depth;
        if height > depth {
            if let Some(stale) = self.tree.hash_at_height(height - depth) {
                self.undo.remove(&stale);
            }
        }
        debug!(height, fees = summary.fees, minted = summary.minted, "block connected");
    }

    /// RevertBlock: ℒ𝒮 × ℬ → ℒ𝒮
    ///
    /// Disconnects `block`, which must be the active tip: transactions are
    /// undone last to first, removing their outputs and restoring what they
    /// spent.
    pub fn revert_block(&mut self, block: &Block) -> ValidationResult<()> {
        if block.hash != self.tree.tip_hash() || self.tree.height() == 0 {
            return Err(RejectReason::NotActiveTip);
        }
        let undo = self.undo.remove(&block.hash).ok_or(RejectReason::ReorgTooDeep {
            depth: 1,
            limit: self.params.max_reorg_depth,
        })?;

        for (tx, spent) in block.transactions.iter().zip(undo.spent.iter()).rev() {
            let tx_id = calculate_tx_id(tx);
            for index in 0..tx.outputs.len() {
                self.utxo_set.remove(&OutPoint::new(tx_id, index as u32));
            }
            for (outpoint, utxo) in spent {
                self.utxo_set.insert(*outpoint, utxo.clone());
            }
        }

        self.minted_supply = self.minted_supply.saturating_sub(undo.minted);
        self.tree.pop_active();
        debug!(height = block.header.height, "block disconnected");
        Ok(())
    }

    /// Disconnect the active tip and hand it back
    pub fn revert_tip(&mut self) -> ValidationResult<Block> {
        let block = self.tip_block().clone();
        self.revert_block(&block)?;
        Ok(block)
    }

    /// Offer a block from any source.
    ///
    /// Blocks extending the tip are fully validated and connected. Blocks
    /// extending another known block get header checks and are stored; if
    /// their branch now carries more cumulative work than the active chain
    /// the ledger reorganizes onto it.
    pub fn accept_block(&mut self, block: Block, now: u64) -> ValidationResult<AcceptOutcome> {
        if let Some(node) = self.tree.get(&block.hash) {
            if node.invalid {
                return Err(RejectReason::KnownInvalid);
            }
            return Ok(AcceptOutcome::AlreadyKnown);
        }
        let parent_hash = block.header.previous_hash;
        match self.tree.get(&parent_hash) {
            None => return Err(RejectReason::UnknownParent),
            Some(parent) if parent.invalid => return Err(RejectReason::KnownInvalid),
            Some(_) => {}
        }

        if parent_hash == self.tree.tip_hash() {
            return self.apply_block(&block, now).map(AcceptOutcome::Extended);
        }

        // A branch forking below the reorg horizon can never be adopted
        let (fork, _) = self.tree.find_fork(&parent_hash).ok_or(RejectReason::UnknownParent)?;
        let fork_height = self.tree.get(&fork).map_or(0, |node| node.height());
        let depth = self.height().saturating_sub(fork_height);
        if depth > self.params.max_reorg_depth {
            return Err(RejectReason::ReorgTooDeep {
                depth,
                limit: self.params.max_reorg_depth,
            });
        }

        let required_target = self.required_target(&parent_hash)?;
        let parent = self.tree.get(&parent_hash).ok_or(RejectReason::UnknownParent)?;
        validate_block_header(&block, &parent.block, &self.context(now, required_target))?;

        let hash = block.hash;
        let work = self.tree.insert(block)?.cumulative_work;
        if work > self.tree.tip().cumulative_work {
            let outcome = reorganize(self, &hash, now)?;
            Ok(AcceptOutcome::Reorganized(outcome))
        } else {
            Ok(AcceptOutcome::SideBranch)
        }
    }

    /// Spendable value locked to `key_hash` with a plain key-hash condition
    pub fn balance(&self, key_hash: &KeyHash) -> u64 {
        self.utxos_for(key_hash)
            .iter()
            .fold(0u64, |total, (_, utxo)| total.saturating_add(utxo.value))
    }

    pub fn utxos_for(&self, key_hash: &KeyHash) -> Vec<(OutPoint, UTXO)> {
        let mut utxos: Vec<(OutPoint, UTXO)> = self
            .utxo_set
            .iter()
            .filter(|(_, utxo)| {
                matches!(
                    &utxo.locking_condition,
                    LockingCondition::PayToKeyHash { key_hash: owner } if owner == key_hash
                )
            })
            .map(|(outpoint, utxo)| (*outpoint, utxo.clone()))
            .collect();
        utxos.sort_by_key(|(outpoint, utxo)| (utxo.confirmed_height, *outpoint));
        utxos
    }

    /// Sum of all unspent values
    pub fn total_unspent(&self) -> u64 {
        self.utxo_set
            .values()
            .fold(0u64, |total, utxo| total.saturating_add(utxo.value))
    }
}

fn add_outputs(utxo_set: &mut UtxoSet, tx: &Transaction, height: Natural) {
    let tx_id = calculate_tx_id(tx);
    for (index, output) in tx.outputs.iter().enumerate() {
        utxo_set.insert(
            OutPoint::new(tx_id, index as u32),
            UTXO {
                value: output.value,
                locking_condition: output.locking_condition.clone(),
                confirmed_height: height,
            },
        );
    }
}
