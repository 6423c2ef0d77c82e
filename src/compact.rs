//! Compact block relay: announce a block as short transaction fingerprints
//! and let the receiver rebuild it from its own mempool

use crate::block::calculate_merkle_root;
use crate::constants::{MIN_TRANSACTION_SIZE, SHORT_ID_LEN};
use crate::error::{RejectReason, ValidationResult};
use crate::mempool::Mempool;
use crate::script::sha256;
use crate::transaction::calculate_tx_id;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Transaction sent in full inside a compact block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefilledTransaction {
    pub index: u32,
    pub tx: Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactBlock {
    pub header: BlockHeader,
    #[serde(with = "hex::serde")]
    pub hash: Hash,
    /// Per-block salt so fingerprints cannot be precomputed
    pub salt: u64,
    /// Fingerprints of the non-prefilled transactions, in block order
    pub short_ids: Vec<u64>,
    /// Sorted by index; always holds the coinbase
    pub prefilled: Vec<PrefilledTransaction>,
}

/// ShortId: ℕ × ℍ → ℕ
///
/// First six bytes of sha256(salt ‖ txid), little-endian
pub fn short_id(salt: u64, tx_id: &Hash) -> u64 {
    let mut data = Vec::with_capacity(40);
    data.extend_from_slice(&salt.to_le_bytes());
    data.extend_from_slice(tx_id);
    let digest = sha256(&data);
    let mut bytes = [0u8; 8];
    bytes[..SHORT_ID_LEN].copy_from_slice(&digest[..SHORT_ID_LEN]);
    u64::from_le_bytes(bytes)
}

impl CompactBlock {
    /// Compact form of `block`, prefilling only the coinbase
    pub fn from_block(block: &Block, salt: u64) -> Self {
        let mut prefilled = Vec::new();
        let mut short_ids = Vec::new();
        for (index, tx) in block.transactions.iter().enumerate() {
            if index == 0 {
                prefilled.push(PrefilledTransaction {
                    index: 0,
                    tx: tx.clone(),
                });
            } else {
                short_ids.push(short_id(salt, &calculate_tx_id(tx)));
            }
        }
        CompactBlock {
            header: block.header.clone(),
            hash: block.hash,
            salt,
            short_ids,
            prefilled,
        }
    }

    pub fn transaction_count(&self) -> usize {
        self.short_ids.len() + self.prefilled.len()
    }

    /// Rebuild the block from prefilled transactions and mempool matches.
    ///
    /// A fingerprint matching no mempool entry, or more than one, leaves its
    /// slot empty; the block is only returned once every slot is filled.
    /// Announcements with more transactions than a block of
    /// `max_block_size` bytes can hold are refused before any slot exists.
    pub fn reconstruct(&self, mempool: &Mempool, max_block_size: usize) -> ValidationResult<Reconstruction> {
        let total = self.transaction_count();
        let max_transactions = max_block_size / MIN_TRANSACTION_SIZE;
        if total > max_transactions {
            return Err(RejectReason::MalformedMessage(format!(
                "compact block announces {} transactions, at most {} fit",
                total, max_transactions
            )));
        }
        let mut slots: Vec<Option<Transaction>> = vec![None; total];
        let mut last_index = None;
        for prefilled in &self.prefilled {
            let index = prefilled.index as usize;
            if index >= total || last_index.map_or(false, |last| index <= last) {
                return Err(RejectReason::MalformedMessage(format!(
                    "prefilled index {} out of order or range",
                    index
                )));
            }
            slots[index] = Some(prefilled.tx.clone());
            last_index = Some(index);
        }

        // None marks a fingerprint shared by several mempool entries
        let mut candidates: HashMap<u64, Option<&Transaction>> = HashMap::new();
        for entry in mempool.entries() {
            candidates
                .entry(short_id(self.salt, &entry.tx_id))
                .and_modify(|slot| *slot = None)
                .or_insert(Some(&entry.tx));
        }

        let mut short_ids = self.short_ids.iter();
        for slot in slots.iter_mut().filter(|slot| slot.is_none()) {
            let id = short_ids.next().ok_or_else(|| {
                RejectReason::MalformedMessage("too few short ids".to_string())
            })?;
            if let Some(Some(tx)) = candidates.get(id) {
                *slot = Some((*tx).clone());
            }
        }

        let pending = PendingBlock {
            header: self.header.clone(),
            hash: self.hash,
            slots,
        };
        if pending.missing_indexes().is_empty() {
            return pending.take_block().map(Reconstruction::Complete);
        }
        Ok(Reconstruction::Incomplete(pending))
    }
}

#[derive(Debug, Clone)]
pub enum Reconstruction {
    Complete(Block),
    /// Slots still missing; request them by index
    Incomplete(PendingBlock),
}

/// A block being rebuilt. Never handed to validation while a slot is empty.
#[derive(Debug, Clone)]
pub struct PendingBlock {
    pub header: BlockHeader,
    pub hash: Hash,
    slots: Vec<Option<Transaction>>,
}

impl PendingBlock {
    pub fn missing_indexes(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index as u32)
            .collect()
    }

    /// Fill the missing slots, in index order, with the transactions a peer
    /// sent back, and produce the block
    pub fn fill(mut self, txs: Vec<Transaction>) -> ValidationResult<Block> {
        let missing = self.missing_indexes();
        if missing.len() != txs.len() {
            return Err(RejectReason::MalformedMessage(format!(
                "expected {} transactions, got {}",
                missing.len(),
                txs.len()
            )));
        }
        for (index, tx) in missing.into_iter().zip(txs) {
            self.slots[index as usize] = Some(tx);
        }
        self.take_block()
    }

    /// The finished block. Fails if any slot is empty or the transactions do
    /// not match the header's Merkle root (e.g. a fingerprint collision).
    fn take_block(&self) -> ValidationResult<Block> {
        let transactions: Vec<Transaction> = self
            .slots
            .iter()
            .map(|slot| slot.clone())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| RejectReason::MalformedBlock("block has unresolved transactions".to_string()))?;
        if calculate_merkle_root(&transactions) != self.header.merkle_root {
            return Err(RejectReason::BadMerkleRoot);
        }
        Ok(Block {
            header: self.header.clone(),
            hash: self.hash,
            transactions,
        })
    }
}
