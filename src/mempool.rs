//! Mempool: valid unconfirmed transactions, their dependency graph and the
//! fee market rules (replacement, child-pays-for-parent, block packing)

use crate::error::{RejectReason, ValidationResult};
use crate::ledger::LedgerState;
use crate::params::MempoolPolicy;
use crate::transaction::{
    calculate_tx_id, is_coinbase, signals_replaceable, transaction_size, validate_transaction,
    UtxoView,
};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Exact fee-rate `fee / size`, compared by cross-multiplication
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeRate {
    pub fee: u64,
    pub size: u64,
}

impl FeeRate {
    pub fn new(fee: u64, size: u64) -> Self {
        FeeRate { fee, size }
    }

    /// fee / size ≥ min_per_kb / 1000
    pub fn meets(&self, min_per_kb: u64) -> bool {
        self.fee as u128 * 1000 >= min_per_kb as u128 * self.size as u128
    }

    /// self ≥ other × (100 + percent) / 100
    pub fn exceeds_by_margin(&self, other: &FeeRate, percent: u64) -> bool {
        self.fee as u128 * other.size as u128 * 100
            >= other.fee as u128 * self.size as u128 * (100 + percent as u128)
    }

    /// Base units per 1000 bytes, rounded down; for display only
    pub fn per_kb(&self) -> u64 {
        if self.size == 0 {
            return 0;
        }
        ((self.fee as u128 * 1000) / self.size as u128) as u64
    }
}

impl PartialEq for FeeRate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FeeRate {}

impl PartialOrd for FeeRate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FeeRate {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.fee as u128 * other.size as u128).cmp(&(other.fee as u128 * self.size as u128))
    }
}

/// MempoolEntry: 𝒯𝒳 × ℕ × ℕ × ℕ × {true, false}
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolEntry {
    pub tx: Transaction,
    #[serde(with = "hex::serde")]
    pub tx_id: Hash,
    pub fee: u64,
    pub size: usize,
    pub arrival_time: u64,
    pub replaceable: bool,
    /// Admission order; a child is always admitted after its parents
    #[serde(default)]
    pub sequence: u64,
}

impl MempoolEntry {
    pub fn fee_rate(&self) -> FeeRate {
        FeeRate::new(self.fee, self.size as u64)
    }
}

/// Successful admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub tx_id: Hash,
    pub fee: u64,
    /// Entries evicted by replacement or capacity pressure
    pub evicted: Vec<Hash>,
}

/// Confirmed outputs plus outputs of mempool entries, minus entries about to
/// be evicted
struct MempoolView<'a> {
    utxo_set: &'a UtxoSet,
    entries: &'a HashMap<Hash, MempoolEntry>,
    excluded: &'a HashSet<Hash>,
    height: Natural,
}

impl<'a> UtxoView for MempoolView<'a> {
    fn utxo(&self, outpoint: &OutPoint) -> Option<UTXO> {
        if let Some(utxo) = self.utxo_set.get(outpoint) {
            return Some(utxo.clone());
        }
        if self.excluded.contains(&outpoint.tx_id) {
            return None;
        }
        let entry = self.entries.get(&outpoint.tx_id)?;
        let output = entry.tx.outputs.get(outpoint.index as usize)?;
        Some(UTXO {
            value: output.value,
            locking_condition: output.locking_condition.clone(),
            confirmed_height: self.height,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Mempool {
    policy: MempoolPolicy,
    entries: HashMap<Hash, MempoolEntry>,
    /// Which entry spends each outpoint
    spends: HashMap<OutPoint, Hash>,
    total_size: usize,
    next_sequence: u64,
}

impl Mempool {
    pub fn new(policy: MempoolPolicy) -> Self {
        Mempool {
            policy,
            ..Mempool::default()
        }
    }

    pub fn policy(&self) -> &MempoolPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of serialized sizes
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn contains(&self, tx_id: &Hash) -> bool {
        self.entries.contains_key(tx_id)
    }

    pub fn get(&self, tx_id: &Hash) -> Option<&MempoolEntry> {
        self.entries.get(tx_id)
    }

    /// Entry spending `outpoint`, if any
    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<&Hash> {
        self.spends.get(outpoint)
    }

    /// Entries in admission order
    pub fn entries(&self) -> Vec<&MempoolEntry> {
        let mut entries: Vec<&MempoolEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.sequence);
        entries
    }

    /// Admit: 𝒯𝒳 × ℳ𝒫 × 𝒰𝒮 → {accepted, rejected}
    ///
    /// 1. Reject duplicates and coinbases
    /// 2. Find conflicting entries (same outpoint already spent in the pool);
    ///    the conflicts and their descendants would be evicted
    /// 3. Validate against confirmed outputs plus surviving pool outputs
    /// 4. Require the minimum fee-rate
    /// 5. With conflicts, apply the replacement rules to each one
    /// 6. Make room if the pool is full
    /// 7. Evict, then insert
    pub fn admit(
        &mut self,
        tx: Transaction,
        ledger: &LedgerState,
        now: u64,
    ) -> ValidationResult<Admission> {
        // 1. Duplicates
        let tx_id = calculate_tx_id(&tx);
        if self.entries.contains_key(&tx_id) {
            return Err(RejectReason::AlreadyKnown);
        }
        if is_coinbase(&tx) {
            return Err(RejectReason::CoinbaseOutsideBlock);
        }

        // 2. Conflicts
        let conflicts: HashSet<Hash> = tx
            .inputs
            .iter()
            .filter_map(|input| self.spends.get(&input.prevout).copied())
            .collect();
        let mut evicted = conflicts.clone();
        for conflict in &conflicts {
            evicted.extend(self.descendants(conflict));
        }
        if tx.inputs.iter().any(|input| evicted.contains(&input.prevout.tx_id)) {
            return Err(RejectReason::ReplacementRejected(
                "spends an output of a transaction it replaces".to_string(),
            ));
        }

        // 3. Validation
        let height = ledger.height() + 1;
        let view = MempoolView {
            utxo_set: ledger.utxo_set(),
            entries: &self.entries,
            excluded: &evicted,
            height,
        };
        let fee = validate_transaction(
            &tx,
            &view,
            ledger.oracle(),
            height,
            ledger.params().max_tx_size,
        )?;
        let size = transaction_size(&tx);
        let rate = FeeRate::new(fee, size as u64);

        // 4. Minimum relay fee-rate
        if !rate.meets(self.policy.min_fee_rate_per_kb) {
            return Err(RejectReason::FeeRateTooLow);
        }

        // 5. Replacement
        for conflict in &conflicts {
            self.check_replacement(&tx, rate, conflict)?;
        }

        // 6. Capacity
        let mut capacity_victims = HashSet::new();
        if self.entries.len() - evicted.len() >= self.policy.max_entries {
            let ancestors = self.ancestors_of_inputs(&tx);
            let victim = self
                .entries
                .values()
                .filter(|entry| !evicted.contains(&entry.tx_id))
                .map(|entry| (self.effective_rate_unchecked(&entry.tx_id), entry.tx_id))
                .min();
            match victim {
                Some((victim_rate, victim))
                    if victim_rate < rate && !ancestors.contains(&victim) =>
                {
                    capacity_victims.insert(victim);
                    capacity_victims.extend(self.descendants(&victim));
                }
                _ => return Err(RejectReason::MempoolFull),
            }
        }

        // 7. Apply
        let mut removed: Vec<Hash> = evicted.into_iter().chain(capacity_victims).collect();
        removed.sort();
        removed.dedup();
        for id in &removed {
            self.remove_entry(id);
        }
        let replaceable = signals_replaceable(&tx);
        self.insert_entry(MempoolEntry {
            tx,
            tx_id,
            fee,
            size,
            arrival_time: now,
            replaceable,
            sequence: 0,
        });
        debug!(tx_id = %hex::encode(tx_id), fee, size, evicted = removed.len(), "transaction admitted");

        Ok(Admission {
            tx_id,
            fee,
            evicted: removed,
        })
    }

    /// ReplacementChecks: 𝒯𝒳 × 𝒯𝒳 → {true, false}
    ///
    /// The replacement R may evict original O iff:
    /// 1. O signals replaceability
    /// 2. R spends every input O spends
    /// 3. feeRate(R) > feeRate(O) and feeRate(R) ≥ feeRate(O) × (1 + margin)
    fn check_replacement(&self, tx: &Transaction, rate: FeeRate, original_id: &Hash) -> ValidationResult<()> {
        let original = self.entries.get(original_id).ok_or_else(|| {
            RejectReason::ReplacementRejected("conflicting entry vanished".to_string())
        })?;

        // 1. Replaceability
        if !original.replaceable {
            return Err(RejectReason::ReplacementRejected(format!(
                "{} does not signal replaceability",
                hex::encode(original_id)
            )));
        }

        // 2. Superset of inputs
        let spent: HashSet<OutPoint> = tx.inputs.iter().map(|input| input.prevout).collect();
        if !original.tx.inputs.iter().all(|input| spent.contains(&input.prevout)) {
            return Err(RejectReason::ReplacementRejected(
                "replacement must spend every input of the original".to_string(),
            ));
        }

        // 3. Fee-rate margin
        let original_rate = original.fee_rate();
        if rate <= original_rate || !rate.exceeds_by_margin(&original_rate, self.policy.replacement_margin_percent) {
            return Err(RejectReason::ReplacementRejected(format!(
                "fee-rate {}/kB does not exceed {}/kB by {}%",
                rate.per_kb(),
                original_rate.per_kb(),
                self.policy.replacement_margin_percent
            )));
        }
        Ok(())
    }

    fn insert_entry(&mut self, mut entry: MempoolEntry) {
        entry.sequence = self.next_sequence;
        self.next_sequence += 1;
        for input in &entry.tx.inputs {
            self.spends.insert(input.prevout, entry.tx_id);
        }
        self.total_size += entry.size;
        self.entries.insert(entry.tx_id, entry);
    }

    fn remove_entry(&mut self, tx_id: &Hash) -> Option<MempoolEntry> {
        let entry = self.entries.remove(tx_id)?;
        for input in &entry.tx.inputs {
            if self.spends.get(&input.prevout) == Some(tx_id) {
                self.spends.remove(&input.prevout);
            }
        }
        self.total_size -= entry.size;
        Some(entry)
    }

    /// Remove `tx_id` and everything spending its outputs, transitively.
    /// Returns the removed ids.
    pub fn remove_with_descendants(&mut self, tx_id: &Hash) -> Vec<Hash> {
        if !self.entries.contains_key(tx_id) {
            return Vec::new();
        }
        let mut removed: Vec<Hash> = self.descendants(tx_id).into_iter().collect();
        removed.push(*tx_id);
        for id in &removed {
            self.remove_entry(id);
        }
        removed
    }

    /// In-pool transactions `tx_id` depends on, transitively
    pub fn ancestors(&self, tx_id: &Hash) -> HashSet<Hash> {
        match self.entries.get(tx_id) {
            Some(entry) => self.ancestors_of_inputs(&entry.tx),
            None => HashSet::new(),
        }
    }

    fn ancestors_of_inputs(&self, tx: &Transaction) -> HashSet<Hash> {
        let mut visited = HashSet::new();
        let mut frontier: Vec<Hash> = tx.inputs.iter().map(|input| input.prevout.tx_id).collect();
        while let Some(current) = frontier.pop() {
            let entry = match self.entries.get(&current) {
                Some(entry) => entry,
                None => continue,
            };
            if !visited.insert(current) {
                continue;
            }
            frontier.extend(entry.tx.inputs.iter().map(|input| input.prevout.tx_id));
        }
        visited
    }

    /// In-pool transactions spending outputs of `tx_id`, transitively
    pub fn descendants(&self, tx_id: &Hash) -> HashSet<Hash> {
        let mut visited = HashSet::new();
        let mut frontier = vec![*tx_id];
        while let Some(current) = frontier.pop() {
            let entry = match self.entries.get(&current) {
                Some(entry) => entry,
                None => continue,
            };
            for index in 0..entry.tx.outputs.len() {
                if let Some(child) = self.spends.get(&OutPoint::new(current, index as u32)) {
                    if *child != *tx_id && visited.insert(*child) {
                        frontier.push(*child);
                    }
                }
            }
        }
        visited
    }

    /// EffectiveFeeRate: 𝒯𝒳 → ℚ
    ///
    /// (fee + Σ ancestor fees) / (size + Σ ancestor sizes), over unconfirmed
    /// ancestors only
    pub fn effective_fee_rate(&self, tx_id: &Hash) -> Option<FeeRate> {
        if !self.entries.contains_key(tx_id) {
            return None;
        }
        Some(self.effective_rate_unchecked(tx_id))
    }

    fn effective_rate_unchecked(&self, tx_id: &Hash) -> FeeRate {
        self.package_rate(self.ancestors(tx_id).iter().chain(std::iter::once(tx_id)))
    }

    fn package_rate<'a>(&self, ids: impl Iterator<Item = &'a Hash>) -> FeeRate {
        ids.filter_map(|id| self.entries.get(id))
            .fold(FeeRate::new(0, 0), |acc, entry| {
                FeeRate::new(acc.fee.saturating_add(entry.fee), acc.size + entry.size as u64)
            })
    }

    /// Extra fee a new child of `size` bytes spending `tx_id` must pay for
    /// the package to reach `target`. Zero when the package already meets it.
    pub fn acceleration_fee(&self, tx_id: &Hash, child_size: u64, target: FeeRate) -> Option<u64> {
        let package = self.effective_fee_rate(tx_id)?;
        if target.size == 0 {
            return Some(0);
        }
        let total_size = package.size as u128 + child_size as u128;
        let required = (target.fee as u128 * total_size + target.size as u128 - 1) / target.size as u128;
        let missing = required.saturating_sub(package.fee as u128);
        Some(missing.min(u64::MAX as u128) as u64)
    }

    /// SelectForBlock: ℳ𝒫 × ℕ → 𝒯𝒳*
    ///
    /// 1. Rank entries by effective fee-rate, highest first
    /// 2. For each, form its package: the entry plus every ancestor not yet
    ///    selected, parents before children
    /// 3. Add the package whole; stop at the first one that does not fit
    pub fn select_for_block(&self, max_size: usize) -> Vec<Transaction> {
        let mut ranked: Vec<(FeeRate, u64, Hash)> = self
            .entries
            .values()
            .map(|entry| (self.effective_rate_unchecked(&entry.tx_id), entry.sequence, entry.tx_id))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut included = HashSet::new();
        let mut selected = Vec::new();
        let mut used = 0usize;
        for (_, _, tx_id) in ranked {
            if included.contains(&tx_id) {
                continue;
            }
            let mut package: Vec<&MempoolEntry> = self
                .ancestors(&tx_id)
                .iter()
                .chain(std::iter::once(&tx_id))
                .filter(|id| !included.contains(*id))
                .filter_map(|id| self.entries.get(id))
                .collect();
            package.sort_by_key(|entry| entry.sequence);

            let package_size: usize = package.iter().map(|entry| entry.size).sum();
            if used + package_size > max_size {
                break;
            }
            used += package_size;
            for entry in package {
                included.insert(entry.tx_id);
                selected.push(entry.tx.clone());
            }
        }
        selected
    }

    /// Drop confirmed transactions and everything that conflicts with them.
    /// Returns the ids of conflicting entries that were evicted.
    pub fn remove_for_block(&mut self, block: &Block) -> Vec<Hash> {
        let mut evicted = Vec::new();
        for tx in block.transactions.iter().filter(|tx| !is_coinbase(tx)) {
            let tx_id = calculate_tx_id(tx);
            self.remove_entry(&tx_id);
            for input in &tx.inputs {
                if let Some(conflict) = self.spends.get(&input.prevout).copied() {
                    evicted.extend(self.remove_with_descendants(&conflict));
                }
            }
        }
        evicted
    }

    /// Remove entries older than the expiry window, with their descendants
    pub fn expire(&mut self, now: u64) -> Vec<Hash> {
        let expiry = self.policy.expiry_secs;
        let stale: Vec<Hash> = self
            .entries
            .values()
            .filter(|entry| entry.arrival_time.saturating_add(expiry) < now)
            .map(|entry| entry.tx_id)
            .collect();
        let mut removed = Vec::new();
        for tx_id in stale {
            removed.extend(self.remove_with_descendants(&tx_id));
        }
        removed
    }

    /// Empty the pool, returning entries in admission order
    pub fn drain(&mut self) -> Vec<MempoolEntry> {
        let mut entries: Vec<MempoolEntry> = self.entries.drain().map(|(_, entry)| entry).collect();
        entries.sort_by_key(|entry| entry.sequence);
        self.spends.clear();
        self.total_size = 0;
        entries
    }

    /// Admit each transaction in order, skipping those no longer valid.
    /// Returns how many were admitted.
    pub fn readmit(
        &mut self,
        txs: impl IntoIterator<Item = (Transaction, u64)>,
        ledger: &LedgerState,
    ) -> usize {
        let mut admitted = 0;
        for (tx, arrival_time) in txs {
            match self.admit(tx, ledger, arrival_time) {
                Ok(_) => admitted += 1,
                Err(reason) => debug!(%reason, "transaction not readmitted"),
            }
        }
        admitted
    }
}
