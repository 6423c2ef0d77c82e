//! Transaction serialization and validation

use crate::constants::*;
use crate::error::{RejectReason, ValidationResult};
use crate::script::{sha256d, PredicateOracle, TxContext};
use crate::types::*;
use std::collections::{HashMap, HashSet};

/// Read access to unspent outputs
pub trait UtxoView {
    fn utxo(&self, outpoint: &OutPoint) -> Option<UTXO>;
}

impl UtxoView for UtxoSet {
    fn utxo(&self, outpoint: &OutPoint) -> Option<UTXO> {
        self.get(outpoint).cloned()
    }
}

/// The UTXO set as it would exist after applying some transactions on top
/// of a base set, without touching the base
pub struct UtxoOverlay<'a> {
    base: &'a UtxoSet,
    created: HashMap<OutPoint, UTXO>,
    spent: HashSet<OutPoint>,
}

impl<'a> UtxoOverlay<'a> {
    pub fn new(base: &'a UtxoSet) -> Self {
        UtxoOverlay {
            base,
            created: HashMap::new(),
            spent: HashSet::new(),
        }
    }

    /// Spend the inputs of `tx` and add its outputs, confirmed at `height`
    pub fn apply(&mut self, tx: &Transaction, height: Natural) {
        if !is_coinbase(tx) {
            for input in &tx.inputs {
                if self.created.remove(&input.prevout).is_none() {
                    self.spent.insert(input.prevout);
                }
            }
        }
        let tx_id = calculate_tx_id(tx);
        for (index, output) in tx.outputs.iter().enumerate() {
            self.created.insert(
                OutPoint::new(tx_id, index as u32),
                UTXO {
                    value: output.value,
                    locking_condition: output.locking_condition.clone(),
                    confirmed_height: height,
                },
            );
        }
    }
}

impl<'a> UtxoView for UtxoOverlay<'a> {
    fn utxo(&self, outpoint: &OutPoint) -> Option<UTXO> {
        if let Some(utxo) = self.created.get(outpoint) {
            return Some(utxo.clone());
        }
        if self.spent.contains(outpoint) {
            return None;
        }
        self.base.get(outpoint).cloned()
    }
}

/// CheckTransaction: 𝒯𝒳 → {valid, invalid}
///
/// Context-free shape checks. A transaction tx = (v, ins, outs, lt) is
/// valid if and only if:
/// 1. |ins| > 0 ∧ |outs| > 0
/// 2. |ins| ≤ M_max_inputs ∧ |outs| ≤ M_max_outputs
/// 3. Σₒ o.value does not overflow
/// 4. no outpoint is spent twice
/// 5. the null prevout appears only as the single input of a coinbase
/// 6. |tx| ≤ max_tx_size
pub fn check_transaction(tx: &Transaction, max_tx_size: usize) -> ValidationResult<()> {
    // 1. Check inputs and outputs are not empty
    if tx.inputs.is_empty() || tx.outputs.is_empty() {
        return Err(RejectReason::MalformedTransaction("empty inputs or outputs".to_string()));
    }

    // 2. Count limits
    if tx.inputs.len() > MAX_INPUTS {
        return Err(RejectReason::MalformedTransaction(format!(
            "too many inputs: {}",
            tx.inputs.len()
        )));
    }
    if tx.outputs.len() > MAX_OUTPUTS {
        return Err(RejectReason::MalformedTransaction(format!(
            "too many outputs: {}",
            tx.outputs.len()
        )));
    }

    // 3. Output value sum
    total_output_value(tx)?;

    // 4. Duplicate inputs
    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(RejectReason::MalformedTransaction(format!(
                "input {} spent twice",
                input.prevout
            )));
        }
    }

    // 5. Coinbase shape
    if is_coinbase(tx) {
        if !matches!(tx.inputs[0].unlock_proof, UnlockProof::Coinbase { .. }) {
            return Err(RejectReason::MalformedTransaction(
                "coinbase input without coinbase proof".to_string(),
            ));
        }
    } else {
        for input in &tx.inputs {
            if input.prevout.is_null() || matches!(input.unlock_proof, UnlockProof::Coinbase { .. }) {
                return Err(RejectReason::MalformedTransaction(
                    "coinbase input in regular transaction".to_string(),
                ));
            }
        }
    }

    // 6. Size limit
    let size = transaction_size(tx);
    if size > max_tx_size {
        return Err(RejectReason::TransactionTooLarge { size, max: max_tx_size });
    }

    Ok(())
}

/// ValidateTransaction: 𝒯𝒳 × 𝒰𝒮 → ℕ ∪ {invalid}
///
/// For non-coinbase transaction tx against a UTXO view us:
/// 1. CheckTransaction(tx)
/// 2. ∀i ∈ ins: us(i.prevout) exists
/// 3. ∀i ∈ ins: Verify(i.proof, us(i.prevout).condition)
/// 4. Let fee = Σᵢ us(i.prevout).value - Σₒ o.value
/// 5. Return fee if fee ≥ 0
pub fn validate_transaction(
    tx: &Transaction,
    view: &dyn UtxoView,
    oracle: &dyn PredicateOracle,
    spending_height: Natural,
    max_tx_size: usize,
) -> ValidationResult<u64> {
    if is_coinbase(tx) {
        return Err(RejectReason::CoinbaseOutsideBlock);
    }

    // 1. Shape
    check_transaction(tx, max_tx_size)?;

    let mut input_total = 0u64;
    for (index, input) in tx.inputs.iter().enumerate() {
        // 2. Resolve
        let utxo = view
            .utxo(&input.prevout)
            .ok_or(RejectReason::MissingInput(input.prevout))?;

        // 3. Unlock
        let ctx = TxContext { tx, input_index: index, spending_height };
        if !oracle.verify(&input.unlock_proof, &utxo.locking_condition, &ctx) {
            return Err(RejectReason::BadUnlockProof(index));
        }

        input_total = input_total
            .checked_add(utxo.value)
            .ok_or(RejectReason::ValueOverflow)?;
    }

    // 4-5. Fee
    let output_total = total_output_value(tx)?;
    if output_total > input_total {
        return Err(RejectReason::InsufficientInputValue {
            input: input_total,
            output: output_total,
        });
    }
    Ok(input_total - output_total)
}

/// Check if transaction is coinbase
pub fn is_coinbase(tx: &Transaction) -> bool {
    tx.inputs.len() == 1 && tx.inputs[0].prevout.is_null()
}

/// Whether any input signals non-final sequencing
pub fn signals_replaceable(tx: &Transaction) -> bool {
    tx.inputs.iter().any(|input| input.sequence < SEQUENCE_RBF_THRESHOLD)
}

pub fn total_output_value(tx: &Transaction) -> ValidationResult<u64> {
    tx.outputs.iter().try_fold(0u64, |acc, output| {
        acc.checked_add(output.value).ok_or(RejectReason::ValueOverflow)
    })
}

// ============================================================================
// CANONICAL SERIALIZATION
// ============================================================================

/// Transaction id: sha256d of the canonical serialization
pub fn calculate_tx_id(tx: &Transaction) -> Hash {
    sha256d(&serialize_transaction(tx))
}

/// Serialized size in bytes, the denominator of every fee-rate
pub fn transaction_size(tx: &Transaction) -> usize {
    serialize_transaction(tx).len()
}

pub fn serialize_transaction(tx: &Transaction) -> Vec<u8> {
    serialize_inner(tx, None)
}

/// Digest signed by input `input_index`: the transaction with every unlock
/// proof blanked, followed by the input index
pub fn signature_hash(tx: &Transaction, input_index: usize) -> Hash {
    sha256d(&serialize_inner(tx, Some(input_index)))
}

fn serialize_inner(tx: &Transaction, signing_input: Option<usize>) -> Vec<u8> {
    let mut data = Vec::new();

    // Version (4 bytes, little-endian)
    data.extend_from_slice(&tx.version.to_le_bytes());

    // Inputs
    data.extend_from_slice(&encode_varint(tx.inputs.len() as u64));
    for input in &tx.inputs {
        data.extend_from_slice(&input.prevout.tx_id);
        data.extend_from_slice(&input.prevout.index.to_le_bytes());
        if signing_input.is_some() {
            data.extend_from_slice(&encode_bytes(&encode_unlock_proof(&UnlockProof::Empty)));
        } else {
            data.extend_from_slice(&encode_bytes(&encode_unlock_proof(&input.unlock_proof)));
        }
        data.extend_from_slice(&input.sequence.to_le_bytes());
    }

    // Outputs
    data.extend_from_slice(&encode_varint(tx.outputs.len() as u64));
    for output in &tx.outputs {
        data.extend_from_slice(&output.value.to_le_bytes());
        data.extend_from_slice(&encode_bytes(&encode_locking_condition(&output.locking_condition)));
    }

    // Lock time (4 bytes, little-endian)
    data.extend_from_slice(&tx.lock_time.to_le_bytes());

    if let Some(index) = signing_input {
        data.extend_from_slice(&(index as u32).to_le_bytes());
    }

    data
}

/// Tagged binary form of a locking condition
pub fn encode_locking_condition(condition: &LockingCondition) -> Vec<u8> {
    let mut data = Vec::new();
    match condition {
        LockingCondition::AnyoneCanSpend => data.push(0),
        LockingCondition::PayToKeyHash { key_hash } => {
            data.push(1);
            data.extend_from_slice(key_hash);
        }
        LockingCondition::PayToScriptHash { script_hash } => {
            data.push(2);
            data.extend_from_slice(script_hash);
        }
        LockingCondition::Multisig { threshold, pubkeys } => {
            data.push(3);
            data.push(*threshold);
            data.extend_from_slice(&encode_varint(pubkeys.len() as u64));
            for pubkey in pubkeys {
                data.extend_from_slice(&encode_bytes(pubkey));
            }
        }
        LockingCondition::HashTimeLock { hash_lock, recipient, refund, timeout_height } => {
            data.push(4);
            data.extend_from_slice(hash_lock);
            data.extend_from_slice(recipient);
            data.extend_from_slice(refund);
            data.extend_from_slice(&timeout_height.to_le_bytes());
        }
    }
    data
}

fn encode_unlock_proof(proof: &UnlockProof) -> Vec<u8> {
    let mut data = Vec::new();
    match proof {
        UnlockProof::Coinbase { height, extra } => {
            data.push(0);
            data.extend_from_slice(&height.to_le_bytes());
            data.extend_from_slice(&encode_bytes(extra));
        }
        UnlockProof::Empty => data.push(1),
        UnlockProof::Signature { pubkey, signature } => {
            data.push(2);
            data.extend_from_slice(&encode_bytes(pubkey));
            data.extend_from_slice(&encode_bytes(signature));
        }
        UnlockProof::MultiSignature { signatures } => {
            data.push(3);
            data.extend_from_slice(&encode_varint(signatures.len() as u64));
            for signature in signatures {
                data.extend_from_slice(&encode_bytes(signature));
            }
        }
        UnlockProof::ScriptHash { redeem, inner } => {
            data.push(4);
            data.extend_from_slice(&encode_bytes(&encode_locking_condition(redeem)));
            data.extend_from_slice(&encode_bytes(&encode_unlock_proof(inner)));
        }
        UnlockProof::Preimage { preimage, pubkey, signature } => {
            data.push(5);
            data.extend_from_slice(&encode_bytes(preimage));
            data.extend_from_slice(&encode_bytes(pubkey));
            data.extend_from_slice(&encode_bytes(signature));
        }
        UnlockProof::Refund { pubkey, signature } => {
            data.push(6);
            data.extend_from_slice(&encode_bytes(pubkey));
            data.extend_from_slice(&encode_bytes(signature));
        }
    }
    data
}

/// Length-prefixed byte string
fn encode_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut data = encode_varint(bytes.len() as u64);
    data.extend_from_slice(bytes);
    data
}

/// Encode a number as a varint
pub fn encode_varint(value: u64) -> Vec<u8> {
    if value < 0xfd {
        vec![value as u8]
    } else if value <= 0xffff {
        let mut result = vec![0xfd];
        result.extend_from_slice(&(value as u16).to_le_bytes());
        result
    } else if value <= 0xffffffff {
        let mut result = vec![0xfe];
        result.extend_from_slice(&(value as u32).to_le_bytes());
        result
    } else {
        let mut result = vec![0xff];
        result.extend_from_slice(&value.to_le_bytes());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::StandardOracle;

    fn output(value: u64) -> TransactionOutput {
        TransactionOutput {
            value,
            locking_condition: LockingCondition::AnyoneCanSpend,
        }
    }

    fn spend(prevout: OutPoint, outputs: Vec<TransactionOutput>) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout,
                unlock_proof: UnlockProof::Empty,
                sequence: SEQUENCE_FINAL,
            }],
            outputs,
            lock_time: 0,
        }
    }

    fn utxo_set_with(outpoint: OutPoint, value: u64) -> UtxoSet {
        let mut set = UtxoSet::new();
        set.insert(
            outpoint,
            UTXO {
                value,
                locking_condition: LockingCondition::AnyoneCanSpend,
                confirmed_height: 1,
            },
        );
        set
    }

    #[test]
    fn test_check_transaction_valid() {
        let tx = spend(OutPoint::new([1; 32], 0), vec![output(5)]);
        assert!(check_transaction(&tx, MAX_TX_SIZE).is_ok());
    }

    #[test]
    fn test_check_transaction_empty_outputs() {
        let tx = spend(OutPoint::new([1; 32], 0), vec![]);
        assert!(matches!(
            check_transaction(&tx, MAX_TX_SIZE),
            Err(RejectReason::MalformedTransaction(_))
        ));
    }

    #[test]
    fn test_check_transaction_duplicate_inputs() {
        let mut tx = spend(OutPoint::new([1; 32], 0), vec![output(5)]);
        tx.inputs.push(tx.inputs[0].clone());
        assert!(matches!(
            check_transaction(&tx, MAX_TX_SIZE),
            Err(RejectReason::MalformedTransaction(_))
        ));
    }

    #[test]
    fn test_check_transaction_output_overflow() {
        let tx = spend(OutPoint::new([1; 32], 0), vec![output(u64::MAX), output(1)]);
        assert_eq!(check_transaction(&tx, MAX_TX_SIZE), Err(RejectReason::ValueOverflow));
    }

    #[test]
    fn test_check_transaction_size_limit() {
        let tx = spend(OutPoint::new([1; 32], 0), vec![output(5)]);
        assert!(matches!(
            check_transaction(&tx, 10),
            Err(RejectReason::TransactionTooLarge { max: 10, .. })
        ));
    }

    #[test]
    fn test_validate_transaction_fee() {
        let prevout = OutPoint::new([1; 32], 0);
        let set = utxo_set_with(prevout, 20);
        let tx = spend(prevout, vec![output(15)]);
        let fee = validate_transaction(&tx, &set, &StandardOracle::new(), 2, MAX_TX_SIZE).unwrap();
        assert_eq!(fee, 5);
    }

    #[test]
    fn test_validate_transaction_missing_input() {
        let set = UtxoSet::new();
        let prevout = OutPoint::new([1; 32], 0);
        let tx = spend(prevout, vec![output(15)]);
        assert_eq!(
            validate_transaction(&tx, &set, &StandardOracle::new(), 2, MAX_TX_SIZE),
            Err(RejectReason::MissingInput(prevout))
        );
    }

    #[test]
    fn test_validate_transaction_negative_fee() {
        let prevout = OutPoint::new([1; 32], 0);
        let set = utxo_set_with(prevout, 10);
        let tx = spend(prevout, vec![output(11)]);
        assert_eq!(
            validate_transaction(&tx, &set, &StandardOracle::new(), 2, MAX_TX_SIZE),
            Err(RejectReason::InsufficientInputValue { input: 10, output: 11 })
        );
    }

    #[test]
    fn test_validate_transaction_rejects_coinbase() {
        let mut tx = spend(OutPoint::null(), vec![output(50)]);
        tx.inputs[0].unlock_proof = UnlockProof::Coinbase { height: 1, extra: vec![] };
        assert_eq!(
            validate_transaction(&tx, &UtxoSet::new(), &StandardOracle::new(), 1, MAX_TX_SIZE),
            Err(RejectReason::CoinbaseOutsideBlock)
        );
    }

    #[test]
    fn test_overlay_chains_outputs_and_hides_spent() {
        let prevout = OutPoint::new([1; 32], 0);
        let set = utxo_set_with(prevout, 20);
        let parent = spend(prevout, vec![output(18)]);
        let child_prevout = OutPoint::new(calculate_tx_id(&parent), 0);

        let mut overlay = UtxoOverlay::new(&set);
        overlay.apply(&parent, 3);
        assert!(overlay.utxo(&prevout).is_none());
        assert_eq!(overlay.utxo(&child_prevout).map(|u| u.value), Some(18));
        // Base untouched
        assert!(set.contains_key(&prevout));

        let child = spend(child_prevout, vec![output(17)]);
        overlay.apply(&child, 3);
        assert!(overlay.utxo(&child_prevout).is_none());
    }

    #[test]
    fn test_signature_hash_blanks_unlock_proofs() {
        let prevout = OutPoint::new([1; 32], 0);
        let a = spend(prevout, vec![output(1)]);
        let mut b = a.clone();
        b.inputs[0].unlock_proof = UnlockProof::Signature { pubkey: vec![2; 33], signature: vec![1; 70] };
        assert_ne!(calculate_tx_id(&a), calculate_tx_id(&b));
        assert_eq!(signature_hash(&a, 0), signature_hash(&b, 0));
        assert_ne!(signature_hash(&a, 0), signature_hash(&a, 1));
    }

    #[test]
    fn test_signals_replaceable() {
        let mut tx = spend(OutPoint::new([1; 32], 0), vec![output(1)]);
        assert!(!signals_replaceable(&tx));
        tx.inputs[0].sequence = SEQUENCE_RBF_THRESHOLD;
        assert!(!signals_replaceable(&tx));
        tx.inputs[0].sequence = 0;
        assert!(signals_replaceable(&tx));
    }

    #[test]
    fn test_encode_varint() {
        assert_eq!(encode_varint(0xfc), vec![0xfc]);
        assert_eq!(encode_varint(0xfd), vec![0xfd, 0xfd, 0x00]);
        assert_eq!(encode_varint(0x10000), vec![0xfe, 0x00, 0x00, 0x01, 0x00]);
    }
}
