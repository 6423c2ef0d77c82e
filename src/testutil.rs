//! Shared builders for unit tests

use crate::block::{calculate_block_hash, calculate_merkle_root};
use crate::constants::{GENESIS_TIMESTAMP, SEQUENCE_FINAL};
use crate::economic::nominal_reward;
use crate::ledger::LedgerState;
use crate::mining::create_coinbase_transaction;
use crate::params::ChainParams;
use crate::pow::check_proof_of_work;
use crate::script::sign_input;
use crate::types::*;
use secp256k1::SecretKey;

pub use crate::script::key_hash_for;

/// Local clock for tests: far enough past genesis that test chains never
/// run into the future-drift limit
pub const NOW: u64 = GENESIS_TIMESTAMP + 1_000_000;
pub const SEQ_FINAL: u32 = SEQUENCE_FINAL;
pub const SEQ_RBF: u32 = 0;

pub fn key(n: u8) -> SecretKey {
    SecretKey::from_slice(&[n; 32]).unwrap()
}

pub fn p2kh(secret_key: &SecretKey) -> LockingCondition {
    LockingCondition::PayToKeyHash {
        key_hash: key_hash_for(secret_key),
    }
}

pub fn anyone() -> LockingCondition {
    LockingCondition::AnyoneCanSpend
}

/// Transaction spending key-hash outputs, each input signed by its key
pub fn spend(
    inputs: &[(OutPoint, &SecretKey)],
    outputs: Vec<(u64, LockingCondition)>,
    sequence: u32,
) -> Transaction {
    let mut tx = Transaction {
        version: 1,
        inputs: inputs
            .iter()
            .map(|(prevout, _)| TransactionInput {
                prevout: *prevout,
                unlock_proof: UnlockProof::Empty,
                sequence,
            })
            .collect(),
        outputs: outputs
            .into_iter()
            .map(|(value, locking_condition)| TransactionOutput { value, locking_condition })
            .collect(),
        lock_time: 0,
    };
    for (index, (_, secret_key)) in inputs.iter().enumerate() {
        tx.inputs[index].unlock_proof = sign_input(&tx, index, secret_key);
    }
    tx
}

/// Transaction spending anyone-can-spend outputs
pub fn spend_open(inputs: &[OutPoint], outputs: Vec<(u64, LockingCondition)>, sequence: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: inputs
            .iter()
            .map(|prevout| TransactionInput {
                prevout: *prevout,
                unlock_proof: UnlockProof::Empty,
                sequence,
            })
            .collect(),
        outputs: outputs
            .into_iter()
            .map(|(value, locking_condition)| TransactionOutput { value, locking_condition })
            .collect(),
        lock_time: 0,
    }
}

pub fn coinbase_outpoint(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].id(), 0)
}

pub fn mine(mut header: BlockHeader, transactions: Vec<Transaction>) -> Block {
    header.merkle_root = calculate_merkle_root(&transactions);
    loop {
        let hash = calculate_block_hash(&header);
        if check_proof_of_work(&hash, header.difficulty_target).is_ok() {
            return Block { header, hash, transactions };
        }
        header.nonce += 1;
    }
}

/// Block on an arbitrary parent under regtest parameters. The coinbase
/// claims the nominal reward plus `fees`; `salt` keeps sibling blocks
/// distinct.
pub fn block_on(
    parent: &Block,
    transactions: Vec<Transaction>,
    recipient: LockingCondition,
    fees: u64,
    salt: u8,
) -> Block {
    let height = parent.header.height + 1;
    let reward = nominal_reward(height, &ChainParams::regtest());
    let mut txs = vec![create_coinbase_transaction(height, reward + fees, recipient, vec![salt])];
    txs.extend(transactions);
    let header = BlockHeader {
        version: 1,
        height,
        previous_hash: parent.hash,
        merkle_root: ZERO_HASH,
        timestamp: parent.header.timestamp + 600,
        difficulty_target: parent.header.difficulty_target,
        nonce: 0,
    };
    mine(header, txs)
}

/// Block extending the ledger's tip with the target and reward it requires
pub fn next_block(
    ledger: &LedgerState,
    transactions: Vec<Transaction>,
    recipient: LockingCondition,
    fees: u64,
) -> Block {
    let tip = ledger.tip_block();
    let height = tip.header.height + 1;
    let mut txs = vec![create_coinbase_transaction(
        height,
        ledger.next_reward() + fees,
        recipient,
        b"next".to_vec(),
    )];
    txs.extend(transactions);
    let header = BlockHeader {
        version: 1,
        height,
        previous_hash: tip.hash,
        merkle_root: ZERO_HASH,
        timestamp: tip.header.timestamp + 600,
        difficulty_target: ledger.required_target(&tip.hash).unwrap(),
        nonce: 0,
    };
    mine(header, txs)
}
