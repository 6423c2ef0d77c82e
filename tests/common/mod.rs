//! Shared builders for integration tests
#![allow(dead_code)]

use secp256k1::SecretKey;
use std::future::Future;
use std::time::Duration;
use utxo_node::block::{calculate_block_hash, calculate_merkle_root};
use utxo_node::economic::nominal_reward;
use utxo_node::mining::create_coinbase_transaction;
use utxo_node::pow::check_proof_of_work;
use utxo_node::script::{key_hash_for, sign_input};
use utxo_node::*;

/// Clock for ledger-level tests; far enough past genesis that test chains
/// never run into the future-drift limit
pub const NOW: u64 = constants::GENESIS_TIMESTAMP + 1_000_000;
pub const SEQ_FINAL: u32 = constants::SEQUENCE_FINAL;
pub const SEQ_RBF: u32 = 0;

pub fn key(n: u8) -> SecretKey {
    SecretKey::from_slice(&[n; 32]).unwrap()
}

pub fn key_hash(n: u8) -> KeyHash {
    key_hash_for(&key(n))
}

pub fn p2kh(n: u8) -> LockingCondition {
    LockingCondition::PayToKeyHash { key_hash: key_hash(n) }
}

pub fn anyone() -> LockingCondition {
    LockingCondition::AnyoneCanSpend
}

fn unsigned(inputs: &[OutPoint], outputs: Vec<(u64, LockingCondition)>, sequence: u32) -> Transaction {
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

/// Spend key-hash outputs, every input signed by `signer`
pub fn spend(inputs: &[OutPoint], signer: u8, outputs: Vec<(u64, LockingCondition)>, sequence: u32) -> Transaction {
    let mut tx = unsigned(inputs, outputs, sequence);
    for index in 0..tx.inputs.len() {
        tx.inputs[index].unlock_proof = sign_input(&tx, index, &key(signer));
    }
    tx
}

/// Spend anyone-can-spend outputs
pub fn spend_open(inputs: &[OutPoint], outputs: Vec<(u64, LockingCondition)>, sequence: u32) -> Transaction {
    unsigned(inputs, outputs, sequence)
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

/// Block on `parent` claiming the nominal reward plus `fees`; `salt` keeps
/// sibling blocks distinct
pub fn block_on(
    parent: &Block,
    params: &ChainParams,
    transactions: Vec<Transaction>,
    recipient: LockingCondition,
    fees: u64,
    salt: u8,
) -> Block {
    let height = parent.header.height + 1;
    let reward = nominal_reward(height, params);
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

/// Block extending the ledger's tip
pub fn next_block(
    ledger: &LedgerState,
    transactions: Vec<Transaction>,
    recipient: LockingCondition,
    fees: u64,
) -> Block {
    block_on(ledger.tip_block(), ledger.params(), transactions, recipient, fees, 0)
}

/// Regtest ledger with `height` empty blocks paying anyone-can-spend
pub fn ledger_at(height: u64) -> LedgerState {
    let mut ledger = LedgerState::new(ChainParams::regtest());
    extend(&mut ledger, height, anyone());
    ledger
}

/// Append `count` empty blocks paying `recipient`, returning them
pub fn extend(ledger: &mut LedgerState, count: u64, recipient: LockingCondition) -> Vec<Block> {
    let mut blocks = Vec::new();
    for _ in 0..count {
        let block = next_block(ledger, vec![], recipient.clone(), 0);
        ledger.apply_block(&block, NOW).unwrap();
        blocks.push(block);
    }
    blocks
}

/// Blocks forking off `ledger`'s chain at `fork_height`, built without
/// touching the ledger
pub fn fork_from(ledger: &LedgerState, fork_height: u64, count: u64, salt: u8) -> Vec<Block> {
    let mut parent = ledger.tree().block_at_height(fork_height).unwrap().clone();
    let mut blocks = Vec::new();
    for _ in 0..count {
        let block = block_on(&parent, ledger.params(), vec![], anyone(), 0, salt);
        parent = block.clone();
        blocks.push(block);
    }
    blocks
}

pub fn spawn_node(ledger: LedgerState) -> NodeHandle {
    let (handle, _) = Node::new(ledger, Mempool::new(MempoolPolicy::default())).spawn();
    handle
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}
