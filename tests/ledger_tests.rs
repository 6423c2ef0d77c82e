//! Ledger-level scenarios: subsidy schedule, value flow and fork choice

mod common;

use common::*;
use utxo_node::*;

#[test]
fn test_rewards_halve_on_schedule() {
    let params = ChainParams {
        halving_interval: 10,
        ..ChainParams::regtest()
    };
    let mut ledger = LedgerState::new(params);
    extend(&mut ledger, 9, p2kh(1));
    assert_eq!(ledger.next_reward(), 50);
    assert_eq!(ledger.blocks_until_halving(), 2);

    extend(&mut ledger, 1, p2kh(1));
    assert_eq!(ledger.next_reward(), 25);

    // Block 11 may not claim the old reward
    let greedy = next_block(&ledger, vec![], p2kh(1), 25);
    match ledger.apply_block(&greedy, NOW) {
        Err(RejectReason::ExcessiveCoinbase { claimed: 50, allowed: 25 }) => {}
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(ledger.height(), 10);

    extend(&mut ledger, 15, p2kh(1));
    assert_eq!(ledger.height(), 25);
    assert_eq!(ledger.minted_supply(), 10 * 50 + 10 * 25 + 5 * 12);
    assert_eq!(ledger.balance(&key_hash(1)), ledger.minted_supply());
    assert_eq!(ledger.next_reward(), 12);
}

#[test]
fn test_payment_round_trip() {
    let mut ledger = LedgerState::new(ChainParams::regtest());
    let funding = extend(&mut ledger, 1, p2kh(1)).remove(0);

    let payment = spend(
        &[coinbase_outpoint(&funding)],
        1,
        vec![(30, p2kh(2)), (15, p2kh(1))],
        SEQ_FINAL,
    );
    let block = next_block(&ledger, vec![payment.clone()], p2kh(3), 5);
    let summary = ledger.apply_block(&block, NOW).unwrap();
    assert_eq!(summary.fees, 5);
    assert_eq!(summary.minted, 50);

    assert_eq!(ledger.balance(&key_hash(1)), 15);
    assert_eq!(ledger.balance(&key_hash(2)), 30);
    assert_eq!(ledger.balance(&key_hash(3)), 55);

    // Key 2 spends onward with a signature of its own
    let onward = spend(&[OutPoint::new(payment.id(), 0)], 2, vec![(29, p2kh(4))], SEQ_FINAL);
    let block = next_block(&ledger, vec![onward], anyone(), 1);
    ledger.apply_block(&block, NOW).unwrap();
    assert_eq!(ledger.balance(&key_hash(2)), 0);
    assert_eq!(ledger.balance(&key_hash(4)), 29);
}

#[test]
fn test_wrong_signer_cannot_spend() {
    let mut ledger = LedgerState::new(ChainParams::regtest());
    let funding = extend(&mut ledger, 1, p2kh(1)).remove(0);
    let theft = spend(&[coinbase_outpoint(&funding)], 2, vec![(50, p2kh(2))], SEQ_FINAL);
    let block = next_block(&ledger, vec![theft], anyone(), 0);
    assert!(ledger.apply_block(&block, NOW).is_err());
    assert_eq!(ledger.height(), 1);
    assert_eq!(ledger.balance(&key_hash(1)), 50);
}

#[test]
fn test_no_double_spend() {
    let mut ledger = ledger_at(1);
    let outpoint = coinbase_outpoint(ledger.tip_block());
    let first = spend_open(&[outpoint], vec![(40, anyone())], SEQ_FINAL);
    let second = spend_open(&[outpoint], vec![(39, p2kh(1))], SEQ_FINAL);

    // Both spends in one block
    let block = next_block(&ledger, vec![first.clone(), second.clone()], anyone(), 21);
    match ledger.apply_block(&block, NOW) {
        Err(RejectReason::InvalidBlockTransaction { index: 2, reason }) => {
            assert_eq!(*reason, RejectReason::MissingInput(outpoint));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(ledger.height(), 1);

    // One spend confirmed, the other in a later block
    let block = next_block(&ledger, vec![first], anyone(), 10);
    ledger.apply_block(&block, NOW).unwrap();
    let block = next_block(&ledger, vec![second], anyone(), 11);
    assert!(matches!(
        ledger.apply_block(&block, NOW),
        Err(RejectReason::InvalidBlockTransaction { index: 1, .. })
    ));
    assert_eq!(ledger.height(), 2);
}

#[test]
fn test_value_is_conserved() {
    let mut ledger = ledger_at(3);
    let inputs: Vec<OutPoint> = (1..=3)
        .map(|height| coinbase_outpoint(ledger.tree().block_at_height(height).unwrap()))
        .collect();
    let merge = spend_open(&inputs, vec![(100, anyone()), (42, p2kh(1))], SEQ_FINAL);
    let split = spend_open(
        &[OutPoint::new(merge.id(), 0)],
        vec![(60, anyone()), (35, anyone())],
        SEQ_FINAL,
    );
    let block = next_block(&ledger, vec![merge, split], anyone(), 13);
    ledger.apply_block(&block, NOW).unwrap();

    assert_eq!(ledger.minted_supply(), 200);
    assert_eq!(ledger.total_unspent(), ledger.minted_supply());
    assert_eq!(ledger.remaining_supply(), ledger.params().max_supply - 200);

    // Outputs exceeding inputs mint nothing
    let inflate = spend_open(&[OutPoint::new(block.transactions[2].id(), 0)], vec![(61, anyone())], SEQ_FINAL);
    let block = next_block(&ledger, vec![inflate], anyone(), 0);
    assert!(ledger.apply_block(&block, NOW).is_err());
    assert_eq!(ledger.total_unspent(), 200);
}

#[test]
fn test_best_chain_wins_in_either_arrival_order() {
    let base = ledger_at(2);
    let short = fork_from(&base, 2, 2, 1);
    let long = fork_from(&base, 2, 3, 2);

    let mut first = base.clone();
    for block in short.iter().chain(long.iter()) {
        first.accept_block(block.clone(), NOW).unwrap();
    }
    let mut second = base.clone();
    for block in long.iter().chain(short.iter()) {
        second.accept_block(block.clone(), NOW).unwrap();
    }

    let expected = long.last().unwrap().hash;
    assert_eq!(first.tip().hash, expected);
    assert_eq!(second.tip().hash, expected);
    assert_eq!(first.height(), 5);
    assert_eq!(first.utxo_set(), second.utxo_set());
    assert_eq!(first.minted_supply(), second.minted_supply());
}

#[test]
fn test_equal_work_keeps_first_seen() {
    let base = ledger_at(1);
    let ours = fork_from(&base, 1, 2, 1);
    let theirs = fork_from(&base, 1, 2, 2);

    let mut ledger = base.clone();
    for block in &ours {
        ledger.accept_block(block.clone(), NOW).unwrap();
    }
    for block in &theirs {
        assert!(matches!(
            ledger.accept_block(block.clone(), NOW).unwrap(),
            AcceptOutcome::SideBranch
        ));
    }
    assert_eq!(ledger.tip().hash, ours[1].hash);

    // One more block on their branch overtakes
    let overtaking = block_on(&theirs[1], ledger.params(), vec![], anyone(), 0, 2);
    match ledger.accept_block(overtaking.clone(), NOW).unwrap() {
        AcceptOutcome::Reorganized(outcome) => {
            assert_eq!(outcome.depth(), 2);
            assert_eq!(outcome.fork_height, 1);
            assert!(outcome.failed.is_none());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(ledger.tip().hash, overtaking.hash);
    assert_eq!(ledger.total_unspent(), ledger.minted_supply());
}

#[test]
fn test_block_with_unknown_parent_is_not_stored() {
    let mut ledger = ledger_at(1);
    let detached = fork_from(&ledger_at(3), 2, 1, 9).remove(0);
    assert!(matches!(
        ledger.accept_block(detached, NOW),
        Err(RejectReason::UnknownParent)
    ));
    assert_eq!(ledger.tree().len(), 2);
}
