//! Block hashing, Merkle commitment and block validation

use crate::economic::current_reward;
use crate::error::{RejectReason, ValidationResult};
use crate::params::ChainParams;
use crate::pow::check_proof_of_work;
use crate::script::{sha256d, PredicateOracle};
use crate::transaction::*;
use crate::types::*;

/// Everything block validation needs besides the block, its predecessor
/// and the UTXO set
pub struct ValidationContext<'a> {
    pub params: &'a ChainParams,
    pub oracle: &'a dyn PredicateOracle,
    /// Local clock, Unix seconds
    pub now: u64,
    /// Compact target the candidate must carry
    pub required_target: u32,
    /// Supply minted by the chain the candidate extends
    pub minted_supply: u64,
}

/// Value flows of a valid block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSummary {
    pub fees: u64,
    pub reward: u64,
    /// Sum of coinbase outputs
    pub claimed: u64,
    /// New supply created: claimed - fees
    pub minted: u64,
}

/// ValidateBlock: ℬ × ℬ × 𝒰𝒮 → {valid, invalid}
///
/// Fail-fast, in order:
/// 1. candidate.height = predecessor.height + 1
/// 2. candidate.previousHash = predecessor.hash
/// 3. BlockHash(candidate.header) = candidate.hash
/// 4. candidate.hash < ExpandTarget(candidate.target), and the target is the
///    one the chain requires at this height
/// 5. predecessor.timestamp ≤ candidate.timestamp ≤ now + drift
/// 6. MerkleRoot(candidate.transactions) = candidate.merkleRoot
/// 7. |candidate| ≤ maxBlockSize
/// 8. every transaction validates against the UTXO set as updated by the
///    transactions before it in the same block
pub fn validate_block(
    candidate: &Block,
    predecessor: &Block,
    utxo_set: &UtxoSet,
    ctx: &ValidationContext<'_>,
) -> ValidationResult<BlockSummary> {
    validate_block_header(candidate, predecessor, ctx)?;
    validate_block_transactions(candidate, utxo_set, ctx)
}

/// Checks 1 through 7 of [`validate_block`]: everything that does not need
/// the UTXO set
pub fn validate_block_header(
    candidate: &Block,
    predecessor: &Block,
    ctx: &ValidationContext<'_>,
) -> ValidationResult<()> {
    let header = &candidate.header;

    // 1. Height
    let expected = predecessor.header.height + 1;
    if header.height != expected {
        return Err(RejectReason::BadHeight { expected, got: header.height });
    }

    // 2. Linkage
    if header.previous_hash != predecessor.hash {
        return Err(RejectReason::BadPreviousHash);
    }

    // 3. Hash commitment
    if calculate_block_hash(header) != candidate.hash {
        return Err(RejectReason::BadBlockHash);
    }

    // 4. Proof of work
    check_proof_of_work(&candidate.hash, header.difficulty_target)?;
    if header.difficulty_target != ctx.required_target {
        return Err(RejectReason::BadDifficulty(format!(
            "expected target {:#010x}, got {:#010x}",
            ctx.required_target, header.difficulty_target
        )));
    }

    // 5. Timestamp window
    let max_drift = ctx.params.max_future_drift;
    if header.timestamp > ctx.now.saturating_add(max_drift) {
        return Err(RejectReason::TimestampTooNew {
            timestamp: header.timestamp,
            max_drift,
        });
    }
    if header.timestamp < predecessor.header.timestamp {
        return Err(RejectReason::TimestampTooOld {
            timestamp: header.timestamp,
            previous: predecessor.header.timestamp,
        });
    }

    // 6. Merkle commitment
    if calculate_merkle_root(&candidate.transactions) != header.merkle_root {
        return Err(RejectReason::BadMerkleRoot);
    }

    // 7. Size
    let size = block_size(candidate);
    if size > ctx.params.max_block_size {
        return Err(RejectReason::BlockTooLarge {
            size,
            max: ctx.params.max_block_size,
        });
    }

    Ok(())
}

/// Check 8 of [`validate_block`], plus the coinbase rules:
/// - the first transaction, and only the first, is a coinbase
/// - its proof commits to the block height
/// - fees ≤ Σ coinbase outputs ≤ reward + fees
pub fn validate_block_transactions(
    candidate: &Block,
    utxo_set: &UtxoSet,
    ctx: &ValidationContext<'_>,
) -> ValidationResult<BlockSummary> {
    let height = candidate.header.height;
    let coinbase = candidate
        .transactions
        .first()
        .ok_or_else(|| RejectReason::BadCoinbase("block has no transactions".to_string()))?;

    if !is_coinbase(coinbase) {
        return Err(RejectReason::BadCoinbase(
            "first transaction is not a coinbase".to_string(),
        ));
    }
    check_transaction(coinbase, ctx.params.max_tx_size)
        .map_err(|reason| RejectReason::InvalidBlockTransaction { index: 0, reason: Box::new(reason) })?;
    match &coinbase.inputs[0].unlock_proof {
        UnlockProof::Coinbase { height: committed, .. } if *committed == height => {}
        _ => {
            return Err(RejectReason::BadCoinbase(
                "coinbase does not commit to block height".to_string(),
            ))
        }
    }

    let mut view = UtxoOverlay::new(utxo_set);
    view.apply(coinbase, height);

    let mut fees: u64 = 0;
    for (index, tx) in candidate.transactions.iter().enumerate().skip(1) {
        if is_coinbase(tx) {
            return Err(RejectReason::BadCoinbase(format!(
                "transaction {} is a second coinbase",
                index
            )));
        }
        let fee = validate_transaction(tx, &view, ctx.oracle, height, ctx.params.max_tx_size)
            .map_err(|reason| RejectReason::InvalidBlockTransaction { index, reason: Box::new(reason) })?;
        fees = fees.checked_add(fee).ok_or(RejectReason::ValueOverflow)?;
        view.apply(tx, height);
    }

    let reward = current_reward(height, ctx.minted_supply, ctx.params);
    let allowed = reward.checked_add(fees).ok_or(RejectReason::ValueOverflow)?;
    let claimed = total_output_value(coinbase)?;
    if claimed > allowed {
        return Err(RejectReason::ExcessiveCoinbase { claimed, allowed });
    }
    if claimed < fees {
        return Err(RejectReason::BadCoinbase(format!(
            "coinbase claims {} but transactions pay {} in fees",
            claimed, fees
        )));
    }

    Ok(BlockSummary {
        fees,
        reward,
        claimed,
        minted: claimed - fees,
    })
}

/// Genesis block: a fixed, rewardless coinbase derived from the parameters
pub fn genesis_block(params: &ChainParams) -> Block {
    let coinbase = Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint::null(),
            unlock_proof: UnlockProof::Coinbase {
                height: 0,
                extra: b"genesis".to_vec(),
            },
            sequence: crate::constants::SEQUENCE_FINAL,
        }],
        outputs: vec![TransactionOutput {
            value: 0,
            locking_condition: LockingCondition::AnyoneCanSpend,
        }],
        lock_time: 0,
    };
    let transactions = vec![coinbase];
    let header = BlockHeader {
        version: 1,
        height: 0,
        previous_hash: ZERO_HASH,
        merkle_root: calculate_merkle_root(&transactions),
        timestamp: params.genesis_timestamp,
        difficulty_target: params.pow_limit,
        nonce: 0,
    };
    Block {
        hash: calculate_block_hash(&header),
        header,
        transactions,
    }
}

// ============================================================================
// HASHING
// ============================================================================

/// Block hash: sha256d of the serialized header
pub fn calculate_block_hash(header: &BlockHeader) -> Hash {
    sha256d(&serialize_header(header))
}

/// Serialize block header to bytes
pub fn serialize_header(header: &BlockHeader) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(96);
    bytes.extend_from_slice(&header.version.to_le_bytes());
    bytes.extend_from_slice(&header.height.to_le_bytes());
    bytes.extend_from_slice(&header.previous_hash);
    bytes.extend_from_slice(&header.merkle_root);
    bytes.extend_from_slice(&header.timestamp.to_le_bytes());
    bytes.extend_from_slice(&header.difficulty_target.to_le_bytes());
    bytes.extend_from_slice(&header.nonce.to_le_bytes());
    bytes
}

/// Serialized block size: header, transaction count and transactions
pub fn block_size(block: &Block) -> usize {
    serialize_header(&block.header).len()
        + encode_varint(block.transactions.len() as u64).len()
        + block.transactions.iter().map(transaction_size).sum::<usize>()
}

/// Merkle root over transaction ids
pub fn calculate_merkle_root(transactions: &[Transaction]) -> Hash {
    let ids: Vec<Hash> = transactions.iter().map(calculate_tx_id).collect();
    merkle_root_from_ids(&ids)
}

/// Binary hash tree, odd node duplicated at each level. Empty input gives
/// the zero hash.
pub fn merkle_root_from_ids(ids: &[Hash]) -> Hash {
    if ids.is_empty() {
        return ZERO_HASH;
    }
    let mut level = ids.to_vec();
    while level.len() > 1 {
        let mut next_level = Vec::with_capacity((level.len() + 1) / 2);
        for chunk in level.chunks(2) {
            let right = chunk.get(1).unwrap_or(&chunk[0]);
            let mut combined = [0u8; 64];
            combined[..32].copy_from_slice(&chunk[0]);
            combined[32..].copy_from_slice(right);
            next_level.push(sha256d(&combined));
        }
        level = next_level;
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::StandardOracle;

    fn coinbase(height: Natural, value: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint::null(),
                unlock_proof: UnlockProof::Coinbase { height, extra: vec![] },
                sequence: crate::constants::SEQUENCE_FINAL,
            }],
            outputs: vec![TransactionOutput {
                value,
                locking_condition: LockingCondition::AnyoneCanSpend,
            }],
            lock_time: 0,
        }
    }

    fn mine(mut header: BlockHeader, transactions: Vec<Transaction>) -> Block {
        header.merkle_root = calculate_merkle_root(&transactions);
        loop {
            let hash = calculate_block_hash(&header);
            if check_proof_of_work(&hash, header.difficulty_target).is_ok() {
                return Block { header, hash, transactions };
            }
            header.nonce += 1;
        }
    }

    fn child_of(parent: &Block, transactions: Vec<Transaction>) -> Block {
        let header = BlockHeader {
            version: 1,
            height: parent.header.height + 1,
            previous_hash: parent.hash,
            merkle_root: ZERO_HASH,
            timestamp: parent.header.timestamp + 600,
            difficulty_target: parent.header.difficulty_target,
            nonce: 0,
        };
        mine(header, transactions)
    }

    fn setup() -> (ChainParams, Block, UtxoSet) {
        let params = ChainParams::regtest();
        let genesis = genesis_block(&params);
        (params, genesis, UtxoSet::new())
    }

    fn context<'a>(params: &'a ChainParams, oracle: &'a StandardOracle) -> ValidationContext<'a> {
        ValidationContext {
            params,
            oracle,
            now: params.genesis_timestamp + 10_000,
            required_target: params.pow_limit,
            minted_supply: 0,
        }
    }

    #[test]
    fn test_valid_block() {
        let (params, genesis, utxos) = setup();
        let oracle = StandardOracle::new();
        let block = child_of(&genesis, vec![coinbase(1, 50)]);
        let summary = validate_block(&block, &genesis, &utxos, &context(&params, &oracle)).unwrap();
        assert_eq!(summary, BlockSummary { fees: 0, reward: 50, claimed: 50, minted: 50 });
    }

    #[test]
    fn test_bad_height_checked_first() {
        let (params, genesis, utxos) = setup();
        let oracle = StandardOracle::new();
        let mut block = child_of(&genesis, vec![coinbase(1, 50)]);
        block.header.height = 5;
        block.header.previous_hash = [9; 32];
        assert_eq!(
            validate_block(&block, &genesis, &utxos, &context(&params, &oracle)),
            Err(RejectReason::BadHeight { expected: 1, got: 5 })
        );
    }

    #[test]
    fn test_bad_previous_hash() {
        let (params, genesis, utxos) = setup();
        let oracle = StandardOracle::new();
        let mut block = child_of(&genesis, vec![coinbase(1, 50)]);
        block.header.previous_hash = [9; 32];
        assert_eq!(
            validate_block(&block, &genesis, &utxos, &context(&params, &oracle)),
            Err(RejectReason::BadPreviousHash)
        );
    }

    #[test]
    fn test_tampered_header_breaks_hash() {
        let (params, genesis, utxos) = setup();
        let oracle = StandardOracle::new();
        let mut block = child_of(&genesis, vec![coinbase(1, 50)]);
        block.header.nonce += 1;
        assert_eq!(
            validate_block(&block, &genesis, &utxos, &context(&params, &oracle)),
            Err(RejectReason::BadBlockHash)
        );
    }

    #[test]
    fn test_insufficient_work() {
        let (params, genesis, utxos) = setup();
        let oracle = StandardOracle::new();
        let mut block = child_of(&genesis, vec![coinbase(1, 50)]);
        // Search for a header whose hash misses the target
        loop {
            block.header.nonce += 1;
            block.hash = calculate_block_hash(&block.header);
            if check_proof_of_work(&block.hash, block.header.difficulty_target).is_err() {
                break;
            }
        }
        assert_eq!(
            validate_block(&block, &genesis, &utxos, &context(&params, &oracle)),
            Err(RejectReason::InsufficientWork)
        );
    }

    #[test]
    fn test_timestamp_window() {
        let (params, genesis, utxos) = setup();
        let oracle = StandardOracle::new();
        let ctx = context(&params, &oracle);

        let mut header = child_of(&genesis, vec![]).header;
        header.timestamp = genesis.header.timestamp - 1;
        let early = mine(header.clone(), vec![coinbase(1, 50)]);
        assert!(matches!(
            validate_block(&early, &genesis, &utxos, &ctx),
            Err(RejectReason::TimestampTooOld { .. })
        ));

        header.timestamp = ctx.now + params.max_future_drift + 1;
        let late = mine(header, vec![coinbase(1, 50)]);
        assert!(matches!(
            validate_block(&late, &genesis, &utxos, &ctx),
            Err(RejectReason::TimestampTooNew { .. })
        ));
    }

    #[test]
    fn test_merkle_mismatch() {
        let (params, genesis, utxos) = setup();
        let oracle = StandardOracle::new();
        let mut block = child_of(&genesis, vec![coinbase(1, 50)]);
        block.transactions[0].outputs[0].value = 49;
        assert_eq!(
            validate_block(&block, &genesis, &utxos, &context(&params, &oracle)),
            Err(RejectReason::BadMerkleRoot)
        );
    }

    #[test]
    fn test_block_size_limit() {
        let (mut params, genesis, utxos) = setup();
        let oracle = StandardOracle::new();
        let block = child_of(&genesis, vec![coinbase(1, 50)]);
        params.max_block_size = block_size(&block) - 1;
        assert!(matches!(
            validate_block(&block, &genesis, &utxos, &context(&params, &oracle)),
            Err(RejectReason::BlockTooLarge { .. })
        ));
    }

    #[test]
    fn test_excessive_coinbase() {
        let (params, genesis, utxos) = setup();
        let oracle = StandardOracle::new();
        let block = child_of(&genesis, vec![coinbase(1, 51)]);
        assert_eq!(
            validate_block(&block, &genesis, &utxos, &context(&params, &oracle)),
            Err(RejectReason::ExcessiveCoinbase { claimed: 51, allowed: 50 })
        );
    }

    #[test]
    fn test_coinbase_height_commitment() {
        let (params, genesis, utxos) = setup();
        let oracle = StandardOracle::new();
        let block = child_of(&genesis, vec![coinbase(7, 50)]);
        assert!(matches!(
            validate_block(&block, &genesis, &utxos, &context(&params, &oracle)),
            Err(RejectReason::BadCoinbase(_))
        ));
    }

    #[test]
    fn test_in_block_chaining_and_double_spend() {
        let (params, genesis, utxos) = setup();
        let oracle = StandardOracle::new();
        let cb = coinbase(1, 50);
        let spend = |prevout: OutPoint, value: u64| Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout,
                unlock_proof: UnlockProof::Empty,
                sequence: crate::constants::SEQUENCE_FINAL,
            }],
            outputs: vec![TransactionOutput { value, locking_condition: LockingCondition::AnyoneCanSpend }],
            lock_time: 0,
        };

        // Spending the same block's coinbase, then its output: legal chaining.
        // The coinbase claims reward plus the 10 in fees.
        let mut cb = cb;
        cb.outputs[0].value = 60;
        let cb_out = OutPoint::new(calculate_tx_id(&cb), 0);
        let a = spend(cb_out, 45);
        let b = spend(OutPoint::new(calculate_tx_id(&a), 0), 40);
        let block = child_of(&genesis, vec![cb.clone(), a.clone(), b]);
        let summary = validate_block(&block, &genesis, &utxos, &context(&params, &oracle)).unwrap();
        assert_eq!(summary.fees, 20);
        assert_eq!(summary.minted, 40);

        // Spending the same output twice in one block
        let c = spend(cb_out, 44);
        let block = child_of(&genesis, vec![cb, a, c]);
        assert_eq!(
            validate_block(&block, &genesis, &utxos, &context(&params, &oracle)),
            Err(RejectReason::InvalidBlockTransaction {
                index: 2,
                reason: Box::new(RejectReason::MissingInput(cb_out)),
            })
        );
    }

    #[test]
    fn test_merkle_odd_duplication() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        assert_eq!(merkle_root_from_ids(&[a]), a);
        assert_eq!(merkle_root_from_ids(&[a, b, c]), merkle_root_from_ids(&[a, b, c, c]));
        assert_ne!(merkle_root_from_ids(&[a, b]), merkle_root_from_ids(&[b, a]));
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let params = ChainParams::default();
        assert_eq!(genesis_block(&params), genesis_block(&params));
        assert_ne!(genesis_block(&params).hash, genesis_block(&ChainParams::regtest()).hash);
    }
}
