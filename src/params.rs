//! Consensus parameters and mempool policy

use crate::constants::*;
use crate::error::{NodeError, Result};
use crate::pow::expand_target;
use serde::{Deserialize, Serialize};

/// Consensus parameters shared by every node of one network.
///
/// Two nodes only converge if these are identical, the genesis block is
/// derived from them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainParams {
    pub max_supply: u64,
    pub initial_reward: u64,
    pub halving_interval: u64,
    pub target_block_time: u64,
    pub adjustment_interval: u64,
    /// Compact form of the easiest allowed target
    pub pow_limit: u32,
    pub max_future_drift: u64,
    pub max_block_size: usize,
    pub max_tx_size: usize,
    pub max_reorg_depth: u64,
    pub genesis_timestamp: u64,
}

impl Default for ChainParams {
    fn default() -> Self {
        ChainParams {
            max_supply: MAX_SUPPLY,
            initial_reward: INITIAL_REWARD,
            halving_interval: HALVING_INTERVAL,
            target_block_time: TARGET_BLOCK_TIME,
            adjustment_interval: ADJUSTMENT_INTERVAL,
            pow_limit: POW_LIMIT,
            max_future_drift: MAX_FUTURE_DRIFT_SECS,
            max_block_size: MAX_BLOCK_SIZE,
            max_tx_size: MAX_TX_SIZE,
            max_reorg_depth: MAX_REORG_DEPTH,
            genesis_timestamp: GENESIS_TIMESTAMP,
        }
    }
}

impl ChainParams {
    /// Parameters for local test networks: trivial proof-of-work
    pub fn regtest() -> Self {
        ChainParams {
            pow_limit: REGTEST_POW_LIMIT,
            ..ChainParams::default()
        }
    }

    /// Expected duration of one adjustment window in seconds
    pub fn expected_window_secs(&self) -> u64 {
        self.adjustment_interval.saturating_mul(self.target_block_time)
    }

    pub fn validate(&self) -> Result<()> {
        if self.halving_interval == 0 {
            return Err(NodeError::Config("halving_interval must be positive".to_string()));
        }
        if self.adjustment_interval == 0 || self.target_block_time == 0 {
            return Err(NodeError::Config(
                "adjustment_interval and target_block_time must be positive".to_string(),
            ));
        }
        if self.max_block_size <= COINBASE_RESERVED_SIZE {
            return Err(NodeError::Config(format!(
                "max_block_size must exceed {} bytes",
                COINBASE_RESERVED_SIZE
            )));
        }
        if self.max_tx_size == 0 {
            return Err(NodeError::Config("max_tx_size must be positive".to_string()));
        }
        expand_target(self.pow_limit)
            .map_err(|e| NodeError::Config(format!("pow_limit: {}", e)))?;
        Ok(())
    }
}

/// Local admission policy of the mempool. Not consensus: nodes may differ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolPolicy {
    /// Minimum fee-rate in base units per 1000 bytes
    pub min_fee_rate_per_kb: u64,
    pub replacement_margin_percent: u64,
    pub max_entries: usize,
    pub expiry_secs: u64,
}

impl Default for MempoolPolicy {
    fn default() -> Self {
        MempoolPolicy {
            min_fee_rate_per_kb: MIN_FEE_RATE_PER_KB,
            replacement_margin_percent: REPLACEMENT_MARGIN_PERCENT,
            max_entries: MAX_MEMPOOL_ENTRIES,
            expiry_secs: MEMPOOL_EXPIRY_SECS,
        }
    }
}
