//! # utxo-node
//!
//! A minimal proof-of-work UTXO node: ledger, fee market and peer
//! synchronization.
//!
//! ## Architecture
//!
//! The crate is layered bottom-up:
//! - Consensus rules: pure functions over transactions, blocks, proof of
//!   work and the subsidy schedule ([`transaction`], [`block`], [`pow`],
//!   [`economic`])
//! - Ledger: the block tree, UTXO set and fork choice with atomic
//!   reorganization ([`chain`], [`ledger`], [`reorganization`])
//! - Fee market: mempool with replace-by-fee and child-pays-for-parent
//!   ([`mempool`]) and block assembly ([`mining`])
//! - Runtime: a single-writer node task ([`node`]), the peer synchronizer
//!   ([`sync`], [`network`], [`compact`]) and persistence ([`storage`])
//!
//! ## Design Principles
//!
//! 1. **Single writer**: only the node task mutates the ledger and mempool;
//!    everything else sends it commands through a [`NodeHandle`]
//! 2. **All or nothing**: a block or reorganization either applies fully or
//!    leaves the ledger untouched
//! 3. **Typed rejections**: every validation failure is a [`RejectReason`]
//!    with a kind and a peer-penalty decision
//!
//! ## Usage
//!
//! ```rust
//! use utxo_node::{ChainParams, LedgerState};
//!
//! let ledger = LedgerState::new(ChainParams::regtest());
//! assert_eq!(ledger.height(), 0);
//! assert_eq!(ledger.next_reward(), 50);
//! ```

pub mod types;
pub mod constants;
pub mod error;
pub mod params;
pub mod transaction;
pub mod script;
pub mod economic;
pub mod pow;
pub mod block;
pub mod chain;
pub mod ledger;
pub mod reorganization;
pub mod mempool;
pub mod mining;
pub mod compact;
pub mod network;
pub mod sync;
pub mod node;
pub mod storage;
pub mod config;
pub mod logging;

#[cfg(test)]
mod testutil;

// Re-export commonly used types
pub use types::*;
pub use error::{ErrorKind, NodeError, RejectReason, Result, ValidationResult};
pub use params::{ChainParams, MempoolPolicy};
pub use ledger::{AcceptOutcome, LedgerState};
pub use mempool::{Admission, Mempool, MempoolEntry};
pub use mining::{BlockTemplate, Miner};
pub use node::{Node, NodeEvent, NodeHandle, NodeStats};
pub use sync::{RelayStats, Synchronizer};
pub use storage::Store;
pub use config::NodeConfig;
