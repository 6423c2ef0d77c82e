//! File-backed persistence of the ledger and mempool
//!
//! The whole node state is one JSON document, rewritten atomically (write to
//! a temporary file, then rename) after every change to the active chain.

use crate::error::{NodeError, Result};
use crate::ledger::{LedgerState, UndoData};
use crate::mempool::{Mempool, MempoolEntry};
use crate::params::{ChainParams, MempoolPolicy};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const STATE_FILE: &str = "chainstate.json";
const PEERS_FILE: &str = "peers.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub outpoint: OutPoint,
    pub utxo: UTXO,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoRecord {
    #[serde(with = "hex::serde")]
    pub block_hash: Hash,
    pub undo: UndoData,
}

/// The persisted document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    /// Active chain from genesis
    pub chain: Vec<Block>,
    pub utxo_set: Vec<UtxoEntry>,
    pub mempool: Vec<MempoolEntry>,
    /// Target required of the next block
    pub difficulty_target: u32,
    pub minted_supply: u64,
    /// Undo data of the most recent blocks, so reorganizations survive a
    /// restart
    #[serde(default)]
    pub undo: Vec<UndoRecord>,
}

impl PersistedState {
    pub fn capture(ledger: &LedgerState, mempool: &Mempool) -> Result<Self> {
        let chain = (0..=ledger.height())
            .map(|height| {
                ledger.tree().block_at_height(height).cloned().ok_or_else(|| {
                    NodeError::Corrupt(format!("active chain has no block at height {}", height))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut utxo_set: Vec<UtxoEntry> = ledger
            .utxo_set()
            .iter()
            .map(|(outpoint, utxo)| UtxoEntry {
                outpoint: *outpoint,
                utxo: utxo.clone(),
            })
            .collect();
        utxo_set.sort_by_key(|entry| entry.outpoint);

        let mut undo: Vec<UndoRecord> = ledger
            .undo_data()
            .iter()
            .map(|(hash, undo)| UndoRecord {
                block_hash: *hash,
                undo: undo.clone(),
            })
            .collect();
        undo.sort_by_key(|record| record.block_hash);

        Ok(PersistedState {
            chain,
            utxo_set,
            mempool: mempool.entries().into_iter().cloned().collect(),
            difficulty_target: ledger.required_target(&ledger.tip().hash)?,
            minted_supply: ledger.minted_supply(),
            undo,
        })
    }

    /// Rebuild ledger and mempool. Mempool entries are re-validated against
    /// the restored UTXO set, keeping their arrival times.
    pub fn restore(self, params: ChainParams, policy: MempoolPolicy) -> Result<(LedgerState, Mempool)> {
        let utxo_set: UtxoSet = self
            .utxo_set
            .into_iter()
            .map(|entry| (entry.outpoint, entry.utxo))
            .collect();
        let undo: HashMap<Hash, UndoData> = self
            .undo
            .into_iter()
            .map(|record| (record.block_hash, record.undo))
            .collect();
        let ledger = LedgerState::from_parts(params, self.chain, utxo_set, undo, self.minted_supply)?;

        let required = ledger.required_target(&ledger.tip().hash)?;
        if required != self.difficulty_target {
            warn!(
                stored = self.difficulty_target,
                derived = required,
                "stored difficulty target differs from chain, using derived value"
            );
        }

        let mut mempool = Mempool::new(policy);
        let mut entries = self.mempool;
        entries.sort_by_key(|entry| entry.sequence);
        let total = entries.len();
        let restored = mempool.readmit(
            entries.into_iter().map(|entry| (entry.tx, entry.arrival_time)),
            &ledger,
        );
        if restored < total {
            warn!(restored, dropped = total - restored, "mempool entries dropped on restore");
        }
        Ok((ledger, mempool))
    }
}

/// Files under the node's data directory
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Store { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn peers_path(&self) -> PathBuf {
        self.dir.join(PEERS_FILE)
    }

    /// The stored document, or `None` if there is none yet
    pub fn load(&self) -> Result<Option<PersistedState>> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let bytes = serde_json::to_vec(state)?;
        write_atomic(&self.dir, &self.state_path(), &bytes)
    }

    /// Resume from the stored document, falling back to a fresh genesis
    /// state when it is absent or unusable
    pub fn load_or_genesis(&self, params: &ChainParams, policy: &MempoolPolicy) -> (LedgerState, Mempool) {
        let loaded = self
            .load()
            .and_then(|state| state.map(|s| s.restore(params.clone(), policy.clone())).transpose());
        match loaded {
            Ok(Some((ledger, mempool))) => {
                info!(
                    height = ledger.height(),
                    tip = %hex::encode(ledger.tip().hash),
                    mempool = mempool.len(),
                    "resumed from persisted state"
                );
                (ledger, mempool)
            }
            Ok(None) => {
                info!(path = %self.state_path().display(), "no persisted state, starting from genesis");
                (LedgerState::new(params.clone()), Mempool::new(policy.clone()))
            }
            Err(e) => {
                warn!(error = %e, path = %self.state_path().display(), "persisted state unusable, starting from genesis");
                (LedgerState::new(params.clone()), Mempool::new(policy.clone()))
            }
        }
    }

    pub fn save_peers(&self, peers: &[SocketAddr]) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(peers)?;
        write_atomic(&self.dir, &self.peers_path(), &bytes)
    }

    /// Known peer addresses; empty if none were stored or the file is bad
    pub fn load_peers(&self) -> Vec<SocketAddr> {
        let path = self.peers_path();
        if !path.exists() {
            return Vec::new();
        }
        match fs::read(&path).map_err(NodeError::from).and_then(|bytes| {
            serde_json::from_slice::<Vec<SocketAddr>>(&bytes).map_err(NodeError::from)
        }) {
            Ok(peers) => peers,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable peer list");
                Vec::new()
            }
        }
    }
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    fs::create_dir_all(dir)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
