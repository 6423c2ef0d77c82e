//! Core ledger types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Hash type: 256-bit digest
pub type Hash = [u8; 32];

/// 160-bit digest of a public key or a locking condition
pub type KeyHash = [u8; 20];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Natural number type
pub type Natural = u64;

/// The all-zero hash, used as the coinbase prevout and the genesis parent
pub const ZERO_HASH: Hash = [0u8; 32];

/// OutPoint: 𝒪 = ℍ × ℕ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    #[serde(with = "hex::serde")]
    pub tx_id: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(tx_id: Hash, index: u32) -> Self {
        OutPoint { tx_id, index }
    }

    /// The prevout carried by every coinbase input
    pub fn null() -> Self {
        OutPoint { tx_id: ZERO_HASH, index: u32::MAX }
    }

    pub fn is_null(&self) -> bool {
        self.tx_id == ZERO_HASH && self.index == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(self.tx_id), self.index)
    }
}

/// Spending predicate attached to an output.
///
/// The predicate oracle matches on the tag; the ledger never interprets
/// condition contents itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LockingCondition {
    /// Spendable with an empty unlock proof
    AnyoneCanSpend,
    /// Spendable by a signature from the key hashing to `key_hash`
    PayToKeyHash {
        #[serde(with = "hex::serde")]
        key_hash: KeyHash,
    },
    /// Spendable by revealing a redeem condition hashing to `script_hash`
    /// and satisfying it
    PayToScriptHash {
        #[serde(with = "hex::serde")]
        script_hash: KeyHash,
    },
    /// k-of-n signatures over the listed compressed public keys
    Multisig { threshold: u8, pubkeys: Vec<ByteString> },
    /// Preimage of `hash_lock` plus a recipient signature, or a refund
    /// signature once `timeout_height` is reached
    HashTimeLock {
        #[serde(with = "hex::serde")]
        hash_lock: Hash,
        #[serde(with = "hex::serde")]
        recipient: KeyHash,
        #[serde(with = "hex::serde")]
        refund: KeyHash,
        timeout_height: Natural,
    },
}

/// Witness data satisfying a [`LockingCondition`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnlockProof {
    /// Marks the single input of a coinbase transaction
    Coinbase {
        height: Natural,
        #[serde(with = "hex::serde")]
        extra: ByteString,
    },
    Empty,
    Signature {
        #[serde(with = "hex::serde")]
        pubkey: ByteString,
        #[serde(with = "hex::serde")]
        signature: ByteString,
    },
    /// Signatures in the same order as the multisig public keys they match
    MultiSignature { signatures: Vec<ByteString> },
    ScriptHash {
        redeem: Box<LockingCondition>,
        inner: Box<UnlockProof>,
    },
    Preimage {
        #[serde(with = "hex::serde")]
        preimage: ByteString,
        #[serde(with = "hex::serde")]
        pubkey: ByteString,
        #[serde(with = "hex::serde")]
        signature: ByteString,
    },
    Refund {
        #[serde(with = "hex::serde")]
        pubkey: ByteString,
        #[serde(with = "hex::serde")]
        signature: ByteString,
    },
}

/// Transaction Input: ℐ = 𝒪 × 𝒫 × ℕ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub prevout: OutPoint,
    pub unlock_proof: UnlockProof,
    pub sequence: u32,
}

/// Transaction Output: 𝒯 = ℕ × ℒ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: Natural,
    pub locking_condition: LockingCondition,
}

/// Transaction: 𝒯𝒳 = ℕ × ℐ* × 𝒯* × ℕ
///
/// The id is derived, see [`crate::transaction::calculate_tx_id`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn id(&self) -> Hash {
        crate::transaction::calculate_tx_id(self)
    }
}

/// Block Header: ℋ = ℕ × ℕ × ℍ × ℍ × ℕ × ℕ × ℕ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub height: Natural,
    #[serde(with = "hex::serde")]
    pub previous_hash: Hash,
    #[serde(with = "hex::serde")]
    pub merkle_root: Hash,
    pub timestamp: Natural,
    /// Compact encoding of the 256-bit proof-of-work target
    pub difficulty_target: u32,
    pub nonce: Natural,
}

/// Block: ℬ = ℋ × ℍ × 𝒯𝒳*
///
/// `hash` is carried alongside the header and must equal the hash
/// recomputed from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    #[serde(with = "hex::serde")]
    pub hash: Hash,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn height(&self) -> Natural {
        self.header.height
    }
}

/// UTXO: 𝒰 = ℕ × ℒ × ℕ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UTXO {
    pub value: Natural,
    pub locking_condition: LockingCondition,
    pub confirmed_height: Natural,
}

/// UTXO Set: 𝒰𝒮 = 𝒪 → 𝒰
pub type UtxoSet = HashMap<OutPoint, UTXO>;

/// Summary of the active chain tip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub height: Natural,
    #[serde(with = "hex::serde")]
    pub hash: Hash,
    pub timestamp: Natural,
}
