//! Error types for validation and node operation

use crate::types::OutPoint;
use thiserror::Error;

/// Classification of a rejected item.
///
/// Decides what happens to the peer that sent it: consensus violations
/// degrade its score, everything else is a plain rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed block or transaction shape
    Structural,
    /// Item breaks a consensus rule
    Consensus,
    /// Local relay policy declined the item
    Policy,
    /// Block or mempool size limits
    Resource,
}

/// Typed outcome of a failed validation. Validation never panics; every
/// failure path ends here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("malformed transaction: {0}")]
    MalformedTransaction(String),

    #[error("malformed block: {0}")]
    MalformedBlock(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("value overflow")]
    ValueOverflow,

    #[error("bad height: expected {expected}, got {got}")]
    BadHeight { expected: u64, got: u64 },

    #[error("previous hash does not match predecessor")]
    BadPreviousHash,

    #[error("block hash does not match header")]
    BadBlockHash,

    #[error("hash does not satisfy proof-of-work target")]
    InsufficientWork,

    #[error("invalid difficulty target: {0}")]
    BadDifficulty(String),

    #[error("timestamp {timestamp} is more than {max_drift}s ahead of local time")]
    TimestampTooNew { timestamp: u64, max_drift: u64 },

    #[error("timestamp {timestamp} precedes predecessor timestamp {previous}")]
    TimestampTooOld { timestamp: u64, previous: u64 },

    #[error("merkle root mismatch")]
    BadMerkleRoot,

    #[error("missing or spent input {0}")]
    MissingInput(OutPoint),

    #[error("unlock proof for input {0} rejected")]
    BadUnlockProof(usize),

    #[error("outputs ({output}) exceed inputs ({input})")]
    InsufficientInputValue { input: u64, output: u64 },

    #[error("bad coinbase: {0}")]
    BadCoinbase(String),

    #[error("coinbase claims {claimed}, allowed {allowed}")]
    ExcessiveCoinbase { claimed: u64, allowed: u64 },

    #[error("transaction {index} rejected: {reason}")]
    InvalidBlockTransaction { index: usize, reason: Box<RejectReason> },

    #[error("unknown parent block")]
    UnknownParent,

    #[error("block previously found invalid")]
    KnownInvalid,

    #[error("reorganization of {depth} blocks exceeds limit of {limit}")]
    ReorgTooDeep { depth: u64, limit: u64 },

    #[error("already known")]
    AlreadyKnown,

    #[error("coinbase transactions are only valid inside blocks")]
    CoinbaseOutsideBlock,

    #[error("fee-rate below minimum relay fee-rate")]
    FeeRateTooLow,

    #[error("replacement rejected: {0}")]
    ReplacementRejected(String),

    #[error("block size {size} exceeds maximum {max}")]
    BlockTooLarge { size: usize, max: usize },

    #[error("transaction size {size} exceeds maximum {max}")]
    TransactionTooLarge { size: usize, max: usize },

    #[error("mempool full")]
    MempoolFull,

    #[error("block is not the active tip")]
    NotActiveTip,
}

impl RejectReason {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RejectReason::MalformedTransaction(_)
            | RejectReason::MalformedBlock(_)
            | RejectReason::MalformedMessage(_)
            | RejectReason::ValueOverflow
            | RejectReason::CoinbaseOutsideBlock => ErrorKind::Structural,

            RejectReason::BadHeight { .. }
            | RejectReason::BadPreviousHash
            | RejectReason::BadBlockHash
            | RejectReason::InsufficientWork
            | RejectReason::BadDifficulty(_)
            | RejectReason::TimestampTooNew { .. }
            | RejectReason::TimestampTooOld { .. }
            | RejectReason::BadMerkleRoot
            | RejectReason::MissingInput(_)
            | RejectReason::BadUnlockProof(_)
            | RejectReason::InsufficientInputValue { .. }
            | RejectReason::BadCoinbase(_)
            | RejectReason::ExcessiveCoinbase { .. }
            | RejectReason::KnownInvalid => ErrorKind::Consensus,

            RejectReason::InvalidBlockTransaction { reason, .. } => match reason.kind() {
                ErrorKind::Structural => ErrorKind::Structural,
                _ => ErrorKind::Consensus,
            },

            RejectReason::UnknownParent
            | RejectReason::ReorgTooDeep { .. }
            | RejectReason::NotActiveTip
            | RejectReason::AlreadyKnown
            | RejectReason::FeeRateTooLow
            | RejectReason::ReplacementRejected(_) => ErrorKind::Policy,

            RejectReason::BlockTooLarge { .. }
            | RejectReason::TransactionTooLarge { .. }
            | RejectReason::MempoolFull => ErrorKind::Resource,
        }
    }

    /// Items that may become valid later, such as a block stamped ahead of
    /// our clock
    pub fn is_temporary(&self) -> bool {
        match self {
            RejectReason::TimestampTooNew { .. } => true,
            RejectReason::InvalidBlockTransaction { reason, .. } => reason.is_temporary(),
            _ => false,
        }
    }

    /// Whether the peer that relayed this item should lose reputation
    pub fn penalizes_sender(&self) -> bool {
        !self.is_temporary() && matches!(self.kind(), ErrorKind::Structural | ErrorKind::Consensus)
    }
}

/// Result of a validation step
pub type ValidationResult<T> = std::result::Result<T, RejectReason>;

/// Failures of the node runtime around the validation core
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("node task has shut down")]
    ChannelClosed,

    #[error("persisted state unusable: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Rejected(#[from] RejectReason),
}

impl NodeError {
    /// Transient failures are retried with backoff rather than treated as
    /// misbehaviour
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::Io(_) | NodeError::Network(_) | NodeError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
