//! Protocol constants and policy defaults

/// Maximum money supply in base units
pub const MAX_SUPPLY: u64 = 21_000_000;

/// Reward of the first block after genesis
pub const INITIAL_REWARD: u64 = 50;

/// Halving interval: 210,000 blocks
pub const HALVING_INTERVAL: u64 = 210_000;

/// Target time per block: 10 minutes
pub const TARGET_BLOCK_TIME: u64 = 600;

/// Difficulty adjustment interval: 2016 blocks
pub const ADJUSTMENT_INTERVAL: u64 = 2016;

/// Bound on the per-adjustment change of the target, in either direction
pub const MAX_ADJUSTMENT_FACTOR: u64 = 4;

/// Easiest allowed target (difficulty floor)
pub const POW_LIMIT: u32 = 0x1f00ffff;

/// Difficulty floor for local test networks: roughly every second hash wins
pub const REGTEST_POW_LIMIT: u32 = 0x207fffff;

/// Genesis timestamp shared by every node of a network
pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

/// How far a block timestamp may run ahead of local time
pub const MAX_FUTURE_DRIFT_SECS: u64 = 2 * 60 * 60;

/// Maximum serialized block size
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum serialized transaction size
pub const MAX_TX_SIZE: usize = 100_000;

/// Maximum number of inputs per transaction
pub const MAX_INPUTS: usize = 1000;

/// Maximum number of outputs per transaction
pub const MAX_OUTPUTS: usize = 1000;

/// Blocks retained with undo data, bounding reorganization depth
pub const MAX_REORG_DEPTH: u64 = 100;

/// Space kept free in a template for the header and coinbase
pub const COINBASE_RESERVED_SIZE: usize = 1_000;

/// Sequence number for final transaction
pub const SEQUENCE_FINAL: u32 = 0xffffffff;

/// Inputs with a sequence below this value signal replaceability
pub const SEQUENCE_RBF_THRESHOLD: u32 = 0xfffffffe;

/// Minimum relay fee-rate in base units per 1000 bytes
pub const MIN_FEE_RATE_PER_KB: u64 = 1;

/// Required fee-rate increase of a replacement, in percent
pub const REPLACEMENT_MARGIN_PERCENT: u64 = 10;

/// Maximum number of mempool entries
pub const MAX_MEMPOOL_ENTRIES: usize = 50_000;

/// Mempool entries older than this are purged
pub const MEMPOOL_EXPIRY_SECS: u64 = 14 * 24 * 60 * 60;

/// Blocks per `getblocks` batch
pub const SYNC_BATCH_SIZE: u64 = 500;

/// Capacity of the seen-block cache
pub const SEEN_BLOCKS_CAPACITY: usize = 10_000;

/// Capacity of the seen-transaction cache
pub const SEEN_TXS_CAPACITY: usize = 50_000;

/// Longest accepted wire message line, in multiples of the maximum block
/// size. JSON with hex-encoded hashes stays well inside this.
pub const MESSAGE_SIZE_FACTOR: usize = 8;

/// Smallest serialized transaction: no inputs and a single anyone-can-spend
/// output
pub const MIN_TRANSACTION_SIZE: usize = 20;

/// Length of a compact relay short transaction id
pub const SHORT_ID_LEN: usize = 6;

/// Wire protocol version announced in the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Score at or below which a peer is banned, unless configured otherwise
pub const DEFAULT_BAN_THRESHOLD: i32 = -100;

/// Consecutive transient failures after which a peer is banned
pub const FAILURE_THRESHOLD: u32 = 5;

/// Duration of a ban: 1 hour
pub const BAN_DURATION_SECS: u64 = 3600;

/// First reconnect delay; doubles per failure
pub const INITIAL_BACKOFF_SECS: u64 = 1;

/// Upper bound on the reconnect delay
pub const MAX_BACKOFF_SECS: u64 = 60;
