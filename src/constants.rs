//! Ledger protocol constants

/// Base units per coin
pub const UNITS_PER_COIN: u128 = 100_000_000;

/// Maximum money supply: 21,000,000 coins in base units
pub const MAX_MONEY: u128 = 21_000_000 * UNITS_PER_COIN;

/// Maximum serialized transaction size: 100 KB
pub const MAX_TX_SIZE: usize = 100_000;

/// Maximum number of inputs per transaction
pub const MAX_INPUTS: usize = 1000;

/// Maximum number of outputs per transaction
pub const MAX_OUTPUTS: usize = 1000;

/// Maximum number of transactions per block
pub const MAX_TRANSACTIONS: usize = 10_000;

/// Maximum lock script length
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Accepted transaction version range
pub const MIN_TX_VERSION: u32 = 1;
pub const MAX_TX_VERSION: u32 = 2;

/// Accepted block version range
pub const MIN_BLOCK_VERSION: u32 = 1;
pub const MAX_BLOCK_VERSION: u32 = 1;

/// Mempool dependency ceilings
pub const MAX_ANCESTORS: usize = 25;
pub const MAX_DESCENDANTS: usize = 25;

/// Replace-by-fee increment in base units
pub const RBF_FEE_INCREMENT: u128 = 1_000;

/// Halving interval: 210,000 blocks
pub const HALVING_INTERVAL: u64 = 210_000;

/// Initial block reward: 50 coins
pub const INITIAL_BLOCK_REWARD: u128 = 50 * UNITS_PER_COIN;

/// Reward floor once halvings run out
pub const MIN_BLOCK_REWARD: u128 = 1;

/// Halvings stop after this many periods
pub const MAX_HALVINGS: u64 = 64;

/// Target time per block: 10 minutes
pub const TARGET_BLOCK_TIME_SECS: u64 = 600;

/// Cap on quadratic voting power of a single voter
pub const MAX_VOTING_POWER: u64 = 1_000_000;

/// Minimum voting power for a vote transaction
pub const MIN_VOTING_POWER: u64 = 1;

/// Blocks a voter must wait between two votes
pub const VOTE_COOLDOWN_BLOCKS: u64 = 10;

/// Minimum leading zero bits on a reward transaction's PoW datum
pub const MIN_POW_DIFFICULTY: u32 = 8;

/// Transactions validated per batch during block validation
pub const TX_BATCH_SIZE: usize = 100;

/// Leaves hashed per batch during Merkle root computation
pub const MERKLE_BATCH_SIZE: usize = 256;

/// Hard cap on the number of unspent outputs held in memory
pub const MAX_UTXO_SET_SIZE: usize = 10_000_000;

/// Quorum threshold for validator signatures (fraction of total weight)
pub const QUORUM_THRESHOLD: f64 = 0.66;

/// Reputation ceiling used to normalize validator weight
pub const MAX_REPUTATION: u64 = 100;

/// Null hash, used as previous hash of a genesis block
pub const ZERO_HASH: [u8; 32] = [0u8; 32];
