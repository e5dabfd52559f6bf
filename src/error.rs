//! Error types for ledger state and validation

use thiserror::Error;

use crate::types::{Amount, OutPoint};

/// Rejection category. Decides whether a caller may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed transaction/block shape or a violated limit
    Structural,
    /// Double spend, duplicate input, key already present
    Conflict,
    /// Funds, fee, voting power or quorum below what is required
    Insufficient,
    /// Stale PoW, cooldown, timestamp window; may pass later unchanged
    Timing,
    /// Storage or runtime failure
    Infrastructure,
    /// A validation exceeded its time budget
    Timeout,
}

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Invalid structure: {0}")]
    InvalidStructure(String),

    #[error("Unsupported version {version}, accepted range {min}..={max}")]
    UnsupportedVersion { version: u32, min: u32, max: u32 },

    #[error("Too many transactions in block: {count} > {max}")]
    ExcessTransactions { count: usize, max: usize },

    #[error("Block too large: {size} bytes, limit {max} bytes")]
    BlockTooLarge { size: u64, max: u64 },

    #[error("Transaction too large: {size} bytes, limit {max} bytes")]
    TransactionTooLarge { size: usize, max: usize },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid vote signature: {0}")]
    InvalidVoteSignature(String),

    #[error("Invalid proof of work: {0}")]
    InvalidProofOfWork(String),

    #[error("Merkle root mismatch: expected {expected}, computed {computed}")]
    MerkleRootMismatch { expected: String, computed: String },

    #[error("Invalid previous block: {0}")]
    InvalidPreviousBlock(String),

    #[error("Invalid coinbase: {0}")]
    InvalidCoinbase(String),

    #[error("Non-standard script: {0}")]
    NonStandardScript(String),

    #[error("UTXO not found: {0}")]
    UtxoNotFound(OutPoint),

    #[error("UTXO already spent: {0}")]
    UtxoAlreadySpent(OutPoint),

    #[error("UTXO already exists: {0}")]
    UtxoExists(OutPoint),

    #[error("Output {outpoint} has {confirmations} confirmations, {required} required")]
    ImmatureOutput { outpoint: OutPoint, confirmations: u64, required: u64 },

    #[error("Duplicate input: {0}")]
    DuplicateInput(OutPoint),

    #[error("Transaction already known: {0}")]
    DuplicateTransaction(String),

    #[error("Replacement fee too low: provided {provided}, required {required}")]
    RbfFeeTooLow { provided: Amount, required: Amount },

    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: Amount, need: Amount },

    #[error("Insufficient fee: {0}")]
    InsufficientFee(String),

    #[error("Insufficient voting power: {power} < {required}")]
    InsufficientVotingPower { power: u64, required: u64 },

    #[error("Insufficient validator quorum: {0}")]
    InsufficientQuorum(String),

    #[error("Too many in-mempool ancestors: {count} > {max}")]
    TooManyAncestors { count: usize, max: usize },

    #[error("Too many in-mempool descendants: {count} > {max}")]
    TooManyDescendants { count: usize, max: usize },

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Mempool full: {0}")]
    MempoolFull(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Stale proof of work: {0}")]
    StaleProofOfWork(String),

    #[error("Vote cooldown for {address}: last vote at {last_height}, next allowed at {next_height}")]
    VoteCooldown { address: String, last_height: u64, next_height: u64 },

    #[error("Mutation rate limited: retry in {retry_in_ms} ms")]
    RateLimited { retry_in_ms: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{operation} timed out after {after_ms} ms")]
    Timeout { operation: String, after_ms: u64 },
}

impl ConsensusError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ConsensusError::InvalidStructure(_) => "INVALID_STRUCTURE",
            ConsensusError::UnsupportedVersion { .. } => "UNSUPPORTED_VERSION",
            ConsensusError::ExcessTransactions { .. } => "EXCESS_TRANSACTIONS",
            ConsensusError::BlockTooLarge { .. } => "BLOCK_TOO_LARGE",
            ConsensusError::TransactionTooLarge { .. } => "TRANSACTION_TOO_LARGE",
            ConsensusError::InvalidAmount(_) => "INVALID_AMOUNT",
            ConsensusError::InvalidSignature(_) => "INVALID_SIGNATURE",
            ConsensusError::InvalidVoteSignature(_) => "INVALID_VOTE_SIGNATURE",
            ConsensusError::InvalidProofOfWork(_) => "INVALID_POW",
            ConsensusError::MerkleRootMismatch { .. } => "MERKLE_ROOT_MISMATCH",
            ConsensusError::InvalidPreviousBlock(_) => "INVALID_PREVIOUS_BLOCK",
            ConsensusError::InvalidCoinbase(_) => "INVALID_COINBASE",
            ConsensusError::NonStandardScript(_) => "NON_STANDARD_SCRIPT",
            ConsensusError::UtxoNotFound(_) => "UTXO_NOT_FOUND",
            ConsensusError::UtxoAlreadySpent(_) => "UTXO_ALREADY_SPENT",
            ConsensusError::UtxoExists(_) => "UTXO_EXISTS",
            ConsensusError::ImmatureOutput { .. } => "IMMATURE_OUTPUT",
            ConsensusError::DuplicateInput(_) => "DUPLICATE_INPUT",
            ConsensusError::DuplicateTransaction(_) => "DUPLICATE_TRANSACTION",
            ConsensusError::RbfFeeTooLow { .. } => "RBF_FEE_TOO_LOW",
            ConsensusError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            ConsensusError::InsufficientFee(_) => "INSUFFICIENT_FEE",
            ConsensusError::InsufficientVotingPower { .. } => "INSUFFICIENT_VOTING_POWER",
            ConsensusError::InsufficientQuorum(_) => "INSUFFICIENT_QUORUM",
            ConsensusError::TooManyAncestors { .. } => "TOO_MANY_ANCESTORS",
            ConsensusError::TooManyDescendants { .. } => "TOO_MANY_DESCENDANTS",
            ConsensusError::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            ConsensusError::MempoolFull(_) => "MEMPOOL_FULL",
            ConsensusError::InvalidTimestamp(_) => "INVALID_TIMESTAMP",
            ConsensusError::StaleProofOfWork(_) => "STALE_POW",
            ConsensusError::VoteCooldown { .. } => "VOTE_COOLDOWN",
            ConsensusError::RateLimited { .. } => "RATE_LIMITED",
            ConsensusError::Storage(_) => "STORAGE_ERROR",
            ConsensusError::Serialization(_) => "SERIALIZATION_ERROR",
            ConsensusError::Config(_) => "CONFIG_ERROR",
            ConsensusError::Timeout { .. } => "TIMEOUT",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsensusError::InvalidStructure(_)
            | ConsensusError::UnsupportedVersion { .. }
            | ConsensusError::ExcessTransactions { .. }
            | ConsensusError::BlockTooLarge { .. }
            | ConsensusError::TransactionTooLarge { .. }
            | ConsensusError::InvalidAmount(_)
            | ConsensusError::InvalidSignature(_)
            | ConsensusError::InvalidVoteSignature(_)
            | ConsensusError::InvalidProofOfWork(_)
            | ConsensusError::MerkleRootMismatch { .. }
            | ConsensusError::InvalidPreviousBlock(_)
            | ConsensusError::InvalidCoinbase(_)
            | ConsensusError::NonStandardScript(_)
            | ConsensusError::TooManyAncestors { .. }
            | ConsensusError::TooManyDescendants { .. }
            | ConsensusError::CapacityExceeded(_)
            | ConsensusError::Config(_) => ErrorKind::Structural,

            ConsensusError::UtxoNotFound(_)
            | ConsensusError::UtxoAlreadySpent(_)
            | ConsensusError::UtxoExists(_)
            | ConsensusError::DuplicateInput(_)
            | ConsensusError::DuplicateTransaction(_)
            | ConsensusError::RbfFeeTooLow { .. } => ErrorKind::Conflict,

            ConsensusError::InsufficientFunds { .. }
            | ConsensusError::InsufficientFee(_)
            | ConsensusError::InsufficientVotingPower { .. }
            | ConsensusError::InsufficientQuorum(_)
            | ConsensusError::MempoolFull(_) => ErrorKind::Insufficient,

            ConsensusError::InvalidTimestamp(_)
            | ConsensusError::StaleProofOfWork(_)
            | ConsensusError::ImmatureOutput { .. }
            | ConsensusError::VoteCooldown { .. }
            | ConsensusError::RateLimited { .. } => ErrorKind::Timing,

            ConsensusError::Storage(_) | ConsensusError::Serialization(_) => {
                ErrorKind::Infrastructure
            }

            ConsensusError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Only infrastructure failures are retried; timeouts are terminal.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Infrastructure
    }
}

impl From<serde_json::Error> for ConsensusError {
    fn from(e: serde_json::Error) -> Self {
        ConsensusError::Serialization(e.to_string())
    }
}

impl From<sled::Error> for ConsensusError {
    fn from(e: sled::Error) -> Self {
        ConsensusError::Storage(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ConsensusError {
    fn from(e: tokio::task::JoinError) -> Self {
        ConsensusError::Storage(format!("background task failed: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
