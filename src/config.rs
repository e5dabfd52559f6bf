//! Ledger configuration
//!
//! Tunables for the UTXO set, mempool and validators. Protocol constants
//! live in [`crate::constants`]; these structs carry the values a node
//! operator may change.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::block_size::BlockSizeParams;
use crate::constants::*;
use crate::economic::RewardSchedule;
use crate::error::{ConsensusError, Result};
use crate::retry::RetryPolicy;
use crate::types::{amount_serde, Amount};

/// UTXO set limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxoSetConfig {
    /// Hard cap on unspent entries
    pub max_size: usize,
    /// Minimum spacing between two public `add` calls; zero disables it
    pub min_mutation_interval_ms: u64,
    /// Confirmations an input needs before `apply_transaction` spends it
    pub min_confirmations: u64,
    pub max_voting_power: u64,
    /// Buffered events per subscriber
    pub event_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for UtxoSetConfig {
    fn default() -> Self {
        Self {
            max_size: MAX_UTXO_SET_SIZE,
            min_mutation_interval_ms: 0,
            min_confirmations: 1,
            max_voting_power: MAX_VOTING_POWER,
            event_capacity: 1024,
            retry: RetryPolicy::default(),
        }
    }
}

impl UtxoSetConfig {
    pub fn for_testing() -> Self {
        Self {
            min_confirmations: 0,
            event_capacity: 64,
            retry: RetryPolicy::for_testing(),
            ..Self::default()
        }
    }

    pub fn min_mutation_interval(&self) -> Duration {
        Duration::from_millis(self.min_mutation_interval_ms)
    }
}

/// Mempool admission and eviction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MempoolConfig {
    // =========================================================================
    // Size Limits
    // =========================================================================
    pub max_transactions: usize,
    pub max_bytes: usize,
    pub max_ancestors: usize,
    pub max_descendants: usize,

    // =========================================================================
    // Fees
    // =========================================================================
    #[serde(with = "amount_serde")]
    pub rbf_fee_increment: Amount,
    /// Minimum fee per byte for admission
    pub min_fee_rate: f64,

    // =========================================================================
    // Eviction
    // =========================================================================
    pub max_age_secs: u64,
    pub eviction_interval_secs: u64,

    // =========================================================================
    // Fee Buckets
    // =========================================================================
    pub bucket_count: usize,
    /// Admissions between two bucket boundary recomputations
    pub rebucket_interval: usize,
    /// Fee rates remembered for boundary quantiles
    pub fee_history_len: usize,
    /// Block capacity assumed by fee estimation
    pub expected_block_bytes: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_transactions: 50_000,
            max_bytes: 300 * 1024 * 1024,
            max_ancestors: MAX_ANCESTORS,
            max_descendants: MAX_DESCENDANTS,
            rbf_fee_increment: RBF_FEE_INCREMENT,
            min_fee_rate: 0.0,
            max_age_secs: 14 * 24 * 60 * 60,
            eviction_interval_secs: 60,
            bucket_count: 10,
            rebucket_interval: 1_000,
            fee_history_len: 10_000,
            expected_block_bytes: 1_000_000,
        }
    }
}

impl MempoolConfig {
    pub fn for_testing() -> Self {
        Self {
            max_transactions: 1_000,
            max_bytes: usize::MAX,
            rbf_fee_increment: 5,
            bucket_count: 4,
            rebucket_interval: 8,
            fee_history_len: 64,
            expected_block_bytes: 10_000,
            ..Self::default()
        }
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// Transaction rule limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub max_tx_size: usize,
    pub max_inputs: usize,
    pub max_outputs: usize,
    pub min_version: u32,
    pub max_version: u32,
    pub signature_timeout_ms: u64,
    pub min_pow_difficulty: u32,
    /// Maximum age of a reward's PoW datum
    pub pow_freshness_secs: u64,
    pub min_voting_power: u64,
    pub max_voting_power: u64,
    pub vote_cooldown_blocks: u64,
    pub retry: RetryPolicy,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_tx_size: MAX_TX_SIZE,
            max_inputs: MAX_INPUTS,
            max_outputs: MAX_OUTPUTS,
            min_version: MIN_TX_VERSION,
            max_version: MAX_TX_VERSION,
            signature_timeout_ms: 5_000,
            min_pow_difficulty: MIN_POW_DIFFICULTY,
            pow_freshness_secs: 2 * 60 * 60,
            min_voting_power: MIN_VOTING_POWER,
            max_voting_power: MAX_VOTING_POWER,
            vote_cooldown_blocks: VOTE_COOLDOWN_BLOCKS,
            retry: RetryPolicy::default(),
        }
    }
}

impl ValidationConfig {
    pub fn for_testing() -> Self {
        Self {
            min_pow_difficulty: 4,
            retry: RetryPolicy::for_testing(),
            ..Self::default()
        }
    }

    pub fn signature_timeout(&self) -> Duration {
        Duration::from_millis(self.signature_timeout_ms)
    }
}

/// Block rule limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockValidationConfig {
    pub max_transactions: usize,
    pub timeout_ms: u64,
    /// Accepted timestamp window around wall-clock time
    pub max_past_secs: u64,
    pub max_future_secs: u64,
    pub min_block_version: u32,
    pub max_block_version: u32,
    pub quorum_threshold: f64,
    pub min_validators: usize,
    pub max_reputation: u64,
    pub tx_batch_size: usize,
    pub merkle_batch_size: usize,
    pub block_size: BlockSizeParams,
    pub reward: RewardSchedule,
}

impl Default for BlockValidationConfig {
    fn default() -> Self {
        Self {
            max_transactions: MAX_TRANSACTIONS,
            timeout_ms: 30_000,
            max_past_secs: 2 * 60 * 60,
            max_future_secs: 2 * 60 * 60,
            min_block_version: MIN_BLOCK_VERSION,
            max_block_version: MAX_BLOCK_VERSION,
            quorum_threshold: QUORUM_THRESHOLD,
            min_validators: 3,
            max_reputation: MAX_REPUTATION,
            tx_batch_size: TX_BATCH_SIZE,
            merkle_batch_size: MERKLE_BATCH_SIZE,
            block_size: BlockSizeParams::default(),
            reward: RewardSchedule::default(),
        }
    }
}

impl BlockValidationConfig {
    pub fn for_testing() -> Self {
        Self {
            timeout_ms: 5_000,
            min_validators: 1,
            tx_batch_size: 4,
            merkle_batch_size: 4,
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Complete ledger configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub utxo_set: UtxoSetConfig,
    #[serde(default)]
    pub mempool: MempoolConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub block: BlockValidationConfig,
}

impl LedgerConfig {
    pub fn for_testing() -> Self {
        Self {
            utxo_set: UtxoSetConfig::for_testing(),
            mempool: MempoolConfig::for_testing(),
            validation: ValidationConfig::for_testing(),
            block: BlockValidationConfig::for_testing(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ConsensusError::Config(format!("invalid ledger config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity checks across sections
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(ConsensusError::Config(msg.to_string()));

        if self.utxo_set.max_size == 0 {
            return fail("utxo_set.max_size must be positive");
        }
        if self.utxo_set.event_capacity == 0 {
            return fail("utxo_set.event_capacity must be positive");
        }
        if self.mempool.max_transactions == 0 || self.mempool.max_bytes == 0 {
            return fail("mempool capacity must be positive");
        }
        if self.mempool.bucket_count == 0 {
            return fail("mempool.bucket_count must be positive");
        }
        if self.mempool.min_fee_rate < 0.0 {
            return fail("mempool.min_fee_rate must not be negative");
        }
        if self.validation.min_version > self.validation.max_version {
            return fail("validation version range is empty");
        }
        if self.utxo_set.max_voting_power != self.validation.max_voting_power {
            return fail("max_voting_power must agree between utxo_set and validation");
        }
        if self.validation.min_voting_power > self.validation.max_voting_power {
            return fail("validation voting power range is empty");
        }
        if self.validation.max_inputs == 0 || self.validation.max_outputs == 0 {
            return fail("validation input/output limits must be positive");
        }
        if self.block.min_block_version > self.block.max_block_version {
            return fail("block version range is empty");
        }
        if !(self.block.quorum_threshold > 0.0 && self.block.quorum_threshold <= 1.0) {
            return fail("block.quorum_threshold must be in (0, 1]");
        }
        if self.block.max_reputation == 0 {
            return fail("block.max_reputation must be positive");
        }
        if self.block.tx_batch_size == 0 || self.block.merkle_batch_size == 0 {
            return fail("block batch sizes must be positive");
        }
        if self.block.reward.halving_interval == 0 {
            return fail("block.reward.halving_interval must be positive");
        }
        self.block.block_size.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(LedgerConfig::default().validate().is_ok());
        assert!(LedgerConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let json = r#"{
            "mempool": {
                "max_transactions": 10,
                "max_bytes": 100000,
                "max_ancestors": 5,
                "max_descendants": 5,
                "rbf_fee_increment": "5",
                "min_fee_rate": 0.0,
                "max_age_secs": 60,
                "eviction_interval_secs": 1,
                "bucket_count": 2,
                "rebucket_interval": 10,
                "fee_history_len": 10,
                "expected_block_bytes": 1000
            }
        }"#;
        let config = LedgerConfig::from_json_str(json).unwrap();
        assert_eq!(config.mempool.max_ancestors, 5);
        assert_eq!(config.mempool.rbf_fee_increment, 5);
        assert_eq!(config.block.max_transactions, MAX_TRANSACTIONS);
    }

    #[test]
    fn test_rejects_bad_quorum() {
        let mut config = LedgerConfig::default();
        config.block.quorum_threshold = 1.5;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_rejects_mismatched_voting_power_cap() {
        let mut config = LedgerConfig::default();
        config.utxo_set.max_voting_power = config.validation.max_voting_power + 1;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");

        config.validation.max_voting_power = config.utxo_set.max_voting_power;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(LedgerConfig::from_json_str("{ not json").is_err());
    }
}
