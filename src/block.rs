//! Block validation
//!
//! Stages run in order and stop at the first failure:
//! Structure → Size → Timestamp → ProofOfWork → Votes → ValidatorQuorum →
//! PreviousBlockLinkage → MerkleRoot → Transactions.
//!
//! Validation never mutates the UTXO set. Transactions are checked against
//! a frozen snapshot overlaid with the effects of earlier transactions in
//! the same block.

use futures::future::join_all;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::block_size::AdaptiveBlockSize;
use crate::config::BlockValidationConfig;
use crate::crypto::CryptoProvider;
use crate::error::{ConsensusError, Result};
use crate::merkle::{merkle_root, verify_proof};
use crate::pow::{check_proof_of_work, hash_block};
use crate::transaction::{voter_address, TransactionValidator};
use crate::types::*;
use crate::utxo_set::{UtxoSet, UtxoSnapshot, UtxoView};

/// Summary of an accepted block
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedBlock {
    pub hash: Hash,
    pub size: u64,
    pub total_fees: Amount,
    /// Amount minted by the reward transaction, if any
    pub reward: Amount,
    /// Passing validator weight over listed validator weight
    pub quorum_score: f64,
}

/// Serialized size: header, transactions, votes and validator entries
pub fn block_size(block: &Block) -> u64 {
    let txs: usize = block.transactions.iter().map(|tx| tx.size()).sum();
    let votes: usize = block
        .votes
        .iter()
        .map(|v| v.signing_bytes().len() + v.signature.len())
        .sum();
    let validators: usize = block
        .validators
        .iter()
        .map(|v| {
            v.address.len()
                + v.public_key.len()
                + 8
                + v.signature.len()
                + 33 * v.merkle_proof.siblings.len()
        })
        .sum();
    (block.header.serialize().len() + txs + votes + validators) as u64
}

/// Snapshot plus the outputs created and consumed so far in the block
struct BlockView<'a> {
    snapshot: &'a UtxoSnapshot,
    created: HashMap<OutPoint, Utxo>,
    spent: HashSet<OutPoint>,
}

impl BlockView<'_> {
    fn apply(&mut self, tx: &Transaction, height: Height) {
        for input in &tx.inputs {
            self.created.remove(&input.prev_out);
            self.spent.insert(input.prev_out);
        }
        for (i, output) in tx.outputs.iter().enumerate() {
            let outpoint = OutPoint::new(tx.id, i as u32);
            self.created.insert(
                outpoint,
                Utxo {
                    tx_id: tx.id,
                    output_index: i as u32,
                    amount: output.amount,
                    address: output.address.clone(),
                    script: output.script.clone(),
                    public_key: Vec::new(),
                    signature: None,
                    spent: false,
                    timestamp: tx.timestamp,
                    block_height: Some(height),
                    merkle_root: None,
                    confirmations: 0,
                    currency: Currency::default(),
                },
            );
        }
    }
}

impl UtxoView for BlockView<'_> {
    fn lookup(&self, outpoint: &OutPoint) -> Option<Utxo> {
        if self.spent.contains(outpoint) {
            return None;
        }
        self.created
            .get(outpoint)
            .cloned()
            .or_else(|| self.snapshot.lookup(outpoint))
    }
}

pub struct BlockValidator {
    crypto: Arc<dyn CryptoProvider>,
    tx_validator: Arc<TransactionValidator>,
    block_size: RwLock<AdaptiveBlockSize>,
    config: BlockValidationConfig,
}

impl BlockValidator {
    pub fn new(
        crypto: Arc<dyn CryptoProvider>,
        tx_validator: Arc<TransactionValidator>,
        config: BlockValidationConfig,
    ) -> Self {
        let block_size = RwLock::new(AdaptiveBlockSize::new(config.block_size.clone()));
        Self {
            crypto,
            tx_validator,
            block_size,
            config,
        }
    }

    pub fn config(&self) -> &BlockValidationConfig {
        &self.config
    }

    /// Byte limit applied to the next block
    pub fn current_size_limit(&self) -> Result<u64> {
        Ok(self.read_size()?.current_limit())
    }

    pub fn observe_mempool_bytes(&self, bytes: u64) -> Result<()> {
        self.write_size()?.observe_mempool_bytes(bytes);
        Ok(())
    }

    pub fn record_propagation_latency(&self, latency_ms: u64) -> Result<()> {
        self.write_size()?.record_propagation_latency(latency_ms);
        Ok(())
    }

    /// Feed a connected block's timestamp; returns the new size limit
    pub fn record_block(&self, timestamp: u64) -> Result<u64> {
        Ok(self.write_size()?.record_block(timestamp))
    }

    /// ValidateBlock: ℬ × ℬ? × 𝒰𝒮 → {valid, invalid}
    ///
    /// Runs every stage under the block timeout; a run that does not finish
    /// in time is rejected.
    #[instrument(skip_all, fields(height = block.header.height))]
    pub async fn validate_block(
        &self,
        block: &Block,
        previous: Option<&Block>,
        utxo_set: &UtxoSet,
    ) -> Result<ValidatedBlock> {
        let timeout = self.config.timeout();
        let result = match tokio::time::timeout(timeout, self.run_stages(block, previous, utxo_set))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ConsensusError::Timeout {
                operation: format!("validation of block {}", block.header.height),
                after_ms: timeout.as_millis() as u64,
            }),
        };

        match &result {
            Ok(validated) => info!(
                "block {} valid: {} transactions, {} bytes, fees {}",
                block.header.height,
                block.transactions.len(),
                validated.size,
                validated.total_fees
            ),
            Err(e) => warn!("block {} rejected: {}", block.header.height, e),
        }
        result
    }

    async fn run_stages(
        &self,
        block: &Block,
        previous: Option<&Block>,
        utxo_set: &UtxoSet,
    ) -> Result<ValidatedBlock> {
        // 1. Structure
        self.check_structure(block)?;

        // 2. Size
        let size = self.check_size(block)?;

        // 3. Timestamp
        self.check_timestamp(block, unix_timestamp())?;

        // 4. Proof of work
        if !check_proof_of_work(block)? {
            return Err(ConsensusError::InvalidProofOfWork(format!(
                "block hash above target for difficulty {}",
                block.header.difficulty
            )));
        }

        // 5. Votes
        self.check_votes(block).await?;

        // 6. Validator quorum
        let hash = hash_block(block);
        let quorum_score = self.check_quorum(block, &hash).await?;

        // 7. Linkage
        if let Some(parent) = previous {
            check_linkage(block, parent)?;
        }

        // 8. Merkle root
        self.check_merkle_root(block)?;

        // 9. Transactions
        let (total_fees, reward) = self.check_transactions(block, utxo_set).await?;

        Ok(ValidatedBlock {
            hash,
            size,
            total_fees,
            reward,
            quorum_score,
        })
    }

    /// CheckBlockStructure: ℬ → {valid, invalid}
    ///
    /// 1. Version within range
    /// 2. At least one transaction, ids unique
    pub fn check_structure(&self, block: &Block) -> Result<()> {
        let version = block.header.version;
        if version < self.config.min_block_version || version > self.config.max_block_version {
            return Err(ConsensusError::UnsupportedVersion {
                version,
                min: self.config.min_block_version,
                max: self.config.max_block_version,
            });
        }

        if block.transactions.is_empty() {
            return Err(ConsensusError::InvalidStructure("block has no transactions".to_string()));
        }

        let mut ids = HashSet::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            if !ids.insert(tx.id) {
                return Err(ConsensusError::DuplicateTransaction(tx.id_hex()));
            }
        }
        Ok(())
    }

    /// |txs| ≤ max_transactions ∧ |block| ≤ current limit
    pub fn check_size(&self, block: &Block) -> Result<u64> {
        let count = block.transactions.len();
        if count > self.config.max_transactions {
            return Err(ConsensusError::ExcessTransactions {
                count,
                max: self.config.max_transactions,
            });
        }

        let size = block_size(block);
        let max = self.current_size_limit()?;
        if size > max {
            return Err(ConsensusError::BlockTooLarge { size, max });
        }
        Ok(size)
    }

    /// now − max_past ≤ timestamp ≤ now + max_future
    pub fn check_timestamp(&self, block: &Block, now: u64) -> Result<()> {
        let timestamp = block.header.timestamp;
        if timestamp > now.saturating_add(self.config.max_future_secs) {
            return Err(ConsensusError::InvalidTimestamp(format!(
                "{} is more than {} s ahead of {}",
                timestamp, self.config.max_future_secs, now
            )));
        }
        if timestamp < now.saturating_sub(self.config.max_past_secs) {
            return Err(ConsensusError::InvalidTimestamp(format!(
                "{} is more than {} s behind {}",
                timestamp, self.config.max_past_secs, now
            )));
        }
        Ok(())
    }

    /// Every vote is signed by its voter
    pub async fn check_votes(&self, block: &Block) -> Result<()> {
        let checks = block.votes.iter().map(|vote| {
            let crypto = Arc::clone(&self.crypto);
            let message = vote.signing_bytes();
            let signature = vote.signature.clone();
            let public_key = vote.voter_public_key.clone();
            tokio::task::spawn_blocking(move || crypto.verify(&message, &signature, &public_key))
        });

        for (i, result) in join_all(checks).await.into_iter().enumerate() {
            if !result? {
                return Err(ConsensusError::InvalidVoteSignature(format!(
                    "vote {} on {}",
                    i, block.votes[i].proposal_id
                )));
            }
        }
        Ok(())
    }

    /// CheckQuorum: ℬ × ℍ → [0, 1]
    ///
    /// A validator passes when its membership proof verifies against the
    /// header's validator root and it signed the block hash. Weight is
    /// reputation / max_reputation. Requires
    /// Σ weight(passing) / Σ weight(listed) ≥ threshold and at least
    /// `min_validators` passing validators.
    pub async fn check_quorum(&self, block: &Block, hash: &Hash) -> Result<f64> {
        let root = block.header.validator_merkle_root;
        let max_reputation = self.config.max_reputation.max(1) as f64;
        let weight = |v: &ValidatorInfo| v.reputation.min(self.config.max_reputation) as f64 / max_reputation;

        let checks = block.validators.iter().map(|validator| {
            let crypto = Arc::clone(&self.crypto);
            let validator = validator.clone();
            let message = *hash;
            tokio::task::spawn_blocking(move || {
                verify_proof(&validator.leaf_hash(), &validator.merkle_proof, &root)
                    && crypto.verify(&message, &validator.signature, &validator.public_key)
            })
        });
        let results = join_all(checks).await;

        let mut total = 0.0;
        let mut passed = 0.0;
        let mut passing = 0usize;
        for (validator, result) in block.validators.iter().zip(results) {
            total += weight(validator);
            if result? {
                passed += weight(validator);
                passing += 1;
            } else {
                debug!("validator {} failed attestation", validator.address);
            }
        }

        let score = if total > 0.0 { passed / total } else { 0.0 };
        if passing < self.config.min_validators || score < self.config.quorum_threshold {
            return Err(ConsensusError::InsufficientQuorum(format!(
                "{} of {} validators passed, score {:.3} < {:.3}",
                passing,
                block.validators.len(),
                score,
                self.config.quorum_threshold
            )));
        }
        Ok(score)
    }

    /// Root over the recomputed transaction ids, leaves hashed in batches
    pub fn check_merkle_root(&self, block: &Block) -> Result<()> {
        let leaves: Vec<Hash> = block
            .transactions
            .par_chunks(self.config.merkle_batch_size.max(1))
            .flat_map_iter(|chunk| chunk.iter().map(|tx| tx.compute_id()))
            .collect();
        let computed = merkle_root(&leaves);

        if computed != block.header.merkle_root {
            return Err(ConsensusError::MerkleRootMismatch {
                expected: hex::encode(block.header.merkle_root),
                computed: hex::encode(computed),
            });
        }
        Ok(())
    }

    /// CheckBlockTransactions: ℬ × 𝒰𝒮 → ℕ × ℕ
    ///
    /// 1. Only index 0 may be a reward: one output, amount ≤ block reward
    /// 2. No outpoint spent twice within the block
    /// 3. Declared amounts of set inputs agree with the live set
    /// 4. Each transaction validates against snapshot + earlier effects
    /// 5. No voter votes twice in the block
    ///
    /// Votes are only checked here; they are recorded when the block is
    /// connected. Returns (Σ fees, reward amount).
    pub async fn check_transactions(
        &self,
        block: &Block,
        utxo_set: &UtxoSet,
    ) -> Result<(Amount, Amount)> {
        let height = block.header.height;
        let snapshot = utxo_set.snapshot()?;
        let mut view = BlockView {
            snapshot: &snapshot,
            created: HashMap::new(),
            spent: HashSet::new(),
        };

        let mut total_fees: Amount = 0;
        let mut reward: Amount = 0;
        let batch_size = self.config.tx_batch_size.max(1);
        let cooldown = self.tx_validator.config().vote_cooldown_blocks;
        let mut voters = HashSet::new();

        for (batch_index, batch) in block.transactions.chunks(batch_size).enumerate() {
            for (offset, tx) in batch.iter().enumerate() {
                let index = batch_index * batch_size + offset;

                // 1. Reward placement
                if tx.is_reward() {
                    reward = self.check_reward(tx, index, height)?;
                }

                // 2. In-block double spends
                for input in &tx.inputs {
                    if view.spent.contains(&input.prev_out) {
                        return Err(ConsensusError::UtxoAlreadySpent(input.prev_out));
                    }
                }

                // 3. Live cross-check
                for input in &tx.inputs {
                    if view.created.contains_key(&input.prev_out) {
                        continue;
                    }
                    let live = utxo_set
                        .get_outpoint(&input.prev_out)
                        .ok_or(ConsensusError::UtxoNotFound(input.prev_out))?;
                    if live.amount != input.amount {
                        return Err(ConsensusError::InvalidAmount(format!(
                            "input {} declares {}, set holds {}",
                            input.prev_out, input.amount, live.amount
                        )));
                    }
                }

                // 4. Full rules
                let validated = self
                    .tx_validator
                    .validate_transaction(tx, &view, height)
                    .await?;
                total_fees = total_fees.saturating_add(validated.fee);

                // 5. One vote per voter per block while a cooldown applies
                if tx.tx_type == TransactionType::QuadraticVote && cooldown > 0 {
                    let voter = voter_address(tx)?;
                    if !voters.insert(voter.clone()) {
                        return Err(ConsensusError::VoteCooldown {
                            address: voter,
                            last_height: height,
                            next_height: height.saturating_add(cooldown),
                        });
                    }
                }
                view.apply(tx, height);
            }
            debug!(
                "validated batch {} ({} transactions)",
                batch_index,
                batch.len()
            );
        }

        Ok((total_fees, reward))
    }

    fn check_reward(&self, tx: &Transaction, index: usize, height: Height) -> Result<Amount> {
        if index != 0 {
            return Err(ConsensusError::InvalidCoinbase(format!(
                "reward transaction at index {}",
                index
            )));
        }
        if tx.outputs.len() != 1 {
            return Err(ConsensusError::InvalidCoinbase(format!(
                "reward has {} outputs",
                tx.outputs.len()
            )));
        }

        let amount = tx.outputs[0].amount;
        let allowed = self.config.reward.block_reward(height);
        if amount > allowed {
            return Err(ConsensusError::InvalidCoinbase(format!(
                "reward {} exceeds {} at height {}",
                amount, allowed, height
            )));
        }
        Ok(amount)
    }

    fn read_size(&self) -> Result<std::sync::RwLockReadGuard<'_, AdaptiveBlockSize>> {
        self.block_size
            .read()
            .map_err(|_| ConsensusError::Storage("block size lock poisoned".to_string()))
    }

    fn write_size(&self) -> Result<std::sync::RwLockWriteGuard<'_, AdaptiveBlockSize>> {
        self.block_size
            .write()
            .map_err(|_| ConsensusError::Storage("block size lock poisoned".to_string()))
    }
}

/// previous_hash = hash(parent) ∧ height = parent.height + 1 ∧
/// timestamp > parent.timestamp
pub fn check_linkage(block: &Block, parent: &Block) -> Result<()> {
    let parent_hash = hash_block(parent);
    if block.header.previous_hash != parent_hash {
        return Err(ConsensusError::InvalidPreviousBlock(format!(
            "previous hash {} does not match parent {}",
            hex::encode(block.header.previous_hash),
            hex::encode(parent_hash)
        )));
    }
    if parent.header.height.checked_add(1) != Some(block.header.height) {
        return Err(ConsensusError::InvalidPreviousBlock(format!(
            "height {} does not follow {}",
            block.header.height, parent.header.height
        )));
    }
    if block.header.timestamp <= parent.header.timestamp {
        return Err(ConsensusError::InvalidPreviousBlock(format!(
            "timestamp {} not after parent {}",
            block.header.timestamp, parent.header.timestamp
        )));
    }
    Ok(())
}
