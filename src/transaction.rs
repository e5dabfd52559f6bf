//! Transaction validation

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::config::ValidationConfig;
use crate::constants::MAX_MONEY;
use crate::crypto::{address_from_public_key, CryptoProvider};
use crate::error::{ConsensusError, Result};
use crate::pow::{meets_difficulty, reward_pow_hash};
use crate::script;
use crate::store::LedgerStore;
use crate::types::*;
use crate::utxo_set::UtxoView;
use crate::voting::{calculate_voting_power, VoteTracker};

/// Outcome of a successful validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTransaction {
    pub fee: Amount,
    pub input_value: Amount,
    pub output_value: Amount,
    pub size: usize,
    /// Quadratic voting power backing a vote, zero for other types
    pub voting_power: u64,
}

/// Rule engine shared by mempool admission and block validation
pub struct TransactionValidator {
    crypto: Arc<dyn CryptoProvider>,
    votes: Arc<VoteTracker>,
    config: ValidationConfig,
}

impl TransactionValidator {
    pub fn new(
        crypto: Arc<dyn CryptoProvider>,
        store: Arc<dyn LedgerStore>,
        config: ValidationConfig,
    ) -> Self {
        let votes = Arc::new(VoteTracker::new(
            store,
            config.vote_cooldown_blocks,
            config.retry.clone(),
        ));
        Self {
            crypto,
            votes,
            config,
        }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn vote_tracker(&self) -> &VoteTracker {
        &self.votes
    }

    /// ValidateTransaction: 𝒯𝒳 × 𝒰𝒮 × ℕ → {valid, invalid}
    ///
    /// Checks run in order and the first failure is returned:
    /// 1. Structure: id, shape, counts, size
    /// 2. Inputs and outputs: amounts, existence, ownership, balance, fee
    /// 3. Signatures over the id, each raced against a timeout
    /// 4. Version range
    /// 5. Type rules: PoW datum for rewards, power and cooldown for votes
    pub async fn validate_transaction(
        &self,
        tx: &Transaction,
        view: &dyn UtxoView,
        height: Height,
    ) -> Result<ValidatedTransaction> {
        self.validate_replacement(tx, view, height, &HashSet::new())
            .await
    }

    /// [`validate_transaction`](Self::validate_transaction) for a
    /// transaction that evicts `replaceable` when admitted. A vote recorded
    /// for one of those does not hold back the voter's cooldown.
    #[instrument(skip(self, tx, view, replaceable), fields(tx = %tx.id_hex()))]
    pub async fn validate_replacement(
        &self,
        tx: &Transaction,
        view: &dyn UtxoView,
        height: Height,
        replaceable: &HashSet<Hash>,
    ) -> Result<ValidatedTransaction> {
        // 1. Structure
        self.check_structure(tx)?;

        // 2. Inputs and outputs
        let (inputs, input_value, output_value) = self.check_inputs(tx, view)?;

        // 3. Signatures
        self.verify_signatures(tx).await?;

        // 4. Version
        self.check_version(tx)?;

        // 5. Type rules
        let voting_power = match tx.tx_type {
            TransactionType::PowReward => {
                self.check_pow_reward(tx, unix_timestamp())?;
                0
            }
            TransactionType::QuadraticVote => {
                self.check_quadratic_vote(tx, &inputs, height, replaceable)
                    .await?
            }
            TransactionType::Standard | TransactionType::Coinbase => 0,
        };

        debug!(
            "transaction valid: fee {} size {} power {}",
            tx.fee,
            tx.size(),
            voting_power
        );
        Ok(ValidatedTransaction {
            fee: tx.fee,
            input_value,
            output_value,
            size: tx.size(),
            voting_power,
        })
    }

    /// CheckTransaction: 𝒯𝒳 → {valid, invalid}
    ///
    /// 1. id ≠ 0 ∧ id = SHA256d(signing bytes)
    /// 2. |outs| > 0, every output has an address and a standard script
    /// 3. reward ⇒ |ins| = 0, otherwise |ins| > 0
    /// 4. |ins| ≤ max_inputs ∧ |outs| ≤ max_outputs
    /// 5. |tx| ≤ max_tx_size
    pub fn check_structure(&self, tx: &Transaction) -> Result<()> {
        // 1. Identity
        if tx.id == [0u8; 32] {
            return Err(ConsensusError::InvalidStructure("missing transaction id".to_string()));
        }
        if tx.compute_id() != tx.id {
            return Err(ConsensusError::InvalidStructure(format!(
                "id {} does not match contents",
                tx.id_hex()
            )));
        }

        // 2. Outputs
        if tx.outputs.is_empty() {
            return Err(ConsensusError::InvalidStructure("no outputs".to_string()));
        }
        for (i, output) in tx.outputs.iter().enumerate() {
            if output.address.is_empty() {
                return Err(ConsensusError::InvalidStructure(format!(
                    "output {} has no address",
                    i
                )));
            }
            if !script::is_standard(&output.script) {
                return Err(ConsensusError::NonStandardScript(format!("output {}", i)));
            }
        }

        // 3. Inputs by type
        if tx.is_reward() {
            if !tx.inputs.is_empty() {
                return Err(ConsensusError::InvalidStructure(
                    "reward transaction with inputs".to_string(),
                ));
            }
            if tx.fee != 0 {
                return Err(ConsensusError::InvalidAmount(
                    "reward transaction pays a fee".to_string(),
                ));
            }
        } else if tx.inputs.is_empty() {
            return Err(ConsensusError::InvalidStructure("no inputs".to_string()));
        }

        // 4. Counts
        if tx.inputs.len() > self.config.max_inputs {
            return Err(ConsensusError::InvalidStructure(format!(
                "too many inputs: {}",
                tx.inputs.len()
            )));
        }
        if tx.outputs.len() > self.config.max_outputs {
            return Err(ConsensusError::InvalidStructure(format!(
                "too many outputs: {}",
                tx.outputs.len()
            )));
        }

        // 5. Size
        let size = tx.size();
        if size > self.config.max_tx_size {
            return Err(ConsensusError::TransactionTooLarge {
                size,
                max: self.config.max_tx_size,
            });
        }

        Ok(())
    }

    /// CheckTxInputs: 𝒯𝒳 × 𝒰𝒮 → 𝒰* × ℕ × ℕ
    ///
    /// Returns the spent outputs with Σin and Σout; requires
    /// Σin ≥ Σout and fee = Σin − Σout for non-reward transactions.
    pub fn check_inputs(
        &self,
        tx: &Transaction,
        view: &dyn UtxoView,
    ) -> Result<(Vec<Utxo>, Amount, Amount)> {
        let mut output_value: Amount = 0;
        for (i, output) in tx.outputs.iter().enumerate() {
            if output.amount == 0 || output.amount > MAX_MONEY {
                return Err(ConsensusError::InvalidAmount(format!(
                    "output {} amount {}",
                    i, output.amount
                )));
            }
            output_value = output_value.saturating_add(output.amount);
        }
        if output_value > MAX_MONEY {
            return Err(ConsensusError::InvalidAmount(format!(
                "outputs total {}",
                output_value
            )));
        }

        if tx.is_reward() {
            return Ok((Vec::new(), 0, output_value));
        }

        let mut seen = HashSet::with_capacity(tx.inputs.len());
        let mut spent = Vec::with_capacity(tx.inputs.len());
        let mut input_value: Amount = 0;

        for input in &tx.inputs {
            if !seen.insert(input.prev_out) {
                return Err(ConsensusError::DuplicateInput(input.prev_out));
            }

            let utxo = view
                .lookup(&input.prev_out)
                .ok_or(ConsensusError::UtxoNotFound(input.prev_out))?;
            if utxo.spent {
                return Err(ConsensusError::UtxoAlreadySpent(input.prev_out));
            }
            if input.amount != utxo.amount {
                return Err(ConsensusError::InvalidAmount(format!(
                    "input {} declares {}, output holds {}",
                    input.prev_out, input.amount, utxo.amount
                )));
            }
            if !owns(&utxo, &input.public_key) {
                return Err(ConsensusError::InvalidSignature(format!(
                    "key does not own {}",
                    input.prev_out
                )));
            }

            input_value = input_value.saturating_add(utxo.amount);
            spent.push(utxo);
        }

        if input_value < output_value {
            return Err(ConsensusError::InsufficientFunds {
                have: input_value,
                need: output_value,
            });
        }
        let fee = input_value - output_value;
        if tx.fee != fee {
            return Err(ConsensusError::InvalidAmount(format!(
                "declared fee {} but inputs minus outputs is {}",
                tx.fee, fee
            )));
        }

        Ok((spent, input_value, output_value))
    }

    /// Every input signs the transaction id. Verifications run on the
    /// blocking pool, concurrently, each under the signature timeout.
    pub async fn verify_signatures(&self, tx: &Transaction) -> Result<()> {
        let timeout = self.config.signature_timeout();

        let checks = tx.inputs.iter().enumerate().map(|(i, input)| {
            let crypto = Arc::clone(&self.crypto);
            let message = tx.id;
            let signature = input.signature.clone();
            let public_key = input.public_key.clone();

            async move {
                let verify = tokio::task::spawn_blocking(move || {
                    crypto.verify(&message, &signature, &public_key)
                });
                match tokio::time::timeout(timeout, verify).await {
                    Ok(Ok(true)) => Ok(()),
                    Ok(Ok(false)) => Err(ConsensusError::InvalidSignature(format!("input {}", i))),
                    Ok(Err(join)) => Err(ConsensusError::from(join)),
                    Err(_) => Err(ConsensusError::Timeout {
                        operation: format!("signature verification of input {}", i),
                        after_ms: timeout.as_millis() as u64,
                    }),
                }
            }
        });

        for result in join_all(checks).await {
            if let Err(e) = result {
                warn!("signature check failed: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn check_version(&self, tx: &Transaction) -> Result<()> {
        if tx.version < self.config.min_version || tx.version > self.config.max_version {
            return Err(ConsensusError::UnsupportedVersion {
                version: tx.version,
                min: self.config.min_version,
                max: self.config.max_version,
            });
        }
        Ok(())
    }

    /// CheckPowReward: 𝒯𝒳 × ℕ → {valid, invalid}
    ///
    /// 1. PoW datum present
    /// 2. hash = SHA256d(recipient ‖ nonce ‖ difficulty ‖ timestamp)
    /// 3. leading zero bits ≥ max(datum difficulty, minimum difficulty)
    /// 4. |now − datum timestamp| within the freshness window
    pub fn check_pow_reward(&self, tx: &Transaction, now: u64) -> Result<()> {
        let pow = tx
            .pow_data
            .as_ref()
            .ok_or_else(|| ConsensusError::InvalidProofOfWork("missing PoW datum".to_string()))?;
        let recipient = tx
            .outputs
            .first()
            .map(|o| o.address.as_str())
            .unwrap_or_default();

        if reward_pow_hash(recipient, pow) != pow.hash {
            return Err(ConsensusError::InvalidProofOfWork(
                "declared hash does not match datum".to_string(),
            ));
        }

        let required = pow.difficulty.max(self.config.min_pow_difficulty);
        if !meets_difficulty(&pow.hash, required) {
            return Err(ConsensusError::InvalidProofOfWork(format!(
                "hash does not meet difficulty {}",
                required
            )));
        }

        let freshness = self.config.pow_freshness_secs;
        if pow.timestamp > now.saturating_add(freshness) {
            return Err(ConsensusError::InvalidTimestamp(format!(
                "PoW timestamp {} is in the future",
                pow.timestamp
            )));
        }
        if now.saturating_sub(pow.timestamp) > freshness {
            return Err(ConsensusError::StaleProofOfWork(format!(
                "PoW from {} is older than {} s",
                pow.timestamp, freshness
            )));
        }

        Ok(())
    }

    /// CheckQuadraticVote: 𝒯𝒳 × 𝒰* × ℕ → ℕ
    ///
    /// power = min(Σ ⌊√amount⌋, cap) over the spent outputs; requires
    /// power ≥ minimum, weight ≤ power and the voter's cooldown elapsed.
    /// Nothing is recorded; see [`record_vote`](Self::record_vote).
    pub async fn check_quadratic_vote(
        &self,
        tx: &Transaction,
        inputs: &[Utxo],
        height: Height,
        replaceable: &HashSet<Hash>,
    ) -> Result<u64> {
        let vote = tx
            .vote_data
            .as_ref()
            .ok_or_else(|| ConsensusError::InvalidStructure("missing vote datum".to_string()))?;

        let power = calculate_voting_power(inputs, self.config.max_voting_power);
        if power < self.config.min_voting_power {
            return Err(ConsensusError::InsufficientVotingPower {
                power,
                required: self.config.min_voting_power,
            });
        }
        if vote.weight > power {
            return Err(ConsensusError::InsufficientVotingPower {
                power,
                required: vote.weight,
            });
        }

        let voter = voter_address(tx)?;
        self.votes
            .check_cooldown(&voter, tx.id, height, replaceable)
            .await?;

        Ok(power)
    }

    /// Record an admitted vote, re-checking the cooldown under the tracker
    /// lock. No-op for other transaction types.
    pub async fn record_vote(
        &self,
        tx: &Transaction,
        height: Height,
        replaceable: &HashSet<Hash>,
    ) -> Result<()> {
        if tx.tx_type != TransactionType::QuadraticVote {
            return Ok(());
        }
        let voter = voter_address(tx)?;
        self.votes
            .record_vote(&voter, tx.id, height, replaceable)
            .await
    }

    /// Record a vote confirmed in a block at `height`
    pub async fn confirm_vote(&self, tx: &Transaction, height: Height) -> Result<()> {
        if tx.tx_type != TransactionType::QuadraticVote {
            return Ok(());
        }
        let voter = voter_address(tx)?;
        self.votes.confirm_vote(&voter, tx.id, height).await
    }
}

/// Address of the key signing a vote's first input
pub fn voter_address(tx: &Transaction) -> Result<String> {
    tx.inputs
        .first()
        .map(|i| address_from_public_key(&i.public_key))
        .ok_or_else(|| ConsensusError::InvalidStructure("vote without inputs".to_string()))
}

/// Whether `public_key` is the owner of `utxo`
fn owns(utxo: &Utxo, public_key: &[u8]) -> bool {
    if utxo.public_key.is_empty() {
        script::script_matches_key(&utxo.script, public_key)
    } else {
        utxo.public_key == public_key
    }
}
