//! Transaction construction
//!
//! Inputs are unspent outputs owned by a single key. `build` fills in the
//! fee and optional change, computes the id and signs it once for every
//! input.

use crate::crypto::{address_from_public_key, CryptoProvider, KeyPair};
use crate::error::{ConsensusError, Result};
use crate::pow::reward_pow_hash;
use crate::script::p2pkh_script;
use crate::types::*;

#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    tx_type: TransactionType,
    version: u32,
    inputs: Vec<Utxo>,
    outputs: Vec<TxOutput>,
    fee: Option<Amount>,
    change_key: Option<ByteString>,
    timestamp: Option<u64>,
    vote_data: Option<VoteData>,
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self {
            tx_type: TransactionType::Standard,
            version: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            fee: None,
            change_key: None,
            timestamp: None,
            vote_data: None,
        }
    }

    /// Quadratic vote on `proposal_id`, backed by the inputs' value
    pub fn vote(proposal_id: &str, choice: bool, weight: u64) -> Self {
        Self {
            tx_type: TransactionType::QuadraticVote,
            vote_data: Some(VoteData {
                proposal_id: proposal_id.to_string(),
                choice,
                weight,
            }),
            ..Self::new()
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn add_input(mut self, utxo: Utxo) -> Self {
        self.inputs.push(utxo);
        self
    }

    pub fn add_inputs(mut self, utxos: impl IntoIterator<Item = Utxo>) -> Self {
        self.inputs.extend(utxos);
        self
    }

    pub fn add_output(mut self, output: TxOutput) -> Self {
        self.outputs.push(output);
        self
    }

    /// Pay `amount` to the P2PKH address of `public_key`
    pub fn pay_to(self, public_key: &[u8], amount: Amount) -> Self {
        self.add_output(p2pkh_output(public_key, amount))
    }

    /// Fixed fee; without one, everything not paid out becomes the fee
    pub fn fee(mut self, fee: Amount) -> Self {
        self.fee = Some(fee);
        self
    }

    /// Return leftover value to `public_key`. Requires an explicit fee.
    pub fn change_to(mut self, public_key: &[u8]) -> Self {
        self.change_key = Some(public_key.to_vec());
        self
    }

    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Assemble and sign with `keypair`, which must own every input
    pub fn build(self, keypair: &KeyPair, crypto: &dyn CryptoProvider) -> Result<Transaction> {
        if self.inputs.is_empty() {
            return Err(ConsensusError::InvalidStructure("no inputs selected".to_string()));
        }

        let input_value = self
            .inputs
            .iter()
            .try_fold(0u128, |acc, u| acc.checked_add(u.amount))
            .ok_or_else(|| ConsensusError::InvalidAmount("input total overflows".to_string()))?;
        let mut outputs = self.outputs;
        let paid = outputs
            .iter()
            .try_fold(0u128, |acc, o| acc.checked_add(o.amount))
            .ok_or_else(|| ConsensusError::InvalidAmount("output total overflows".to_string()))?;

        let fee = match (self.fee, &self.change_key) {
            (Some(fee), Some(change_key)) => {
                let need = paid.saturating_add(fee);
                if input_value < need {
                    return Err(ConsensusError::InsufficientFunds {
                        have: input_value,
                        need,
                    });
                }
                let change = input_value - need;
                if change > 0 {
                    outputs.push(p2pkh_output(change_key, change));
                }
                fee
            }
            (Some(fee), None) => {
                if input_value != paid.saturating_add(fee) {
                    return Err(ConsensusError::InvalidAmount(format!(
                        "inputs {} do not equal outputs {} plus fee {}",
                        input_value, paid, fee
                    )));
                }
                fee
            }
            (None, _) => input_value.checked_sub(paid).ok_or(
                ConsensusError::InsufficientFunds {
                    have: input_value,
                    need: paid,
                },
            )?,
        };

        let public_key = keypair.public_key_bytes();
        let mut tx = Transaction {
            id: [0; 32],
            tx_type: self.tx_type,
            version: self.version,
            inputs: self
                .inputs
                .iter()
                .map(|utxo| TxInput {
                    prev_out: utxo.outpoint(),
                    amount: utxo.amount,
                    signature: Vec::new(),
                    public_key: public_key.clone(),
                })
                .collect(),
            outputs,
            fee,
            timestamp: self.timestamp.unwrap_or_else(unix_timestamp),
            pow_data: None,
            vote_data: self.vote_data,
        };

        tx.id = tx.compute_id();
        let signature = crypto.sign(&tx.id, keypair)?;
        for input in &mut tx.inputs {
            input.signature = signature.clone();
        }
        Ok(tx)
    }
}

/// Block reward paying `amount` to `recipient`. `timestamp` distinguishes
/// the rewards of different blocks.
pub fn coinbase(recipient: &[u8], amount: Amount, timestamp: u64) -> Transaction {
    reward(TransactionType::Coinbase, recipient, amount, timestamp, None)
}

/// Reward backed by a PoW datum found at `nonce`
pub fn pow_reward(
    recipient: &[u8],
    amount: Amount,
    nonce: u64,
    difficulty: u32,
    timestamp: u64,
) -> Transaction {
    let mut pow = PowData {
        nonce,
        difficulty,
        timestamp,
        hash: [0; 32],
    };
    pow.hash = reward_pow_hash(&address_from_public_key(recipient), &pow);
    reward(TransactionType::PowReward, recipient, amount, timestamp, Some(pow))
}

fn reward(
    tx_type: TransactionType,
    recipient: &[u8],
    amount: Amount,
    timestamp: u64,
    pow_data: Option<PowData>,
) -> Transaction {
    let mut tx = Transaction {
        id: [0; 32],
        tx_type,
        version: 1,
        inputs: Vec::new(),
        outputs: vec![p2pkh_output(recipient, amount)],
        fee: 0,
        timestamp,
        pow_data,
        vote_data: None,
    };
    tx.id = tx.compute_id();
    tx
}

fn p2pkh_output(public_key: &[u8], amount: Amount) -> TxOutput {
    TxOutput {
        address: address_from_public_key(public_key),
        amount,
        script: p2pkh_script(public_key),
    }
}
