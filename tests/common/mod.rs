//! Shared fixtures for integration tests

#![allow(dead_code)]

use qv_ledger::builder::{coinbase, TransactionBuilder};
use qv_ledger::crypto::{CryptoProvider, KeyPair, Secp256k1Crypto};
use qv_ledger::merkle::{merkle_proof, merkle_root};
use qv_ledger::pow::{check_proof_of_work, hash_block};
use qv_ledger::script::p2pkh_script;
use qv_ledger::store::{LedgerStore, MemoryStore};
use qv_ledger::*;
use std::sync::Arc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn crypto() -> Arc<Secp256k1Crypto> {
    Arc::new(Secp256k1Crypto::new())
}

pub fn keypair(name: &str) -> KeyPair {
    KeyPair::from_seed(name.as_bytes()).unwrap()
}

pub fn ledger() -> Ledger {
    ledger_with(LedgerConfig::for_testing(), Arc::new(MemoryStore::new()))
}

pub fn ledger_with(config: LedgerConfig, store: Arc<dyn LedgerStore>) -> Ledger {
    init_tracing();
    Ledger::new(store, crypto(), keypair("ledger"), config).unwrap()
}

/// Confirmed output of `amount` owned by `owner`
pub fn owned_utxo(owner: &KeyPair, seed: u8, amount: Amount) -> Utxo {
    Utxo {
        tx_id: [seed; 32],
        output_index: 0,
        amount,
        address: owner.address(),
        script: p2pkh_script(&owner.public_key_bytes()),
        public_key: owner.public_key_bytes(),
        signature: None,
        spent: false,
        timestamp: 0,
        block_height: Some(0),
        merkle_root: None,
        confirmations: 1,
        currency: Currency::default(),
    }
}

pub async fn fund(set: &UtxoSet, owner: &KeyPair, seed: u8, amount: Amount) -> Utxo {
    set.add(owned_utxo(owner, seed, amount)).await.unwrap()
}

/// Output `index` of `tx` as the builder's input
pub fn output_of(tx: &Transaction, index: u32) -> Utxo {
    let output = &tx.outputs[index as usize];
    Utxo {
        tx_id: tx.id,
        output_index: index,
        amount: output.amount,
        address: output.address.clone(),
        script: output.script.clone(),
        public_key: vec![],
        signature: None,
        spent: false,
        timestamp: tx.timestamp,
        block_height: None,
        merkle_root: None,
        confirmations: 0,
        currency: Currency::default(),
    }
}

/// Spend `input` back to its owner, paying `fee`
pub fn pay_fee(owner: &KeyPair, input: Utxo, fee: Amount) -> Transaction {
    let amount = input.amount - fee;
    TransactionBuilder::new()
        .add_input(input)
        .pay_to(&owner.public_key_bytes(), amount)
        .timestamp(1)
        .build(owner, crypto().as_ref())
        .unwrap()
}

pub fn reward(recipient: &KeyPair, amount: Amount, timestamp: u64) -> Transaction {
    coinbase(&recipient.public_key_bytes(), amount, timestamp)
}

/// Validators attesting blocks, each with reputation 100
pub struct ValidatorSet {
    pub keys: Vec<KeyPair>,
}

impl ValidatorSet {
    pub fn new(count: usize) -> Self {
        Self {
            keys: (0..count).map(|i| keypair(&format!("validator-{}", i))).collect(),
        }
    }

    fn leaves(&self) -> Vec<Hash> {
        self.keys
            .iter()
            .map(|k| validator_leaf_hash(&k.address(), &k.public_key_bytes(), 100))
            .collect()
    }

    pub fn root(&self) -> Hash {
        merkle_root(&self.leaves())
    }

    /// Sign the block hash with every validator
    pub fn attest(&self, block: &mut Block) {
        let leaves = self.leaves();
        let hash = hash_block(block);
        let crypto = crypto();
        block.validators = self
            .keys
            .iter()
            .enumerate()
            .map(|(i, key)| ValidatorInfo {
                address: key.address(),
                public_key: key.public_key_bytes(),
                reputation: 100,
                signature: crypto.sign(&hash, key).unwrap(),
                merkle_proof: merkle_proof(&leaves, i).unwrap(),
            })
            .collect();
    }
}

/// Block on top of `previous` at low difficulty, nonce ground and attested
pub fn build_block(
    validators: &ValidatorSet,
    previous: Option<&Block>,
    transactions: Vec<Transaction>,
    difficulty: u32,
) -> Block {
    let ids: Vec<Hash> = transactions.iter().map(|tx| tx.id).collect();
    let now = unix_timestamp();
    let (previous_hash, height, timestamp) = match previous {
        Some(parent) => (
            hash_block(parent),
            parent.header.height + 1,
            now.max(parent.header.timestamp + 1),
        ),
        None => ([0; 32], 1, now),
    };

    let mut block = Block {
        header: BlockHeader {
            version: 1,
            previous_hash,
            merkle_root: merkle_root(&ids),
            validator_merkle_root: validators.root(),
            timestamp,
            difficulty,
            nonce: 0,
            height,
        },
        transactions,
        votes: vec![],
        validators: vec![],
    };

    while !check_proof_of_work(&block).unwrap() {
        block.header.nonce += 1;
    }
    validators.attest(&mut block);
    block
}
