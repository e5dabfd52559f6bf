//! # QV-Ledger
//!
//! Ledger state and validation engine for a proof-of-work chain with a
//! quadratic-voting governance layer.
//!
//! The crate tracks the set of unspent outputs, queues unconfirmed
//! transactions, and enforces the rules deciding whether a transaction or a
//! block may change ledger state.
//!
//! ## Architecture
//!
//! Leaf to root:
//! - Ledger store (key-value trait with in-memory and sled adapters)
//! - UTXO set (in-memory index, durable mirror, Merkle commitment)
//! - Mempool (fee buckets, ancestor/descendant bounds, replace-by-fee)
//! - Transaction validator (structure, balance, signatures, PoW rewards, votes)
//! - Block validator (PoW, quorum, Merkle root, in-block transaction rules)
//!
//! [`Ledger`] wires them together: transactions enter through the mempool;
//! a block is validated against a frozen snapshot of the set and only then
//! applied, after which its transactions leave the mempool.
//!
//! ## Design Principles
//!
//! 1. **Validate before mutate**: no rule failure leaves partial state
//! 2. **Typed rejections**: every failure carries a stable code and category
//! 3. **Exact Version Pinning**: consensus-critical crypto pinned to exact versions
//! 4. **Exact arithmetic**: amounts are integers, voting power uses integer square roots
//!
//! ## Usage
//!
//! ```rust
//! use qv_ledger::{Ledger, LedgerConfig};
//! use qv_ledger::crypto::{KeyPair, Secp256k1Crypto};
//! use qv_ledger::store::MemoryStore;
//! use std::sync::Arc;
//!
//! let ledger = Ledger::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(Secp256k1Crypto::new()),
//!     KeyPair::from_seed(b"ledger").unwrap(),
//!     LedgerConfig::default(),
//! )
//! .unwrap();
//! assert!(ledger.utxo_set().is_empty());
//! ```

pub mod block;
pub mod block_size;
pub mod builder;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod economic;
pub mod error;
pub mod mempool;
pub mod merkle;
pub mod pow;
pub mod retry;
pub mod script;
pub mod store;
pub mod transaction;
pub mod types;
pub mod utxo_set;
pub mod voting;

// Re-export commonly used types
pub use block::{BlockValidator, ValidatedBlock};
pub use config::LedgerConfig;
pub use error::{ConsensusError, ErrorKind, Result};
pub use mempool::{Mempool, MempoolEntry, MempoolInfo, PendingOptions};
pub use transaction::{TransactionValidator, ValidatedTransaction};
pub use types::*;
pub use utxo_set::{ListUnspentOptions, UtxoEvent, UtxoSet, UtxoView};

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, instrument};

use crate::crypto::{CryptoProvider, KeyPair};
use crate::store::LedgerStore;
use crate::voting::VoteTally;

/// UTXO set, mempool and validators over one store
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    utxo_set: Arc<UtxoSet>,
    tx_validator: Arc<TransactionValidator>,
    mempool: Arc<Mempool>,
    block_validator: BlockValidator,
    /// Last connected block; serializes `connect_block`
    tip: Mutex<Option<Block>>,
    config: LedgerConfig,
}

impl Ledger {
    /// Ledger over an empty set
    pub fn new(
        store: Arc<dyn LedgerStore>,
        crypto: Arc<dyn CryptoProvider>,
        keypair: KeyPair,
        config: LedgerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let utxo_set = UtxoSet::new(
            Arc::clone(&store),
            Arc::clone(&crypto),
            keypair,
            config.utxo_set.clone(),
        );
        Ok(Self::assemble(store, crypto, utxo_set, config))
    }

    /// Ledger over the unspent outputs already in `store`
    pub async fn open(
        store: Arc<dyn LedgerStore>,
        crypto: Arc<dyn CryptoProvider>,
        keypair: KeyPair,
        config: LedgerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let utxo_set = UtxoSet::open(
            Arc::clone(&store),
            Arc::clone(&crypto),
            keypair,
            config.utxo_set.clone(),
        )
        .await?;
        Ok(Self::assemble(store, crypto, utxo_set, config))
    }

    fn assemble(
        store: Arc<dyn LedgerStore>,
        crypto: Arc<dyn CryptoProvider>,
        utxo_set: UtxoSet,
        config: LedgerConfig,
    ) -> Self {
        let utxo_set = Arc::new(utxo_set);
        let tx_validator = Arc::new(TransactionValidator::new(
            Arc::clone(&crypto),
            Arc::clone(&store),
            config.validation.clone(),
        ));
        let mempool = Arc::new(Mempool::new(
            Arc::clone(&utxo_set),
            Arc::clone(&tx_validator),
            config.mempool.clone(),
        ));
        let block_validator =
            BlockValidator::new(crypto, Arc::clone(&tx_validator), config.block.clone());

        Self {
            store,
            utxo_set,
            tx_validator,
            mempool,
            block_validator,
            tip: Mutex::new(None),
            config,
        }
    }

    pub fn utxo_set(&self) -> &Arc<UtxoSet> {
        &self.utxo_set
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn transaction_validator(&self) -> &Arc<TransactionValidator> {
        &self.tx_validator
    }

    pub fn block_validator(&self) -> &BlockValidator {
        &self.block_validator
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub async fn tip(&self) -> Option<Block> {
        self.tip.lock().await.clone()
    }

    /// Admit a transaction to the mempool
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<MempoolEntry> {
        let entry = self.mempool.add_transaction(tx).await?;
        self.observe_mempool().await?;
        Ok(entry)
    }

    /// ConnectBlock: ℬ × 𝒰𝒮 → 𝒰𝒮'
    ///
    /// 1. Validate against the current tip and a snapshot of the set
    /// 2. Apply all transactions to the set in one batch and record votes
    /// 3. Drop confirmed and conflicting transactions from the mempool
    /// 4. Feed the block into the adaptive size limit
    /// 5. Advance heights and the tip
    #[instrument(skip_all, fields(height = block.header.height))]
    pub async fn connect_block(&self, block: Block) -> Result<ValidatedBlock> {
        let mut tip = self.tip.lock().await;

        // 1. Validate
        let validated = self
            .block_validator
            .validate_block(&block, tip.as_ref(), &self.utxo_set)
            .await?;

        // 2. Apply, then record the block's votes
        self.utxo_set.apply_block(&block).await?;
        for tx in &block.transactions {
            if let Err(e) = self.tx_validator.confirm_vote(tx, block.header.height).await {
                error!("vote {} not recorded: {}", tx.id_hex(), e);
            }
        }

        // 3. Mempool
        let removed = self.mempool.remove_transactions(&block.transactions).await;

        // 4. Size limit
        let limit = self.block_validator.record_block(block.header.timestamp)?;

        // 5. Heights
        let height = block.header.height;
        self.utxo_set.set_height(height);
        self.mempool.set_height(height).await;
        self.observe_mempool().await?;

        info!(
            "connected block {} ({} transactions, {} left the mempool, next limit {} bytes)",
            height,
            block.transactions.len(),
            removed,
            limit
        );
        *tip = Some(block);
        Ok(validated)
    }

    /// Weighted approve/reject totals per proposal of a block's votes
    pub fn tally_block_votes(&self, block: &Block) -> BTreeMap<String, VoteTally> {
        voting::tally_votes(&block.votes, self.config.block.tx_batch_size)
    }

    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }

    async fn observe_mempool(&self) -> Result<()> {
        let bytes = self.mempool.get_mempool_info().await.bytes;
        self.block_validator.observe_mempool_bytes(bytes as u64)
    }
}
