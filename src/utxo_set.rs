//! UTXO set
//!
//! The set of spendable outputs, held in memory for reads and mirrored to a
//! [`LedgerStore`]. Every committed mutation recomputes a Merkle root over
//! the canonical leaves of all unspent entries, so any entry can be proven
//! against the current root.
//!
//! Locking: a single writer lock serializes all mutations (and
//! `list_unspent`). The in-memory index sits behind a `RwLock` that is only
//! held for short sections without awaiting, so lookups never wait for a
//! writer that is blocked on storage.
//!
//! Spent outputs leave the in-memory index but their records stay in the
//! store, flagged `spent`, which is what `revert_transaction` restores from.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::config::UtxoSetConfig;
use crate::constants::MAX_MONEY;
use crate::crypto::{CryptoProvider, KeyPair};
use crate::error::{ConsensusError, Result};
use crate::merkle::{merkle_proof, merkle_root, verify_proof};
use crate::script;
use crate::store::{
    address_key, unspent_key, utxo_key, LedgerStore, RangeQuery, WriteBatch, UTXO_PREFIX,
};
use crate::types::*;
use crate::voting;

/// Read access to unspent outputs
pub trait UtxoView: Send + Sync {
    /// The unspent output at `outpoint`, if any
    fn lookup(&self, outpoint: &OutPoint) -> Option<Utxo>;
}

/// Notification of a committed mutation. Delivery is best-effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtxoEvent {
    Added(Utxo),
    Removed(Utxo),
    Spent(Utxo),
}

/// Filters for [`UtxoSet::list_unspent`]
#[derive(Debug, Clone, Default)]
pub struct ListUnspentOptions {
    pub addresses: Option<Vec<String>>,
    pub min_amount: Option<Amount>,
    pub max_amount: Option<Amount>,
    pub min_confirmations: Option<u64>,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Frozen copy of the unspent outputs
#[derive(Debug, Clone)]
pub struct UtxoSnapshot {
    entries: Arc<BTreeMap<OutPoint, Utxo>>,
    merkle_root: Hash,
    height: Height,
}

impl UtxoSnapshot {
    pub fn merkle_root(&self) -> Hash {
        self.merkle_root
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_value(&self) -> Amount {
        self.entries.values().map(|u| u.amount).sum()
    }

    /// Entries in canonical order
    pub fn iter(&self) -> impl Iterator<Item = &Utxo> {
        self.entries.values()
    }
}

impl UtxoView for UtxoSnapshot {
    fn lookup(&self, outpoint: &OutPoint) -> Option<Utxo> {
        self.entries.get(outpoint).cloned()
    }
}

#[derive(Debug, Default)]
struct UtxoIndex {
    entries: BTreeMap<OutPoint, Utxo>,
    leaves: BTreeMap<OutPoint, Hash>,
    by_address: HashMap<String, BTreeSet<OutPoint>>,
    total_value: Amount,
    merkle_root: Hash,
}

impl UtxoIndex {
    fn insert(&mut self, utxo: Utxo, leaf: Hash) {
        let outpoint = utxo.outpoint();
        self.leaves.insert(outpoint, leaf);
        self.by_address
            .entry(utxo.address.clone())
            .or_default()
            .insert(outpoint);
        self.total_value = self.total_value.saturating_add(utxo.amount);
        self.entries.insert(outpoint, utxo);
    }

    fn remove(&mut self, outpoint: &OutPoint) -> Option<Utxo> {
        let utxo = self.entries.remove(outpoint)?;
        self.leaves.remove(outpoint);
        if let Some(set) = self.by_address.get_mut(&utxo.address) {
            set.remove(outpoint);
            if set.is_empty() {
                self.by_address.remove(&utxo.address);
            }
        }
        self.total_value = self.total_value.saturating_sub(utxo.amount);
        Some(utxo)
    }

    fn leaf_vec(&self) -> Vec<Hash> {
        self.leaves.values().copied().collect()
    }

    fn recompute_root(&mut self) -> Hash {
        self.merkle_root = merkle_root(&self.leaf_vec());
        self.merkle_root
    }
}

/// In-memory changes of one mutation, kept until the store commits them
#[derive(Debug, Default)]
struct Staged {
    created: Vec<OutPoint>,
    /// Unspent records taken out of the index
    consumed: Vec<Utxo>,
    previous_root: Hash,
}

pub struct UtxoSet {
    index: RwLock<UtxoIndex>,
    /// Writer lock; holds the time of the last public `add`
    writer: Mutex<Option<Instant>>,
    store: Arc<dyn LedgerStore>,
    crypto: Arc<dyn CryptoProvider>,
    keypair: KeyPair,
    config: UtxoSetConfig,
    events: broadcast::Sender<UtxoEvent>,
    height: AtomicU64,
}

impl UtxoSet {
    /// Empty set over `store`
    pub fn new(
        store: Arc<dyn LedgerStore>,
        crypto: Arc<dyn CryptoProvider>,
        keypair: KeyPair,
        config: UtxoSetConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let mut index = UtxoIndex::default();
        index.recompute_root();
        Self {
            index: RwLock::new(index),
            writer: Mutex::new(None),
            store,
            crypto,
            keypair,
            config,
            events,
            height: AtomicU64::new(0),
        }
    }

    /// Rebuild the set from the unspent `utxo:` records in `store`
    pub async fn open(
        store: Arc<dyn LedgerStore>,
        crypto: Arc<dyn CryptoProvider>,
        keypair: KeyPair,
        config: UtxoSetConfig,
    ) -> Result<Self> {
        let set = Self::new(store, crypto, keypair, config);
        let records = set.store.range(RangeQuery::prefix(UTXO_PREFIX)).await?;

        let mut loaded = 0usize;
        let mut height = 0;
        {
            let mut index = set.write_index()?;
            for (key, value) in records {
                let utxo: Utxo = serde_json::from_slice(&value).map_err(|e| {
                    error!("corrupt record {}: {}", key, e);
                    ConsensusError::Serialization(format!("{}: {}", key, e))
                })?;
                if utxo.spent {
                    continue;
                }
                height = height.max(utxo.block_height.unwrap_or_default());
                let leaf = set.leaf_hash(&utxo);
                index.insert(utxo, leaf);
                loaded += 1;
            }
            index.recompute_root();
        }
        set.height.store(height, Ordering::SeqCst);

        info!("loaded {} unspent outputs at height {}", loaded, height);
        Ok(set)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get(&self, tx_id: &Hash, index: u32) -> Option<Utxo> {
        self.get_outpoint(&OutPoint::new(*tx_id, index))
    }

    pub fn get_outpoint(&self, outpoint: &OutPoint) -> Option<Utxo> {
        self.read_index().ok()?.entries.get(outpoint).cloned()
    }

    pub fn exists(&self, outpoint: &OutPoint) -> bool {
        self.read_index()
            .map(|index| index.entries.contains_key(outpoint))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.read_index().map(|i| i.entries.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn merkle_root(&self) -> Hash {
        self.read_index().map(|i| i.merkle_root).unwrap_or_default()
    }

    pub fn total_value(&self) -> Amount {
        self.read_index().map(|i| i.total_value).unwrap_or_default()
    }

    /// Chain height the set has been advanced to
    pub fn height(&self) -> Height {
        self.height.load(Ordering::SeqCst)
    }

    pub fn set_height(&self, height: Height) {
        self.height.store(height, Ordering::SeqCst);
    }

    /// Key the set signs its entries with
    pub fn public_key(&self) -> ByteString {
        self.keypair.public_key_bytes()
    }

    pub fn get_balance(&self, address: &str) -> Amount {
        self.get_utxos_by_address(address)
            .iter()
            .map(|u| u.amount)
            .sum()
    }

    pub fn get_utxos_by_address(&self, address: &str) -> Vec<Utxo> {
        let Ok(index) = self.read_index() else {
            return Vec::new();
        };
        index
            .by_address
            .get(address)
            .map(|ops| {
                ops.iter()
                    .filter_map(|op| index.entries.get(op).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Result<UtxoSnapshot> {
        let index = self.read_index()?;
        Ok(UtxoSnapshot {
            entries: Arc::new(index.entries.clone()),
            merkle_root: index.merkle_root,
            height: self.height(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UtxoEvent> {
        self.events.subscribe()
    }

    /// Quadratic voting power of `utxos`, capped by configuration
    pub fn calculate_voting_power(&self, utxos: &[Utxo]) -> u64 {
        voting::calculate_voting_power(utxos, self.config.max_voting_power)
    }

    /// Unspent outputs matching `options`, in canonical order
    pub async fn list_unspent(&self, options: ListUnspentOptions) -> Result<Vec<Utxo>> {
        let _writer = self.writer.lock().await;
        let height = self.height();
        let index = self.read_index()?;

        let wanted = |utxo: &Utxo| {
            options.min_amount.map_or(true, |min| utxo.amount >= min)
                && options.max_amount.map_or(true, |max| utxo.amount <= max)
                && options
                    .min_confirmations
                    .map_or(true, |min| utxo.confirmations_at(height) >= min)
        };
        let limit = options.limit.unwrap_or(usize::MAX);

        let result = match &options.addresses {
            Some(addresses) => {
                let outpoints: BTreeSet<OutPoint> = addresses
                    .iter()
                    .filter_map(|a| index.by_address.get(a))
                    .flatten()
                    .copied()
                    .collect();
                outpoints
                    .iter()
                    .filter_map(|op| index.entries.get(op))
                    .filter(|u| wanted(*u))
                    .skip(options.offset)
                    .take(limit)
                    .cloned()
                    .collect()
            }
            None => index
                .entries
                .values()
                .filter(|u| wanted(*u))
                .skip(options.offset)
                .take(limit)
                .cloned()
                .collect(),
        };
        Ok(result)
    }

    /// Largest-first selection of `address`'s outputs covering `target`
    pub fn find_utxos_for_amount(&self, address: &str, target: Amount) -> Result<Vec<Utxo>> {
        let mut candidates = self.get_utxos_by_address(address);
        candidates.sort_by(|a, b| {
            b.amount
                .cmp(&a.amount)
                .then_with(|| a.outpoint().cmp(&b.outpoint()))
        });

        let mut selected = Vec::new();
        let mut total: Amount = 0;
        for utxo in candidates {
            if total >= target {
                break;
            }
            total = total.saturating_add(utxo.amount);
            selected.push(utxo);
        }

        if total < target {
            return Err(ConsensusError::InsufficientFunds {
                have: total,
                need: target,
            });
        }
        Ok(selected)
    }

    /// Check `utxo` against the current root and the set's signature.
    /// Read-only; repeated calls give the same answer for the same state.
    pub fn verify_utxo(&self, utxo: &Utxo) -> Result<bool> {
        let index = self.read_index()?;
        let outpoint = utxo.outpoint();
        if !index.leaves.contains_key(&outpoint) {
            debug!("verify {}: not in set", outpoint);
            return Ok(false);
        }

        let position = index.leaves.range(..outpoint).count();
        let proof = match merkle_proof(&index.leaf_vec(), position) {
            Some(proof) => proof,
            None => return Ok(false),
        };
        let in_tree = verify_proof(&self.leaf_hash(utxo), &proof, &index.merkle_root);

        let signed = utxo.signature.as_deref().map_or(false, |sig| {
            self.crypto.verify(
                &utxo.canonical_bytes(),
                sig,
                &self.keypair.public_key_bytes(),
            )
        });

        debug!("verify {}: merkle={} signature={}", outpoint, in_tree, signed);
        Ok(in_tree && signed)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Insert a new unspent output
    pub async fn add(&self, utxo: Utxo) -> Result<Utxo> {
        let mut last_add = self.writer.lock().await;

        let interval = self.config.min_mutation_interval();
        if let Some(last) = *last_add {
            let elapsed = last.elapsed();
            if !interval.is_zero() && elapsed < interval {
                return Err(ConsensusError::RateLimited {
                    retry_in_ms: (interval - elapsed).as_millis() as u64,
                });
            }
        }

        validate_new_utxo(&utxo)?;
        let outpoint = utxo.outpoint();
        {
            let index = self.read_index()?;
            if index.entries.contains_key(&outpoint) {
                return Err(ConsensusError::UtxoExists(outpoint));
            }
            if index.entries.len() >= self.config.max_size {
                return Err(ConsensusError::CapacityExceeded(format!(
                    "UTXO set holds {} entries",
                    self.config.max_size
                )));
            }
        }

        let stored = self.insert_utxo(utxo).await?;
        *last_add = Some(Instant::now());
        Ok(stored)
    }

    /// Index, sign and persist one output; writer lock held by the caller
    async fn insert_utxo(&self, utxo: Utxo) -> Result<Utxo> {
        let outpoint = utxo.outpoint();
        let staged = self.stage(Vec::new(), vec![utxo])?;
        let stored = self.committed_entries(&staged.created)?;

        let mut batch = WriteBatch::new();
        for utxo in &stored {
            put_unspent(&mut batch, utxo)?;
        }

        let (store, batch_ref) = (&self.store, &batch);
        let written = self
            .config
            .retry
            .run("insert_utxo", move || store.write(batch_ref.clone()))
            .await;
        if let Err(e) = written {
            error!("failed to persist {}: {}", outpoint, e);
            self.unstage(staged)?;
            return Err(e);
        }

        for utxo in &stored {
            self.emit(UtxoEvent::Added(utxo.clone()));
        }
        info!("added {}", outpoint);
        stored
            .into_iter()
            .next()
            .ok_or(ConsensusError::UtxoNotFound(outpoint))
    }

    /// Delete an unspent output outright. `Ok(false)` when absent.
    pub async fn remove(&self, utxo: &Utxo) -> Result<bool> {
        let _writer = self.writer.lock().await;
        let outpoint = utxo.outpoint();

        let existing = match self.get_outpoint(&outpoint) {
            Some(existing) => existing,
            None => return Ok(false),
        };

        let mut batch = WriteBatch::new();
        delete_record(&mut batch, &existing);
        self.store.write(batch).await?;

        {
            let mut index = self.write_index()?;
            index.remove(&outpoint);
            index.recompute_root();
        }

        self.emit(UtxoEvent::Removed(existing));
        info!("removed {}", outpoint);
        Ok(true)
    }

    /// Mark an output spent. `Ok(false)` if it is absent or already spent.
    pub async fn spend_utxo(&self, tx_id: &Hash, index: u32) -> Result<bool> {
        let _writer = self.writer.lock().await;
        let outpoint = OutPoint::new(*tx_id, index);

        let staged = match self.get_outpoint(&outpoint) {
            Some(_) => self.stage(vec![outpoint], Vec::new())?,
            None => {
                debug!("spend {}: not unspent", outpoint);
                return Ok(false);
            }
        };

        let mut batch = WriteBatch::new();
        for utxo in &staged.consumed {
            put_spent(&mut batch, utxo)?;
        }
        if let Err(e) = self.store.write(batch).await {
            self.unstage(staged)?;
            return Err(e);
        }

        for utxo in &staged.consumed {
            self.emit(UtxoEvent::Spent(spent_copy(utxo)));
        }
        info!("spent {}", outpoint);
        Ok(true)
    }

    /// Spend the inputs of `tx` and create its outputs at `height`.
    ///
    /// All inputs are checked before anything changes. The store write is a
    /// single batch; if it fails the in-memory changes are rolled back.
    #[instrument(skip(self, tx), fields(tx = %tx.id_hex()))]
    pub async fn apply_transaction(&self, tx: &Transaction, height: Height) -> Result<()> {
        let _writer = self.writer.lock().await;

        // 1. Every input exists, is unique and safe to spend
        let mut seen = HashSet::new();
        let mut input_value: Amount = 0;
        {
            let index = self.read_index()?;
            for input in &tx.inputs {
                if !seen.insert(input.prev_out) {
                    return Err(ConsensusError::DuplicateInput(input.prev_out));
                }
                let utxo = index
                    .entries
                    .get(&input.prev_out)
                    .ok_or(ConsensusError::UtxoNotFound(input.prev_out))?;
                self.check_safe_to_spend(utxo, height)?;
                input_value = input_value
                    .checked_add(utxo.amount)
                    .ok_or_else(|| ConsensusError::InvalidAmount("input sum overflow".to_string()))?;
            }
        }

        // 2. Σout ≤ Σin unless the transaction mints a reward
        let output_value = tx
            .output_value()
            .ok_or_else(|| ConsensusError::InvalidAmount("output sum overflow".to_string()))?;
        if !tx.is_reward() && output_value > input_value {
            return Err(ConsensusError::InsufficientFunds {
                have: input_value,
                need: output_value,
            });
        }

        // 3. Outputs do not collide with existing entries
        let outputs = outputs_of(tx, height);
        for utxo in &outputs {
            if self.exists(&utxo.outpoint()) {
                return Err(ConsensusError::UtxoExists(utxo.outpoint()));
            }
        }

        // 4. Mutate memory, then persist atomically
        let spends: Vec<OutPoint> = tx.inputs.iter().map(|i| i.prev_out).collect();
        let staged = self.stage(spends, outputs)?;
        let batch = self.commit_batch(&staged)?;

        if let Err(e) = self.store.write(batch).await {
            warn!("apply {} failed, rolling back: {}", tx.id_hex(), e);
            self.rollback_transaction(staged)?;
            return Err(e);
        }

        self.advance_height(height);
        self.emit_staged(&staged)?;
        info!(
            "applied transaction: {} inputs, {} outputs at height {}",
            tx.inputs.len(),
            tx.outputs.len(),
            height
        );
        Ok(())
    }

    /// Drop the uncommitted batch and restore the index as it was
    fn rollback_transaction(&self, staged: Staged) -> Result<()> {
        self.unstage(staged)
    }

    /// Undo `tx`: delete its outputs and restore its inputs from their
    /// retained spent records.
    pub async fn revert_transaction(&self, tx: &Transaction) -> Result<()> {
        let _writer = self.writer.lock().await;

        let mut removed = Vec::with_capacity(tx.outputs.len());
        for outpoint in tx.outpoints() {
            let utxo = self
                .get_outpoint(&outpoint)
                .ok_or(ConsensusError::UtxoNotFound(outpoint))?;
            removed.push(utxo);
        }

        let mut restored = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            let bytes = self
                .store
                .get(&utxo_key(&input.prev_out))
                .await?
                .ok_or(ConsensusError::UtxoNotFound(input.prev_out))?;
            let mut utxo: Utxo = serde_json::from_slice(&bytes)?;
            if !utxo.spent {
                return Err(ConsensusError::InvalidStructure(format!(
                    "input {} is not spent",
                    input.prev_out
                )));
            }
            utxo.spent = false;
            restored.push(utxo);
        }

        let mut batch = WriteBatch::new();
        for utxo in &removed {
            delete_record(&mut batch, utxo);
        }
        for utxo in &restored {
            put_unspent(&mut batch, utxo)?;
        }
        self.store.write(batch).await?;

        {
            let mut index = self.write_index()?;
            for utxo in &removed {
                index.remove(&utxo.outpoint());
            }
            for utxo in &restored {
                index.insert(utxo.clone(), self.leaf_hash(utxo));
            }
            index.recompute_root();
        }

        for utxo in removed {
            self.emit(UtxoEvent::Removed(utxo));
        }
        for utxo in restored {
            self.emit(UtxoEvent::Added(utxo));
        }
        info!("reverted transaction {}", tx.id_hex());
        Ok(())
    }

    /// Apply every transaction of `block` in one batch. Outputs created and
    /// spent within the block never enter the set.
    #[instrument(skip(self, block), fields(height = block.header.height))]
    pub async fn apply_block(&self, block: &Block) -> Result<()> {
        let _writer = self.writer.lock().await;
        let height = block.header.height;

        let mut created: BTreeMap<OutPoint, Utxo> = BTreeMap::new();
        let mut spends: Vec<OutPoint> = Vec::new();
        let mut spent_here: HashSet<OutPoint> = HashSet::new();
        let mut cancelled = 0usize;

        {
            let index = self.read_index()?;
            for tx in &block.transactions {
                for input in &tx.inputs {
                    let outpoint = input.prev_out;
                    if !spent_here.insert(outpoint) {
                        return Err(ConsensusError::UtxoAlreadySpent(outpoint));
                    }
                    if created.remove(&outpoint).is_some() {
                        cancelled += 1;
                        continue;
                    }
                    if !index.entries.contains_key(&outpoint) {
                        return Err(ConsensusError::UtxoNotFound(outpoint));
                    }
                    spends.push(outpoint);
                }
                for utxo in outputs_of(tx, height) {
                    let outpoint = utxo.outpoint();
                    if index.entries.contains_key(&outpoint) || created.contains_key(&outpoint) {
                        return Err(ConsensusError::UtxoExists(outpoint));
                    }
                    created.insert(outpoint, utxo);
                }
            }
        }

        let staged = self.stage(spends, created.into_values().collect())?;
        let batch = self.commit_batch(&staged)?;

        if let Err(e) = self.store.write(batch).await {
            error!("block {} failed to persist: {}", height, e);
            self.unstage(staged)?;
            return Err(e);
        }

        self.advance_height(height);
        self.emit_staged(&staged)?;
        info!(
            "applied block {}: {} spent, {} created, {} consumed in-block",
            height,
            staged.consumed.len(),
            staged.created.len(),
            cancelled
        );
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn read_index(&self) -> Result<RwLockReadGuard<'_, UtxoIndex>> {
        self.index
            .read()
            .map_err(|_| ConsensusError::Storage("UTXO index lock poisoned".to_string()))
    }

    fn write_index(&self) -> Result<RwLockWriteGuard<'_, UtxoIndex>> {
        self.index
            .write()
            .map_err(|_| ConsensusError::Storage("UTXO index lock poisoned".to_string()))
    }

    /// Merkle leaf of an entry: the provider's digest of its canonical tuple
    fn leaf_hash(&self, utxo: &Utxo) -> Hash {
        self.crypto.hash(&utxo.canonical_bytes())
    }

    fn check_safe_to_spend(&self, utxo: &Utxo, height: Height) -> Result<()> {
        let outpoint = utxo.outpoint();
        if utxo.spent {
            return Err(ConsensusError::UtxoAlreadySpent(outpoint));
        }
        let confirmations = utxo.confirmations_at(height);
        if confirmations < self.config.min_confirmations {
            return Err(ConsensusError::ImmatureOutput {
                outpoint,
                confirmations,
                required: self.config.min_confirmations,
            });
        }
        if !script::is_spendable(&utxo.script) {
            return Err(ConsensusError::NonStandardScript(format!(
                "{} is not spendable",
                outpoint
            )));
        }
        if utxo.amount == 0 || utxo.amount > MAX_MONEY {
            return Err(ConsensusError::InvalidAmount(format!(
                "{} holds {}",
                outpoint, utxo.amount
            )));
        }
        Ok(())
    }

    /// Remove `spends` and insert `creates` in memory, recompute the root and
    /// stamp the new entries with it and the set's signature.
    fn stage(&self, spends: Vec<OutPoint>, creates: Vec<Utxo>) -> Result<Staged> {
        let signed: Vec<Utxo> = creates
            .into_iter()
            .map(|mut utxo| {
                utxo.signature = Some(self.crypto.sign(&utxo.canonical_bytes(), &self.keypair)?);
                Ok(utxo)
            })
            .collect::<Result<_>>()?;

        let mut index = self.write_index()?;
        let mut staged = Staged {
            previous_root: index.merkle_root,
            ..Default::default()
        };

        for outpoint in spends {
            if let Some(utxo) = index.remove(&outpoint) {
                staged.consumed.push(utxo);
            }
        }
        for utxo in signed {
            staged.created.push(utxo.outpoint());
            let leaf = self.leaf_hash(&utxo);
            index.insert(utxo, leaf);
        }

        let root = index.recompute_root();
        for outpoint in &staged.created {
            if let Some(utxo) = index.entries.get_mut(outpoint) {
                utxo.merkle_root = Some(root);
            }
        }
        Ok(staged)
    }

    fn unstage(&self, staged: Staged) -> Result<()> {
        let (created, consumed) = (staged.created.len(), staged.consumed.len());
        let mut index = self.write_index()?;
        for outpoint in &staged.created {
            index.remove(outpoint);
        }
        for utxo in staged.consumed {
            let leaf = self.leaf_hash(&utxo);
            index.insert(utxo, leaf);
        }
        index.merkle_root = staged.previous_root;
        warn!("rolled back {} created and {} spent entries", created, consumed);
        Ok(())
    }

    fn committed_entries(&self, outpoints: &[OutPoint]) -> Result<Vec<Utxo>> {
        let index = self.read_index()?;
        Ok(outpoints
            .iter()
            .filter_map(|op| index.entries.get(op).cloned())
            .collect())
    }

    fn commit_batch(&self, staged: &Staged) -> Result<WriteBatch> {
        let mut batch = WriteBatch::new();
        for utxo in &staged.consumed {
            put_spent(&mut batch, utxo)?;
        }
        for utxo in self.committed_entries(&staged.created)? {
            put_unspent(&mut batch, &utxo)?;
        }
        Ok(batch)
    }

    fn emit_staged(&self, staged: &Staged) -> Result<()> {
        for utxo in &staged.consumed {
            self.emit(UtxoEvent::Spent(spent_copy(utxo)));
        }
        for utxo in self.committed_entries(&staged.created)? {
            self.emit(UtxoEvent::Added(utxo));
        }
        Ok(())
    }

    fn emit(&self, event: UtxoEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn advance_height(&self, height: Height) {
        self.height.fetch_max(height, Ordering::SeqCst);
    }
}

impl UtxoView for UtxoSet {
    fn lookup(&self, outpoint: &OutPoint) -> Option<Utxo> {
        self.get_outpoint(outpoint)
    }
}

/// Structural checks on an output entering the set through `add`
fn validate_new_utxo(utxo: &Utxo) -> Result<()> {
    if utxo.amount == 0 || utxo.amount > MAX_MONEY {
        return Err(ConsensusError::InvalidAmount(format!(
            "amount {} outside (0, {}]",
            utxo.amount, MAX_MONEY
        )));
    }
    if utxo.address.is_empty() {
        return Err(ConsensusError::InvalidStructure("empty address".to_string()));
    }
    if !script::is_standard(&utxo.script) {
        return Err(ConsensusError::NonStandardScript(utxo.outpoint().to_string()));
    }
    if utxo.spent {
        return Err(ConsensusError::InvalidStructure(
            "cannot add a spent output".to_string(),
        ));
    }
    Ok(())
}

/// Outputs of `tx` as unsigned set entries confirmed at `height`
fn outputs_of(tx: &Transaction, height: Height) -> Vec<Utxo> {
    let owner_key = tx
        .inputs
        .first()
        .map(|i| i.public_key.clone())
        .unwrap_or_default();

    tx.outputs
        .iter()
        .enumerate()
        .map(|(i, output)| Utxo {
            tx_id: tx.id,
            output_index: i as u32,
            amount: output.amount,
            address: output.address.clone(),
            script: output.script.clone(),
            public_key: output_public_key(output, &owner_key),
            signature: None,
            spent: false,
            timestamp: tx.timestamp,
            block_height: Some(height),
            merkle_root: None,
            confirmations: 1,
            currency: Currency::default(),
        })
        .collect()
}

/// Key an output is locked to. P2PK scripts carry it; for hash-locked
/// outputs it is only known once spent, so change back to the spender keeps
/// the spender's key.
fn output_public_key(output: &TxOutput, spender_key: &[u8]) -> ByteString {
    match script::classify(&output.script) {
        script::ScriptType::PayToPublicKey => output.script[1..output.script.len() - 1].to_vec(),
        script::ScriptType::PayToPublicKeyHash
            if script::script_matches_key(&output.script, spender_key) =>
        {
            spender_key.to_vec()
        }
        _ => Vec::new(),
    }
}

fn spent_copy(utxo: &Utxo) -> Utxo {
    let mut spent = utxo.clone();
    spent.spent = true;
    spent
}

fn put_unspent(batch: &mut WriteBatch, utxo: &Utxo) -> Result<()> {
    let outpoint = utxo.outpoint();
    batch
        .put(utxo_key(&outpoint), serde_json::to_vec(utxo)?)
        .put(address_key(&utxo.address, &outpoint), Vec::new())
        .put(
            unspent_key(&utxo.address, utxo.amount, &outpoint),
            serde_json::to_vec(&outpoint)?,
        );
    Ok(())
}

fn put_spent(batch: &mut WriteBatch, utxo: &Utxo) -> Result<()> {
    let outpoint = utxo.outpoint();
    batch
        .put(utxo_key(&outpoint), serde_json::to_vec(&spent_copy(utxo))?)
        .delete(unspent_key(&utxo.address, utxo.amount, &outpoint));
    Ok(())
}

fn delete_record(batch: &mut WriteBatch, utxo: &Utxo) {
    let outpoint = utxo.outpoint();
    batch
        .delete(utxo_key(&outpoint))
        .delete(address_key(&utxo.address, &outpoint))
        .delete(unspent_key(&utxo.address, utxo.amount, &outpoint));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Secp256k1Crypto;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_add_spend_balance() {
        let (set, _) = new_set();
        set.add(utxo([0xa; 32], 0, 100, "X")).await.unwrap();
        assert_eq!(set.get_balance("X"), 100);

        assert!(set.spend_utxo(&[0xa; 32], 0).await.unwrap());
        assert!(!set.spend_utxo(&[0xa; 32], 0).await.unwrap());
        assert_eq!(set.get_balance("X"), 0);
    }

    #[tokio::test]
    async fn test_add_rejects_duplicates_and_bad_entries() {
        let (set, _) = new_set();
        set.add(utxo([1; 32], 0, 10, "X")).await.unwrap();

        let err = set.add(utxo([1; 32], 0, 10, "X")).await.unwrap_err();
        assert_eq!(err.code(), "UTXO_EXISTS");

        let err = set.add(utxo([2; 32], 0, 0, "X")).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");

        let err = set.add(utxo([3; 32], 0, 10, "")).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STRUCTURE");

        let mut odd = utxo([4; 32], 0, 10, "X");
        odd.script = vec![0x51];
        assert_eq!(set.add(odd).await.unwrap_err().code(), "NON_STANDARD_SCRIPT");
    }

    #[tokio::test]
    async fn test_capacity() {
        let mut config = UtxoSetConfig::for_testing();
        config.max_size = 1;
        let set = set_with(config, Arc::new(MemoryStore::new()));

        set.add(utxo([1; 32], 0, 10, "X")).await.unwrap();
        let err = set.add(utxo([2; 32], 0, 10, "X")).await.unwrap_err();
        assert_eq!(err.code(), "CAPACITY_EXCEEDED");
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let mut config = UtxoSetConfig::for_testing();
        config.min_mutation_interval_ms = 60_000;
        let set = set_with(config, Arc::new(MemoryStore::new()));

        set.add(utxo([1; 32], 0, 10, "X")).await.unwrap();
        let err = set.add(utxo([2; 32], 0, 10, "X")).await.unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED");
    }

    #[tokio::test]
    async fn test_verify_utxo() {
        let (set, _) = new_set();
        for i in 0..5u8 {
            set.add(utxo([i + 1; 32], 0, 10 + i as u128, "X")).await.unwrap();
        }
        let stored = set.get(&[3; 32], 0).unwrap();

        assert!(set.verify_utxo(&stored).unwrap());
        assert!(set.verify_utxo(&stored).unwrap());

        let mut tampered = stored.clone();
        tampered.amount += 1;
        assert!(!set.verify_utxo(&tampered).unwrap());

        let mut unsigned = stored;
        unsigned.signature = None;
        assert!(!set.verify_utxo(&unsigned).unwrap());
    }

    #[tokio::test]
    async fn test_merkle_root_tracks_mutations() {
        let (set, _) = new_set();
        let empty_root = set.merkle_root();
        let added = set.add(utxo([1; 32], 0, 10, "X")).await.unwrap();
        assert_ne!(set.merkle_root(), empty_root);
        assert_eq!(added.merkle_root, Some(set.merkle_root()));

        assert!(set.remove(&added).await.unwrap());
        assert_eq!(set.merkle_root(), empty_root);
        assert!(!set.remove(&added).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_rolls_back_when_store_fails() {
        let store = Arc::new(MemoryStore::new());
        let set = set_with(UtxoSetConfig::for_testing(), store.clone());
        let root = set.merkle_root();

        store.set_fail_writes(10);
        assert!(set.add(utxo([1; 32], 0, 10, "X")).await.is_err());
        assert!(set.is_empty());
        assert_eq!(set.merkle_root(), root);
    }

    #[tokio::test]
    async fn test_list_unspent_filters_and_pages() {
        let (set, _) = new_set();
        for i in 0..6u8 {
            let address = if i % 2 == 0 { "A" } else { "B" };
            set.add(utxo([i + 1; 32], 0, 10 * (i as u128 + 1), address)).await.unwrap();
        }

        let only_a = set
            .list_unspent(ListUnspentOptions {
                addresses: Some(vec!["A".into()]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(only_a.len(), 3);

        let page = set
            .list_unspent(ListUnspentOptions {
                min_amount: Some(20),
                max_amount: Some(50),
                offset: 1,
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        let amounts: Vec<Amount> = page.iter().map(|u| u.amount).collect();
        assert_eq!(amounts, vec![30, 40]);
    }

    #[tokio::test]
    async fn test_find_utxos_for_amount() {
        let (set, _) = new_set();
        set.add(utxo([1; 32], 0, 10, "X")).await.unwrap();
        set.add(utxo([2; 32], 0, 50, "X")).await.unwrap();
        set.add(utxo([3; 32], 0, 30, "X")).await.unwrap();

        let picked = set.find_utxos_for_amount("X", 60).unwrap();
        let amounts: Vec<Amount> = picked.iter().map(|u| u.amount).collect();
        assert_eq!(amounts, vec![50, 30]);

        let err = set.find_utxos_for_amount("X", 100).unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
    }

    #[tokio::test]
    async fn test_events() {
        let (set, _) = new_set();
        let mut events = set.subscribe();

        set.add(utxo([1; 32], 0, 10, "X")).await.unwrap();
        set.spend_utxo(&[1; 32], 0).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), UtxoEvent::Added(_)));
        match events.recv().await.unwrap() {
            UtxoEvent::Spent(u) => assert!(u.spent),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_reloads_unspent() {
        let store = Arc::new(MemoryStore::new());
        let set = set_with(UtxoSetConfig::for_testing(), store.clone());
        set.add(utxo([1; 32], 0, 10, "X")).await.unwrap();
        set.add(utxo([2; 32], 0, 20, "X")).await.unwrap();
        set.spend_utxo(&[1; 32], 0).await.unwrap();
        let root = set.merkle_root();

        let reopened = UtxoSet::open(
            store,
            Arc::new(Secp256k1Crypto::new()),
            KeyPair::from_seed(b"utxo-set").unwrap(),
            UtxoSetConfig::for_testing(),
        )
        .await
        .unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.merkle_root(), root);
        assert_eq!(reopened.get_balance("X"), 20);
    }

    fn new_set() -> (UtxoSet, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (set_with(UtxoSetConfig::for_testing(), store.clone()), store)
    }

    fn set_with(config: UtxoSetConfig, store: Arc<MemoryStore>) -> UtxoSet {
        UtxoSet::new(
            store,
            Arc::new(Secp256k1Crypto::new()),
            KeyPair::from_seed(b"utxo-set").unwrap(),
            config,
        )
    }

    fn utxo(tx_id: Hash, index: u32, amount: Amount, address: &str) -> Utxo {
        Utxo {
            tx_id,
            output_index: index,
            amount,
            address: address.to_string(),
            script: script::p2pkh_script(&[0x02; 33]),
            public_key: vec![0x02; 33],
            signature: None,
            spent: false,
            timestamp: 0,
            block_height: None,
            merkle_root: None,
            confirmations: 0,
            currency: Currency::default(),
        }
    }
}
