//! Mempool
//!
//! Unconfirmed transactions waiting for a block, bucketed by fee rate and
//! tracked with their in-mempool ancestors and descendants.
//!
//! Locking: each submission first takes a per-transaction token, so
//! duplicate submissions of one id serialize, then validates without holding
//! the pool, and finally takes the coarse state lock for conflict handling
//! and insertion.

use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::MempoolConfig;
use crate::error::{ConsensusError, Result};
use crate::transaction::TransactionValidator;
use crate::types::*;
use crate::utxo_set::{UtxoSet, UtxoView};

/// A transaction admitted to the pool
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub fee: Amount,
    pub size: usize,
    /// Fee per byte
    pub fee_rate: f64,
    /// In-mempool transactions this one depends on, transitively
    pub ancestors: HashSet<Hash>,
    /// In-mempool transactions depending on this one, transitively
    pub descendants: HashSet<Hash>,
    /// Unix seconds at admission
    pub added_at: u64,
    pub height: Height,
}

/// Options for [`Mempool::get_pending_transactions`]
#[derive(Debug, Clone, Default)]
pub struct PendingOptions {
    pub limit: Option<usize>,
    pub min_fee_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MempoolInfo {
    pub size: usize,
    pub bytes: usize,
    #[serde(with = "amount_serde")]
    pub total_fee: Amount,
    pub min_fee_rate: f64,
    pub max_fee_rate: f64,
    pub bucket_boundaries: Vec<f64>,
    pub height: Height,
}

#[derive(Debug, Default)]
struct MempoolState {
    entries: HashMap<Hash, MempoolEntry>,
    /// Outpoint → id of the pool transaction spending it
    spenders: HashMap<OutPoint, Hash>,
    /// Ascending lower bounds of buckets 1..n; bucket 0 takes the rest
    boundaries: Vec<f64>,
    buckets: Vec<HashSet<Hash>>,
    total_bytes: usize,
    fee_history: VecDeque<f64>,
    admissions: usize,
    height: Height,
}

impl MempoolState {
    fn bucket_for(&self, fee_rate: f64) -> usize {
        self.boundaries.partition_point(|b| *b <= fee_rate)
    }

    fn insert(&mut self, entry: MempoolEntry) {
        let id = entry.tx.id;
        for input in &entry.tx.inputs {
            self.spenders.insert(input.prev_out, id);
        }
        for ancestor in &entry.ancestors {
            if let Some(a) = self.entries.get_mut(ancestor) {
                a.descendants.insert(id);
            }
        }

        let bucket = self.bucket_for(entry.fee_rate);
        if self.buckets.len() <= bucket {
            self.buckets.resize_with(bucket + 1, HashSet::new);
        }
        self.buckets[bucket].insert(id);
        self.total_bytes += entry.size;
        self.entries.insert(id, entry);
    }

    /// Remove one entry and unlink it from its relatives
    fn remove(&mut self, id: &Hash) -> Option<MempoolEntry> {
        let entry = self.entries.remove(id)?;
        for input in &entry.tx.inputs {
            if self.spenders.get(&input.prev_out) == Some(id) {
                self.spenders.remove(&input.prev_out);
            }
        }
        for ancestor in &entry.ancestors {
            if let Some(a) = self.entries.get_mut(ancestor) {
                a.descendants.remove(id);
            }
        }
        for descendant in &entry.descendants {
            if let Some(d) = self.entries.get_mut(descendant) {
                d.ancestors.remove(id);
            }
        }
        let bucket = self.bucket_for(entry.fee_rate);
        if let Some(set) = self.buckets.get_mut(bucket) {
            set.remove(id);
        }
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        Some(entry)
    }

    /// Remove entries together with all their descendants
    fn remove_with_descendants(&mut self, ids: &HashSet<Hash>) -> Vec<MempoolEntry> {
        let doomed = self.with_descendants(ids);
        doomed.iter().filter_map(|id| self.remove(id)).collect()
    }

    fn with_descendants(&self, ids: &HashSet<Hash>) -> HashSet<Hash> {
        let mut all = HashSet::new();
        for id in ids {
            if let Some(entry) = self.entries.get(id) {
                all.insert(*id);
                all.extend(entry.descendants.iter().copied());
            }
        }
        all
    }

    /// Lowest fee-rate entry outside `excluded`
    fn lowest_fee_rate(&self, excluded: &HashSet<Hash>) -> Option<&MempoolEntry> {
        self.entries
            .values()
            .filter(|e| !excluded.contains(&e.tx.id))
            .min_by(|a, b| {
                a.fee_rate
                    .total_cmp(&b.fee_rate)
                    .then_with(|| b.tx.id.cmp(&a.tx.id))
            })
    }

    /// Output of a pool transaction as a not-yet-confirmed set entry
    fn pending_output(&self, outpoint: &OutPoint) -> Option<Utxo> {
        let entry = self.entries.get(&outpoint.tx_id)?;
        let output = entry.tx.outputs.get(outpoint.index as usize)?;
        Some(Utxo {
            tx_id: outpoint.tx_id,
            output_index: outpoint.index,
            amount: output.amount,
            address: output.address.clone(),
            script: output.script.clone(),
            public_key: Vec::new(),
            signature: None,
            spent: false,
            timestamp: entry.tx.timestamp,
            block_height: None,
            merkle_root: None,
            confirmations: 0,
            currency: Currency::default(),
        })
    }

    fn record_fee_rate(&mut self, fee_rate: f64, config: &MempoolConfig) {
        self.fee_history.push_back(fee_rate);
        while self.fee_history.len() > config.fee_history_len.max(1) {
            self.fee_history.pop_front();
        }
        self.admissions += 1;
        if config.rebucket_interval > 0 && self.admissions % config.rebucket_interval == 0 {
            self.rebucket(config.bucket_count);
        }
    }

    /// Recompute bucket boundaries as quantiles of recent fee rates
    fn rebucket(&mut self, bucket_count: usize) {
        let mut rates: Vec<f64> = self.fee_history.iter().copied().collect();
        rates.sort_by(|a, b| a.total_cmp(b));

        let mut boundaries: Vec<f64> = Vec::new();
        if !rates.is_empty() {
            for k in 1..bucket_count.max(1) {
                let q = rates[(k * rates.len() / bucket_count).min(rates.len() - 1)];
                if boundaries.last().map_or(true, |last| q > *last) {
                    boundaries.push(q);
                }
            }
        }

        self.boundaries = boundaries;
        let mut buckets = vec![HashSet::new(); self.boundaries.len() + 1];
        for entry in self.entries.values() {
            buckets[self.bucket_for(entry.fee_rate)].insert(entry.tx.id);
        }
        self.buckets = buckets;
        debug!("rebucketed mempool: boundaries {:?}", self.boundaries);
    }
}

/// The set outputs plus outputs created by pool transactions
struct MempoolView<'a> {
    utxo_set: &'a UtxoSet,
    pending: HashMap<OutPoint, Utxo>,
}

impl UtxoView for MempoolView<'_> {
    fn lookup(&self, outpoint: &OutPoint) -> Option<Utxo> {
        self.pending
            .get(outpoint)
            .cloned()
            .or_else(|| self.utxo_set.lookup(outpoint))
    }
}

pub struct Mempool {
    state: Mutex<MempoolState>,
    tokens: std::sync::Mutex<HashMap<Hash, Arc<Mutex<()>>>>,
    utxo_set: Arc<UtxoSet>,
    validator: Arc<TransactionValidator>,
    config: MempoolConfig,
}

impl Mempool {
    pub fn new(
        utxo_set: Arc<UtxoSet>,
        validator: Arc<TransactionValidator>,
        config: MempoolConfig,
    ) -> Self {
        let state = MempoolState {
            buckets: vec![HashSet::new()],
            height: utxo_set.height(),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
            tokens: std::sync::Mutex::new(HashMap::new()),
            utxo_set,
            validator,
            config,
        }
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }

    /// AcceptToMemoryPool: 𝒯𝒳 × 𝒰𝒮 → {accepted, rejected}
    ///
    /// 1. Serialize on the transaction's token and reject known ids
    /// 2. Validate against the set plus pending pool outputs
    /// 3. Resolve conflicts by replace-by-fee
    /// 4. Enforce ancestor and descendant ceilings
    /// 5. Make room by evicting cheaper entries, or reject
    /// 6. Record votes, insert and link into the dependency graph
    #[instrument(skip(self, tx), fields(tx = %tx.id_hex()))]
    pub async fn add_transaction(&self, tx: Transaction) -> Result<MempoolEntry> {
        if tx.is_reward() {
            return Err(ConsensusError::InvalidStructure(
                "reward transactions are only valid in blocks".to_string(),
            ));
        }

        let id = tx.id;
        let token = self.acquire_token(&id)?;
        let result = {
            let _guard = token.lock().await;
            self.admit(tx).await
        };
        self.release_token(&id, &token);

        if let Err(e) = &result {
            warn!("rejected transaction: {}", e);
        }
        result
    }

    async fn admit(&self, tx: Transaction) -> Result<MempoolEntry> {
        // 1. Duplicate check, view of pending outputs, entries it would replace
        let (view, height, replaceable) = {
            let state = self.state.lock().await;
            if state.entries.contains_key(&tx.id) {
                return Err(ConsensusError::DuplicateTransaction(tx.id_hex()));
            }
            let pending = tx
                .inputs
                .iter()
                .filter_map(|i| state.pending_output(&i.prev_out).map(|u| (i.prev_out, u)))
                .collect();
            let conflicts: HashSet<Hash> = tx
                .inputs
                .iter()
                .filter_map(|i| state.spenders.get(&i.prev_out).copied())
                .collect();
            (
                MempoolView {
                    utxo_set: self.utxo_set.as_ref(),
                    pending,
                },
                state.height,
                state.with_descendants(&conflicts),
            )
        };

        // 2. Full validation, pool unlocked
        let validated = self
            .validator
            .validate_replacement(&tx, &view, height + 1, &replaceable)
            .await?;
        let fee_rate = validated.fee as f64 / validated.size.max(1) as f64;
        if fee_rate < self.config.min_fee_rate {
            return Err(ConsensusError::InsufficientFee(format!(
                "fee rate {:.3} below minimum {:.3}",
                fee_rate, self.config.min_fee_rate
            )));
        }

        let mut state = self.state.lock().await;
        if state.entries.contains_key(&tx.id) {
            return Err(ConsensusError::DuplicateTransaction(tx.id_hex()));
        }

        // Parents may have left the pool while it was unlocked
        let mut parents = HashSet::new();
        for input in &tx.inputs {
            if state.entries.contains_key(&input.prev_out.tx_id) {
                parents.insert(input.prev_out.tx_id);
            } else if !self.utxo_set.exists(&input.prev_out) {
                return Err(ConsensusError::UtxoNotFound(input.prev_out));
            }
        }

        // 3. Conflicts
        let conflicts: HashSet<Hash> = tx
            .inputs
            .iter()
            .filter_map(|i| state.spenders.get(&i.prev_out).copied())
            .collect();
        let mut evict = HashSet::new();
        if !conflicts.is_empty() {
            for id in &conflicts {
                if let Some(old) = state.entries.get(id) {
                    let required = old.fee.saturating_add(self.config.rbf_fee_increment);
                    if validated.fee < required {
                        return Err(ConsensusError::RbfFeeTooLow {
                            provided: validated.fee,
                            required,
                        });
                    }
                }
            }
            evict = state.with_descendants(&conflicts);
            if parents.iter().any(|p| evict.contains(p)) {
                return Err(ConsensusError::InvalidStructure(
                    "replacement spends an output of a transaction it replaces".to_string(),
                ));
            }
        }

        // 4. Ancestor and descendant ceilings
        let mut ancestors = HashSet::new();
        for parent in &parents {
            if let Some(p) = state.entries.get(parent) {
                ancestors.insert(*parent);
                ancestors.extend(p.ancestors.iter().copied());
            }
        }
        if ancestors.len() > self.config.max_ancestors {
            return Err(ConsensusError::TooManyAncestors {
                count: ancestors.len(),
                max: self.config.max_ancestors,
            });
        }
        for ancestor in &ancestors {
            if let Some(a) = state.entries.get(ancestor) {
                let count = a.descendants.len() + 1;
                if count > self.config.max_descendants {
                    return Err(ConsensusError::TooManyDescendants {
                        count,
                        max: self.config.max_descendants,
                    });
                }
            }
        }

        // 5. Capacity
        let mut protected = evict.clone();
        protected.extend(ancestors.iter().copied());
        loop {
            let remaining: Vec<&MempoolEntry> = state
                .entries
                .values()
                .filter(|e| !evict.contains(&e.tx.id))
                .collect();
            let count = remaining.len() + 1;
            let bytes = remaining.iter().map(|e| e.size).sum::<usize>() + validated.size;
            if count <= self.config.max_transactions && bytes <= self.config.max_bytes {
                break;
            }

            let victim = match state.lowest_fee_rate(&protected) {
                Some(v) if v.fee_rate < fee_rate => v.tx.id,
                _ => {
                    return Err(ConsensusError::MempoolFull(format!(
                        "{} transactions, {} bytes",
                        count - 1,
                        bytes - validated.size
                    )))
                }
            };
            let doomed = state.with_descendants(&HashSet::from([victim]));
            if doomed.iter().any(|id| ancestors.contains(id)) {
                protected.insert(victim);
                continue;
            }
            protected.extend(doomed.iter().copied());
            evict.extend(doomed);
        }

        // 6. Record a vote only once admission is certain, then insert
        self.validator.record_vote(&tx, height + 1, &evict).await?;
        for removed in state.remove_with_descendants(&evict) {
            info!("evicted {} for {}", removed.tx.id_hex(), tx.id_hex());
        }

        let entry = MempoolEntry {
            fee: validated.fee,
            size: validated.size,
            fee_rate,
            ancestors,
            descendants: HashSet::new(),
            added_at: unix_timestamp(),
            height,
            tx,
        };
        state.insert(entry.clone());
        state.record_fee_rate(fee_rate, &self.config);

        info!(
            "accepted {} (fee {}, {:.3}/byte, {} ancestors)",
            entry.tx.id_hex(),
            entry.fee,
            entry.fee_rate,
            entry.ancestors.len()
        );
        Ok(entry)
    }

    /// Drop confirmed transactions, then every entry whose inputs are no
    /// longer available, with its descendants. Returns the number removed.
    pub async fn remove_transactions(&self, txs: &[Transaction]) -> usize {
        let mut state = self.state.lock().await;
        let mut removed = 0;

        // 1. Confirmed, and pool transactions double-spent by them
        for tx in txs {
            if state.remove(&tx.id).is_some() {
                removed += 1;
            }
            let conflicts: HashSet<Hash> = tx
                .inputs
                .iter()
                .filter_map(|i| state.spenders.get(&i.prev_out).copied())
                .filter(|id| *id != tx.id)
                .collect();
            removed += state.remove_with_descendants(&conflicts).len();
        }

        // 2. Entries whose inputs vanished
        let orphaned: HashSet<Hash> = state
            .entries
            .values()
            .filter(|entry| {
                entry.tx.inputs.iter().any(|input| {
                    state.pending_output(&input.prev_out).is_none()
                        && !self.utxo_set.exists(&input.prev_out)
                })
            })
            .map(|entry| entry.tx.id)
            .collect();
        if !orphaned.is_empty() {
            warn!("dropping {} transactions with unavailable inputs", orphaned.len());
        }
        removed += state.remove_with_descendants(&orphaned).len();

        debug!("removed {} transactions, {} remain", removed, state.entries.len());
        removed
    }

    /// Transactions in non-increasing fee-rate order. An entry is skipped
    /// unless all of its ancestors were selected before it.
    pub async fn get_pending_transactions(&self, options: PendingOptions) -> Vec<Transaction> {
        let state = self.state.lock().await;
        let limit = options.limit.unwrap_or(usize::MAX);
        let min_rate = options.min_fee_rate.unwrap_or(f64::MIN);

        let mut selected: HashSet<Hash> = HashSet::new();
        let mut result = Vec::new();

        'buckets: for bucket in state.buckets.iter().rev() {
            let mut entries: Vec<&MempoolEntry> =
                bucket.iter().filter_map(|id| state.entries.get(id)).collect();
            entries.sort_by(|a, b| {
                b.fee_rate
                    .total_cmp(&a.fee_rate)
                    .then_with(|| a.ancestors.len().cmp(&b.ancestors.len()))
                    .then_with(|| a.tx.id.cmp(&b.tx.id))
            });

            for entry in entries {
                if result.len() >= limit {
                    break 'buckets;
                }
                if entry.fee_rate < min_rate {
                    break 'buckets;
                }
                if !entry.ancestors.iter().all(|a| selected.contains(a)) {
                    continue;
                }
                selected.insert(entry.tx.id);
                result.push(entry.tx.clone());
            }
        }
        result
    }

    /// Fee rate a transaction must beat to be mined within `target_blocks`
    /// blocks, assuming blocks of `expected_block_bytes`.
    pub async fn estimate_fee(&self, target_blocks: usize) -> f64 {
        let state = self.state.lock().await;
        let capacity = target_blocks
            .max(1)
            .saturating_mul(self.config.expected_block_bytes);

        let mut rates: Vec<(f64, usize)> = state
            .entries
            .values()
            .map(|e| (e.fee_rate, e.size))
            .collect();
        rates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut used = 0usize;
        for (rate, size) in rates {
            used = used.saturating_add(size);
            if used > capacity {
                return rate.max(self.config.min_fee_rate);
            }
        }
        self.config.min_fee_rate
    }

    /// Drop entries older than `max_age`, then the cheapest entries while
    /// over the count or byte budget. Returns the number removed.
    pub async fn evict(&self, now: u64) -> usize {
        let mut state = self.state.lock().await;
        let max_age = self.config.max_age().as_secs();

        let expired: HashSet<Hash> = state
            .entries
            .values()
            .filter(|e| now.saturating_sub(e.added_at) > max_age)
            .map(|e| e.tx.id)
            .collect();
        let mut removed = state.remove_with_descendants(&expired).len();

        while state.entries.len() > self.config.max_transactions
            || state.total_bytes > self.config.max_bytes
        {
            let victim = match state.lowest_fee_rate(&HashSet::new()) {
                Some(v) => v.tx.id,
                None => break,
            };
            removed += state
                .remove_with_descendants(&HashSet::from([victim]))
                .len();
        }

        if removed > 0 {
            info!("evicted {} transactions", removed);
        }
        removed
    }

    /// Run [`Mempool::evict`] every `eviction_interval_secs`
    pub fn spawn_eviction_task(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.eviction_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.evict(unix_timestamp()).await;
            }
        })
    }

    pub async fn get_mempool_info(&self) -> MempoolInfo {
        let state = self.state.lock().await;
        let rates = state.entries.values().map(|e| e.fee_rate);
        let min_fee_rate = rates.clone().fold(f64::INFINITY, f64::min);
        MempoolInfo {
            size: state.entries.len(),
            bytes: state.total_bytes,
            total_fee: state.entries.values().map(|e| e.fee).sum(),
            min_fee_rate: if min_fee_rate.is_finite() { min_fee_rate } else { 0.0 },
            max_fee_rate: rates.fold(0.0, f64::max),
            bucket_boundaries: state.boundaries.clone(),
            height: state.height,
        }
    }

    /// Ids of all pool transactions, highest fee rate first
    pub async fn get_raw_mempool(&self) -> Vec<Hash> {
        let state = self.state.lock().await;
        let mut entries: Vec<&MempoolEntry> = state.entries.values().collect();
        entries.sort_by(|a, b| {
            b.fee_rate
                .total_cmp(&a.fee_rate)
                .then_with(|| a.tx.id.cmp(&b.tx.id))
        });
        entries.into_iter().map(|e| e.tx.id).collect()
    }

    pub async fn get_entry(&self, id: &Hash) -> Option<MempoolEntry> {
        self.state.lock().await.entries.get(id).cloned()
    }

    pub async fn contains(&self, id: &Hash) -> bool {
        self.state.lock().await.entries.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn set_height(&self, height: Height) {
        self.state.lock().await.height = height;
    }

    fn acquire_token(&self, id: &Hash) -> Result<Arc<Mutex<()>>> {
        let mut tokens = self
            .tokens
            .lock()
            .map_err(|_| ConsensusError::Storage("mempool token map poisoned".to_string()))?;
        Ok(Arc::clone(
            tokens.entry(*id).or_insert_with(|| Arc::new(Mutex::new(()))),
        ))
    }

    /// Forget the token once nobody else is waiting on it
    fn release_token(&self, id: &Hash, token: &Arc<Mutex<()>>) {
        if let Ok(mut tokens) = self.tokens.lock() {
            // the map and this caller hold the only references
            if Arc::strong_count(token) <= 2 {
                tokens.remove(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebucket_quantiles() {
        let mut state = MempoolState {
            buckets: vec![HashSet::new()],
            ..Default::default()
        };
        state.fee_history = (1..=8).map(|r| r as f64).collect();
        state.rebucket(4);
        assert_eq!(state.boundaries, vec![3.0, 5.0, 7.0]);
        assert_eq!(state.bucket_for(1.0), 0);
        assert_eq!(state.bucket_for(3.0), 1);
        assert_eq!(state.bucket_for(6.5), 2);
        assert_eq!(state.bucket_for(100.0), 3);
    }

    #[test]
    fn test_rebucket_dedups_equal_rates() {
        let mut state = MempoolState::default();
        state.fee_history = vec![2.0; 10].into();
        state.rebucket(4);
        assert_eq!(state.boundaries, vec![2.0]);
        assert_eq!(state.buckets.len(), 2);
    }
}
