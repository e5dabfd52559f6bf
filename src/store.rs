//! Persistent ledger store
//!
//! An ordered key-value store with atomic batches and range scans. Keys are
//! UTF-8 strings compared bytewise; values are UTF-8 JSON documents.
//!
//! Key layout:
//!
//! - `utxo:<txId>:<index>`: the UTXO record, retained with `spent = true`
//!   after it is consumed
//! - `address:<address>:<txId>:<index>`: address membership
//! - `unspent:<address>:<amount:039>:<txId>:<index>`: unspent outputs of an
//!   address ordered by amount
//! - `vote:<address>`: last recorded vote of a voter

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

use crate::error::{ConsensusError, Result};
use crate::types::{Amount, OutPoint};

/// Highest code point, used as an inclusive upper bound for prefix scans
const PREFIX_END: char = '\u{10FFFF}';

pub const UTXO_PREFIX: &str = "utxo:";
pub const ADDRESS_PREFIX: &str = "address:";
pub const UNSPENT_PREFIX: &str = "unspent:";
pub const VOTE_PREFIX: &str = "vote:";

pub fn utxo_key(outpoint: &OutPoint) -> String {
    format!("{}{}", UTXO_PREFIX, outpoint)
}

pub fn address_key(address: &str, outpoint: &OutPoint) -> String {
    format!("{}{}:{}", ADDRESS_PREFIX, address, outpoint)
}

pub fn unspent_key(address: &str, amount: Amount, outpoint: &OutPoint) -> String {
    format!("{}{}:{:039}:{}", UNSPENT_PREFIX, address, amount, outpoint)
}

pub fn vote_key(address: &str) -> String {
    format!("{}{}", VOTE_PREFIX, address)
}

/// Single operation of a [`WriteBatch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Operations applied atomically by [`LedgerStore::write`]. Dropping an
/// unwritten batch discards it.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value,
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Inclusive key range scan
#[derive(Debug, Clone, Default)]
pub struct RangeQuery {
    pub gte: Option<String>,
    pub lte: Option<String>,
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl RangeQuery {
    /// All keys starting with `prefix`
    pub fn prefix(prefix: &str) -> Self {
        Self {
            gte: Some(prefix.to_string()),
            lte: Some(format!("{}{}", prefix, PREFIX_END)),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    fn contains(&self, key: &str) -> bool {
        self.gte.as_deref().map_or(true, |gte| key >= gte)
            && self.lte.as_deref().map_or(true, |lte| key <= lte)
    }
}

/// Durable key-value store consumed by the UTXO set and the vote tracker
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// No error when the key is absent
    async fn delete(&self, key: &str) -> Result<()>;

    /// Apply every operation of `batch` or none of them
    async fn write(&self, batch: WriteBatch) -> Result<()>;

    async fn range(&self, query: RangeQuery) -> Result<Vec<(String, Vec<u8>)>>;

    async fn flush(&self) -> Result<()>;

    async fn close(&self) -> Result<()> {
        self.flush().await
    }
}

/// Volatile store over a `BTreeMap`
///
/// Supports write-failure injection so callers' rollback paths can be
/// exercised.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` mutating calls fail with a storage error
    pub fn set_fail_writes(&self, count: usize) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.data.lock().map(|d| d.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn data(&self) -> Result<MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.data
            .lock()
            .map_err(|_| ConsensusError::Storage("memory store lock poisoned".to_string()))
    }

    fn check_injected_failure(&self) -> Result<()> {
        let remaining = self.fail_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(ConsensusError::Storage("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data()?.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_injected_failure()?;
        self.data()?.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_injected_failure()?;
        self.data()?.remove(key);
        Ok(())
    }

    async fn write(&self, batch: WriteBatch) -> Result<()> {
        self.check_injected_failure()?;
        let mut data = self.data()?;
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn range(&self, query: RangeQuery) -> Result<Vec<(String, Vec<u8>)>> {
        let data = self.data()?;
        let matching = data.iter().filter(|(k, _)| query.contains(k));
        let limit = query.limit.unwrap_or(usize::MAX);

        let items = if query.reverse {
            matching
                .rev()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            matching
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        Ok(items)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Durable store backed by sled; blocking calls run on the blocking pool
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref()).map_err(|e| {
            error!("failed to open ledger store at {:?}: {}", path.as_ref(), e);
            ConsensusError::Storage(format!("open failed: {}", e))
        })?;
        info!("opened ledger store at {:?}", path.as_ref());
        Ok(Self { db })
    }

    /// In-memory sled instance, discarded on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

#[async_trait]
impl LedgerStore for SledStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let db = self.db.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            db.get(key.as_bytes())
                .map(|v| v.map(|ivec| ivec.to_vec()))
                .map_err(ConsensusError::from)
        })
        .await?
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let db = self.db.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            db.insert(key.as_bytes(), value)
                .map(|_| ())
                .map_err(ConsensusError::from)
        })
        .await?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let db = self.db.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            db.remove(key.as_bytes())
                .map(|_| ())
                .map_err(ConsensusError::from)
        })
        .await?
    }

    async fn write(&self, batch: WriteBatch) -> Result<()> {
        let db = self.db.clone();
        let count = batch.len();
        tokio::task::spawn_blocking(move || {
            let mut sled_batch = sled::Batch::default();
            for op in batch.into_ops() {
                match op {
                    BatchOp::Put { key, value } => sled_batch.insert(key.as_bytes(), value),
                    BatchOp::Delete { key } => sled_batch.remove(key.as_bytes()),
                }
            }
            db.apply_batch(sled_batch).map_err(|e| {
                error!("batch of {} operations failed: {}", count, e);
                ConsensusError::from(e)
            })
        })
        .await??;
        debug!("applied batch of {} operations", count);
        Ok(())
    }

    async fn range(&self, query: RangeQuery) -> Result<Vec<(String, Vec<u8>)>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let lower = query.gte.clone().unwrap_or_default().into_bytes();
            let iter = match &query.lte {
                Some(lte) => db.range(lower..=lte.clone().into_bytes()),
                None => db.range(lower..),
            };
            let limit = query.limit.unwrap_or(usize::MAX);

            let decode = |item: sled::Result<(sled::IVec, sled::IVec)>| -> Result<(String, Vec<u8>)> {
                let (k, v) = item?;
                let key = String::from_utf8(k.to_vec())
                    .map_err(|e| ConsensusError::Storage(format!("non UTF-8 key: {}", e)))?;
                Ok((key, v.to_vec()))
            };

            if query.reverse {
                iter.rev().take(limit).map(decode).collect()
            } else {
                iter.take(limit).map(decode).collect()
            }
        })
        .await?
    }

    async fn flush(&self) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.flush().map(|_| ()).map_err(ConsensusError::from))
            .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_batch_is_atomic_under_failure() {
        let store = MemoryStore::new();
        store.put("a", b"1".to_vec()).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.put("b", b"2".to_vec()).delete("a");

        store.set_fail_writes(1);
        assert!(store.write(batch.clone()).await.is_err());
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("b").await.unwrap(), None);

        store.write(batch).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_memory_prefix_range() {
        let store = MemoryStore::new();
        for key in ["utxo:01:0", "utxo:02:0", "vote:abc", "address:x:01:0"] {
            store.put(key, vec![]).await.unwrap();
        }

        let keys: Vec<String> = store
            .range(RangeQuery::prefix(UTXO_PREFIX))
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["utxo:01:0", "utxo:02:0"]);

        let last = store
            .range(RangeQuery::prefix(UTXO_PREFIX).reversed().with_limit(1))
            .await
            .unwrap();
        assert_eq!(last[0].0, "utxo:02:0");
    }

    #[tokio::test]
    async fn test_sled_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path().join("db")).unwrap();

        let mut batch = WriteBatch::new();
        batch.put("utxo:aa:0", b"x".to_vec()).put("utxo:aa:1", b"y".to_vec());
        store.write(batch).await.unwrap();
        store.delete("utxo:aa:0").await.unwrap();

        let items = store.range(RangeQuery::prefix(UTXO_PREFIX)).await.unwrap();
        assert_eq!(items, vec![("utxo:aa:1".to_string(), b"y".to_vec())]);
        store.flush().await.unwrap();
    }

    #[test]
    fn test_unspent_key_orders_by_amount() {
        let op = OutPoint::new([0; 32], 0);
        assert!(unspent_key("x", 9, &op) < unspent_key("x", 10, &op));
        assert_eq!(unspent_key("x", 5, &op).split(':').nth(2).unwrap().len(), 39);
    }
}
