//! Quadratic voting
//!
//! A voter's power is the sum of the integer square roots of the amounts of
//! the outputs backing the vote, capped. Each voter may vote once per
//! cooldown window; the last vote is persisted under `vote:<address>`.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ConsensusError, Result};
use crate::retry::RetryPolicy;
use crate::store::{vote_key, LedgerStore};
use crate::types::{Amount, BlockVote, ByteString, Hash, Height, Utxo};

/// ⌊√n⌋ by Newton's method
pub fn integer_sqrt(n: u128) -> u128 {
    if n < 2 {
        return n;
    }

    let bits = 128 - n.leading_zeros();
    let mut x = 1u128 << ((bits + 1) / 2);
    loop {
        let next = (x + n / x) / 2;
        if next >= x {
            return x;
        }
        x = next;
    }
}

/// VotingPower: 𝒰* → ℕ
///
/// power = min(Σ ⌊√amount⌋, cap)
pub fn calculate_voting_power(utxos: &[Utxo], cap: u64) -> u64 {
    let power = utxos
        .iter()
        .map(|u| integer_sqrt(u.amount))
        .fold(0u128, |acc, p| acc.saturating_add(p));
    power.min(cap as u128) as u64
}

/// Last recorded vote of a voter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub height: Height,
    #[serde(with = "hex")]
    pub tx_id: Hash,
}

/// Persists last-vote heights and enforces the cooldown between votes
pub struct VoteTracker {
    store: Arc<dyn LedgerStore>,
    cooldown_blocks: u64,
    retry: RetryPolicy,
    /// Serializes check-then-record
    lock: Mutex<()>,
}

impl VoteTracker {
    pub fn new(store: Arc<dyn LedgerStore>, cooldown_blocks: u64, retry: RetryPolicy) -> Self {
        Self {
            store,
            cooldown_blocks,
            retry,
            lock: Mutex::new(()),
        }
    }

    pub async fn last_vote(&self, address: &str) -> Result<Option<VoteRecord>> {
        match self.store.get(&vote_key(address)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fail with `VoteCooldown` if a vote by `address` at `height` would
    /// come too soon after the recorded one. A record of `tx_id` itself, or
    /// of a transaction in `replaceable`, does not count. Writes nothing.
    pub async fn check_cooldown(
        &self,
        address: &str,
        tx_id: Hash,
        height: Height,
        replaceable: &HashSet<Hash>,
    ) -> Result<()> {
        let last = self.last_vote(address).await?;
        self.cooldown_violation(address, last, tx_id, height, replaceable)
    }

    /// Check the cooldown and record the vote at `height` under the tracker
    /// lock. Re-recording the same transaction is a no-op.
    pub async fn record_vote(
        &self,
        address: &str,
        tx_id: Hash,
        height: Height,
        replaceable: &HashSet<Hash>,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;

        let last = self.last_vote(address).await?;
        if last.as_ref().map_or(false, |l| l.tx_id == tx_id) {
            debug!("vote {} by {} already recorded", hex::encode(tx_id), address);
            return Ok(());
        }
        self.cooldown_violation(address, last, tx_id, height, replaceable)?;
        self.write_record(address, tx_id, height).await
    }

    /// Record a vote confirmed in a block, whatever the previous record
    pub async fn confirm_vote(&self, address: &str, tx_id: Hash, height: Height) -> Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(last) = self.last_vote(address).await? {
            if last.tx_id == tx_id && last.height >= height {
                return Ok(());
            }
        }
        self.write_record(address, tx_id, height).await
    }

    fn cooldown_violation(
        &self,
        address: &str,
        last: Option<VoteRecord>,
        tx_id: Hash,
        height: Height,
        replaceable: &HashSet<Hash>,
    ) -> Result<()> {
        let last = match last {
            Some(last) if last.tx_id != tx_id && !replaceable.contains(&last.tx_id) => last,
            _ => return Ok(()),
        };
        let next_height = last.height.saturating_add(self.cooldown_blocks);
        if height < next_height {
            return Err(ConsensusError::VoteCooldown {
                address: address.to_string(),
                last_height: last.height,
                next_height,
            });
        }
        Ok(())
    }

    async fn write_record(&self, address: &str, tx_id: Hash, height: Height) -> Result<()> {
        let record = serde_json::to_vec(&VoteRecord { height, tx_id })?;
        let key = vote_key(address);
        let (store, key) = (&self.store, &key);
        self.retry
            .run("record_vote", move || store.put(key, record.clone()))
            .await?;

        info!("recorded vote by {} at height {}", address, height);
        Ok(())
    }
}

/// Weighted totals of one proposal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteTally {
    pub approved: Amount,
    pub rejected: Amount,
    voters: HashSet<ByteString>,
}

impl VoteTally {
    pub fn unique_voters(&self) -> usize {
        self.voters.len()
    }

    pub fn is_approved(&self) -> bool {
        self.approved > self.rejected
    }

    fn merge(mut self, other: VoteTally) -> Self {
        self.approved = self.approved.saturating_add(other.approved);
        self.rejected = self.rejected.saturating_add(other.rejected);
        self.voters.extend(other.voters);
        self
    }
}

/// Tally votes per proposal, processing `chunk_size` votes per parallel task
pub fn tally_votes(votes: &[BlockVote], chunk_size: usize) -> BTreeMap<String, VoteTally> {
    votes
        .par_chunks(chunk_size.max(1))
        .map(|chunk| {
            let mut tallies: BTreeMap<String, VoteTally> = BTreeMap::new();
            for vote in chunk {
                let tally = tallies.entry(vote.proposal_id.clone()).or_default();
                if vote.choice {
                    tally.approved = tally.approved.saturating_add(vote.weight as Amount);
                } else {
                    tally.rejected = tally.rejected.saturating_add(vote.weight as Amount);
                }
                tally.voters.insert(vote.voter_public_key.clone());
            }
            tallies
        })
        .reduce(BTreeMap::new, |mut acc, chunk| {
            for (proposal, tally) in chunk {
                let merged = match acc.remove(&proposal) {
                    Some(existing) => existing.merge(tally),
                    None => tally,
                };
                acc.insert(proposal, merged);
            }
            acc
        })
}
