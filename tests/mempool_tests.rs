//! Mempool admission, replacement, ordering and eviction

mod common;

use common::*;
use qv_ledger::builder::TransactionBuilder;
use qv_ledger::config::MempoolConfig;
use qv_ledger::crypto::KeyPair;
use qv_ledger::store::MemoryStore;
use qv_ledger::*;
use std::collections::HashSet;
use std::sync::Arc;

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn test_replace_by_fee() {
    let ledger = ledger();
    let alice = keypair("alice");
    let input = fund(ledger.utxo_set(), &alice, 1, 100).await;
    let mempool = ledger.mempool();

    let first = pay_fee(&alice, input.clone(), 10);
    ledger.submit_transaction(first.clone()).await.unwrap();

    let replacement = pay_fee(&alice, input.clone(), 25);
    ledger.submit_transaction(replacement.clone()).await.unwrap();
    assert!(!mempool.contains(&first.id).await);
    assert!(mempool.contains(&replacement.id).await);

    let too_cheap = pay_fee(&alice, input, 26);
    let err = ledger.submit_transaction(too_cheap).await.unwrap_err();
    assert_eq!(err.code(), "RBF_FEE_TOO_LOW");
    assert_eq!(mempool.len().await, 1);
}

#[tokio::test]
async fn test_missing_input_is_conflict() {
    let ledger = ledger();
    let alice = keypair("alice");
    fund(ledger.utxo_set(), &alice, 1, 100).await;

    let orphan = pay_fee(&alice, owned_utxo(&alice, 9, 100), 10);
    let err = ledger.submit_transaction(orphan).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(ledger.mempool().len().await, 0);
}

#[tokio::test]
async fn test_reward_and_duplicate_rejected() {
    let ledger = ledger();
    let alice = keypair("alice");
    let input = fund(ledger.utxo_set(), &alice, 1, 100).await;

    let err = ledger
        .submit_transaction(reward(&alice, 50, 1))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STRUCTURE");

    let tx = pay_fee(&alice, input, 10);
    ledger.submit_transaction(tx.clone()).await.unwrap();
    let err = ledger.submit_transaction(tx).await.unwrap_err();
    assert_eq!(err.code(), "DUPLICATE_TRANSACTION");
}

#[tokio::test]
async fn test_concurrent_duplicate_submissions() {
    let ledger = ledger();
    let alice = keypair("alice");
    let input = fund(ledger.utxo_set(), &alice, 1, 100).await;
    let tx = pay_fee(&alice, input, 10);

    let mempool = ledger.mempool();
    let (a, b) = tokio::join!(
        mempool.add_transaction(tx.clone()),
        mempool.add_transaction(tx.clone())
    );
    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    let err = a.err().or(b.err()).unwrap();
    assert_eq!(err.code(), "DUPLICATE_TRANSACTION");
}

#[tokio::test]
async fn test_spending_pending_output() {
    let ledger = ledger();
    let alice = keypair("alice");
    let input = fund(ledger.utxo_set(), &alice, 1, 100).await;

    let parent = pay_fee(&alice, input, 10);
    let child = pay_fee(&alice, output_of(&parent, 0), 10);
    ledger.submit_transaction(parent.clone()).await.unwrap();
    let entry = ledger.submit_transaction(child.clone()).await.unwrap();

    assert_eq!(entry.ancestors, HashSet::from([parent.id]));
    let parent_entry = ledger.mempool().get_entry(&parent.id).await.unwrap();
    assert_eq!(parent_entry.descendants, HashSet::from([child.id]));
}

#[tokio::test]
async fn test_replacement_evicts_descendants() {
    let ledger = ledger();
    let alice = keypair("alice");
    let input = fund(ledger.utxo_set(), &alice, 1, 100).await;

    let parent = pay_fee(&alice, input.clone(), 10);
    let child = pay_fee(&alice, output_of(&parent, 0), 10);
    ledger.submit_transaction(parent.clone()).await.unwrap();
    ledger.submit_transaction(child.clone()).await.unwrap();

    let replacement = pay_fee(&alice, input, 30);
    ledger.submit_transaction(replacement.clone()).await.unwrap();
    assert_eq!(ledger.mempool().get_raw_mempool().await, vec![replacement.id]);
}

// ============================================================================
// Dependency bounds
// ============================================================================

#[tokio::test]
async fn test_ancestor_bound() {
    let mut config = LedgerConfig::for_testing();
    config.mempool.max_ancestors = 2;
    let ledger = ledger_with(config, Arc::new(MemoryStore::new()));
    let alice = keypair("alice");
    let mut input = fund(ledger.utxo_set(), &alice, 1, 100).await;

    for _ in 0..3 {
        let tx = pay_fee(&alice, input, 1);
        ledger.submit_transaction(tx.clone()).await.unwrap();
        input = output_of(&tx, 0);
    }

    let err = ledger
        .submit_transaction(pay_fee(&alice, input, 1))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TOO_MANY_ANCESTORS");
    assert_eq!(ledger.mempool().len().await, 3);
}

#[tokio::test]
async fn test_descendant_bound() {
    let mut config = LedgerConfig::for_testing();
    config.mempool.max_descendants = 1;
    let ledger = ledger_with(config, Arc::new(MemoryStore::new()));
    let alice = keypair("alice");
    let input = fund(ledger.utxo_set(), &alice, 1, 100).await;

    let parent = TransactionBuilder::new()
        .add_input(input)
        .pay_to(&alice.public_key_bytes(), 45)
        .pay_to(&alice.public_key_bytes(), 45)
        .timestamp(1)
        .build(&alice, crypto().as_ref())
        .unwrap();
    ledger.submit_transaction(parent.clone()).await.unwrap();
    ledger
        .submit_transaction(pay_fee(&alice, output_of(&parent, 0), 5))
        .await
        .unwrap();

    let err = ledger
        .submit_transaction(pay_fee(&alice, output_of(&parent, 1), 5))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TOO_MANY_DESCENDANTS");
}

// ============================================================================
// Ordering, estimation, capacity
// ============================================================================

#[tokio::test]
async fn test_pending_order_is_fee_rate_non_increasing() {
    let ledger = ledger();
    let alice = keypair("alice");

    for seed in 1..=12u8 {
        let input = fund(ledger.utxo_set(), &alice, seed, 1_000).await;
        let fee = (seed as Amount * 37) % 200 + 1;
        ledger.submit_transaction(pay_fee(&alice, input, fee)).await.unwrap();
    }

    let pending = ledger
        .mempool()
        .get_pending_transactions(PendingOptions::default())
        .await;
    assert_eq!(pending.len(), 12);
    let rates: Vec<f64> = pending
        .iter()
        .map(|tx| tx.fee as f64 / tx.size() as f64)
        .collect();
    assert!(rates.windows(2).all(|w| w[0] >= w[1]));

    let limited = ledger
        .mempool()
        .get_pending_transactions(PendingOptions {
            limit: Some(3),
            ..Default::default()
        })
        .await;
    assert_eq!(limited, pending[..3].to_vec());
}

#[tokio::test]
async fn test_pending_skips_children_of_unselected_parents() {
    let ledger = ledger();
    let alice = keypair("alice");
    let input = fund(ledger.utxo_set(), &alice, 1, 1_000).await;

    let parent = pay_fee(&alice, input, 1);
    let child = pay_fee(&alice, output_of(&parent, 0), 500);
    ledger.submit_transaction(parent.clone()).await.unwrap();
    ledger.submit_transaction(child.clone()).await.unwrap();

    let pending = ledger
        .mempool()
        .get_pending_transactions(PendingOptions::default())
        .await;
    assert_eq!(pending, vec![parent]);
}

#[tokio::test]
async fn test_estimate_fee() {
    let mut config = LedgerConfig::for_testing();
    config.mempool.expected_block_bytes = 1;
    let ledger = ledger_with(config, Arc::new(MemoryStore::new()));
    let alice = keypair("alice");

    assert_eq!(ledger.mempool().estimate_fee(1).await, 0.0);

    for seed in 1..=3u8 {
        let input = fund(ledger.utxo_set(), &alice, seed, 1_000).await;
        ledger
            .submit_transaction(pay_fee(&alice, input, 10 * seed as Amount))
            .await
            .unwrap();
    }
    let info = ledger.mempool().get_mempool_info().await;
    assert_eq!(ledger.mempool().estimate_fee(1).await, info.max_fee_rate);
}

#[tokio::test]
async fn test_full_mempool_evicts_cheapest() {
    let mut config = LedgerConfig::for_testing();
    config.mempool = MempoolConfig {
        max_transactions: 2,
        ..MempoolConfig::for_testing()
    };
    let ledger = ledger_with(config, Arc::new(MemoryStore::new()));
    let alice = keypair("alice");

    let cheap = submit_funded(&ledger, &alice, 1, 10).await;
    submit_funded(&ledger, &alice, 2, 20).await;
    submit_funded(&ledger, &alice, 3, 30).await;
    assert!(!ledger.mempool().contains(&cheap.id).await);
    assert_eq!(ledger.mempool().len().await, 2);

    let input = fund(ledger.utxo_set(), &alice, 4, 1_000).await;
    let err = ledger
        .submit_transaction(pay_fee(&alice, input, 5))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "MEMPOOL_FULL");
}

#[tokio::test]
async fn test_evict_expired() {
    let mut config = LedgerConfig::for_testing();
    config.mempool.max_age_secs = 60;
    let ledger = ledger_with(config, Arc::new(MemoryStore::new()));
    let alice = keypair("alice");
    submit_funded(&ledger, &alice, 1, 10).await;
    submit_funded(&ledger, &alice, 2, 10).await;

    assert_eq!(ledger.mempool().evict(unix_timestamp()).await, 0);
    assert_eq!(ledger.mempool().evict(unix_timestamp() + 3_600).await, 2);
    assert!(ledger.mempool().is_empty().await);
}

#[tokio::test]
async fn test_eviction_task_expires_entries() {
    let mut config = LedgerConfig::for_testing();
    config.mempool.max_age_secs = 0;
    config.mempool.eviction_interval_secs = 1;
    let ledger = ledger_with(config, Arc::new(MemoryStore::new()));
    let alice = keypair("alice");
    submit_funded(&ledger, &alice, 1, 10).await;

    let task = Arc::clone(ledger.mempool()).spawn_eviction_task();
    tokio::time::sleep(std::time::Duration::from_millis(2_500)).await;
    task.abort();

    assert!(ledger.mempool().is_empty().await);
}

#[tokio::test]
async fn test_vote_cooldown_through_mempool() {
    let ledger = ledger();
    let alice = keypair("alice");
    let a = fund(ledger.utxo_set(), &alice, 1, 100).await;
    let b = fund(ledger.utxo_set(), &alice, 2, 100).await;

    let vote = |input: Utxo, weight: u64| {
        TransactionBuilder::vote("proposal-1", true, weight)
            .add_input(input)
            .pay_to(&alice.public_key_bytes(), 99)
            .timestamp(1)
            .build(&alice, crypto().as_ref())
            .unwrap()
    };

    let err = ledger.submit_transaction(vote(a.clone(), 11)).await.unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_VOTING_POWER");

    ledger.submit_transaction(vote(a, 10)).await.unwrap();
    let err = ledger.submit_transaction(vote(b, 1)).await.unwrap_err();
    assert_eq!(err.code(), "VOTE_COOLDOWN");
}

#[tokio::test]
async fn test_rejected_vote_leaves_no_cooldown() {
    let ledger = ledger();
    let alice = keypair("alice");
    let a = fund(ledger.utxo_set(), &alice, 1, 100).await;
    let b = fund(ledger.utxo_set(), &alice, 2, 100).await;
    ledger.submit_transaction(pay_fee(&alice, a.clone(), 10)).await.unwrap();

    // pays 11 where replacing the spend of `a` needs 15
    let err = ledger
        .submit_transaction(vote_with_fee(&alice, a, 11))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "RBF_FEE_TOO_LOW");
    assert_eq!(ledger.mempool().len().await, 1);

    let tracker = ledger.transaction_validator().vote_tracker();
    assert!(tracker.last_vote(&alice.address()).await.unwrap().is_none());

    let vote = vote_with_fee(&alice, b, 1);
    ledger.submit_transaction(vote.clone()).await.unwrap();
    let last = tracker.last_vote(&alice.address()).await.unwrap().unwrap();
    assert_eq!(last.tx_id, vote.id);
}

#[tokio::test]
async fn test_vote_replaced_by_fee() {
    let ledger = ledger();
    let alice = keypair("alice");
    let input = fund(ledger.utxo_set(), &alice, 1, 100).await;

    let first = vote_with_fee(&alice, input.clone(), 1);
    ledger.submit_transaction(first.clone()).await.unwrap();

    let bumped = vote_with_fee(&alice, input, 20);
    ledger.submit_transaction(bumped.clone()).await.unwrap();
    assert_eq!(ledger.mempool().get_raw_mempool().await, vec![bumped.id]);

    let last = ledger
        .transaction_validator()
        .vote_tracker()
        .last_vote(&alice.address())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.tx_id, bumped.id);
}

fn vote_with_fee(voter: &KeyPair, input: Utxo, fee: Amount) -> Transaction {
    let change = input.amount - fee;
    TransactionBuilder::vote("proposal-1", true, 5)
        .add_input(input)
        .pay_to(&voter.public_key_bytes(), change)
        .timestamp(1)
        .build(voter, crypto().as_ref())
        .unwrap()
}

async fn submit_funded(ledger: &Ledger, owner: &KeyPair, seed: u8, fee: Amount) -> Transaction {
    let input = fund(ledger.utxo_set(), owner, seed, 1_000).await;
    let tx = pay_fee(owner, input, fee);
    ledger.submit_transaction(tx.clone()).await.unwrap();
    tx
}
