use std::time::Duration;
use tokio::time;
use tracing_test::traced_test;

use super::common::{admit_concurrently, admit_sequentially};
use crate::admission::pipeline::TransactionalPipeline;
use crate::admission::{AdmissionController, AdmissionStrategy, Verdict};
use crate::config::Strategy;
use crate::storage::{BucketStore, MemoryStore};
use crate::test_utils::{create_test_gate, gate_config, memory_store, FlakyStore};

#[tokio::test(start_paused = true)]
async fn test_first_request_burst_is_bounded() {
    let (gate, store) = create_test_gate(
        gate_config(Strategy::TransactionalPipeline),
        Some(Duration::from_millis(1)),
    )
    .await;

    // Every request checks existence before any of them creates the bucket
    let burst = 20;
    let admitted = admit_concurrently(&gate, "new", burst).await;

    assert_eq!(admitted, burst);
    assert!(admitted <= 10 + burst - 1);
    // Last creator wins; the bucket looks like a single first request
    assert_eq!(store.inner().tokens("rate_limit:new"), Some(9));
    assert_eq!(store.inner().ttl("rate_limit:new"), Some(Duration::from_secs(60)));
}

#[tokio::test(start_paused = true)]
async fn test_overshoot_is_handed_back() {
    let (gate, store) = create_test_gate(
        gate_config(Strategy::TransactionalPipeline),
        Some(Duration::from_millis(1)),
    )
    .await;

    assert!(gate.admit_one("E").await.is_admit());
    let admitted = admit_concurrently(&gate, "E", 50).await;

    assert_eq!(admitted, 9);
    assert_eq!(store.inner().tokens("rate_limit:E"), Some(0));
    assert_eq!(gate.admit_one("E").await, Verdict::Deny);
}

#[tokio::test(start_paused = true)]
async fn test_no_store_contact_at_startup() {
    let (_gate, store) = create_test_gate(gate_config(Strategy::TransactionalPipeline), None).await;
    assert_eq!(store.calls(), 0);
}

#[tokio::test]
async fn test_round_trips_per_decision() {
    let store = FlakyStore::new(memory_store(None));
    let pipeline = TransactionalPipeline::new(store.clone(), &gate_config(Strategy::TransactionalPipeline));
    assert_eq!(pipeline.kind(), Strategy::TransactionalPipeline);

    // Absent: EXISTS + MULTI/EXEC
    assert!(pipeline.try_consume("k", 1).await.unwrap());
    assert_eq!(store.calls(), 2);

    // Live: EXISTS + HGET + HINCRBY
    store.reset_calls();
    assert!(pipeline.try_consume("k", 1).await.unwrap());
    assert_eq!(store.calls(), 3);

    // Denied: EXISTS + HGET, no write
    store.inner().set_hash_fields("k", &[("tokens", "0".to_string())]).await.unwrap();
    store.reset_calls();
    assert!(!pipeline.try_consume("k", 1).await.unwrap());
    assert_eq!(store.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_bucket_missing_tokens_field_is_recreated() {
    let store = FlakyStore::new(memory_store(None));
    let pipeline = TransactionalPipeline::new(store.clone(), &gate_config(Strategy::TransactionalPipeline));

    // A hash without a tokens field counts as absent
    store.inner().set_hash_fields("odd", &[("created_at", "1".to_string())]).await.unwrap();
    assert!(pipeline.try_consume("odd", 1).await.unwrap());
    assert_eq!(store.inner().tokens("odd"), Some(9));
    assert_eq!(store.inner().ttl("odd"), Some(Duration::from_secs(60)));

    time::advance(Duration::from_secs(60)).await;
    assert_eq!(store.inner().tokens("odd"), None);
}

// Store latency is 10ms per round trip, so a request started at `start`
// runs EXISTS at +10ms, HGET at +20ms and HINCRBY at +30ms.
async fn gate_with_bucket_expiring_in(
    offset_before_expiry: Duration,
) -> (AdmissionController, FlakyStore<MemoryStore>) {
    let (gate, store) = create_test_gate(
        gate_config(Strategy::TransactionalPipeline),
        Some(Duration::from_millis(10)),
    )
    .await;

    assert!(gate.admit_one("X").await.is_admit());
    let ttl = store.inner().ttl("rate_limit:X").unwrap();
    time::advance(ttl - offset_before_expiry).await;
    (gate, store)
}

#[tokio::test(start_paused = true)]
async fn test_bucket_expiring_before_decrement_opens_new_window() {
    // EXISTS and HGET see the old bucket, HINCRBY lands after it expired
    let (gate, store) = gate_with_bucket_expiring_in(Duration::from_millis(25)).await;

    assert_eq!(gate.admit_one("X").await, Verdict::Admit);
    assert_eq!(store.inner().tokens("rate_limit:X"), Some(9));
    assert_eq!(store.inner().ttl("rate_limit:X"), Some(Duration::from_secs(60)));

    time::advance(Duration::from_secs(1)).await;
    assert_eq!(gate.admit_one("X").await, Verdict::Admit);
    assert_eq!(store.inner().tokens("rate_limit:X"), Some(8));
}

#[tokio::test(start_paused = true)]
async fn test_bucket_expiring_before_read_opens_new_window() {
    // EXISTS sees the old bucket, HGET finds it gone
    let (gate, store) = gate_with_bucket_expiring_in(Duration::from_millis(15)).await;

    assert_eq!(gate.admit_one("X").await, Verdict::Admit);
    assert_eq!(store.inner().tokens("rate_limit:X"), Some(9));
    assert_eq!(store.inner().ttl("rate_limit:X"), Some(Duration::from_secs(60)));
}

#[tokio::test(start_paused = true)]
async fn test_drained_bucket_expiring_before_decrement_opens_new_window() {
    let (gate, store) = create_test_gate(
        gate_config(Strategy::TransactionalPipeline),
        Some(Duration::from_millis(10)),
    )
    .await;
    let key = "rate_limit:Y";

    admit_sequentially(&gate, "Y", 9).await;
    assert_eq!(store.inner().tokens(key), Some(1));
    let ttl = store.inner().ttl(key).unwrap();
    time::advance(ttl - Duration::from_millis(25)).await;

    // The last token of the old window is read, the decrement hits the new one
    assert_eq!(gate.admit_one("Y").await, Verdict::Admit);
    assert_eq!(store.inner().tokens(key), Some(9));
    assert_eq!(store.inner().ttl(key), Some(Duration::from_secs(60)));
}

#[tokio::test]
#[traced_test]
async fn test_pipeline_selection_is_logged() {
    let (gate, _store) = create_test_gate(gate_config(Strategy::TransactionalPipeline), None).await;
    assert_eq!(gate.strategy(), Strategy::TransactionalPipeline);
    assert!(logs_contain("may be over-admitted"));
}
