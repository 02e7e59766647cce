// Behaviour both strategies must share, checked against each of them

use std::time::Duration;
use tokio::time;
use tokio_test::assert_ok;
use tracing_test::traced_test;

use super::common::{admit_concurrently, admit_sequentially};
use crate::admission::Verdict;
use crate::config::Strategy;
use crate::error::GateError;
use crate::test_utils::{create_test_gate, gate_config};

const STRATEGIES: [Strategy; 2] = [Strategy::AtomicScript, Strategy::TransactionalPipeline];

#[tokio::test(start_paused = true)]
async fn test_sequential_requests_exhaust_quota() {
    for strategy in STRATEGIES {
        let (gate, store) = create_test_gate(gate_config(strategy), None).await;

        let mut verdicts = Vec::new();
        for _ in 0..10 {
            verdicts.push(gate.admit_one("A").await);
            time::advance(Duration::from_millis(400)).await;
        }
        assert!(
            verdicts.iter().all(Verdict::is_admit),
            "{}: first 10 requests should be admitted, got {:?}",
            strategy,
            verdicts
        );

        assert_eq!(gate.admit_one("A").await, Verdict::Deny, "{}: 11th request", strategy);
        assert_eq!(store.inner().tokens("rate_limit:A"), Some(0));
    }
}

#[tokio::test(start_paused = true)]
async fn test_window_reset_after_expiry() {
    for strategy in STRATEGIES {
        let (gate, store) = create_test_gate(gate_config(strategy), None).await;

        admit_sequentially(&gate, "A", 10).await;
        assert_eq!(gate.admit_one("A").await, Verdict::Deny);

        time::advance(Duration::from_secs(61)).await;

        assert_eq!(gate.admit_one("A").await, Verdict::Admit, "{}: fresh window", strategy);
        assert_eq!(store.inner().tokens("rate_limit:A"), Some(9));
        assert_eq!(store.inner().ttl("rate_limit:A"), Some(Duration::from_secs(60)));
    }
}

#[tokio::test]
async fn test_identities_are_independent() {
    for strategy in STRATEGIES {
        let (gate, _store) = create_test_gate(gate_config(strategy), None).await;

        let mut admitted_a = 0;
        let mut admitted_b = 0;
        for _ in 0..10 {
            admitted_a += gate.admit_one("A").await.is_admit() as usize;
            admitted_b += gate.admit_one("B").await.is_admit() as usize;
        }

        assert_eq!(admitted_a, 10, "{}: identity A", strategy);
        assert_eq!(admitted_b, 10, "{}: identity B", strategy);
        assert_eq!(gate.admit_one("A").await, Verdict::Deny);
        assert_eq!(gate.admit_one("B").await, Verdict::Deny);
        assert!(gate.admit_one("C").await.is_admit());
    }
}

#[tokio::test(start_paused = true)]
async fn test_deny_changes_nothing() {
    for strategy in STRATEGIES {
        let (gate, store) = create_test_gate(gate_config(strategy), None).await;
        let key = gate.bucket_key("A");

        admit_sequentially(&gate, "A", 10).await;
        time::advance(Duration::from_secs(30)).await;

        // Repeated denials neither resurrect quota nor extend the window
        for _ in 0..5 {
            assert_eq!(gate.admit_one("A").await, Verdict::Deny);
            assert_eq!(store.inner().tokens(&key), Some(0));
            assert_eq!(store.inner().ttl(&key), Some(Duration::from_secs(30)));
        }
    }
}

#[tokio::test]
#[traced_test]
async fn test_denials_are_logged_at_info() {
    for strategy in STRATEGIES {
        let (gate, _store) = create_test_gate(gate_config(strategy), None).await;
        admit_sequentially(&gate, "A", 10).await;
        assert_eq!(gate.admit_one("A").await, Verdict::Deny);
    }

    // Admissions stay at debug; only the two denials are events
    logs_assert(|lines: &[&str]| {
        let events: Vec<&&str> = lines
            .iter()
            .filter(|line| line.contains("Admission check"))
            .collect();
        if events.len() != STRATEGIES.len() {
            return Err(format!("expected {} deny events, got {}", STRATEGIES.len(), events.len()));
        }
        match events.iter().all(|line| line.contains("INFO")) {
            true => Ok(()),
            false => Err("deny event not logged at info".to_string()),
        }
    });
}

#[tokio::test]
async fn test_store_outage_is_an_error_without_retry() {
    for strategy in STRATEGIES {
        let (gate, store) = create_test_gate(gate_config(strategy), None).await;
        assert!(gate.admit_one("A").await.is_admit());

        store.set_down(true);
        store.reset_calls();

        let verdict = gate.admit_one("A").await;
        assert!(matches!(verdict, Verdict::Error(_)), "{}: got {:?}", strategy, verdict);
        assert_eq!(store.calls(), 1, "{}: exactly one round trip", strategy);

        // Back up: the bucket is where it was
        store.set_down(false);
        assert!(gate.admit_one("A").await.is_admit());
        assert_eq!(store.inner().tokens("rate_limit:A"), Some(8));
    }
}

#[tokio::test]
async fn test_cost_edge_cases() {
    for strategy in STRATEGIES {
        let (gate, store) = create_test_gate(gate_config(strategy), None).await;
        store.reset_calls();

        // Zero cost is a caller bug
        assert!(matches!(gate.admit("A", 0).await, Verdict::Error(_)));
        assert!(matches!(
            gate.check("A", 0).await,
            Err(GateError::Internal(_))
        ));

        // Larger than the bucket: denied without touching the store
        assert_eq!(gate.admit("A", 11).await, Verdict::Deny);
        assert_eq!(store.calls(), 0);
        assert_eq!(store.inner().tokens("rate_limit:A"), None);

        // A cost equal to the capacity drains a fresh bucket in one go
        assert_ok!(gate.check("A", 10).await);
        assert_eq!(store.inner().tokens("rate_limit:A"), Some(0));
        assert!(matches!(
            gate.check("A", 1).await,
            Err(GateError::LimitExceeded(_))
        ));
    }
}

#[tokio::test]
async fn test_weighted_requests_consume_cost() {
    for strategy in STRATEGIES {
        let (gate, store) = create_test_gate(gate_config(strategy), None).await;

        assert!(gate.admit("A", 4).await.is_admit());
        assert!(gate.admit("A", 4).await.is_admit());
        assert_eq!(store.inner().tokens("rate_limit:A"), Some(2));

        // Not enough left for 3, but a 2 still fits
        assert_eq!(gate.admit("A", 3).await, Verdict::Deny);
        assert_eq!(store.inner().tokens("rate_limit:A"), Some(2));
        assert!(gate.admit("A", 2).await.is_admit());
    }
}

#[tokio::test]
async fn test_concurrent_requests_on_existing_bucket_are_exact() {
    for strategy in STRATEGIES {
        let (gate, _store) = create_test_gate(gate_config(strategy), Some(Duration::from_millis(1))).await;

        assert!(gate.admit_one("C").await.is_admit());
        let admitted = admit_concurrently(&gate, "C", 50).await;
        assert_eq!(admitted, 9, "{}: one admitted earlier, nine left", strategy);
    }
}
