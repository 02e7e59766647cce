// src/admission/tests/mod.rs

mod pipeline_tests;
mod scenario_tests;

pub(crate) mod common {
    use futures::future::join_all;

    use crate::admission::{AdmissionController, Verdict};

    /// Fires `attempts` single-token checks for `identity` at once and
    /// returns how many were admitted.
    pub async fn admit_concurrently(
        gate: &AdmissionController,
        identity: &str,
        attempts: usize,
    ) -> usize {
        let verdicts = join_all((0..attempts).map(|_| gate.admit_one(identity))).await;
        assert!(
            verdicts.iter().all(|v| !matches!(v, Verdict::Error(_))),
            "no check should fail: {:?}",
            verdicts
        );
        verdicts.iter().filter(|v| v.is_admit()).count()
    }

    /// Sends `count` requests one after another and returns the verdicts
    pub async fn admit_sequentially(
        gate: &AdmissionController,
        identity: &str,
        count: usize,
    ) -> Vec<Verdict> {
        let mut verdicts = Vec::with_capacity(count);
        for _ in 0..count {
            verdicts.push(gate.admit_one(identity).await);
        }
        verdicts
    }
}
