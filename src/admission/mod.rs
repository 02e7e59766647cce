// src/admission/mod.rs

pub mod pipeline;
pub mod script;

#[cfg(test)]
mod tests;

pub use pipeline::TransactionalPipeline;
pub use script::AtomicScript;

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::admission_event;
use crate::config::{GateConfig, Strategy};
use crate::error::{GateError, Result};
use crate::storage::BucketStore;

/// Hash field holding the tokens left in the current window
pub const TOKENS_FIELD: &str = "tokens";

/// Hash field recording when the bucket was created, in epoch microseconds
pub const CREATED_AT_FIELD: &str = "created_at";

/// Outcome of one admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Quota was available and has been consumed
    Admit,
    /// No quota left in the current window; nothing was changed
    Deny,
    /// The store could not be consulted
    Error(String),
}

impl Verdict {
    pub fn is_admit(&self) -> bool {
        matches!(self, Verdict::Admit)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Admit => "admit",
            Verdict::Deny => "deny",
            Verdict::Error(_) => "error",
        }
    }
}

/// A way of running the bucket state machine against the store.
///
/// Absent bucket: create it with `max_tokens - cost` tokens and a TTL of one
/// window, admit. Live bucket: consume `cost` when at least that many tokens
/// remain, otherwise deny without writing. Expiry is left to the store.
#[async_trait]
pub trait AdmissionStrategy: Send + Sync + Debug {
    /// Which strategy this is
    fn kind(&self) -> Strategy;

    /// Check the bucket at `key` and consume `cost` tokens if enough remain.
    /// `cost` is at least 1 and never above the bucket capacity.
    async fn try_consume(&self, key: &str, cost: u64) -> Result<bool>;
}

/// Decides, per identity, whether a request fits in the current window.
///
/// Holds no bucket state of its own: every decision is a round trip to the
/// store, so any number of processes sharing the store agree on the quota.
/// Cloning is cheap and clones share the same strategy.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    strategy: Arc<dyn AdmissionStrategy>,
    config: Arc<GateConfig>,
}

impl AdmissionController {
    /// Builds the controller with the strategy named in `config`.
    ///
    /// For the atomic-script strategy the bucket script is loaded here; a
    /// store that cannot take it fails with `ScriptLoad`.
    pub async fn new<S>(store: S, config: GateConfig) -> Result<Self>
    where
        S: BucketStore + 'static,
    {
        config.validate()?;

        let strategy: Arc<dyn AdmissionStrategy> = match config.strategy {
            Strategy::AtomicScript => Arc::new(AtomicScript::load(store, &config).await?),
            Strategy::TransactionalPipeline => {
                warn!(
                    "Transactional pipeline strategy selected: simultaneous first requests \
                     from a new identity may be over-admitted"
                );
                Arc::new(TransactionalPipeline::new(store, &config))
            }
        };

        info!(
            strategy = %config.strategy,
            max_tokens = config.max_tokens,
            window_seconds = config.window_secs(),
            failure_policy = %config.failure_policy,
            "Admission controller ready"
        );

        Ok(Self {
            strategy,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy.kind()
    }

    /// Store key of the bucket belonging to `identity`
    pub fn bucket_key(&self, identity: &str) -> String {
        format!("{}:{}", self.config.key_prefix, identity)
    }

    /// Consume `cost` tokens from the identity's bucket.
    ///
    /// `Err(LimitExceeded)` when the window has no room left; store failures
    /// come back as `Err(Storage)` and are never retried.
    pub async fn check(&self, identity: &str, cost: u64) -> Result<()> {
        if cost == 0 {
            return Err(GateError::Internal("admission cost must be at least 1".to_string()));
        }

        // Can never fit, not even in a fresh window
        if cost > self.config.max_tokens {
            return Err(GateError::LimitExceeded(format!(
                "cost {} exceeds bucket capacity {} for {}",
                cost, self.config.max_tokens, identity
            )));
        }

        let key = self.bucket_key(identity);
        if self.strategy.try_consume(&key, cost).await? {
            Ok(())
        } else {
            Err(GateError::LimitExceeded(identity.to_string()))
        }
    }

    /// Admission decision for one request of weight `cost`
    pub async fn admit(&self, identity: &str, cost: u64) -> Verdict {
        let strategy = self.strategy.kind().as_str();
        let verdict = match self.check(identity, cost).await {
            Ok(()) => Verdict::Admit,
            Err(GateError::LimitExceeded(_)) => Verdict::Deny,
            Err(e) => {
                error!(identity, cost, strategy, error = %e, "Admission check failed");
                return Verdict::Error(e.to_string());
            }
        };

        if verdict.is_admit() {
            debug!(identity, cost, strategy, "Admitted");
        } else {
            let key = self.bucket_key(identity);
            admission_event!(identity, key.as_str(), verdict.as_str(), cost, strategy);
        }
        verdict
    }

    /// Admission decision for a request of weight 1
    pub async fn admit_one(&self, identity: &str) -> Verdict {
        self.admit(identity, 1).await
    }
}
