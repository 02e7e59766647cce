// src/admission/pipeline.rs

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::debug;

use super::{AdmissionStrategy, CREATED_AT_FIELD, TOKENS_FIELD};
use crate::config::{GateConfig, Strategy};
use crate::error::Result;
use crate::storage::{BucketStore, StoreTransaction};

/// Transactional-pipeline strategy
///
/// Runs the bucket state machine as separate round trips: an existence
/// check, then either a MULTI/EXEC that creates the bucket with its TTL, or
/// a read followed by a decrement.
///
/// Known gap: two first requests for a new identity can both see the bucket
/// absent and both create it. The last write wins and both are admitted, so
/// a burst of `k` simultaneous first requests admits at most
/// `max_tokens + k - 1`. Once a bucket exists, admissions are exact: a
/// decrement that lands below zero is handed back and denied. The same
/// first-request race reappears when several decrements land on a bucket
/// that expired after they read it: one of them opens the new window and
/// the hand-backs of the others are added on top of it.
#[derive(Debug)]
pub struct TransactionalPipeline<S>
where
    S: BucketStore,
{
    store: S,
    max_tokens: i64,
    window: Duration,
}

impl<S> TransactionalPipeline<S>
where
    S: BucketStore,
{
    pub fn new(store: S, config: &GateConfig) -> Self {
        Self {
            store,
            max_tokens: config.max_tokens as i64,
            window: config.window,
        }
    }

    // Absent -> Active. Not guarded against a concurrent creator.
    async fn create_bucket(&self, key: &str, cost: i64) -> Result<bool> {
        let mut transaction = self.store.transaction();
        transaction
            .set_hash_fields(
                key,
                &[
                    (TOKENS_FIELD, (self.max_tokens - cost).to_string()),
                    (CREATED_AT_FIELD, Utc::now().timestamp_micros().to_string()),
                ],
            )
            .expire(key, self.window);
        self.store.run_transaction(transaction).await?;

        debug!(key, "Bucket created");
        Ok(true)
    }

    // Active -> Active
    async fn consume(&self, key: &str, tokens: i64, cost: i64) -> Result<bool> {
        if tokens < cost {
            return Ok(false);
        }

        let remaining = self
            .store
            .increment_hash_field(key, TOKENS_FIELD, -cost)
            .await?;
        if remaining >= 0 {
            return Ok(true);
        }

        // Buckets are always created with a TTL, so a key without one was
        // recreated by our decrement after expiring past the read. That is a
        // fresh window: Absent -> Active.
        if self.store.expire_if_persistent(key, self.window).await? {
            debug!(key, "Bucket expired before decrement, starting a new window");
            return self.create_bucket(key, cost).await;
        }

        // Concurrent consumers drained the bucket between our read and our
        // decrement. Give the tokens back; EXPIRE NX keeps the hand-back from
        // leaving a key without TTL should the bucket expire in between.
        let mut transaction = self.store.transaction();
        transaction
            .increment_hash_field(key, TOKENS_FIELD, cost)
            .expire_if_persistent(key, self.window);
        self.store.run_transaction(transaction).await?;

        debug!(key, remaining, "Decrement overshot, tokens returned");
        Ok(false)
    }
}

#[async_trait]
impl<S> AdmissionStrategy for TransactionalPipeline<S>
where
    S: BucketStore,
{
    fn kind(&self) -> Strategy {
        Strategy::TransactionalPipeline
    }

    async fn try_consume(&self, key: &str, cost: u64) -> Result<bool> {
        let cost = cost as i64;

        if self.store.exists(key).await? == 0 {
            return self.create_bucket(key, cost).await;
        }

        match self.store.get_hash_field(key, TOKENS_FIELD).await? {
            Some(tokens) => self.consume(key, tokens, cost).await,
            // Expired between the two round trips
            None => self.create_bucket(key, cost).await,
        }
    }
}
