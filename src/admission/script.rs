// src/admission/script.rs

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::debug;

use super::AdmissionStrategy;
use crate::config::{GateConfig, Strategy};
use crate::error::{GateError, Result, StorageError};
use crate::storage::{BucketStore, ScriptHandle};

/// Source of the bucket check-and-consume script.
///
/// KEYS = [bucket key]; ARGV = [max tokens, window seconds, now in epoch
/// microseconds, cost]; returns 1 to admit, 0 to deny.
pub const BUCKET_SCRIPT: &str = include_str!("bucket.lua");

/// Atomic-script strategy
///
/// The whole exists / create-or-decrement / expire sequence runs inside the
/// store as one script, so requests for the same bucket are serialised by
/// the store and the admitted count never exceeds the quota, however many
/// processes are calling.
#[derive(Debug)]
pub struct AtomicScript<S>
where
    S: BucketStore,
{
    store: S,
    script: ScriptHandle,
    max_tokens: i64,
    window: Duration,
}

impl<S> AtomicScript<S>
where
    S: BucketStore,
{
    /// Loads the bucket script into the store
    pub async fn load(store: S, config: &GateConfig) -> Result<Self> {
        let script = store.load_script(BUCKET_SCRIPT).await.map_err(|e| match e {
            GateError::ScriptLoad(_) => e,
            other => GateError::ScriptLoad(other.to_string()),
        })?;
        debug!(sha = script.sha(), "Bucket script loaded");

        Ok(Self {
            store,
            script,
            max_tokens: config.max_tokens as i64,
            window: config.window,
        })
    }

    pub fn script(&self) -> &ScriptHandle {
        &self.script
    }
}

#[async_trait]
impl<S> AdmissionStrategy for AtomicScript<S>
where
    S: BucketStore,
{
    fn kind(&self) -> Strategy {
        Strategy::AtomicScript
    }

    async fn try_consume(&self, key: &str, cost: u64) -> Result<bool> {
        let args = [
            self.max_tokens,
            self.window.as_secs() as i64,
            Utc::now().timestamp_micros(),
            cost as i64,
        ];

        match self.store.run_script(&self.script, &[key], &args).await? {
            1 => Ok(true),
            0 => Ok(false),
            other => Err(StorageError::Command(format!(
                "bucket script returned {}, expected 0 or 1",
                other
            ))
            .into()),
        }
    }
}
