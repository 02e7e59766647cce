// src/test_utils.rs

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::admission::AdmissionController;
use crate::config::{GateConfig, InMemoryConfig, Strategy};
use crate::error::{Result, StorageError};
use crate::storage::{BucketStore, MemoryStore, ScriptHandle};

/// Wraps a store so tests can take it down and count the round trips made.
#[derive(Debug, Clone)]
pub struct FlakyStore<S> {
    inner: S,
    down: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl<S> FlakyStore<S>
where
    S: BucketStore,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            down: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Round trips attempted since the last reset, failed ones included
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    fn round_trip(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::Connection("Connection refused (os error 111)".to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl<S> BucketStore for FlakyStore<S>
where
    S: BucketStore,
{
    type Transaction = S::Transaction;

    async fn exists(&self, key: &str) -> Result<u64> {
        self.round_trip()?;
        self.inner.exists(key).await
    }

    async fn get_hash_field(&self, key: &str, field: &str) -> Result<Option<i64>> {
        self.round_trip()?;
        self.inner.get_hash_field(key, field).await
    }

    async fn increment_hash_field(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.round_trip()?;
        self.inner.increment_hash_field(key, field, delta).await
    }

    async fn set_hash_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        self.round_trip()?;
        self.inner.set_hash_fields(key, fields).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.round_trip()?;
        self.inner.expire(key, ttl).await
    }

    async fn expire_if_persistent(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.round_trip()?;
        self.inner.expire_if_persistent(key, ttl).await
    }

    fn transaction(&self) -> Self::Transaction {
        self.inner.transaction()
    }

    async fn run_transaction(&self, transaction: Self::Transaction) -> Result<()> {
        self.round_trip()?;
        self.inner.run_transaction(transaction).await
    }

    async fn load_script(&self, source: &str) -> Result<ScriptHandle> {
        self.round_trip()?;
        self.inner.load_script(source).await
    }

    async fn run_script(&self, script: &ScriptHandle, keys: &[&str], args: &[i64]) -> Result<i64> {
        self.round_trip()?;
        self.inner.run_script(script, keys, args).await
    }
}

/// Memory store with no background task and optional simulated latency
pub fn memory_store(latency: Option<Duration>) -> MemoryStore {
    MemoryStore::new(InMemoryConfig {
        max_entries: 1000,
        use_background_task: false,
        cleanup_interval: Duration::from_secs(60),
        latency,
    })
}

/// 10 requests per 60 seconds with the given strategy
pub fn gate_config(strategy: Strategy) -> GateConfig {
    GateConfig::new(10, Duration::from_secs(60)).with_strategy(strategy)
}

/// Controller over a flaky memory store; the store handle shares state with it
pub async fn create_test_gate(
    config: GateConfig,
    latency: Option<Duration>,
) -> (AdmissionController, FlakyStore<MemoryStore>) {
    let store = FlakyStore::new(memory_store(latency));
    let gate = AdmissionController::new(store.clone(), config)
        .await
        .expect("gate should build over the memory store");
    (gate, store)
}
