// src/storage/memory.rs

// In-memory store with the same contract as Redis. Used by the tests and the
// simulation CLI; expiry runs on tokio's clock so paused-time tests can
// jump past a window.
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task;
use tokio::time::{self, Instant};

use crate::admission::script::BUCKET_SCRIPT;
use crate::admission::{CREATED_AT_FIELD, TOKENS_FIELD};
use crate::config::InMemoryConfig;
use crate::error::{Result, StorageError};
use crate::storage::{BucketStore, ScriptHandle, StoreTransaction};

/// Queued operations for a memory transaction
#[derive(Debug, Default)]
pub struct MemoryTransaction {
    operations: Vec<MemoryOperation>,
}

/// Represents an operation in the memory transaction
#[derive(Debug)]
enum MemoryOperation {
    SetHashFields(String, Vec<(String, String)>),
    IncrementHashField(String, String, i64),
    Expire(String, Duration),
    ExpireIfPersistent(String, Duration),
}

impl StoreTransaction for MemoryTransaction {
    fn set_hash_fields(&mut self, key: &str, fields: &[(&str, String)]) -> &mut Self {
        let fields = fields
            .iter()
            .map(|(field, value)| (field.to_string(), value.clone()))
            .collect();
        self.operations
            .push(MemoryOperation::SetHashFields(key.to_string(), fields));
        self
    }

    fn increment_hash_field(&mut self, key: &str, field: &str, delta: i64) -> &mut Self {
        self.operations.push(MemoryOperation::IncrementHashField(
            key.to_string(),
            field.to_string(),
            delta,
        ));
        self
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> &mut Self {
        self.operations
            .push(MemoryOperation::Expire(key.to_string(), ttl));
        self
    }

    fn expire_if_persistent(&mut self, key: &str, ttl: Duration) -> &mut Self {
        self.operations
            .push(MemoryOperation::ExpireIfPersistent(key.to_string(), ttl));
        self
    }
}

/// A hash stored under one key
#[derive(Debug, Clone, Default)]
struct HashEntry {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct MemoryData {
    entries: HashMap<String, HashEntry>,
    scripts: HashMap<String, ScriptHandle>,
}

impl MemoryData {
    /// The live entry for `key`, dropping it first if its TTL has passed
    fn live(&mut self, key: &str) -> Option<&mut HashEntry> {
        let expired = matches!(
            self.entries.get(key),
            Some(HashEntry { expires_at: Some(at), .. }) if *at <= Instant::now()
        );
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn live_or_insert(&mut self, key: &str, max_entries: usize) -> Result<&mut HashEntry> {
        if self.live(key).is_none() {
            if self.entries.len() >= max_entries {
                return Err(StorageError::Command("Maximum entries limit exceeded".to_string()).into());
            }
            self.entries.insert(key.to_string(), HashEntry::default());
        }
        self.entries
            .get_mut(key)
            .ok_or_else(|| StorageError::Command(format!("entry vanished: {}", key)).into())
    }

    fn set_fields(&mut self, key: &str, fields: &[(String, String)], max_entries: usize) -> Result<()> {
        let entry = self.live_or_insert(key, max_entries)?;
        for (field, value) in fields {
            entry.fields.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    fn increment(&mut self, key: &str, field: &str, delta: i64, max_entries: usize) -> Result<i64> {
        let entry = self.live_or_insert(key, max_entries)?;
        let current = match entry.fields.get(field) {
            Some(raw) => parse_int(raw)?,
            None => 0,
        };
        let updated = current.checked_add(delta).ok_or_else(|| {
            StorageError::Command("increment or decrement would overflow".to_string())
        })?;
        entry.fields.insert(field.to_string(), updated.to_string());
        Ok(updated)
    }

    fn expire(&mut self, key: &str, ttl: Duration, only_if_persistent: bool) -> bool {
        match self.live(key) {
            Some(entry) if only_if_persistent && entry.expires_at.is_some() => false,
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }

    // Native rendition of bucket.lua; runs under the store lock so it is as
    // indivisible as the script is inside Redis.
    fn run_bucket_script(&mut self, key: &str, args: &[i64], max_entries: usize) -> Result<i64> {
        let [max_tokens, window, now_micros, cost] = args else {
            return Err(StorageError::Command(format!(
                "bucket script expects 4 arguments, got {}",
                args.len()
            ))
            .into());
        };

        if self.live(key).is_none() {
            if cost > max_tokens {
                return Ok(0);
            }
            let fields = [
                (TOKENS_FIELD.to_string(), (max_tokens - cost).to_string()),
                (CREATED_AT_FIELD.to_string(), now_micros.to_string()),
            ];
            self.set_fields(key, &fields, max_entries)?;
            self.expire(key, Duration::from_secs((*window).max(0) as u64), false);
            return Ok(1);
        }

        let tokens = match self.live(key).and_then(|entry| entry.fields.get(TOKENS_FIELD)) {
            Some(raw) => raw.parse::<i64>().unwrap_or(0),
            None => 0,
        };
        if tokens < *cost {
            return Ok(0);
        }

        self.increment(key, TOKENS_FIELD, -cost, max_entries)?;
        Ok(1)
    }
}

fn parse_int(raw: &str) -> Result<i64> {
    raw.parse::<i64>().map_err(|_| {
        StorageError::Serialization(format!("hash value is not an integer: {}", raw)).into()
    })
}

/// In-memory store implementation
#[derive(Debug, Clone)]
pub struct MemoryStore {
    data: Arc<Mutex<MemoryData>>,
    config: InMemoryConfig,
}

impl MemoryStore {
    /// Creates a new in-memory store with the given configuration.
    ///
    /// With `use_background_task` set this must be called inside a tokio
    /// runtime; the cleanup task ends once the last clone is dropped.
    pub fn new(config: InMemoryConfig) -> Self {
        let data = Arc::new(Mutex::new(MemoryData::default()));

        if config.use_background_task {
            let weak = Arc::downgrade(&data);
            let interval = config.cleanup_interval;
            task::spawn(async move {
                let mut interval = time::interval(interval);
                loop {
                    interval.tick().await;
                    if !Self::cleanup_expired_entries(&weak) {
                        break;
                    }
                }
            });
        }

        Self { data, config }
    }

    /// Drops expired entries; false once the store itself is gone
    fn cleanup_expired_entries(data: &Weak<Mutex<MemoryData>>) -> bool {
        let Some(data) = data.upgrade() else {
            return false;
        };
        let now = Instant::now();
        let mut data = data.lock().unwrap_or_else(PoisonError::into_inner);
        data.entries.retain(|_, entry| match entry.expires_at {
            Some(expiry) => expiry > now,
            None => true,
        });
        true
    }

    fn lock(&self) -> MutexGuard<'_, MemoryData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Simulated network latency, so concurrent callers interleave between steps
    async fn round_trip(&self) {
        if let Some(latency) = self.config.latency {
            time::sleep(latency).await;
        }
    }

    /// Current token count of a bucket, if it is live
    pub fn tokens(&self, key: &str) -> Option<i64> {
        let mut data = self.lock();
        data.live(key)
            .and_then(|entry| entry.fields.get(TOKENS_FIELD))
            .and_then(|raw| raw.parse().ok())
    }

    /// Remaining time-to-live of a key; None when absent or persistent
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut data = self.lock();
        data.live(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Number of stored keys, expired ones included until they are touched
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    type Transaction = MemoryTransaction;

    async fn exists(&self, key: &str) -> Result<u64> {
        self.round_trip().await;
        Ok(self.lock().live(key).is_some() as u64)
    }

    async fn get_hash_field(&self, key: &str, field: &str) -> Result<Option<i64>> {
        self.round_trip().await;
        let mut data = self.lock();
        match data.live(key).and_then(|entry| entry.fields.get(field)) {
            Some(raw) => parse_int(raw).map(Some),
            None => Ok(None),
        }
    }

    async fn increment_hash_field(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.round_trip().await;
        self.lock()
            .increment(key, field, delta, self.config.max_entries)
    }

    async fn set_hash_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        self.round_trip().await;
        let fields: Vec<(String, String)> = fields
            .iter()
            .map(|(field, value)| (field.to_string(), value.clone()))
            .collect();
        self.lock()
            .set_fields(key, &fields, self.config.max_entries)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.round_trip().await;
        Ok(self.lock().expire(key, ttl, false))
    }

    async fn expire_if_persistent(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.round_trip().await;
        Ok(self.lock().expire(key, ttl, true))
    }

    fn transaction(&self) -> Self::Transaction {
        MemoryTransaction::default()
    }

    async fn run_transaction(&self, transaction: Self::Transaction) -> Result<()> {
        self.round_trip().await;
        let mut data = self.lock();

        // Snapshot every touched key so a failing operation rolls the rest back
        let mut snapshot: HashMap<String, Option<HashEntry>> = HashMap::new();
        for op in &transaction.operations {
            let key = match op {
                MemoryOperation::SetHashFields(key, _)
                | MemoryOperation::IncrementHashField(key, _, _)
                | MemoryOperation::Expire(key, _)
                | MemoryOperation::ExpireIfPersistent(key, _) => key,
            };
            if !snapshot.contains_key(key) {
                let current = data.live(key).cloned();
                snapshot.insert(key.clone(), current);
            }
        }

        let max_entries = self.config.max_entries;
        let applied = transaction.operations.iter().try_for_each(|op| match op {
            MemoryOperation::SetHashFields(key, fields) => data.set_fields(key, fields, max_entries),
            MemoryOperation::IncrementHashField(key, field, delta) => {
                data.increment(key, field, *delta, max_entries).map(|_| ())
            }
            MemoryOperation::Expire(key, ttl) => {
                data.expire(key, *ttl, false);
                Ok(())
            }
            MemoryOperation::ExpireIfPersistent(key, ttl) => {
                data.expire(key, *ttl, true);
                Ok(())
            }
        });

        if applied.is_err() {
            for (key, previous) in snapshot {
                match previous {
                    Some(entry) => data.entries.insert(key, entry),
                    None => data.entries.remove(&key),
                };
            }
        }
        applied
    }

    async fn load_script(&self, source: &str) -> Result<ScriptHandle> {
        self.round_trip().await;
        if source != BUCKET_SCRIPT {
            return Err(StorageError::ScriptUnsupported(
                "the in-memory store only runs the bucket script".to_string(),
            )
            .into());
        }
        let handle = ScriptHandle::new(source);
        self.lock()
            .scripts
            .insert(handle.sha().to_string(), handle.clone());
        Ok(handle)
    }

    async fn run_script(&self, script: &ScriptHandle, keys: &[&str], args: &[i64]) -> Result<i64> {
        self.round_trip().await;
        let mut data = self.lock();
        if !data.scripts.contains_key(script.sha()) {
            return Err(StorageError::Command(format!(
                "NOSCRIPT no script loaded with sha {}",
                script.sha()
            ))
            .into());
        }
        let [key] = keys else {
            return Err(StorageError::Command(format!(
                "bucket script expects 1 key, got {}",
                keys.len()
            ))
            .into());
        };
        data.run_bucket_script(key, args, self.config.max_entries)
    }
}
