// src/storage/mod.rs

pub mod memory;
pub mod redis;

#[cfg(test)]
mod tests;

pub use memory::{MemoryStore, MemoryTransaction};
pub use redis::{RedisStore, RedisTransaction};

use super::error::Result;
use async_trait::async_trait;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

/// A script registered with a store.
///
/// The handle is the SHA1 of the source. The source is kept alongside so a
/// store that lost its script cache can be handed the text again.
#[derive(Clone, PartialEq, Eq)]
pub struct ScriptHandle {
    sha: String,
    source: Arc<str>,
}

impl ScriptHandle {
    pub fn new(source: &str) -> Self {
        Self {
            sha: ::redis::Script::new(source).get_hash().to_string(),
            source: Arc::from(source),
        }
    }

    pub fn sha(&self) -> &str {
        &self.sha
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl Debug for ScriptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptHandle").field("sha", &self.sha).finish()
    }
}

// Operations queued for all-or-nothing execution
pub trait StoreTransaction: Send + Sync {
    // Set several hash fields at once
    fn set_hash_fields(&mut self, key: &str, fields: &[(&str, String)]) -> &mut Self;

    // Add `delta` to an integer hash field
    fn increment_hash_field(&mut self, key: &str, field: &str, delta: i64) -> &mut Self;

    // Set the key's time-to-live
    fn expire(&mut self, key: &str, ttl: Duration) -> &mut Self;

    // Set the key's time-to-live only when it has none
    fn expire_if_persistent(&mut self, key: &str, ttl: Duration) -> &mut Self;
}

/// The operations the admission controller needs from a shared key-value store.
///
/// Implementations must be safe to call from many tasks at once; every call
/// is one round trip and nothing is cached between calls.
#[async_trait]
pub trait BucketStore: Send + Sync + Debug {
    // The type of transaction this store builds
    type Transaction: StoreTransaction;

    // Number of the given keys that exist (0 or 1 for a single key)
    async fn exists(&self, key: &str) -> Result<u64>;

    // Reads an integer hash field; None when the key or field is absent
    async fn get_hash_field(&self, key: &str, field: &str) -> Result<Option<i64>>;

    // Atomically adds `delta` to a hash field and returns the new value
    async fn increment_hash_field(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    // Sets hash fields outside of a transaction
    async fn set_hash_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<()>;

    // Sets the key's time-to-live; false when the key does not exist
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    // Sets the time-to-live only when the key has none; true when it was set
    async fn expire_if_persistent(&self, key: &str, ttl: Duration) -> Result<bool>;

    // Starts an empty transaction
    fn transaction(&self) -> Self::Transaction;

    // Applies every queued operation, or none of them
    async fn run_transaction(&self, transaction: Self::Transaction) -> Result<()>;

    // Registers a script and returns the handle to run it by
    async fn load_script(&self, source: &str) -> Result<ScriptHandle>;

    // Runs a loaded script as one indivisible unit
    async fn run_script(&self, script: &ScriptHandle, keys: &[&str], args: &[i64]) -> Result<i64>;
}
