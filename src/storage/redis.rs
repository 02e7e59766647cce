// src/storage/redis.rs

use async_trait::async_trait;
use deadpool_redis::{Connection, Manager, Pool, Runtime};
use futures::future::try_join_all;
use redis::{AsyncCommands, ErrorKind, IntoConnectionInfo, Pipeline};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::RedisConfig;
use crate::error::{GateError, Result, StorageError};
use crate::storage::{BucketStore, ScriptHandle, StoreTransaction};
use crate::storage_op;

/// Redis MULTI/EXEC transaction
pub struct RedisTransaction {
    pipeline: Pipeline,
}

impl RedisTransaction {
    fn new() -> Self {
        let mut pipeline = Pipeline::new();
        pipeline.atomic();
        Self { pipeline }
    }
}

impl StoreTransaction for RedisTransaction {
    fn set_hash_fields(&mut self, key: &str, fields: &[(&str, String)]) -> &mut Self {
        self.pipeline.hset_multiple(key, fields).ignore();
        self
    }

    fn increment_hash_field(&mut self, key: &str, field: &str, delta: i64) -> &mut Self {
        self.pipeline.hincr(key, field, delta).ignore();
        self
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> &mut Self {
        self.pipeline.expire(key, ttl.as_secs() as i64).ignore();
        self
    }

    // EXPIRE ... NX needs Redis 7
    fn expire_if_persistent(&mut self, key: &str, ttl: Duration) -> &mut Self {
        self.pipeline
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs())
            .arg("NX")
            .ignore();
        self
    }
}

/// Pooled Redis store
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    config: RedisConfig,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.config.url)
            .field("pool_size", &self.config.pool_size)
            .finish()
    }
}

impl RedisStore {
    /// Builds the pool, then opens and pings `min_idle` connections.
    ///
    /// Any failure here is fatal for the caller: a bad address or bad
    /// credentials come back as `Config`, an unreachable server as
    /// `StoreUnavailable`.
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        config.validate()?;

        let mut info = config
            .connection_url()
            .as_str()
            .into_connection_info()
            .map_err(|e| GateError::Config(format!("invalid Redis address {}: {}", config.url, e)))?;
        info.redis.db = config.db;
        if let Some(username) = &config.username {
            info.redis.username = Some(username.clone());
        }
        if let Some(password) = &config.password {
            info.redis.password = Some(password.clone());
        }

        let manager = Manager::new(info)
            .map_err(|e| GateError::Config(format!("invalid Redis connection settings: {}", e)))?;
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .wait_timeout(Some(config.pool_timeout))
            .create_timeout(Some(config.connection_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| GateError::Config(format!("failed to build Redis pool: {}", e)))?;

        let store = Self { pool, config };
        store.warm_up().await?;

        info!(
            url = %store.config.url,
            pool_size = store.config.pool_size,
            min_idle = store.config.min_idle,
            "Connected to Redis"
        );
        Ok(store)
    }

    // Check out min_idle connections at once and ping each; they go back to
    // the pool idle when dropped.
    async fn warm_up(&self) -> Result<()> {
        let idle = self.config.min_idle.max(1);
        let connections = try_join_all((0..idle).map(|_| async {
            let mut conn = self.connection().await?;
            Self::ping_connection(&mut conn).await?;
            Ok::<_, GateError>(conn)
        }))
        .await
        .map_err(|e| GateError::StoreUnavailable(format!("could not start Redis connection: {}", e)))?;

        debug!(connections = connections.len(), "Redis pool warmed up");
        Ok(())
    }

    async fn connection(&self) -> Result<Connection> {
        Ok(self.pool.get().await?)
    }

    async fn ping_connection(conn: &mut Connection) -> Result<()> {
        let reply: String = redis::cmd("PING").query_async(conn).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StorageError::Command(format!("Unexpected response from Redis PING: {}", reply)).into())
        }
    }

    /// Ping Redis through the pool
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        Self::ping_connection(&mut conn).await
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    type Transaction = RedisTransaction;

    async fn exists(&self, key: &str) -> Result<u64> {
        let start = Instant::now();
        let result: Result<u64> = async {
            let mut conn = self.connection().await?;
            Ok(conn.exists(key).await?)
        }
        .await;
        storage_op!("EXISTS", key, result, start.elapsed().as_millis() as u64);
        result
    }

    async fn get_hash_field(&self, key: &str, field: &str) -> Result<Option<i64>> {
        let start = Instant::now();
        let result: Result<Option<i64>> = async {
            let mut conn = self.connection().await?;
            Ok(conn.hget(key, field).await?)
        }
        .await;
        storage_op!("HGET", key, result, start.elapsed().as_millis() as u64);
        result
    }

    async fn increment_hash_field(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let start = Instant::now();
        let result: Result<i64> = async {
            let mut conn = self.connection().await?;
            Ok(conn.hincr(key, field, delta).await?)
        }
        .await;
        storage_op!("HINCRBY", key, result, start.elapsed().as_millis() as u64);
        result
    }

    async fn set_hash_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let start = Instant::now();
        let result: Result<()> = async {
            let mut conn = self.connection().await?;
            let _: () = conn.hset_multiple(key, fields).await?;
            Ok(())
        }
        .await;
        storage_op!("HSET", key, result, start.elapsed().as_millis() as u64);
        result
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let start = Instant::now();
        let result: Result<bool> = async {
            let mut conn = self.connection().await?;
            Ok(conn.expire(key, ttl.as_secs() as i64).await?)
        }
        .await;
        storage_op!("EXPIRE", key, result, start.elapsed().as_millis() as u64);
        result
    }

    async fn expire_if_persistent(&self, key: &str, ttl: Duration) -> Result<bool> {
        let start = Instant::now();
        let result: Result<bool> = async {
            let mut conn = self.connection().await?;
            Ok(redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl.as_secs())
                .arg("NX")
                .query_async(&mut conn)
                .await?)
        }
        .await;
        storage_op!("EXPIRE NX", key, result, start.elapsed().as_millis() as u64);
        result
    }

    fn transaction(&self) -> Self::Transaction {
        RedisTransaction::new()
    }

    async fn run_transaction(&self, transaction: Self::Transaction) -> Result<()> {
        let start = Instant::now();
        let result: Result<()> = async {
            let mut conn = self.connection().await?;
            let _: () = transaction.pipeline.query_async(&mut conn).await?;
            Ok(())
        }
        .await;
        storage_op!("MULTI", "-", result, start.elapsed().as_millis() as u64);
        result
    }

    async fn load_script(&self, source: &str) -> Result<ScriptHandle> {
        let mut conn = self
            .connection()
            .await
            .map_err(|e| GateError::ScriptLoad(e.to_string()))?;
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(source)
            .query_async(&mut conn)
            .await
            .map_err(|e| GateError::ScriptLoad(format!("failed to load script: {}", e)))?;

        let handle = ScriptHandle::new(source);
        if handle.sha() != sha {
            return Err(GateError::ScriptLoad(format!(
                "store returned sha {} for script {}",
                sha,
                handle.sha()
            )));
        }
        debug!(sha = %sha, "Script loaded");
        Ok(handle)
    }

    async fn run_script(&self, script: &ScriptHandle, keys: &[&str], args: &[i64]) -> Result<i64> {
        let start = Instant::now();
        let result: Result<i64> = async {
            let mut conn = self.connection().await?;
            let reply: redis::RedisResult<i64> = redis::cmd("EVALSHA")
                .arg(script.sha())
                .arg(keys.len())
                .arg(keys)
                .arg(args)
                .query_async(&mut conn)
                .await;

            match reply {
                // The server forgot the script (restart or SCRIPT FLUSH): hand
                // it the source once instead of failing every request.
                Err(e) if e.kind() == ErrorKind::NoScriptError => {
                    warn!(sha = script.sha(), "Script missing from Redis cache, sending source");
                    Ok(redis::cmd("EVAL")
                        .arg(script.source())
                        .arg(keys.len())
                        .arg(keys)
                        .arg(args)
                        .query_async(&mut conn)
                        .await?)
                }
                other => Ok(other?),
            }
        }
        .await;
        let key = keys.first().copied().unwrap_or("-");
        storage_op!("EVALSHA", key, result, start.elapsed().as_millis() as u64);
        result
    }
}
