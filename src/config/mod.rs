// src/config/mod.rs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{GateError, Result};

/// Default location of the mounted Redis secrets file
pub const DEFAULT_SECRETS_FILE: &str = "/run/secrets/redisSecrets";

/// How the admission controller checks and consumes quota in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// One server-side script per decision; exact under any concurrency
    #[default]
    AtomicScript,
    /// Exists / read / write round trips; racy on first-request bursts
    TransactionalPipeline,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::AtomicScript => "atomic-script",
            Strategy::TransactionalPipeline => "transactional-pipeline",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "atomic-script" | "atomic" | "script" => Ok(Strategy::AtomicScript),
            "transactional-pipeline" | "pipeline" => Ok(Strategy::TransactionalPipeline),
            other => Err(GateError::Config(format!("unknown strategy: {}", other))),
        }
    }
}

/// What the gate does with a request when the store cannot be consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Reject with 500
    #[default]
    FailClosed,
    /// Forward the request unchecked
    FailOpen,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::FailClosed => f.write_str("fail-closed"),
            FailurePolicy::FailOpen => f.write_str("fail-open"),
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fail-closed" | "closed" => Ok(FailurePolicy::FailClosed),
            "fail-open" | "open" => Ok(FailurePolicy::FailOpen),
            other => Err(GateError::Config(format!("unknown failure policy: {}", other))),
        }
    }
}

/// Quota settings for the admission controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Bucket capacity: admissions allowed per window
    pub max_tokens: u64,

    /// Time until a bucket's quota fully resets
    #[serde(rename = "window_seconds", with = "duration_secs")]
    pub window: Duration,

    #[serde(default)]
    pub strategy: Strategy,

    /// Prefix for bucket keys, joined to the identity with ':'
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_key_prefix() -> String {
    "rate_limit".to_string()
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(60))
    }
}

impl GateConfig {
    pub fn new(max_tokens: u64, window: Duration) -> Self {
        Self {
            max_tokens,
            window,
            strategy: Strategy::default(),
            key_prefix: default_key_prefix(),
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Window length in whole seconds, as handed to the store's expiry
    pub fn window_secs(&self) -> u64 {
        self.window.as_secs()
    }

    /// Reject quotas the store cannot express
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(GateError::Config("max_tokens must be at least 1".to_string()));
        }
        if self.max_tokens > i64::MAX as u64 {
            return Err(GateError::Config(format!(
                "max_tokens {} does not fit a store integer",
                self.max_tokens
            )));
        }
        if self.window.as_secs() == 0 {
            return Err(GateError::Config(format!(
                "window must be at least one second, got {:?}",
                self.window
            )));
        }
        if self.key_prefix.is_empty() {
            return Err(GateError::Config("key_prefix must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Configuration for Redis storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL, or a bare `host:port`
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub db: i64,

    /// Maximum number of pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connections opened eagerly at startup
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,

    /// How long a caller waits for a free pooled connection
    #[serde(default = "default_pool_timeout", with = "duration_serde")]
    pub pool_timeout: Duration,

    /// Connection timeout
    #[serde(default = "default_conn_timeout", with = "duration_serde")]
    pub connection_timeout: Duration,
}

fn default_pool_size() -> usize {
    10
}

fn default_min_idle() -> usize {
    2
}

fn default_pool_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_conn_timeout() -> Duration {
    Duration::from_secs(2)
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            db: 0,
            pool_size: default_pool_size(),
            min_idle: default_min_idle(),
            pool_timeout: default_pool_timeout(),
            connection_timeout: default_conn_timeout(),
        }
    }

    /// Parse the `KEY=value;KEY=value` secrets format.
    ///
    /// Both `REDIS_CONN_ADDRESS` and `REDIS_PASSWORD` are required; a
    /// password-protected connection logs in as the `default` user.
    pub fn from_secrets(contents: &str) -> Result<Self> {
        let mut secrets = HashMap::new();
        for entry in contents.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (name, value) = entry.split_once('=').ok_or_else(|| {
                GateError::Config(format!("malformed Redis secret entry: {}", entry))
            })?;
            let (name, value) = (name.trim(), value.trim());
            if name.is_empty() || value.is_empty() {
                return Err(GateError::Config(format!(
                    "missing Redis secret in entry: {}",
                    entry
                )));
            }
            secrets.insert(name.to_string(), value.to_string());
        }

        let address = secrets.remove("REDIS_CONN_ADDRESS").ok_or_else(|| {
            GateError::Config("REDIS_CONN_ADDRESS missing from Redis secrets".to_string())
        })?;
        let password = secrets.remove("REDIS_PASSWORD").ok_or_else(|| {
            GateError::Config("REDIS_PASSWORD missing from Redis secrets".to_string())
        })?;

        let mut config = Self::new(address);
        config.username = Some("default".to_string());
        config.password = Some(password);
        Ok(config)
    }

    pub fn from_secrets_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GateError::Config(format!(
                "failed to read Redis secrets from {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_secrets(&contents)
    }

    /// `REDIS_URL` (plus optional `REDIS_USERNAME` / `REDIS_PASSWORD`) wins
    /// over the secrets file.
    pub fn from_env_or_secrets(secrets_file: impl AsRef<Path>) -> Result<Self> {
        match std::env::var("REDIS_URL") {
            Ok(url) if !url.trim().is_empty() => {
                let mut config = Self::new(url.trim());
                config.password = std::env::var("REDIS_PASSWORD").ok();
                config.username = std::env::var("REDIS_USERNAME")
                    .ok()
                    .or_else(|| config.password.as_ref().map(|_| "default".to_string()));
                Ok(config)
            }
            _ => Self::from_secrets_file(secrets_file),
        }
    }

    /// The address with a `redis://` scheme, as the client expects it
    pub fn connection_url(&self) -> String {
        if self.url.contains("://") {
            self.url.clone()
        } else {
            format!("redis://{}", self.url)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(GateError::Config("Redis address is empty".to_string()));
        }
        if self.pool_size == 0 {
            return Err(GateError::Config("pool_size must be at least 1".to_string()));
        }
        if self.min_idle > self.pool_size {
            return Err(GateError::Config(format!(
                "min_idle ({}) exceeds pool_size ({})",
                self.min_idle, self.pool_size
            )));
        }
        Ok(())
    }
}

/// Configuration for in-memory storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryConfig {
    /// Maximum number of entries to store
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Whether to use a background task for expiration
    #[serde(default = "default_use_background_task")]
    pub use_background_task: bool,

    /// How often to run the background expiration task
    #[serde(default = "default_cleanup_interval", with = "duration_serde")]
    pub cleanup_interval: Duration,

    /// Simulated round-trip latency applied before every operation
    #[serde(skip)]
    pub latency: Option<Duration>,
}

fn default_max_entries() -> usize {
    10_000
}

// Spawning the cleanup task needs a runtime, so it is opt-in
fn default_use_background_task() -> bool {
    false
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            use_background_task: default_use_background_task(),
            cleanup_interval: default_cleanup_interval(),
            latency: None,
        }
    }
}

/// HTTP listener settings for the server binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
}

fn default_addr() -> String {
    "0.0.0.0:4000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

/// Everything the server binary needs, loadable from one JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gate: GateConfig,
    pub redis: RedisConfig,
}

impl Settings {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GateError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&contents)
            .map_err(|e| GateError::Config(format!("invalid settings in {}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        self.gate.validate()?;
        self.redis.validate()
    }
}

// Helper module to serialize/deserialize Duration with serde
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// Whole seconds, matching the store's expiry granularity
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
