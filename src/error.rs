// error definitions
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    /// Missing or invalid startup configuration (store address, credentials, quota)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The store could not be reached while starting up
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The bucket script could not be loaded into the store
    #[error("Script load error: {0}")]
    ScriptLoad(String),

    /// Returned when a client has no quota left in its current window
    #[error("Rate limit exceeded: {0}")]
    LimitExceeded(String),

    /// Errors raised by the store while serving a request
    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// Unexpected or internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Connection refused, reset or timed out
    #[error("Store connection error: {0}")]
    Connection(String),

    // Store authentication errors
    #[error("Store authentication error: {0}")]
    Auth(String),

    /// Command rejected by the store
    #[error("Store command error: {0}")]
    Command(String),

    /// No pooled connection could be checked out
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Stored value could not be decoded
    #[error("Data serialization error: {0}")]
    Serialization(String),

    /// The store cannot execute the given script source
    #[error("Unsupported script: {0}")]
    ScriptUnsupported(String),
}

impl From<StorageError> for GateError {
    fn from(err: StorageError) -> Self {
        GateError::Storage(err)
    }
}

impl From<redis::RedisError> for GateError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::AuthenticationFailed => {
                GateError::Storage(StorageError::Auth(err.to_string()))
            }
            redis::ErrorKind::IoError | redis::ErrorKind::ClientError => {
                GateError::Storage(StorageError::Connection(err.to_string()))
            }
            redis::ErrorKind::TypeError => {
                GateError::Storage(StorageError::Serialization(err.to_string()))
            }
            _ => GateError::Storage(StorageError::Command(err.to_string())),
        }
    }
}

impl From<deadpool_redis::PoolError> for GateError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        match err {
            deadpool_redis::PoolError::Backend(err) => err.into(),
            other => GateError::Storage(StorageError::Pool(other.to_string())),
        }
    }
}

// define a Result type alias for convenience
pub type Result<T> = std::result::Result<T, GateError>;
