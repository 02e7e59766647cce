// library entry
pub mod admission;
pub mod config;
pub mod error;
pub mod identity;
pub mod interceptor;
pub mod logging;
pub mod routes;
pub mod storage;

#[cfg(test)]
mod test_utils;

#[cfg(test)]
mod tests;

// Re-export key components for convenience
pub use admission::{AdmissionController, AdmissionStrategy, Verdict};
pub use config::{FailurePolicy, GateConfig, Strategy};
pub use error::{GateError, Result};
pub use logging::init as init_logging;
pub use storage::{BucketStore, StoreTransaction};
