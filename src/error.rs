//! Crate error type.
//!
//! Fetch and mutation failures are user data and travel as the caller's own
//! error type. `CacheError` only covers usage and configuration defects.

use thiserror::Error;

use crate::cache::QueryDigest;

/// Usage or configuration defect raised by the cache itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// A digest was built with a different data/error type pair than the one
    /// it was first registered with.
    #[error("query '{digest}' already exists with different types: expected {expected}, got {found}")]
    TypeMismatch {
        digest: QueryDigest,
        expected: &'static str,
        found: &'static str,
    },

    /// A fire-and-forget operation was started outside a tokio runtime.
    #[error("no tokio runtime available to spawn onto")]
    NoRuntime,

    /// An environment override could not be parsed.
    #[error("invalid value '{value}' for {var}")]
    Config { var: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, CacheError>;
