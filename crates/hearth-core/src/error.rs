//! Error types for the storage, chain, and submission layers.
//!
//! Moderation failures never appear here: they are absorbed inside the moderation
//! gateway and surface only as fallbacks.

use thiserror::Error;

/// Errors from the persistence collaborator.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Another writer already stored a message at this position of the thread.
    #[error("chain index {chain_index} already taken in thread {thread_id}")]
    Conflict { thread_id: String, chain_index: u64 },

    /// The position is past the end of the thread.
    #[error("chain index {chain_index} would leave a gap in thread {thread_id} (next is {expected})")]
    Gap {
        thread_id: String,
        chain_index: u64,
        expected: u64,
    },

    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "sled-store")]
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors from appending to or reading a thread's chain.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("persistence failed: {0}")]
    Store(#[from] StoreError),
}

/// Fatal errors of a submission. Everything else is an outcome, not an error.
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// The message passed the tone gate but could not be linked and stored.
    #[error("message could not be persisted: {0}")]
    Persistence(#[from] ChainError),
}

/// Configuration loading failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;
