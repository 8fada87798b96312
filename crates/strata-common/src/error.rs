//! Error types for Strata
//!
//! This module defines the error type shared by the tree engine and the
//! LSM layer. Structural retries never escape the tree engine; everything
//! else surfaces through this enum.

use crate::types::{ComponentId, FileId, OpType, PageId};
use thiserror::Error;

/// Common result type for Strata operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Strata
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("page not found: {file}/{page}")]
    PageNotFound { file: FileId, page: PageId },

    #[error("page file not found: {0}")]
    FileNotFound(FileId),

    #[error("data corruption detected: {0}")]
    Corruption(String),

    // Logical errors: rejected before any page is modified
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("invalid tuple: {0}")]
    InvalidTuple(String),

    #[error("tuple too large: {size} bytes, max {max} bytes")]
    TupleTooLarge { size: usize, max: usize },

    // Component lifecycle
    #[error("component {component} rejected {op} in state {state}")]
    ComponentUnavailable {
        component: ComponentId,
        op: OpType,
        state: &'static str,
    },

    #[error("structural retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: usize },

    #[error("index is shut down")]
    ShutDown,

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create an invalid tuple error
    pub fn invalid_tuple(msg: impl Into<String>) -> Self {
        Self::InvalidTuple(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Logical errors leave the index untouched
    #[must_use]
    pub const fn is_logical(&self) -> bool {
        matches!(
            self,
            Self::DuplicateKey(_)
                | Self::KeyNotFound(_)
                | Self::InvalidTuple(_)
                | Self::TupleTooLarge { .. }
        )
    }

    /// Check if the operation may succeed when retried
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ComponentUnavailable { .. } | Self::RetriesExhausted { .. }
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::KeyNotFound(_) | Self::PageNotFound { .. } | Self::FileNotFound(_)
        )
    }

    /// Check if a component rejected the operation
    #[must_use]
    pub const fn is_component_unavailable(&self) -> bool {
        matches!(self, Self::ComponentUnavailable { .. })
    }
}
