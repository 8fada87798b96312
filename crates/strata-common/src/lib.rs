//! Strata Common - Shared types and utilities
//!
//! This crate provides the identifiers, tuple model, error definitions and
//! configuration used by the Strata storage engine.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    CacheConfig, FlushPolicyConfig, IndexConfig, KeyConfig, MemoryConfig, MergePolicyConfig,
};
pub use error::{Error, Result};
pub use types::*;
