//! Strata Storage Engine - LSM secondary indexes
//!
//! This crate implements:
//! - A page buffer cache over memory-resident and file-backed page files
//! - A concurrent paged tree serving R-tree and B-tree-like indexes
//! - Bottom-up bulk loading
//! - LSM components with deleted-key trees and a lifecycle state machine
//! - Flush, merge, and the policies and tracker that trigger them

pub mod buffer;
pub mod lsm;
pub mod tree;

// Re-exports
pub use buffer::{BufferCache, CacheStats, PageReadGuard, PageWriteGuard};
pub use lsm::{
    ComponentInfo, ComponentKind, ComponentState, IndexHooks, IndexStats, LsmAccessor,
    LsmBulkLoader, LsmCursor, LsmIndex, OperationTracker, PolicyOperationTracker,
};
pub use tree::{
    GenerationCounter, KeyBound, KeyDiscipline, OpContext, OrderedDiscipline, SearchPredicate,
    SpatialDiscipline, TreeBulkLoader, TreeIndex, TreeOptions, TreeShape, TreeStats,
};
