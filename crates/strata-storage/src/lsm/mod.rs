//! LSM secondary indexes
//!
//! An index is a list of components, each a tree plus a tree of deleted
//! tuples, wrapped in a lifecycle state machine:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ LsmIndex / LsmAccessor                                      │
//! │   insert, delete ──► mutable memory component (head)        │
//! │   search ─────────► every component, newest first           │
//! ├─────────────────────────────────────────────────────────────┤
//! │ memory: mutable ── full ──► frozen ── flush ──► disk        │
//! │ disk:   disk, disk, ... ── merge ──► disk                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Visibility
//! A component's tombstones hide tuples of older components only. A tuple
//! is visible when the newest component that holds it or a tombstone for
//! it holds the tuple itself.
//!
//! # Durability
//! Disk components and the manifest listing them survive restarts; memory
//! components are flushed on shutdown.

mod accessor;
mod component;
mod cursor;
mod harness;
mod index;
pub mod manifest;
pub mod policy;
mod scheduler;
pub mod state;
pub mod tracker;

pub use accessor::LsmAccessor;
pub use component::{ComponentKind, LsmComponent, component_paths};
pub use cursor::LsmCursor;
pub use harness::{HarnessStats, IndexHooks};
pub use index::{ComponentInfo, IndexStats, LsmBulkLoader, LsmIndex};
pub use manifest::{Manifest, ManifestEntry};
pub use policy::{
    ComponentStats, ConstantMergePolicy, EntryBudgetPolicy, FlushPolicy, ManualFlushPolicy,
    MergeCandidate, MergePolicy, NoMergePolicy, PageBudgetPolicy, PrefixMergePolicy,
};
pub use state::{ComponentGate, ComponentState};
pub use tracker::{BackgroundTask, OperationTracker, PolicyOperationTracker};
