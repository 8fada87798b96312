//! Per-accessor operation context
//!
//! One context belongs to one accessor and is reused for every operation
//! that accessor runs; it is never shared between threads.

use super::discipline::KeyBound;
use strata_common::PageId;

/// Page visited during a descent, with the LSN observed at the visit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PathEntry {
    pub page: PageId,
    pub lsn: u64,
    /// Index of the parent entry; only used by breadth-first rescans
    pub parent: Option<usize>,
}

/// Ordered list of visited pages
#[derive(Debug, Default)]
pub(crate) struct PathList {
    entries: Vec<PathEntry>,
}

impl PathList {
    pub fn push(&mut self, page: PageId, lsn: u64, parent: Option<usize>) -> usize {
        self.entries.push(PathEntry { page, lsn, parent });
        self.entries.len() - 1
    }

    pub fn pop(&mut self) -> Option<PathEntry> {
        self.entries.pop()
    }

    pub fn last(&self) -> Option<PathEntry> {
        self.entries.last().copied()
    }

    pub fn get(&self, index: usize) -> Option<PathEntry> {
        self.entries.get(index).copied()
    }

    pub fn set_lsn(&mut self, index: usize, lsn: u64) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.lsn = lsn;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Pending update of a parent after a split
#[derive(Clone, Debug)]
pub(crate) struct SplitKey {
    pub left: PageId,
    pub right: PageId,
    pub right_bound: KeyBound,
    pub level: u8,
}

/// Kind of tree operation a context is running
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TreeOp {
    #[default]
    Idle,
    Insert,
    Delete,
}

/// Mutable scratch state of one tree operation
#[derive(Debug, Default)]
pub struct OpContext {
    pub(crate) op: TreeOp,
    pub(crate) path: PathList,
    pub(crate) traverse: PathList,
    pub(crate) split: Option<SplitKey>,
    pub(crate) retries: usize,
}

impl OpContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reset(&mut self, op: TreeOp) {
        self.op = op;
        self.path.clear();
        self.traverse.clear();
        self.split = None;
        self.retries = 0;
    }

    /// Operation the context last ran
    #[must_use]
    pub const fn op(&self) -> TreeOp {
        self.op
    }

    /// Pages on the current descent path
    #[must_use]
    pub fn path_len(&self) -> usize {
        self.path.len()
    }
}
